use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BackpressureSettings;
use crate::message::{Message, MessageId, MessageType};
use crate::utils::clock::SharedClock;

#[derive(Debug, Default)]
struct BackpressureState {
    in_flight: usize,
    dropped: u64,
    shedding: bool,
    admitted: HashSet<MessageId>,
    connected: bool,
    offline_since_ms: Option<i64>,
    connection_attempts: u64,
    messages_received: u64,
    messages_sent: u64,
}

/// Point-in-time view of the controller, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackpressureMetrics {
    pub enabled: bool,
    pub max_incoming_requests: usize,
    pub lower_threshold: usize,
    pub in_flight: usize,
    pub dropped: u64,
    pub shedding: bool,
    pub connected: bool,
    pub offline_since_ms: Option<i64>,
    pub connection_attempts: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Admission gate for inbound requests, with connection bookkeeping
/// All counters live under one lock so an admit and its matching complete
/// always see each other
#[derive(Debug)]
pub struct BackpressureController {
    settings: BackpressureSettings,
    state: Mutex<BackpressureState>,
    clock: SharedClock,
}

impl BackpressureController {
    pub fn new(settings: BackpressureSettings, clock: SharedClock) -> Self {
        Self {
            settings,
            state: Mutex::new(BackpressureState::default()),
            clock,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BackpressureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks to start processing one more request
    /// Returns false if the caller must drop it
    pub fn admit(&self) -> bool {
        let mut state = self.lock_state();
        self.admit_locked(&mut state)
    }

    fn admit_locked(&self, state: &mut BackpressureState) -> bool {
        let max = self.settings.max_incoming_requests;
        if self.settings.enabled && max > 0 {
            if state.shedding && state.in_flight <= self.settings.lower_threshold {
                state.shedding = false;
                info!("Backpressure released at {} in-flight requests", state.in_flight);
            }
            if state.shedding || state.in_flight >= max {
                if !state.shedding {
                    warn!("Backpressure engaged at {} in-flight requests", state.in_flight);
                }
                state.shedding = true;
                state.dropped += 1;
                return false;
            }
        }
        state.in_flight += 1;
        true
    }

    /// Marks one admitted request as done.
    pub fn complete(&self) {
        let mut state = self.lock_state();
        self.complete_locked(&mut state);
    }

    fn complete_locked(&self, state: &mut BackpressureState) {
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.shedding && state.in_flight <= self.settings.lower_threshold {
            state.shedding = false;
            info!("Backpressure released at {} in-flight requests", state.in_flight);
        }
    }

    /// Gate for an inbound message. Only requests count against the limit;
    /// an admitted request is tracked until [`message_processed`](Self::message_processed).
    pub fn admit_message(&self, message: &Message) -> bool {
        if message.message_type() != MessageType::Request {
            return true;
        }
        let mut state = self.lock_state();
        if !self.admit_locked(&mut state) {
            debug!("Dropped request {} under backpressure", message.id());
            return false;
        }
        state.admitted.insert(message.id().to_string());
        true
    }

    /// Completes the request admitted under `message_id`. Ids that were
    /// never admitted, or already completed, are ignored.
    pub fn message_processed(&self, message_id: &str) {
        let mut state = self.lock_state();
        if state.admitted.remove(message_id) {
            self.complete_locked(&mut state);
        }
    }

    pub fn on_connection_attempt(&self) {
        self.lock_state().connection_attempts += 1;
    }

    pub fn on_connected(&self) {
        let mut state = self.lock_state();
        state.connected = true;
        state.offline_since_ms = None;
    }

    /// Records a lost connection. Only the first disconnect after a
    /// successful connect sets the offline timestamp.
    pub fn on_disconnected(&self) {
        let now = self.clock.now_ms();
        let mut state = self.lock_state();
        state.connected = false;
        state.offline_since_ms.get_or_insert(now);
    }

    pub fn on_message_received(&self) {
        self.lock_state().messages_received += 1;
    }

    pub fn on_message_sent(&self) {
        self.lock_state().messages_sent += 1;
    }

    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight
    }

    pub fn dropped_count(&self) -> u64 {
        self.lock_state().dropped
    }

    pub fn metrics(&self) -> BackpressureMetrics {
        let state = self.lock_state();
        BackpressureMetrics {
            enabled: self.settings.enabled,
            max_incoming_requests: self.settings.max_incoming_requests,
            lower_threshold: self.settings.lower_threshold,
            in_flight: state.in_flight,
            dropped: state.dropped,
            shedding: state.shedding,
            connected: state.connected,
            offline_since_ms: state.offline_since_ms,
            connection_attempts: state.connection_attempts,
            messages_received: state.messages_received,
            messages_sent: state.messages_sent,
        }
    }
}
