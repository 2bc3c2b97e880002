use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::backoff::RetryBackoff;
use super::queue::DelayableMessageQueue;
use super::stub::{StubRegistry, TransmitError, TransportStub};
use super::table::RoutingTable;
use crate::address::{Address, TransportKind};
use crate::capabilities::CapabilitiesDirectory;
use crate::config::RouterSettings;
use crate::message::{DelayableMessage, FailureAction, Message, MessageId};
use crate::persistence::MessagePersister;
use crate::utils::clock::{SharedClock, system_clock};
use crate::utils::error::RoutingError;

/// Upper bound for an idle worker's sleep, so workers re-check the queue
/// even when no wakeup arrives.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(1000);

/// How a message left the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(RoutingError),
}

/// Told once about every message that reaches a terminal outcome.
pub trait MessageProcessedListener: Send + Sync {
    fn message_processed(&self, message: &Message, outcome: &DeliveryOutcome);
}

/// Bookkeeping for a message whose attempt is currently running.
#[derive(Debug)]
struct InFlight {
    recipient: String,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    queue: DelayableMessageQueue,
    in_flight: HashMap<MessageId, InFlight>,
}

struct RouterInner {
    settings: RouterSettings,
    backoff: RetryBackoff,
    clock: SharedClock,
    routing_table: Arc<RoutingTable>,
    directory: Option<Arc<CapabilitiesDirectory>>,
    persister: Option<Arc<dyn MessagePersister>>,
    stubs: StubRegistry,
    state: Mutex<RouterState>,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<Weak<dyn MessageProcessedListener>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Schedules outbound messages and delivers them through transport stubs
/// Messages wait in a delay queue until they are ready, are resolved to an
/// address through the routing table and are retried with exponential backoff
/// until they are delivered or their TTL runs out
///
/// Cloning is cheap; all clones share one queue and one set of workers.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

pub struct MessageRouterBuilder {
    settings: RouterSettings,
    routing_table: Option<Arc<RoutingTable>>,
    clock: Option<SharedClock>,
    directory: Option<Arc<CapabilitiesDirectory>>,
    persister: Option<Arc<dyn MessagePersister>>,
}

impl MessageRouterBuilder {
    pub fn routing_table(mut self, routing_table: Arc<RoutingTable>) -> Self {
        self.routing_table = Some(routing_table);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Directory consulted when the routing table has no entry for a recipient.
    pub fn directory(mut self, directory: Arc<CapabilitiesDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn MessagePersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn build(self) -> MessageRouter {
        let clock = self.clock.unwrap_or_else(system_clock);
        let routing_table = self
            .routing_table
            .unwrap_or_else(|| Arc::new(RoutingTable::new(clock.clone())));
        let (shutdown_tx, _) = watch::channel(false);

        MessageRouter {
            inner: Arc::new(RouterInner {
                backoff: RetryBackoff::from_settings(&self.settings),
                settings: self.settings,
                clock,
                routing_table,
                directory: self.directory,
                persister: self.persister,
                stubs: StubRegistry::new(),
                state: Mutex::new(RouterState::default()),
                wakeup: Notify::new(),
                shutdown_tx,
                listeners: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl MessageRouter {
    pub fn builder(settings: RouterSettings) -> MessageRouterBuilder {
        MessageRouterBuilder {
            settings,
            routing_table: None,
            clock: None,
            directory: None,
            persister: None,
        }
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.inner.routing_table
    }

    pub fn register_stub(&self, kind: TransportKind, stub: Arc<dyn TransportStub>) {
        debug!("Registered transport stub for {kind:?}");
        self.inner.stubs.register(kind, stub);
    }

    /// Starts the delivery workers
    /// Messages left in the durability store by a previous run are queued
    /// again first, ready immediately; expired ones are dropped when popped
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.is_shut_down() {
            return;
        }

        self.reload_persisted();

        for worker_id in 0..self.inner.settings.max_parallel_sends {
            let inner = self.inner.clone();
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            workers.push(tokio::spawn(run_worker(inner, worker_id, shutdown_rx)));
        }
        info!(
            "Message router started with {} workers",
            self.inner.settings.max_parallel_sends
        );
    }

    fn reload_persisted(&self) {
        let Some(persister) = &self.inner.persister else {
            return;
        };
        let now = self.inner.clock.now_ms();
        let stored = persister.fetch_all(&self.inner.settings.queue_id);
        if stored.is_empty() {
            return;
        }

        let mut state = self.inner.lock_state();
        let mut restored = 0;
        for message in stored {
            if state.queue.push(message.into_delayable(now)) {
                restored += 1;
            }
        }
        info!("Restored {restored} persisted messages");
    }

    /// Queues `message` for delivery as soon as possible.
    pub fn enqueue(&self, message: Message) -> Result<(), RoutingError> {
        let now = self.inner.clock.now_ms();
        self.schedule(DelayableMessage::new(message, now))
    }

    /// Like [`enqueue`](Self::enqueue), and `action` runs exactly once with
    /// the terminal error if delivery ultimately fails.
    pub fn enqueue_with_failure_action(
        &self,
        message: Message,
        action: FailureAction,
    ) -> Result<(), RoutingError> {
        let now = self.inner.clock.now_ms();
        self.schedule(DelayableMessage::new(message, now).with_failure_action(action))
    }

    fn schedule(&self, delayable: DelayableMessage) -> Result<(), RoutingError> {
        if self.is_shut_down() {
            return Err(RoutingError::Shutdown);
        }
        if delayable.message().is_expired(self.inner.clock.now_ms()) {
            debug!("Rejected expired message {}", delayable.id());
            return Err(RoutingError::Expired);
        }

        {
            let mut state = self.inner.lock_state();
            let id = delayable.id().to_string();
            if state.in_flight.contains_key(&id) || !state.queue.push(delayable) {
                return Err(RoutingError::AlreadyQueued(id));
            }
            trace!("Queued message {id}");
        }
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Stops delivery to `participant_id`
    /// Queued messages are dropped with outcome `Cancelled`; messages whose
    /// attempt is still running are not retried if that attempt fails
    ///
    /// Returns how many queued messages were dropped.
    pub fn cancel_for_recipient(&self, participant_id: &str) -> usize {
        let removed = {
            let mut state = self.inner.lock_state();
            for in_flight in state.in_flight.values_mut() {
                if in_flight.recipient == participant_id {
                    in_flight.cancelled = true;
                }
            }
            state.queue.remove_for_recipient(participant_id)
        };

        let count = removed.len();
        for message in removed {
            self.inner
                .finish(message, DeliveryOutcome::Failed(RoutingError::Cancelled));
        }
        if count > 0 {
            debug!("Cancelled {count} queued messages for {participant_id}");
        }
        count
    }

    /// Registers a listener without keeping it alive; it is dropped from the
    /// router once its last strong reference goes away.
    pub fn add_message_processed_listener<L>(&self, listener: &Arc<L>)
    where
        L: MessageProcessedListener + 'static,
    {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn MessageProcessedListener> = weak;
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(weak);
    }

    /// Number of messages waiting in the queue, not counting running attempts.
    pub fn queue_len(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock_state().in_flight.len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Stops accepting messages and waits for the workers to exit.
    /// Queued messages stay in the durability store for the next start.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.wakeup.notify_waiters();

        let workers: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Router worker ended abnormally: {e}");
            }
        }
        info!("Message router stopped");
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("queue_id", &self.inner.settings.queue_id)
            .field("queue_len", &self.queue_len())
            .field("stubs", &self.inner.stubs)
            .finish()
    }
}

enum Popped {
    Ready(DelayableMessage),
    Wait(Duration),
}

async fn run_worker(inner: Arc<RouterInner>, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
    trace!("Router worker {worker_id} running");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Register interest before looking at the queue so an enqueue in
        // between is not missed.
        let notified = inner.wakeup.notified();

        match inner.pop_ready() {
            Popped::Ready(message) => inner.clone().process(message),
            Popped::Wait(wait) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
    trace!("Router worker {worker_id} exiting");
}

impl RouterInner {
    fn lock_state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops the next ready message and marks it in flight under the same lock.
    fn pop_ready(&self) -> Popped {
        let now = self.clock.now_ms();
        let mut state = self.lock_state();
        match state.queue.pop_ready(now) {
            Some(message) => {
                state.in_flight.insert(
                    message.id().to_string(),
                    InFlight {
                        recipient: message.message().recipient().to_string(),
                        cancelled: false,
                    },
                );
                Popped::Ready(message)
            }
            None => {
                let wait = state
                    .queue
                    .next_ready_at()
                    .map(|ready_at| Duration::from_millis(ready_at.saturating_sub(now).max(0) as u64))
                    .unwrap_or(MAX_IDLE_WAIT);
                Popped::Wait(wait.min(MAX_IDLE_WAIT))
            }
        }
    }

    fn process(self: Arc<Self>, message: DelayableMessage) {
        let now = self.clock.now_ms();
        if message.message().is_expired(now) {
            debug!("Message {} expired before delivery", message.id());
            self.finish(message, DeliveryOutcome::Failed(RoutingError::Expired));
            return;
        }

        let recipient = message.message().recipient().to_string();
        let Some(address) = self.resolve(&recipient) else {
            debug!("No route to {recipient} for message {}", message.id());
            let delay = self.backoff.delay_for(message.retry_count());
            self.retry_or_fail(message, delay, RoutingError::NoRouteFound(recipient));
            return;
        };

        let Some(stub) = self.stubs.get(address.kind()) else {
            warn!("No transport stub registered for {:?}", address.kind());
            let delay = self.backoff.delay_for(message.retry_count());
            let reason = format!("no transport stub for {:?}", address.kind());
            self.retry_or_fail(message, delay, RoutingError::TransmissionFailed(reason));
            return;
        };

        tokio::spawn(async move {
            trace!("Transmitting message {} to {address:?}", message.id());
            let result = stub.transmit(message.message(), &address).await;
            self.on_transmit_result(message, result);
        });
    }

    /// Routing table first, then the directory; a directory hit is cached
    /// in the routing table.
    fn resolve(&self, participant_id: &str) -> Option<Address> {
        if let Some(address) = self.routing_table.get(participant_id) {
            return Some(address);
        }
        let entry = self.directory.as_ref()?.lookup_by_participant_id(participant_id)?;
        self.routing_table.put(
            participant_id,
            entry.address.clone(),
            true,
            entry.expiry_date_ms,
        );
        Some(entry.address)
    }

    fn on_transmit_result(&self, message: DelayableMessage, result: Result<(), TransmitError>) {
        match result {
            Ok(()) => {
                trace!("Delivered message {}", message.id());
                self.finish(message, DeliveryOutcome::Delivered);
            }
            Err(TransmitError::NotSent(reason)) => {
                warn!("Message {} not sent: {reason}", message.id());
                self.finish(
                    message,
                    DeliveryOutcome::Failed(RoutingError::TransmissionFailed(reason)),
                );
            }
            Err(TransmitError::Delay(delay)) => {
                debug!("Transport asked to retry message {} in {delay:?}", message.id());
                let reason = format!("transport requested a retry in {delay:?}");
                self.retry_or_fail(message, delay, RoutingError::TransmissionFailed(reason));
            }
            Err(TransmitError::Failed(reason)) => {
                debug!("Transmission of message {} failed: {reason}", message.id());
                let delay = self.backoff.delay_for(message.retry_count());
                self.retry_or_fail(message, delay, RoutingError::TransmissionFailed(reason));
            }
        }
    }

    /// Queues `message` again after `delay`, or ends it with `terminal` when
    /// the retry would land at or past its TTL or exceed the retry limit.
    fn retry_or_fail(&self, mut message: DelayableMessage, delay: Duration, terminal: RoutingError) {
        let cancelled = self
            .lock_state()
            .in_flight
            .get(message.id())
            .is_some_and(|f| f.cancelled);
        if cancelled {
            self.finish(message, DeliveryOutcome::Failed(RoutingError::Cancelled));
            return;
        }

        let now = self.clock.now_ms();
        let ready_at = now.saturating_add(delay.as_millis() as i64);
        let retries_exhausted = self
            .settings
            .max_retries()
            .is_some_and(|max| message.retry_count() >= max);
        if ready_at >= message.message().ttl_absolute_ms() || retries_exhausted {
            debug!(
                "Giving up on message {} after {} retries: {terminal}",
                message.id(),
                message.retry_count()
            );
            self.finish(message, DeliveryOutcome::Failed(terminal));
            return;
        }

        message.reschedule(ready_at);
        // Persist before the message becomes visible to other workers, so a
        // fast delivery can't remove it from the store ahead of this write.
        if let Some(persister) = &self.persister {
            persister.persist(&self.settings.queue_id, &message);
        }

        // A cancel may have landed while the store was written; the flag is
        // checked again under the lock that makes the message visible.
        let cancelled = {
            let mut state = self.lock_state();
            match state.in_flight.remove(message.id()) {
                Some(in_flight) if in_flight.cancelled => Some(message),
                _ => {
                    let id = message.id().to_string();
                    if !state.queue.push(message) {
                        error!("Message {id} was queued twice");
                    }
                    None
                }
            }
        };
        match cancelled {
            Some(message) => {
                self.finish(message, DeliveryOutcome::Failed(RoutingError::Cancelled));
            }
            None => self.wakeup.notify_one(),
        }
    }

    fn finish(&self, mut message: DelayableMessage, outcome: DeliveryOutcome) {
        self.lock_state().in_flight.remove(message.id());
        if let Some(persister) = &self.persister {
            persister.remove(&self.settings.queue_id, message.id());
        }

        if let DeliveryOutcome::Failed(error) = &outcome {
            if let Some(action) = message.take_failure_action() {
                action(error.clone());
            }
        }

        let listeners: Vec<Arc<dyn MessageProcessedListener>> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.message_processed(message.message(), &outcome);
        }
    }
}
