//! The `node` module assembles one routemesh node from its settings.
//!
//! A node owns the routing table, the capabilities directory, the router with
//! its transport stubs, the dispatcher and the backpressure controller, and
//! runs a single maintenance tick that sweeps everything that expires.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::address::{Address, TransportKind};
use crate::backpressure::BackpressureController;
use crate::capabilities::{CapabilitiesDirectory, DiscoveryEntry, ProviderQos};
use crate::config::Settings;
use crate::dispatcher::{Dispatcher, RequestHandler};
use crate::message::Message;
use crate::persistence::{MessagePersister, SledPersister};
use crate::routing::{MessageRouter, RoutingTable};
use crate::transport::{
    ChannelClient, ChannelEndpoint, ChannelRegistry, ChannelServer, ChannelStub, InProcessStub,
    start_channel_server,
};
use crate::utils::clock::{SharedClock, system_clock};
use crate::utils::error::{DirectoryError, PersistenceError, TransportError};

/// Participant id of the provider every served node answers pings on.
pub const PING_PARTICIPANT_ID: &str = "routemesh.ping";

/// How long a provider registered through [`Node::register_provider`] stays
/// in the directory without being refreshed.
const PROVIDER_REGISTRATION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct Node {
    settings: Settings,
    clock: SharedClock,
    routing_table: Arc<RoutingTable>,
    directory: Arc<CapabilitiesDirectory>,
    backpressure: Arc<BackpressureController>,
    router: MessageRouter,
    dispatcher: Arc<Dispatcher>,
    channels: Arc<ChannelRegistry>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(settings: Settings) -> Result<Self, PersistenceError> {
        Self::with_clock(settings, system_clock())
    }

    pub fn with_clock(settings: Settings, clock: SharedClock) -> Result<Self, PersistenceError> {
        let routing_table = Arc::new(RoutingTable::new(clock.clone()));
        let directory = Arc::new(CapabilitiesDirectory::new(
            routing_table.clone(),
            settings.directory.conflict_policy,
            clock.clone(),
        ));
        let backpressure = Arc::new(BackpressureController::new(
            settings.backpressure.clone(),
            clock.clone(),
        ));

        let mut router = MessageRouter::builder(settings.router.clone())
            .clock(clock.clone())
            .routing_table(routing_table.clone())
            .directory(directory.clone());
        if settings.persistence.enabled {
            let persister: Arc<dyn MessagePersister> =
                Arc::new(SledPersister::open(&settings.persistence.path)?);
            router = router.persister(persister);
        }
        let router = router.build();

        let dispatcher = Dispatcher::new(
            router.clone(),
            &settings.dispatcher,
            clock.clone(),
            Some(backpressure.clone()),
        );

        let channels = Arc::new(ChannelRegistry::new());
        router.register_stub(
            TransportKind::InProcess,
            Arc::new(InProcessStub::new(&dispatcher)),
        );
        router.register_stub(
            TransportKind::Channel,
            Arc::new(ChannelStub::new(channels.clone(), Some(backpressure.clone()))),
        );

        Ok(Self {
            settings,
            clock,
            routing_table,
            directory,
            backpressure,
            router,
            dispatcher,
            channels,
            maintenance: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn directory(&self) -> &Arc<CapabilitiesDirectory> {
        &self.directory
    }

    pub fn backpressure(&self) -> &Arc<BackpressureController> {
        &self.backpressure
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Starts the router workers and the maintenance tick.
    pub fn start(&self) {
        self.router.start();
        let mut maintenance = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if maintenance.is_none() {
            *maintenance = Some(spawn_maintenance(
                Duration::from_millis(self.settings.maintenance.interval_ms),
                self.clock.clone(),
                self.dispatcher.clone(),
                self.directory.clone(),
                self.routing_table.clone(),
            ));
        }
    }

    pub fn channel_endpoint(&self) -> ChannelEndpoint {
        ChannelEndpoint::new(
            self.settings.server.channel_id.clone(),
            self.dispatcher.clone(),
            self.channels.clone(),
            Some(self.backpressure.clone()),
        )
    }

    /// Accepts channel connections on the configured host and port.
    pub async fn serve(&self) -> Result<ChannelServer, TransportError> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        start_channel_server(&addr, self.channel_endpoint()).await
    }

    pub async fn connect(&self, url: &str) -> Result<ChannelClient, TransportError> {
        ChannelClient::connect(url, self.channel_endpoint()).await
    }

    /// Makes a participant living on this node reachable, for example a
    /// consumer that expects replies.
    pub fn register_local_participant(&self, participant_id: &str) {
        self.routing_table
            .add(participant_id, Address::InProcess, false);
    }

    /// Registers a local provider: its request handler and its directory entry.
    pub fn register_provider(
        &self,
        participant_id: &str,
        domain: &str,
        interface_name: &str,
        handler: Arc<dyn RequestHandler>,
        provider_qos: ProviderQos,
    ) -> Result<(), DirectoryError> {
        let now = self.clock.now_ms();
        self.directory.add(DiscoveryEntry {
            participant_id: participant_id.to_string(),
            domain: domain.to_string(),
            interface_name: interface_name.to_string(),
            address: Address::InProcess,
            provider_qos,
            last_seen_ms: now,
            expiry_date_ms: now.saturating_add(PROVIDER_REGISTRATION_TTL.as_millis() as i64),
        })?;
        self.dispatcher
            .register_request_handler(participant_id, handler);
        Ok(())
    }

    /// Removes a local provider and stops delivering messages still queued
    /// for it.
    pub fn unregister_provider(&self, participant_id: &str) {
        self.dispatcher.unregister_request_handler(participant_id);
        self.directory.remove(participant_id);
        let cancelled = self.router.cancel_for_recipient(participant_id);
        if cancelled > 0 {
            debug!("Dropped {cancelled} messages queued for {participant_id}");
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.router.shutdown().await;
        info!("Node {} stopped", self.settings.server.channel_id);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("channel_id", &self.settings.server.channel_id)
            .field("router", &self.router)
            .field("directory_entries", &self.directory.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// Runs one coalesced sweep every `interval`: reply waiters time out,
/// expired discovery entries and routing entries are removed.
pub fn spawn_maintenance(
    interval: Duration,
    clock: SharedClock,
    dispatcher: Arc<Dispatcher>,
    directory: Arc<CapabilitiesDirectory>,
    routing_table: Arc<RoutingTable>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = clock.now_ms();
            let replies = dispatcher.sweep_expired_reply_waiters(now);
            let entries = directory.sweep_expired(now);
            let routes = routing_table.purge(now);
            if replies + entries + routes > 0 {
                debug!("Maintenance swept {replies} replies, {entries} entries, {routes} routes");
            }
        }
    })
}

/// Answers every request with `pong`.
#[derive(Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl RequestHandler for PingHandler {
    async fn handle(&self, _request: &Message) -> Result<Vec<u8>, String> {
        Ok(b"pong".to_vec())
    }
}
