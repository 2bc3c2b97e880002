use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, trace, warn};

use super::handler::{MessageListener, RequestHandler};
use super::reply_caller::{ReplyCallback, ReplyCallerDirectory};
use crate::backpressure::BackpressureController;
use crate::config::DispatcherSettings;
use crate::message::{Message, MessageType, ParticipantId};
use crate::routing::{DeliveryOutcome, MessageProcessedListener, MessageRouter};
use crate::utils::clock::SharedClock;
use crate::utils::error::DispatchError;

#[derive(Clone)]
struct RegisteredHandler {
    handler: Arc<dyn RequestHandler>,
    /// Present for single-threaded handlers.
    serial: Option<Arc<AsyncMutex<()>>>,
}

/// An inbound request together with the handler it was routed to.
struct PendingRequest {
    request: Message,
    registered: RegisteredHandler,
}

/// Connects callers and providers to the router
/// Outbound messages go to the router; inbound messages are handed to reply
/// waiters, request handlers or message listeners depending on their type
pub struct Dispatcher {
    router: MessageRouter,
    clock: SharedClock,
    reply_callers: ReplyCallerDirectory,
    handlers: RwLock<HashMap<ParticipantId, RegisteredHandler>>,
    listeners: RwLock<HashMap<ParticipantId, Arc<dyn MessageListener>>>,
    handler_pool: Arc<Semaphore>,
    /// Requests that arrived while every pool slot was taken.
    waiting_requests: Mutex<VecDeque<PendingRequest>>,
    backpressure: Option<Arc<BackpressureController>>,
}

impl Dispatcher {
    /// Creates a dispatcher and subscribes it to the router's delivery
    /// outcomes, so requests that can't be delivered fail their waiters.
    pub fn new(
        router: MessageRouter,
        settings: &DispatcherSettings,
        clock: SharedClock,
        backpressure: Option<Arc<BackpressureController>>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            router,
            clock,
            reply_callers: ReplyCallerDirectory::default(),
            handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            handler_pool: Arc::new(Semaphore::new(settings.handler_pool_size.max(1))),
            waiting_requests: Mutex::new(VecDeque::new()),
            backpressure,
        });
        dispatcher.router.add_message_processed_listener(&dispatcher);
        dispatcher
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    // ---- registration ----

    pub fn register_request_handler(&self, participant_id: &str, handler: Arc<dyn RequestHandler>) {
        let serial = handler
            .single_threaded()
            .then(|| Arc::new(AsyncMutex::new(())));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(participant_id.to_string(), RegisteredHandler { handler, serial });
        debug!("Registered request handler for {participant_id}");
    }

    pub fn unregister_request_handler(&self, participant_id: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(participant_id)
            .is_some()
    }

    pub fn register_message_listener(&self, participant_id: &str, listener: Arc<dyn MessageListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(participant_id.to_string(), listener);
    }

    pub fn unregister_message_listener(&self, participant_id: &str) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(participant_id)
            .is_some()
    }

    /// Registers `callback` for the reply carrying `request_reply_id`
    /// The callback runs once: with the reply, with the error the reply
    /// carries, or with `Timeout` once `expiry_date_ms` has passed
    pub fn register_reply_waiter(
        &self,
        request_reply_id: &str,
        callback: ReplyCallback,
        expiry_date_ms: i64,
    ) -> Result<(), DispatchError> {
        self.reply_callers
            .add(request_reply_id, callback, expiry_date_ms)
            .map_err(|_| {
                DispatchError::InvalidRequest(format!(
                    "a reply waiter for {request_reply_id} already exists"
                ))
            })
    }

    /// Drops a waiter without invoking it.
    pub fn remove_reply_waiter(&self, request_reply_id: &str) -> bool {
        self.reply_callers.take(request_reply_id).is_some()
    }

    pub fn pending_replies(&self) -> usize {
        self.reply_callers.len()
    }

    /// Inbound requests waiting for a free handler slot.
    pub fn waiting_requests(&self) -> usize {
        self.lock_waiting().len()
    }

    /// Resolves every waiter expired at `now_ms` with `Timeout`.
    pub fn sweep_expired_reply_waiters(&self, now_ms: i64) -> usize {
        let expired = self.reply_callers.take_expired(now_ms);
        let count = expired.len();
        for caller in expired {
            caller.resolve(Err(DispatchError::Timeout));
        }
        if count > 0 {
            debug!("Timed out {count} reply waiters");
        }
        count
    }

    // ---- outbound ----

    /// Hands any message to the router.
    pub fn send(&self, message: Message) -> Result<(), DispatchError> {
        self.router.enqueue(message)?;
        Ok(())
    }

    /// Sends a request and registers `callback` for its reply, expiring with
    /// the request's TTL
    /// If this returns an error the callback has not been invoked and never
    /// will be
    pub fn send_request(&self, request: Message, callback: ReplyCallback) -> Result<(), DispatchError> {
        let Some(request_reply_id) = request.request_reply_id().map(str::to_string) else {
            return Err(DispatchError::InvalidRequest(format!(
                "message {} has no request-reply id",
                request.id()
            )));
        };
        if !matches!(
            request.message_type(),
            MessageType::Request | MessageType::SubscriptionRequest
        ) {
            return Err(DispatchError::InvalidRequest(format!(
                "message {} is a {:?}, not a request",
                request.id(),
                request.message_type()
            )));
        }

        self.register_reply_waiter(&request_reply_id, callback, request.ttl_absolute_ms())?;
        if let Err(e) = self.router.enqueue(request) {
            self.reply_callers.take(&request_reply_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Sends a request and waits for its reply payload.
    pub async fn request(&self, request: Message) -> Result<Vec<u8>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(
            request,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        // The sender only disappears without a value if the waiter was removed.
        rx.await.unwrap_or(Err(DispatchError::Timeout))
    }

    // ---- inbound ----

    /// Entry point for every message a transport receives for this node.
    pub fn message_arrived(self: &Arc<Self>, message: Message) {
        let now = self.clock.now_ms();
        if message.is_expired(now) {
            debug!("Discarding expired message {}", message.id());
            self.inbound_done(&message);
            return;
        }

        trace!(
            "Message {} ({:?}) arrived for {}",
            message.id(),
            message.message_type(),
            message.recipient()
        );
        match message.message_type() {
            MessageType::Reply | MessageType::SubscriptionReply => self.handle_reply(message, now),
            MessageType::Request | MessageType::SubscriptionRequest => self.handle_request(message),
            MessageType::OneWay | MessageType::Publication | MessageType::Multicast => {
                self.handle_one_way(message)
            }
        }
    }

    fn handle_reply(&self, reply: Message, now_ms: i64) {
        let Some(request_reply_id) = reply.request_reply_id() else {
            warn!("Reply {} carries no request-reply id, discarded", reply.id());
            return;
        };
        let Some(caller) = self.reply_callers.take(request_reply_id) else {
            debug!("No waiter for reply {request_reply_id}, discarded");
            return;
        };

        if caller.is_expired(now_ms) {
            caller.resolve(Err(DispatchError::Timeout));
            return;
        }
        match reply.reply_error() {
            Some(error) => caller.resolve(Err(error)),
            None => caller.resolve(Ok(reply.payload().to_vec())),
        }
    }

    fn handle_request(self: &Arc<Self>, request: Message) {
        let registered = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request.recipient())
            .cloned();

        let Some(registered) = registered else {
            debug!("No request handler for {}", request.recipient());
            let error = DispatchError::UnknownParticipant(request.recipient().to_string());
            self.send_reply(request.create_error_reply(&error));
            self.inbound_done(&request);
            return;
        };

        let job = PendingRequest {
            request,
            registered,
        };
        // Slots are only handed back under this lock, so a request parked
        // here is always picked up by a running task.
        let permit = {
            let mut waiting = self.lock_waiting();
            match Arc::clone(&self.handler_pool).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    trace!("Handler pool busy, request {} waits", job.request.id());
                    waiting.push_back(job);
                    return;
                }
            }
        };

        let dispatcher = Arc::clone(self);
        tokio::spawn(dispatcher.serve_requests(job, permit));
    }

    /// Runs `job` and then every request that queued up behind it, keeping
    /// one pool slot until nothing is left.
    async fn serve_requests(self: Arc<Self>, mut job: PendingRequest, mut permit: OwnedSemaphorePermit) {
        loop {
            self.run_handler(job).await;
            match self.next_waiting_request(permit) {
                Some((next, held)) => {
                    job = next;
                    permit = held;
                }
                None => return,
            }
        }
    }

    fn next_waiting_request(
        &self,
        permit: OwnedSemaphorePermit,
    ) -> Option<(PendingRequest, OwnedSemaphorePermit)> {
        let mut waiting = self.lock_waiting();
        match waiting.pop_front() {
            Some(job) => Some((job, permit)),
            None => {
                drop(permit);
                None
            }
        }
    }

    async fn run_handler(&self, job: PendingRequest) {
        let PendingRequest {
            request,
            registered: RegisteredHandler { handler, serial },
        } = job;
        if request.is_expired(self.clock.now_ms()) {
            debug!("Request {} expired while waiting for a handler", request.id());
            self.inbound_done(&request);
            return;
        }

        let _serial_guard = match &serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let reply = match handler.handle(&request).await {
            Ok(payload) => request.create_reply(payload),
            Err(reason) => {
                warn!("Handler for {} failed: {reason}", request.recipient());
                request.create_error_reply(&DispatchError::ProviderRuntime(reason))
            }
        };
        self.send_reply(reply);
        self.inbound_done(&request);
    }

    fn lock_waiting(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.waiting_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_one_way(&self, message: Message) {
        let listener = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message.recipient())
            .cloned();
        match listener {
            Some(listener) => listener.on_message(&message),
            None => warn!(
                "No listener for {}, dropping message {}",
                message.recipient(),
                message.id()
            ),
        }
    }

    fn send_reply(&self, reply: Message) {
        let id = reply.id().to_string();
        if let Err(e) = self.router.enqueue(reply) {
            warn!("Could not send reply {id}: {e}");
        }
    }

    fn inbound_done(&self, message: &Message) {
        if let Some(backpressure) = &self.backpressure {
            backpressure.message_processed(message.id());
        }
    }
}

impl MessageProcessedListener for Dispatcher {
    fn message_processed(&self, message: &Message, outcome: &DeliveryOutcome) {
        let DeliveryOutcome::Failed(error) = outcome else {
            return;
        };
        if !matches!(
            message.message_type(),
            MessageType::Request | MessageType::SubscriptionRequest
        ) {
            return;
        }
        let Some(request_reply_id) = message.request_reply_id() else {
            return;
        };
        if let Some(caller) = self.reply_callers.take(request_reply_id) {
            debug!("Request {} failed: {error}", message.id());
            caller.resolve(Err(DispatchError::Routing(error.clone())));
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending_replies", &self.reply_callers.len())
            .field("waiting_requests", &self.waiting_requests())
            .field("router", &self.router)
            .finish()
    }
}
