use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use super::*;
use crate::address::{Address, TransportKind};
use crate::backpressure::BackpressureController;
use crate::config::{BackpressureSettings, DispatcherSettings, RouterSettings};
use crate::message::{Message, MessageType};
use crate::routing::MessageRouter;
use crate::transport::InProcessStub;
use crate::utils::clock::{Clock, ManualClock, SharedClock, system_clock};
use crate::utils::error::{DispatchError, RoutingError};

fn router_settings() -> RouterSettings {
    RouterSettings {
        retry_interval_ms: 10,
        max_delay_ms: 20,
        jitter_ratio: 0.0,
        max_retry_count: -1,
        max_parallel_sends: 2,
        queue_id: "dispatcher-test".to_string(),
    }
}

fn local_node(
    clock: SharedClock,
    backpressure: Option<Arc<BackpressureController>>,
) -> Arc<Dispatcher> {
    local_node_with_pool(clock, backpressure, 4)
}

fn local_node_with_pool(
    clock: SharedClock,
    backpressure: Option<Arc<BackpressureController>>,
    handler_pool_size: usize,
) -> Arc<Dispatcher> {
    let router = MessageRouter::builder(router_settings())
        .clock(clock.clone())
        .build();
    let dispatcher = Dispatcher::new(
        router.clone(),
        &DispatcherSettings { handler_pool_size },
        clock,
        backpressure,
    );
    router.register_stub(
        TransportKind::InProcess,
        Arc::new(InProcessStub::new(&dispatcher)),
    );
    for participant in ["consumer", "provider", "nobody-home"] {
        router.routing_table().add(participant, Address::InProcess, false);
    }
    router.start();
    dispatcher
}

fn request_to(recipient: &str, payload: &[u8]) -> Message {
    let (builder, _) = Message::builder(MessageType::Request, "consumer", recipient)
        .ttl_from_now(Duration::from_secs(5))
        .payload(payload.to_vec())
        .with_request_reply_id();
    builder.build()
}

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: &Message) -> Result<Vec<u8>, String> {
        Ok(request.payload().to_ascii_uppercase())
    }
}

struct FailingHandler;

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(&self, _request: &Message) -> Result<Vec<u8>, String> {
        Err("boom".to_string())
    }
}

/// Records the highest number of concurrent invocations it has seen.
#[derive(Default)]
struct ConcurrencyGauge {
    single_threaded: bool,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

#[async_trait]
impl RequestHandler for ConcurrencyGauge {
    async fn handle(&self, _request: &Message) -> Result<Vec<u8>, String> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    fn single_threaded(&self) -> bool {
        self.single_threaded
    }
}

/// Blocks every request until the test hands out permits.
struct GatedHandler {
    gate: tokio::sync::Semaphore,
    started: AtomicUsize,
    handled: AtomicUsize,
}

impl GatedHandler {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(0),
            started: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RequestHandler for GatedHandler {
    async fn handle(&self, _request: &Message) -> Result<Vec<u8>, String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|e| e.to_string())?;
        permit.forget();
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct CollectingListener {
    received: Mutex<Vec<Message>>,
}

impl MessageListener for CollectingListener {
    fn on_message(&self, message: &Message) {
        self.received.lock().unwrap().push(message.clone());
    }
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let dispatcher = local_node(system_clock(), None);
    dispatcher.register_request_handler("provider", Arc::new(EchoHandler));

    let reply = dispatcher.request(request_to("provider", b"hello")).await;
    assert_eq!(reply, Ok(b"HELLO".to_vec()));
    assert_eq!(dispatcher.pending_replies(), 0);
}

#[tokio::test]
async fn test_unknown_participant_gets_error_reply() {
    let dispatcher = local_node(system_clock(), None);

    let reply = dispatcher.request(request_to("nobody-home", b"hi")).await;
    assert_eq!(
        reply,
        Err(DispatchError::UnknownParticipant("nobody-home".to_string()))
    );
}

#[tokio::test]
async fn test_handler_error_becomes_provider_runtime_error() {
    let dispatcher = local_node(system_clock(), None);
    dispatcher.register_request_handler("provider", Arc::new(FailingHandler));

    let reply = dispatcher.request(request_to("provider", b"hi")).await;
    assert_eq!(reply, Err(DispatchError::ProviderRuntime("boom".to_string())));
}

#[tokio::test]
async fn test_undeliverable_request_fails_its_waiter() {
    let dispatcher = local_node(system_clock(), None);
    let (builder, _) = Message::builder(MessageType::Request, "consumer", "unrouted")
        .ttl_from_now(Duration::from_millis(100))
        .with_request_reply_id();

    let reply = dispatcher.request(builder.build()).await;
    assert_eq!(
        reply,
        Err(DispatchError::Routing(RoutingError::NoRouteFound(
            "unrouted".to_string()
        )))
    );
    assert_eq!(dispatcher.pending_replies(), 0);
}

#[tokio::test]
async fn test_send_request_requires_request_reply_id() {
    let dispatcher = local_node(system_clock(), None);
    let request = Message::builder(MessageType::Request, "consumer", "provider").build();

    let result = dispatcher.send_request(request, Box::new(|_| panic!("must not run")));
    assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
    assert_eq!(dispatcher.pending_replies(), 0);
}

#[tokio::test]
async fn test_sweep_times_out_expired_waiters_once() {
    let clock = Arc::new(ManualClock::new(1_000));
    let dispatcher = local_node(clock.clone(), None);
    let results = Arc::new(Mutex::new(Vec::new()));

    for (id, expiry) in [("r1", 1_500), ("r2", 3_000)] {
        let sink = results.clone();
        dispatcher
            .register_reply_waiter(id, Box::new(move |r| sink.lock().unwrap().push(r)), expiry)
            .unwrap();
    }

    clock.set(1_500);
    assert_eq!(dispatcher.sweep_expired_reply_waiters(clock.now_ms()), 1);
    assert_eq!(dispatcher.sweep_expired_reply_waiters(clock.now_ms()), 0);
    assert_eq!(*results.lock().unwrap(), vec![Err(DispatchError::Timeout)]);
    assert_eq!(dispatcher.pending_replies(), 1);
}

#[tokio::test]
async fn test_reply_after_waiter_expiry_resolves_as_timeout() {
    let clock = Arc::new(ManualClock::new(1_000));
    let dispatcher = local_node(clock.clone(), None);
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    dispatcher
        .register_reply_waiter("late", Box::new(move |r| sink.lock().unwrap().push(r)), 1_500)
        .unwrap();

    clock.set(1_600);
    let request = Message::builder(MessageType::Request, "consumer", "provider")
        .ttl_absolute_ms(10_000)
        .processor_header(crate::message::HEADER_REQUEST_REPLY_ID, "late")
        .build();
    dispatcher.message_arrived(request.create_reply(b"too late".to_vec()));

    assert_eq!(*results.lock().unwrap(), vec![Err(DispatchError::Timeout)]);
}

#[tokio::test]
async fn test_reply_without_waiter_is_discarded() {
    let dispatcher = local_node(system_clock(), None);
    let reply = request_to("provider", b"").create_reply(b"orphan".to_vec());
    dispatcher.message_arrived(reply);
    assert_eq!(dispatcher.pending_replies(), 0);
}

#[tokio::test]
async fn test_removed_waiter_is_never_invoked() {
    let dispatcher = local_node(system_clock(), None);
    dispatcher
        .register_reply_waiter("r1", Box::new(|_| panic!("must not run")), i64::MAX)
        .unwrap();
    assert!(dispatcher.remove_reply_waiter("r1"));
    assert!(!dispatcher.remove_reply_waiter("r1"));
    assert_eq!(dispatcher.sweep_expired_reply_waiters(i64::MAX), 0);
}

#[tokio::test]
async fn test_single_threaded_handler_is_serialized() {
    let dispatcher = local_node(system_clock(), None);
    let gauge = Arc::new(ConcurrencyGauge {
        single_threaded: true,
        ..Default::default()
    });
    dispatcher.register_request_handler("provider", gauge.clone());

    let requests = (0..4).map(|_| dispatcher.request(request_to("provider", b"")));
    let replies = join_all(requests).await;

    assert!(replies.iter().all(Result::is_ok));
    assert_eq!(gauge.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_multi_threaded_handler_runs_concurrently() {
    let dispatcher = local_node(system_clock(), None);
    let gauge = Arc::new(ConcurrencyGauge::default());
    dispatcher.register_request_handler("provider", gauge.clone());

    let requests = (0..4).map(|_| dispatcher.request(request_to("provider", b"")));
    let replies = join_all(requests).await;

    assert!(replies.iter().all(Result::is_ok));
    assert!(gauge.max_running.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_one_way_messages_reach_listeners() {
    let dispatcher = local_node(system_clock(), None);
    let listener = Arc::new(CollectingListener::default());
    dispatcher.register_message_listener("consumer", listener.clone());

    let publication = Message::builder(MessageType::Publication, "provider", "consumer")
        .ttl_from_now(Duration::from_secs(5))
        .payload(b"tick".to_vec())
        .build();
    dispatcher.message_arrived(publication.clone());
    let stray = Message::builder(MessageType::OneWay, "provider", "nobody-home")
        .ttl_from_now(Duration::from_secs(5))
        .build();
    dispatcher.message_arrived(stray);

    assert_eq!(*listener.received.lock().unwrap(), vec![publication]);
    assert!(dispatcher.unregister_message_listener("consumer"));
}

#[tokio::test]
async fn test_expired_inbound_message_is_discarded() {
    let dispatcher = local_node(system_clock(), None);
    let listener = Arc::new(CollectingListener::default());
    dispatcher.register_message_listener("consumer", listener.clone());

    let expired = Message::builder(MessageType::OneWay, "provider", "consumer")
        .ttl_absolute_ms(1)
        .build();
    dispatcher.message_arrived(expired);
    assert!(listener.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_processed_request_releases_backpressure() {
    let backpressure = Arc::new(BackpressureController::new(
        BackpressureSettings {
            enabled: true,
            max_incoming_requests: 1,
            lower_threshold: 0,
        },
        system_clock(),
    ));
    let dispatcher = local_node(system_clock(), Some(backpressure.clone()));
    dispatcher.register_request_handler("provider", Arc::new(EchoHandler));

    let request = request_to("provider", b"x");
    assert!(backpressure.admit_message(&request));
    assert_eq!(backpressure.in_flight(), 1);

    let done = Arc::new(Mutex::new(None));
    let sink = done.clone();
    let request_reply_id = request.request_reply_id().unwrap().to_string();
    dispatcher
        .register_reply_waiter(
            &request_reply_id,
            Box::new(move |r| *sink.lock().unwrap() = Some(r)),
            request.ttl_absolute_ms(),
        )
        .unwrap();
    dispatcher.message_arrived(request);

    for _ in 0..100 {
        if done.lock().unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*done.lock().unwrap(), Some(Ok(b"X".to_vec())));
    assert_eq!(backpressure.in_flight(), 0);
}

#[tokio::test]
async fn test_requests_wait_for_a_free_handler_slot() {
    let dispatcher = local_node_with_pool(system_clock(), None, 1);
    let handler = Arc::new(GatedHandler::new());
    dispatcher.register_request_handler("provider", handler.clone());

    for _ in 0..3 {
        dispatcher.message_arrived(request_to("provider", b""));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handler.started.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.waiting_requests(), 2);

    handler.gate.add_permits(3);
    for _ in 0..100 {
        if handler.handled.load(Ordering::SeqCst) == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    assert_eq!(dispatcher.waiting_requests(), 0);
}
