use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::{
    keys, CorrelationIdGenerator, CourierError, Envelope, EnvelopeKind, MessageBus,
    PromiseConfig, PublishInterceptor, Rejection, RequestDispatcher, RequestOptions,
    RequestReplyConfig, REPLY_CHANNEL, TIMEOUT_MESSAGE,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

// Spawns a responder answering every request on (channel, topic) with `answer`
fn spawn_responder<A>(bus: &MessageBus, channel: &str, topic: &str, answer: A)
where
    A: Fn(Envelope) + Send + 'static,
{
    let (_sid, mut rx) = bus.subscribe(channel, topic);
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            answer(req);
        }
    });
}

#[tokio::test]
async fn request_resolves_with_reply_data() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    spawn_responder(&bus, "channel1", "who.are.you", move |req| {
        req.reply(None, json!({ "name": "I'm the Doctor" })).unwrap();
        let _ = seen_tx.send(req);
    });

    let answer = dispatcher
        .request(
            RequestOptions::new("who.are.you")
                .channel("channel1")
                .data(json!({ "asking": "Martha" })),
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(answer, json!({ "name": "I'm the Doctor" }));

    let req = seen_rx.recv().await.unwrap();
    assert_eq!(req.data, json!({ "asking": "Martha" }));
    let headers = req.wire_headers();
    assert_eq!(headers.get(keys::REPLYABLE), Some(&json!(true)));
    assert_eq!(headers.get(keys::REQUEST_ID), headers.get(keys::REPLY_TOPIC));
    assert_eq!(headers.get(keys::REPLY_CHANNEL), Some(&json!(REPLY_CHANNEL)));
}

#[tokio::test]
async fn request_times_out_when_reply_is_late() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let (late_tx, late_rx) = oneshot::channel();
    let late_tx = Arc::new(Mutex::new(Some(late_tx)));
    spawn_responder(&bus, "channel2", "y.u.no", move |req| {
        let late_tx = Arc::clone(&late_tx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            let delivered = req.reply(None, json!({ "msg": "u mad bro?" }));
            if let Some(tx) = late_tx.lock().unwrap().take() {
                let _ = tx.send(delivered);
            }
        });
    });

    let future = dispatcher
        .request(
            RequestOptions::new("y.u.no")
                .channel("channel2")
                .data(json!({}))
                .timeout(Duration::from_millis(500)),
        )
        .unwrap();
    let err = future.await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), TIMEOUT_MESSAGE);

    // Timer and reply subscription are gone as soon as the request settled
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);

    // The late reply finds nobody listening
    let delivered = late_rx.await.unwrap().unwrap();
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn error_reply_rejects_with_exact_value() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    spawn_responder(&bus, "channel2", "y.u.no", |req| {
        req.reply(Some(json!({ "msg": "OHSNAP! You failed." })), Value::Null)
            .unwrap();
    });

    let err = dispatcher
        .request(RequestOptions::new("y.u.no").channel("channel2"))
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Rejection::Application(json!({ "msg": "OHSNAP! You failed." }))
    );
    assert_eq!(
        err.application_value(),
        Some(&json!({ "msg": "OHSNAP! You failed." }))
    );
}

#[tokio::test]
async fn falsy_error_argument_is_a_success_reply() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    spawn_responder(&bus, "/", "falsy", |req| {
        req.reply(Some(json!(false)), json!("fine")).unwrap();
    });

    let answer = dispatcher
        .request(RequestOptions::new("falsy"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(answer, json!("fine"));
}

#[test]
fn unconfigured_adapter_fails_before_any_side_effect() {
    let bus = MessageBus::new();
    let dispatcher: RequestDispatcher =
        RequestDispatcher::new(bus.clone(), PromiseConfig::unconfigured());

    let err = dispatcher
        .request(RequestOptions::new("who.are.you").channel("channel1"))
        .unwrap_err();
    assert!(matches!(err, CourierError::Configuration(_)));
    assert!(err
        .to_string()
        .starts_with("You need to provide an implementation for postal.configuration.promise"));

    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
    assert!(bus.stats("channel1").is_none());
    assert_eq!(dispatcher.pending_count(), 0);
}

#[test]
fn missing_get_promise_is_reported() {
    let bus = MessageBus::new();
    let config = PromiseConfig::unconfigured().create_deferred(courier_core::OneshotDeferred::new);
    let dispatcher: RequestDispatcher = RequestDispatcher::new(bus.clone(), config);

    let err = dispatcher
        .request(RequestOptions::new("who.are.you"))
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("postal.configuration.promise.getPromise"));
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

#[tokio::test]
async fn concurrent_requests_do_not_cross_talk() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    // Answers the first request last
    spawn_responder(&bus, "math", "double", |req| {
        tokio::spawn(async move {
            let n = req.data.as_i64().unwrap_or_default();
            let delay = if n == 1 { 150 } else { 10 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            req.reply(None, json!(n * 2)).unwrap();
        });
    });

    let first = dispatcher
        .request(RequestOptions::new("double").channel("math").data(json!(1)))
        .unwrap();
    let second = dispatcher
        .request(RequestOptions::new("double").channel("math").data(json!(21)))
        .unwrap();
    assert_eq!(dispatcher.pending_count(), 2);

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), json!(2));
    assert_eq!(b.unwrap(), json!(42));
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn replies_are_published_with_resolver_no_cache() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let (_spy, mut replies) = bus.subscribe(REPLY_CHANNEL, "#");
    spawn_responder(&bus, "channel1", "who.are.you", |req| {
        req.reply(None, json!("hello")).unwrap();
    });

    dispatcher
        .request(RequestOptions::new("who.are.you").channel("channel1"))
        .unwrap()
        .await
        .unwrap();

    let reply = replies.recv().await.unwrap();
    assert!(reply.kind.is_reply());
    let headers = reply.wire_headers();
    assert_eq!(headers.get(keys::RESOLVER_NO_CACHE), Some(&json!(true)));
    assert_eq!(headers.get(keys::IS_REPLY), Some(&json!(true)));
    assert_eq!(headers.get(keys::IS_ERROR), Some(&json!(false)));

    // Only the request binding was cached; single-use reply topics were not
    assert_eq!(bus.resolver_cache_len(), 1);
}

#[tokio::test]
async fn reply_before_timeout_releases_timer_and_subscription() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    spawn_responder(&bus, "/", "quick", |req| {
        req.reply(None, json!("done")).unwrap();
    });

    let future = dispatcher
        .request(RequestOptions::new("quick").timeout(Duration::from_millis(200)))
        .unwrap();
    assert_eq!(dispatcher.pending_count(), 1);
    assert_eq!(future.await.unwrap(), json!("done"));
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

#[tokio::test]
async fn explicit_reply_route_is_used() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    spawn_responder(&bus, "/", "route.me", move |req| {
        let replier = req.replier().unwrap();
        let _ = seen_tx.send((
            replier.reply_channel().to_string(),
            replier.reply_topic().to_string(),
        ));
        replier.reply_ok(json!("routed")).unwrap();
    });

    let answer = dispatcher
        .request(
            RequestOptions::new("route.me")
                .reply_channel("replies")
                .reply_topic("route.me.answer"),
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(answer, json!("routed"));
    assert_eq!(
        seen_rx.recv().await.unwrap(),
        ("replies".to_string(), "route.me.answer".to_string())
    );
    assert_eq!(bus.subscription_count("replies"), 0);
}

#[tokio::test]
async fn supplied_envelope_gets_fresh_correlation_headers() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    spawn_responder(&bus, "channel1", "who.are.you", move |req| {
        req.reply(None, req.data.clone()).unwrap();
        let _ = seen_tx.send(req.wire_headers());
    });

    let envelope = Envelope::new("who.are.you", json!("echo"))
        .with_channel("channel1")
        .with_header(keys::REPLYABLE, json!(false))
        .with_header(keys::REQUEST_ID, json!("stale"))
        .with_header("traceId", json!("t-1"));
    let answer = dispatcher
        .request(RequestOptions::from_envelope(envelope))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(answer, json!("echo"));

    let headers = seen_rx.recv().await.unwrap();
    assert_eq!(headers.get(keys::REPLYABLE), Some(&json!(true)));
    assert_ne!(headers.get(keys::REQUEST_ID), Some(&json!("stale")));
    assert_eq!(headers.get("traceId"), Some(&json!("t-1")));
}

#[tokio::test]
async fn dispatcher_default_timeout_applies() {
    let bus = MessageBus::new();
    let config = RequestReplyConfig::default().with_default_timeout(Duration::from_millis(50));
    let dispatcher = RequestDispatcher::with_config(bus.clone(), PromiseConfig::tokio(), config);

    let err = dispatcher
        .request(RequestOptions::new("nobody.home"))
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

#[tokio::test]
async fn request_without_topic_is_rejected() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let err = dispatcher.request(RequestOptions::default()).unwrap_err();
    assert!(matches!(err, CourierError::InvalidRequest(_)));
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

#[tokio::test]
async fn bus_reset_drops_pending_request() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let future = dispatcher.request(RequestOptions::new("silence")).unwrap();
    bus.reset();
    assert_eq!(future.await, Err(Rejection::Dropped));
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn huge_timeout_has_no_deadline() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone()).with_id_generator(Arc::new(FixedIds));

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    spawn_responder(&bus, "/", "patient", move |req| {
        let release_rx = release_rx.lock().unwrap().take();
        tokio::spawn(async move {
            if let Some(rx) = release_rx {
                let _ = rx.await;
            }
            req.reply(None, json!("eventually")).unwrap();
        });
    });

    let future = dispatcher
        .request(RequestOptions::new("patient").timeout(Duration::MAX))
        .unwrap();
    assert!(dispatcher.pending("fixed-id").unwrap().deadline.is_none());

    release_tx.send(()).unwrap();
    assert_eq!(future.await.unwrap(), json!("eventually"));
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

// Answers requests from inside the publish call that carries them
struct InlineResponder;

impl PublishInterceptor for InlineResponder {
    fn name(&self) -> &str {
        "inline-responder"
    }

    fn before_publish(&self, envelope: &mut Envelope, _bus: &MessageBus) {
        if matches!(envelope.kind, EnvelopeKind::Request { .. }) {
            envelope.reply(None, json!("sync")).unwrap();
        }
    }
}

#[tokio::test]
async fn reply_published_during_request_publish_is_received() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());
    // Installed after the reply router, so the replier is already attached
    assert!(bus.add_interceptor(Arc::new(InlineResponder)));

    let answer = tokio::time::timeout(
        Duration::from_millis(500),
        dispatcher
            .request(RequestOptions::new("instant").timeout(Duration::from_millis(200)))
            .unwrap(),
    )
    .await
    .expect("request never settled");
    assert_eq!(answer, Ok(json!("sync")));
    assert_eq!(dispatcher.pending_count(), 0);
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

#[tokio::test]
async fn dropped_future_releases_request() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone());

    let future = dispatcher.request(RequestOptions::new("forgotten")).unwrap();
    assert_eq!(dispatcher.pending_count(), 1);
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 1);
    drop(future);

    tokio::time::timeout(Duration::from_millis(500), async {
        while dispatcher.pending_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("abandoned request was never released");
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 0);
}

struct FixedIds;

impl CorrelationIdGenerator for FixedIds {
    fn create(&self) -> String {
        "fixed-id".to_string()
    }
}

#[tokio::test]
async fn colliding_request_id_is_refused() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone()).with_id_generator(Arc::new(FixedIds));

    let _first = dispatcher.request(RequestOptions::new("slow")).unwrap();
    let pending = dispatcher.pending("fixed-id").unwrap();
    assert_eq!(pending.reply_topic, "fixed-id");
    assert_eq!(pending.reply_channel, REPLY_CHANNEL);
    assert!(pending.deadline.is_none());

    let err = dispatcher.request(RequestOptions::new("slow")).unwrap_err();
    assert!(matches!(err, CourierError::DuplicateRequest(id) if id == "fixed-id"));
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_colliding_requests_admit_one() {
    let bus = MessageBus::new();
    let dispatcher = RequestDispatcher::tokio(bus.clone()).with_id_generator(Arc::new(FixedIds));

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.request(RequestOptions::new("slow")) })
        })
        .collect();

    let mut admitted = Vec::new();
    let mut refused = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(future) => admitted.push(future),
            Err(CourierError::DuplicateRequest(_)) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(refused, 15);
    assert_eq!(bus.subscription_count(REPLY_CHANNEL), 1);
}

// Deferred whose settlement operations are not named resolve/reject
struct Mailbox {
    tx: Mutex<Option<oneshot::Sender<String>>>,
    rx: Option<oneshot::Receiver<String>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Some(rx),
        }
    }

    fn post(&self, msg: String) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(msg);
        }
    }
}

#[tokio::test]
async fn custom_adapter_with_own_settlement_verbs() {
    let bus = MessageBus::new();
    let config = PromiseConfig::with_verbs(
        |m: &Mailbox, data| m.post(format!("done:{data}")),
        |m: &Mailbox, reason| m.post(format!("failed:{reason}")),
    )
    .create_deferred(Mailbox::new)
    .get_promise(|m: &mut Mailbox| m.rx.take());
    let dispatcher = RequestDispatcher::new(bus.clone(), config);

    spawn_responder(&bus, "/", "answer", |req| {
        req.reply(None, json!(42)).unwrap();
    });

    let promise = dispatcher
        .request(RequestOptions::new("answer"))
        .unwrap()
        .unwrap();
    assert_eq!(promise.await.unwrap(), "done:42");

    let promise = dispatcher
        .request(RequestOptions::new("unanswered").timeout(Duration::from_millis(20)))
        .unwrap()
        .unwrap();
    assert_eq!(
        promise.await.unwrap(),
        format!("failed:{TIMEOUT_MESSAGE}")
    );
}
