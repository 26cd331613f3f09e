use super::*;
use crate::config::RegistryConfig;
use crate::entity::{Entity, EntityCollection, EntityStateMap, SerializedEntityState};
use crate::event::Event;
use crate::session::{
    SessionError, SessionHub, SessionId, SessionPort, SubscribeRequest, SubscribedNotice,
    SubscriptionOptions, Topic, UnsubscribeRequest, UnsubscribedNotice,
};
use crate::spatial::{
    east_north_up_to_fixed_frame, Cartographic, FrameGraph, FrameRef, ReferenceFrame,
    StateSerializer,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Fixtures
// ============================================================================

struct Provider {
    hub: Arc<SessionHub>,
    entities: Arc<EntityCollection>,
    registry: Arc<SubscriptionRegistry>,
}

struct Consumer {
    port: Arc<SessionPort>,
    /// Provider-side id of this consumer's session
    session: SessionId,
    entities: Arc<EntityCollection>,
    tracker: Arc<SubscriptionTracker>,
}

fn provider(authorizer: Arc<dyn SubscriptionAuthorizer>) -> Provider {
    let entities = Arc::new(EntityCollection::new());
    let serializer = Arc::new(FrameGraph::new(Arc::clone(&entities), 32));
    provider_with(entities, serializer, authorizer)
}

fn provider_with(
    entities: Arc<EntityCollection>,
    serializer: Arc<dyn StateSerializer>,
    authorizer: Arc<dyn SubscriptionAuthorizer>,
) -> Provider {
    let hub = SessionHub::new();
    let registry = SubscriptionRegistry::new(
        &hub,
        Arc::clone(&entities),
        serializer,
        authorizer,
        &RegistryConfig::default(),
    );
    Provider {
        hub,
        entities,
        registry,
    }
}

fn connect(provider: &Provider) -> Consumer {
    let before: HashSet<SessionId> = provider.hub.sessions().iter().map(|p| p.id()).collect();
    let port = provider.hub.connect_loopback();
    let session = provider
        .hub
        .sessions()
        .iter()
        .map(|p| p.id())
        .find(|id| !before.contains(id))
        .unwrap();

    let entities = Arc::new(EntityCollection::new());
    let resolver = Arc::new(FrameGraph::new(Arc::clone(&entities), 32));
    let tracker = SubscriptionTracker::new(Arc::clone(&entities), Arc::clone(&port), resolver);

    Consumer {
        port,
        session,
        entities,
        tracker,
    }
}

/// Tracker over a bare port pair; returns the tracker, its entities and the
/// far end of the session
fn standalone_tracker() -> (Arc<SubscriptionTracker>, Arc<EntityCollection>, Arc<SessionPort>) {
    let (consumer, provider) = SessionPort::pair();
    let entities = Arc::new(EntityCollection::new());
    let resolver = Arc::new(FrameGraph::new(Arc::clone(&entities), 32));
    let tracker = SubscriptionTracker::new(Arc::clone(&entities), consumer, resolver);
    (tracker, entities, provider)
}

fn record<T: Clone + Send + 'static>(event: &Event<T>) -> Arc<Mutex<Vec<T>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    event.add_listener(move |value: &T| sink.lock().push(value.clone()));
    log
}

/// "+id" / "-id" per tracker transition, in raise order
fn record_transitions(tracker: &SubscriptionTracker) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    tracker
        .subscribed_event
        .add_listener(move |e| sink.lock().push(format!("+{}", e.id)));
    let sink = Arc::clone(&log);
    tracker
        .unsubscribed_event
        .add_listener(move |e| sink.lock().push(format!("-{}", e.id)));
    log
}

fn opts(value: Value) -> Option<SubscriptionOptions> {
    value.as_object().cloned()
}

fn tick(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + TimeDelta::seconds(seconds)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Round-trip a request nobody handles; every envelope sent before it has
/// been dispatched once it returns
async fn flush(port: &SessionPort) {
    let result = port.request(Topic::EntityFrame, &Value::Null).await;
    assert_eq!(result, Err(SessionError::UnhandledTopic(Topic::EntityFrame)));
}

/// Holds every authorization until a permit is released
struct GatedAuthorizer {
    gate: Semaphore,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl GatedAuthorizer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionAuthorizer for GatedAuthorizer {
    async fn allow_subscription(
        &self,
        _session: SessionId,
        _id: &str,
        _options: Option<&SubscriptionOptions>,
    ) -> Result<(), SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SessionError::Disconnected)?;
        permit.forget();
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Holds only requests carrying `held` options; everything else passes
struct SelectiveGate {
    held: Option<SubscriptionOptions>,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl SelectiveGate {
    fn new(held: Option<SubscriptionOptions>) -> Arc<Self> {
        Arc::new(Self {
            held,
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionAuthorizer for SelectiveGate {
    async fn allow_subscription(
        &self,
        _session: SessionId,
        _id: &str,
        options: Option<&SubscriptionOptions>,
    ) -> Result<(), SessionError> {
        if options != self.held.as_ref() {
            return Ok(());
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SessionError::Disconnected)?;
        permit.forget();
        Ok(())
    }
}

struct CountingSerializer {
    inner: FrameGraph,
    calls: AtomicUsize,
}

impl StateSerializer for CountingSerializer {
    fn serialize_entity_state(
        &self,
        entity: &Entity,
        time: DateTime<Utc>,
        frame: &FrameRef,
    ) -> Option<SerializedEntityState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.serialize_entity_state(entity, time, frame)
    }
}

fn place(entities: &EntityCollection, id: &str, position: Vector3<f64>) -> Arc<Entity> {
    let entity = entities.get_or_create_entity(id);
    entity.set_pose(
        Some(position),
        Some(UnitQuaternion::identity()),
        FrameRef::Literal(ReferenceFrame::Fixed),
    );
    entity
}

// ============================================================================
// Subscribe / unsubscribe lifecycle
// ============================================================================

#[tokio::test]
async fn test_double_subscribe_with_equal_options_records_once() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);
    let transitions = record_transitions(&c.tracker);
    let granted = record(&p.registry.session_subscribed_event);

    let mut reordered = SubscriptionOptions::new();
    reordered.insert("b".to_string(), json!(2));
    reordered.insert("a".to_string(), json!(1));

    let first = c
        .tracker
        .subscribe("drone", opts(json!({ "a": 1, "b": 2 })), None)
        .await
        .unwrap();
    let second = c
        .tracker
        .subscribe("drone", Some(reordered), None)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(*transitions.lock(), vec!["+drone"]);
    assert_eq!(granted.lock().len(), 1);
    assert_eq!(c.tracker.subscriptions().len(), 1);
    assert_eq!(p.registry.subscriptions_of(c.session).unwrap().len(), 1);
}

#[tokio::test]
async fn test_resubscribe_with_new_options_replaces_record() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);
    let transitions = record_transitions(&c.tracker);

    c.tracker
        .subscribe("drone", opts(json!({ "rate": 10 })), None)
        .await
        .unwrap();
    c.tracker
        .subscribe("drone", opts(json!({ "rate": 30 })), None)
        .await
        .unwrap();

    assert_eq!(*transitions.lock(), vec!["+drone", "-drone", "+drone"]);
    assert_eq!(
        c.tracker.subscriptions().get("drone"),
        Some(&opts(json!({ "rate": 30 })))
    );
    assert_eq!(
        p.registry.subscriptions_of(c.session).unwrap().get("drone"),
        Some(&opts(json!({ "rate": 30 })))
    );
    assert_eq!(p.registry.subscribers_of("drone").len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_unknown_id_is_silent() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);
    let transitions = record_transitions(&c.tracker);
    let released = record(&p.registry.session_unsubscribed_event);

    c.tracker.unsubscribe("ghost", None);
    flush(&c.port).await;

    assert!(transitions.lock().is_empty());
    assert!(released.lock().is_empty());
    assert!(!p.registry.handle_unsubscribe(c.session, "ghost"));
}

#[tokio::test]
async fn test_unsubscribe_removes_both_sides() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);
    let released = record(&p.registry.session_unsubscribed_event);

    c.tracker.subscribe("drone", None, None).await.unwrap();
    assert!(p.registry.is_subscribed(c.session, "drone"));

    c.tracker.unsubscribe("drone", None);
    assert!(!c.tracker.is_subscribed("drone"));
    flush(&c.port).await;

    assert!(!p.registry.is_subscribed(c.session, "drone"));
    assert!(p.registry.subscribers_of("drone").is_empty());
    assert_eq!(
        *released.lock(),
        vec![SessionUnsubscription {
            session: c.session,
            id: "drone".to_string()
        }]
    );
    assert!(p.registry.index_is_consistent());
}

#[tokio::test]
async fn test_rejected_subscribe_changes_nothing() {
    let p = provider(Arc::new(AllowList::new(["ar.origin"])));
    let c = connect(&p);
    let transitions = record_transitions(&c.tracker);
    let granted = record(&p.registry.session_subscribed_event);

    let result = c.tracker.subscribe("secret", None, None).await;

    assert!(matches!(result, Err(SessionError::Rejected(_))));
    assert!(p.registry.subscribers_of("secret").is_empty());
    assert!(granted.lock().is_empty());
    assert!(transitions.lock().is_empty());
    assert!(!c.tracker.is_subscribed("secret"));
    assert!(!c.entities.contains("secret"));
}

#[tokio::test]
async fn test_close_releases_every_subscription() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);
    let released = record(&p.registry.session_unsubscribed_event);

    for id in ["a", "b", "c"] {
        c.tracker.subscribe(id, None, None).await.unwrap();
    }
    assert_eq!(p.registry.session_count(), 1);

    c.port.close();
    eventually(|| p.registry.session_count() == 0).await;

    let mut ids: Vec<String> = released.lock().iter().map(|e| e.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
    for id in ["a", "b", "c"] {
        assert!(p.registry.subscribers_of(id).is_empty());
    }
    assert!(p.registry.subscriptions_of(c.session).is_none());
    assert!(p.registry.index_is_consistent());
}

#[tokio::test]
async fn test_closing_one_of_two_sessions_keeps_the_other() {
    let p = provider(Arc::new(AllowAll));
    let first = connect(&p);
    let second = connect(&p);

    first.tracker.subscribe("shared", None, None).await.unwrap();
    second.tracker.subscribe("shared", None, None).await.unwrap();
    assert_eq!(p.registry.subscribers_of("shared").len(), 2);

    first.port.close();
    eventually(|| p.registry.session_count() == 1).await;

    let remaining = p.registry.subscribers_of("shared");
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains(&second.session));
    assert!(p.registry.index_is_consistent());
}

#[tokio::test]
async fn test_legacy_context_topics_share_handlers() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);

    c.port
        .request(
            Topic::ContextSubscribe,
            &SubscribeRequest {
                id: "legacy".to_string(),
                options: None,
            },
        )
        .await
        .unwrap();
    assert!(p.registry.is_subscribed(c.session, "legacy"));

    c.port
        .send(
            Topic::ContextUnsubscribe,
            &UnsubscribeRequest {
                id: "legacy".to_string(),
            },
        )
        .unwrap();
    flush(&c.port).await;
    assert!(!p.registry.is_subscribed(c.session, "legacy"));
}

#[tokio::test]
async fn test_revoke_notifies_consumer() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);
    let transitions = record_transitions(&c.tracker);

    c.tracker.subscribe("drone", None, None).await.unwrap();
    assert!(p.registry.revoke_subscription(c.session, "drone"));
    assert!(!p.registry.revoke_subscription(c.session, "drone"));

    eventually(|| !c.tracker.is_subscribed("drone")).await;
    assert_eq!(*transitions.lock(), vec!["+drone", "-drone"]);
}

#[tokio::test]
async fn test_pushed_subscribed_notice_is_recorded() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);

    let provider_port = p.hub.get(&c.session).unwrap();
    provider_port
        .send(
            Topic::EntitySubscribed,
            &SubscribedNotice {
                id: "pushed".to_string(),
                options: opts(json!({ "lod": 2 })),
            },
        )
        .unwrap();

    eventually(|| c.tracker.is_subscribed("pushed")).await;
    assert_eq!(
        c.tracker.subscriptions().get("pushed"),
        Some(&opts(json!({ "lod": 2 })))
    );
}

// ============================================================================
// In-flight races
// ============================================================================

#[tokio::test]
async fn test_identical_in_flight_subscribe_shares_authorization() {
    let gate = GatedAuthorizer::new();
    let p = provider(gate.clone());
    let c = connect(&p);
    let granted = record(&p.registry.session_subscribed_event);

    let (first, second, ()) = tokio::join!(
        c.tracker.subscribe("drone", opts(json!({ "rate": 10 })), None),
        c.tracker.subscribe("drone", opts(json!({ "rate": 10 })), None),
        async {
            flush(&c.port).await;
            eventually(|| gate.calls() >= 1).await;
            gate.release();
        }
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(gate.calls(), 1);
    assert_eq!(granted.lock().len(), 1);
    assert_eq!(c.tracker.subscriptions().len(), 1);
}

#[tokio::test]
async fn test_differing_in_flight_subscribes_last_commit_wins() {
    let gate = GatedAuthorizer::new();
    let p = provider(gate.clone());
    let c = connect(&p);
    let session = c.session;

    let (first, second, ()) = tokio::join!(
        c.tracker.subscribe("drone", opts(json!({ "rate": 10 })), None),
        c.tracker.subscribe("drone", opts(json!({ "rate": 30 })), None),
        async {
            flush(&c.port).await;
            eventually(|| gate.calls() == 2).await;
            gate.release();
            eventually(|| {
                c.tracker.subscriptions().get("drone") == Some(&opts(json!({ "rate": 10 })))
            })
            .await;
            gate.release();
        }
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(
        p.registry.subscriptions_of(session).unwrap().get("drone"),
        Some(&opts(json!({ "rate": 30 })))
    );
    assert_eq!(
        c.tracker.subscriptions().get("drone"),
        Some(&opts(json!({ "rate": 30 })))
    );
}

#[tokio::test]
async fn test_unsubscribe_overtakes_in_flight_subscribe() {
    let gate = GatedAuthorizer::new();
    let p = provider(gate.clone());
    let c = connect(&p);
    let granted = record(&p.registry.session_subscribed_event);

    let (result, ()) = tokio::join!(c.tracker.subscribe("drone", None, None), async {
        flush(&c.port).await;
        c.tracker.unsubscribe("drone", None);
        flush(&c.port).await;
        gate.release();
    });

    assert_eq!(result.unwrap_err(), SessionError::Superseded);
    assert!(!p.registry.is_subscribed(c.session, "drone"));
    assert!(!c.tracker.is_subscribed("drone"));
    assert!(granted.lock().is_empty());

    // A later subscribe is unaffected by the earlier revocation
    let (result, ()) = tokio::join!(c.tracker.subscribe("drone", None, None), async {
        flush(&c.port).await;
        gate.release();
    });
    assert!(result.is_ok());
    assert!(p.registry.is_subscribed(c.session, "drone"));
}

#[tokio::test]
async fn test_close_during_authorization_commits_nothing() {
    let gate = GatedAuthorizer::new();
    let p = provider(gate.clone());
    let c = connect(&p);
    let granted = record(&p.registry.session_subscribed_event);

    let (result, ()) = tokio::join!(c.tracker.subscribe("drone", None, None), async {
        flush(&c.port).await;
        c.port.close();
        eventually(|| p.registry.session_count() == 0).await;
        gate.release();
        eventually(|| gate.completed() == 1).await;
    });

    assert_eq!(result.unwrap_err(), SessionError::Disconnected);
    assert!(granted.lock().is_empty());
    assert!(p.registry.subscribers_of("drone").is_empty());
    assert!(p.registry.index_is_consistent());
}

#[tokio::test]
async fn test_unsubscribe_cancels_older_pending_subscribe() {
    let gate = SelectiveGate::new(opts(json!({ "rate": 10 })));
    let p = provider(gate.clone());
    let c = connect(&p);
    let session = c.session;

    let (slow, ()) = tokio::join!(
        c.tracker.subscribe("drone", opts(json!({ "rate": 10 })), None),
        async {
            eventually(|| gate.waiting() == 1).await;
            c.tracker
                .subscribe("drone", opts(json!({ "rate": 30 })), None)
                .await
                .unwrap();
            c.tracker.unsubscribe("drone", None);
            flush(&c.port).await;
            gate.release();
        }
    );

    assert_eq!(slow.unwrap_err(), SessionError::Superseded);
    assert!(!p.registry.is_subscribed(session, "drone"));
    assert!(!c.tracker.is_subscribed("drone"));
    assert!(p.registry.subscribers_of("drone").is_empty());
    assert_eq!(p.registry.pending_count(session, "drone"), 0);
    assert!(c.tracker.pending_subscriptions().is_empty());
    assert!(p.registry.index_is_consistent());
}

#[tokio::test]
async fn test_repeating_current_options_cancels_older_pending_subscribe() {
    let gate = SelectiveGate::new(opts(json!({ "rate": 10 })));
    let p = provider(gate.clone());
    let c = connect(&p);
    let session = c.session;

    c.tracker
        .subscribe("drone", opts(json!({ "rate": 30 })), None)
        .await
        .unwrap();

    let (slow, ()) = tokio::join!(
        c.tracker.subscribe("drone", opts(json!({ "rate": 10 })), None),
        async {
            eventually(|| gate.waiting() == 1).await;
            c.tracker
                .subscribe("drone", opts(json!({ "rate": 30 })), None)
                .await
                .unwrap();
            gate.release();
        }
    );

    assert_eq!(slow.unwrap_err(), SessionError::Superseded);
    assert_eq!(
        p.registry.subscriptions_of(session).unwrap().get("drone"),
        Some(&opts(json!({ "rate": 30 })))
    );
    assert_eq!(
        c.tracker.subscriptions().get("drone"),
        Some(&opts(json!({ "rate": 30 })))
    );
    assert_eq!(p.registry.pending_count(session, "drone"), 0);
}

#[tokio::test]
async fn test_pushed_unsubscribe_cancels_pending_subscribe() {
    let (tracker, _entities, far) = standalone_tracker();

    let gate = Arc::new(Semaphore::new(0));
    let held = Arc::clone(&gate);
    far.on(Topic::EntitySubscribe, move |_: SubscribeRequest| {
        let held = Arc::clone(&held);
        async move {
            match held.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    Ok(Value::Null)
                }
                Err(_) => Err(SessionError::Disconnected),
            }
        }
    });

    let released = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&released);
    far.on(Topic::EntityUnsubscribe, move |req: UnsubscribeRequest| {
        sink.lock().push(req.id);
        async { Ok(Value::Null) }
    });

    let (result, ()) = tokio::join!(tracker.subscribe("drone", None, None), async {
        far.send(
            Topic::EntityUnsubscribed,
            &UnsubscribedNotice {
                id: "drone".to_string(),
            },
        )
        .unwrap();
        // Nothing handles this on the tracker side; once answered, the
        // notice ahead of it has been applied
        let _ = far.request(Topic::ContextSubscribe, &Value::Null).await;
        gate.add_permits(1);
    });

    assert_eq!(result.unwrap_err(), SessionError::Superseded);
    assert!(!tracker.is_subscribed("drone"));
    assert!(tracker.pending_subscriptions().is_empty());

    // The far side is told to drop whatever it may have committed
    eventually(|| *released.lock() == vec!["drone".to_string()]).await;
}

#[tokio::test]
async fn test_unsubscribe_without_pending_subscribe_keeps_no_bookkeeping() {
    let (tracker, _entities, _far) = standalone_tracker();

    for i in 0..50 {
        let id = format!("transient-{}", i);
        tracker.handle_subscribed(&id, None);
        tracker.unsubscribe(&id, None);
    }

    assert!(tracker.subscriptions().is_empty());
    assert!(tracker.pending_subscriptions().is_empty());
}

// ============================================================================
// Snapshot assembly and cache
// ============================================================================

#[tokio::test]
async fn test_fill_reports_absent_entity_as_none() {
    let p = provider(Arc::new(AllowAll));
    let c = connect(&p);

    c.tracker
        .subscribe("entity-1", opts(json!({})), None)
        .await
        .unwrap();

    let mut out = EntityStateMap::new();
    p.registry
        .fill_entity_state_map_for_session(c.session, tick(0), &mut out);

    assert_eq!(out.len(), 1);
    assert_eq!(out.get("entity-1"), Some(&None));
}

#[test]
fn test_cached_state_is_computed_once_per_tick() {
    let entities = Arc::new(EntityCollection::new());
    let serializer = Arc::new(CountingSerializer {
        inner: FrameGraph::new(Arc::clone(&entities), 32),
        calls: AtomicUsize::new(0),
    });
    let p = provider_with(Arc::clone(&entities), serializer.clone(), Arc::new(AllowAll));
    let drone = place(&entities, "drone", Vector3::new(1.0, 2.0, 3.0));

    let first = p.registry.get_cached_serialized_entity_state(Some(&drone), tick(0));
    let again = p.registry.get_cached_serialized_entity_state(Some(&drone), tick(0));
    assert_eq!(first, again);
    assert_eq!(serializer.calls.load(Ordering::SeqCst), 1);

    // Within the epsilon counts as the same tick
    let jitter = tick(0) + TimeDelta::nanoseconds(100);
    p.registry.get_cached_serialized_entity_state(Some(&drone), jitter);
    assert_eq!(serializer.calls.load(Ordering::SeqCst), 1);

    drone.set_pose(
        Some(Vector3::new(4.0, 5.0, 6.0)),
        None,
        FrameRef::Literal(ReferenceFrame::Fixed),
    );
    let next = p
        .registry
        .get_cached_serialized_entity_state(Some(&drone), tick(1))
        .unwrap();
    assert_eq!(serializer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(next.position, Vector3::new(4.0, 5.0, 6.0));

    // Changing the target frame drops the cached entry
    p.registry
        .set_target_reference_frame("drone", FrameRef::Literal(ReferenceFrame::Fixed));
    p.registry.get_cached_serialized_entity_state(Some(&drone), tick(1));
    assert_eq!(serializer.calls.load(Ordering::SeqCst), 3);

    assert!(p.registry.get_cached_serialized_entity_state(None, tick(2)).is_none());
    assert_eq!(serializer.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_target_frame_fallbacks() {
    let p = provider(Arc::new(AllowAll));
    let drone = place(&p.entities, "drone", Vector3::new(1.0, 2.0, 3.0));
    let frame_at = |seconds| {
        p.registry
            .get_cached_serialized_entity_state(Some(&drone), tick(seconds))
            .unwrap()
    };

    // Nothing configured, no origin entity
    let state = frame_at(0);
    assert_eq!(state.reference_frame, FrameRef::Literal(ReferenceFrame::Fixed));
    assert_eq!(state.position, Vector3::new(1.0, 2.0, 3.0));

    let origin = place(&p.entities, "ar.origin", Vector3::new(10.0, 0.0, 0.0));
    let state = frame_at(1);
    assert_eq!(state.reference_frame, FrameRef::entity("ar.origin"));
    assert_eq!(state.position, Vector3::new(-9.0, 2.0, 3.0));

    // The origin itself is never serialized relative to itself
    let origin_state = p
        .registry
        .get_cached_serialized_entity_state(Some(&origin), tick(1))
        .unwrap();
    assert_eq!(
        origin_state.reference_frame,
        FrameRef::Literal(ReferenceFrame::Fixed)
    );

    // Configured frame entity that does not exist falls back to the origin
    p.registry
        .set_target_reference_frame("drone", FrameRef::entity("missing"));
    assert_eq!(frame_at(2).reference_frame, FrameRef::entity("ar.origin"));

    place(&p.entities, "pad", Vector3::new(0.0, 2.0, 0.0));
    p.registry.set_target_reference_frame("drone", FrameRef::entity("pad"));
    let state = frame_at(3);
    assert_eq!(state.reference_frame, FrameRef::entity("pad"));
    assert_eq!(state.position, Vector3::new(1.0, 0.0, 3.0));

    p.registry
        .set_target_reference_frame("drone", FrameRef::Literal(ReferenceFrame::Inertial));
    assert_eq!(
        frame_at(4).reference_frame,
        FrameRef::Literal(ReferenceFrame::Inertial)
    );

    assert_eq!(
        p.registry.clear_target_reference_frame("drone"),
        Some(FrameRef::Literal(ReferenceFrame::Inertial))
    );
    assert_eq!(frame_at(5).reference_frame, FrameRef::entity("ar.origin"));
}

#[tokio::test]
async fn test_publish_frame_reaches_subscribed_consumers_only() {
    let p = provider(Arc::new(AllowAll));
    let subscribed = connect(&p);
    let idle = connect(&p);
    let frames = record(&subscribed.tracker.frame_event);
    let idle_frames = record(&idle.tracker.frame_event);

    let drone = place(&p.entities, "drone", Vector3::new(1.0, 2.0, 3.0));
    drone.set_meta(Some(json!({ "battery": 0.8 })));
    subscribed.tracker.subscribe("drone", None, None).await.unwrap();

    assert_eq!(p.registry.publish_frame(tick(0)), 1);
    eventually(|| frames.lock().len() == 1).await;

    assert_eq!(frames.lock()[0], tick(0));
    assert!(idle_frames.lock().is_empty());

    let local = subscribed.entities.get_by_id("drone").unwrap();
    assert_eq!(
        local.position_value(),
        Some((
            Vector3::new(1.0, 2.0, 3.0),
            FrameRef::Literal(ReferenceFrame::Fixed)
        ))
    );
    assert_eq!(local.meta(), Some(json!({ "battery": 0.8 })));
}

// ============================================================================
// Tracker state application and geodesy
// ============================================================================

#[tokio::test]
async fn test_handle_subscribed_and_unsubscribed_transitions() {
    let (tracker, _entities, _far) = standalone_tracker();
    let transitions = record_transitions(&tracker);

    tracker.handle_subscribed("a", None);
    tracker.handle_subscribed("a", None);
    tracker.handle_subscribed("a", opts(json!({ "lod": 1 })));
    assert!(!tracker.handle_unsubscribed("b"));
    assert!(tracker.handle_unsubscribed("a"));
    assert!(!tracker.handle_unsubscribed("a"));

    assert_eq!(*transitions.lock(), vec!["+a", "-a", "+a", "-a"]);
    assert!(tracker.subscriptions().is_empty());
}

#[tokio::test]
async fn test_update_with_none_clears_pose_and_keeps_entity() {
    let (tracker, entities, _far) = standalone_tracker();
    let state = SerializedEntityState {
        position: Vector3::new(1.0, 0.0, 0.0),
        orientation: Some(UnitQuaternion::identity()),
        reference_frame: FrameRef::Literal(ReferenceFrame::Fixed),
        meta: Some(json!({ "label": "crate" })),
    };

    let entity = tracker.update_entity_from_serialized_state("crate", Some(&state));
    let position = entity.position().unwrap();
    assert!(entity.meta().is_some());

    let cleared = tracker.update_entity_from_serialized_state("crate", None);

    assert!(Arc::ptr_eq(&entity, &cleared));
    assert!(entities.contains("crate"));
    assert!(Arc::ptr_eq(&position, &cleared.position().unwrap()));
    assert!(cleared.position_value().is_none());
    assert!(cleared.orientation_value().is_none());
    assert!(cleared.meta().is_none());
}

#[tokio::test]
async fn test_update_resolves_entity_frames_and_mutates_in_place() {
    let (tracker, entities, _far) = standalone_tracker();

    let mut states = EntityStateMap::new();
    states.insert(
        "marker".to_string(),
        Some(SerializedEntityState {
            position: Vector3::new(0.0, 0.0, 1.5),
            orientation: None,
            reference_frame: FrameRef::entity("ar.origin"),
            meta: None,
        }),
    );
    tracker.apply_entity_state_map(&states);

    assert!(entities.contains("ar.origin"));
    let marker = entities.get_by_id("marker").unwrap();
    let position = marker.position().unwrap();
    assert_eq!(position.reference_frame(), FrameRef::entity("ar.origin"));

    let moved = SerializedEntityState {
        position: Vector3::new(0.0, 1.0, 1.5),
        orientation: Some(UnitQuaternion::identity()),
        reference_frame: FrameRef::Literal(ReferenceFrame::Fixed),
        meta: None,
    };
    tracker.update_entity_from_serialized_state("marker", Some(&moved));

    assert!(Arc::ptr_eq(&position, &marker.position().unwrap()));
    assert_eq!(position.value(), Some(Vector3::new(0.0, 1.0, 1.5)));
    assert_eq!(marker.orientation_value(), Some(UnitQuaternion::identity()));
}

#[tokio::test]
async fn test_create_fixed_round_trips_through_cartographic() {
    let (tracker, entities, _far) = standalone_tracker();
    let site = Cartographic::from_degrees(-75.6, 40.0, 120.0);

    let entity = tracker.create_fixed(&site, east_north_up_to_fixed_frame);
    assert!(!entities.contains(entity.id()));
    assert!(entity.orientation_value().is_some());

    let resolved = tracker.get_cartographic(&entity, tick(0)).unwrap();
    assert!((resolved.longitude_degrees() - -75.6).abs() < 1e-7);
    assert!((resolved.latitude_degrees() - 40.0).abs() < 1e-7);
    assert!((resolved.height - 120.0).abs() < 1e-2);

    let other = tracker.create_fixed(&site, east_north_up_to_fixed_frame);
    assert_ne!(entity.id(), other.id());
}

#[tokio::test]
async fn test_get_cartographic_without_position_is_none() {
    let (tracker, entities, _far) = standalone_tracker();
    let entity = entities.get_or_create_entity("unplaced");
    assert!(tracker.get_cartographic(&entity, tick(0)).is_none());
}
