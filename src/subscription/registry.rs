use super::authorizer::SubscriptionAuthorizer;
use crate::config::RegistryConfig;
use crate::entity::{Entity, EntityCollection, EntityStateMap, SerializedEntityState};
use crate::event::Event;
use crate::session::{
    FrameStateMessage, SessionError, SessionHub, SessionId, SessionPort, SubscribeRequest,
    SubscriptionOptions, Topic, UnsubscribeRequest, UnsubscribedNotice,
};
use crate::spatial::{FrameRef, ReferenceFrame, StateSerializer};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type Outcome = Result<(), SessionError>;

/// A session gained a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSubscription {
    pub session: SessionId,
    pub id: String,
    pub options: Option<SubscriptionOptions>,
}

/// A session lost a subscription (unsubscribe, revoke or disconnect)
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUnsubscription {
    pub session: SessionId,
    pub id: String,
}

/// Subscribe request waiting on the authorizer
struct InFlight {
    options: Option<SubscriptionOptions>,
    outcome: Shared<BoxFuture<'static, Outcome>>,
    token: u64,
}

/// Everything one connected session holds
#[derive(Default)]
struct SubscriberEntry {
    subscriptions: HashMap<String, Option<SubscriptionOptions>>,

    /// Latest in-flight subscribe per entity id
    in_flight: HashMap<String, InFlight>,

    /// Every subscribe per entity id still being authorized, joined
    /// requests excluded
    pending: HashMap<String, Pending>,
}

/// Subscribes for one entity id awaiting authorization
#[derive(Default)]
struct Pending {
    count: usize,

    /// Bumped to cancel everything pending; a commit whose captured
    /// generation is stale is dropped
    generation: u64,
}

impl SubscriberEntry {
    /// Cancel every subscribe for `id` still being authorized.
    /// Returns false if none was pending.
    fn cancel_pending(&mut self, id: &str) -> bool {
        self.in_flight.remove(id);
        match self.pending.get_mut(id) {
            Some(pending) => {
                pending.generation += 1;
                true
            }
            None => false,
        }
    }

    /// Retire one pending subscribe for `id`. Returns whether it is still
    /// allowed to commit.
    fn settle_pending(&mut self, id: &str, generation: u64) -> bool {
        let (current, drained) = match self.pending.get_mut(id) {
            Some(pending) => {
                pending.count = pending.count.saturating_sub(1);
                (pending.generation == generation, pending.count == 0)
            }
            None => return false,
        };
        if drained {
            self.pending.remove(id);
        }
        current
    }
}

/// Both directions of the subscription index, changed together
#[derive(Default)]
struct SubscriberIndex {
    by_subscriber: HashMap<SessionId, SubscriberEntry>,
    by_entity: HashMap<String, HashSet<SessionId>>,
}

impl SubscriberIndex {
    fn unlink(&mut self, session: SessionId, id: &str) {
        if let Some(subscribers) = self.by_entity.get_mut(id) {
            subscribers.remove(&session);
            if subscribers.is_empty() {
                self.by_entity.remove(id);
            }
        }
    }
}

struct CachedState {
    time: DateTime<Utc>,
    state: Option<SerializedEntityState>,
}

/// Provider-side arbiter of which sessions are subscribed to which entities.
///
/// Installs subscribe/unsubscribe handlers on every session the hub
/// connects, and assembles each subscriber's per-tick entity state map.
pub struct SubscriptionRegistry {
    entities: Arc<EntityCollection>,
    serializer: Arc<dyn StateSerializer>,
    authorizer: Arc<dyn SubscriptionAuthorizer>,

    index: Mutex<SubscriberIndex>,

    /// Connected provider-side ports, for frame publication
    sessions: DashMap<SessionId, Arc<SessionPort>>,

    /// Entity id -> frame its state is serialized in
    target_reference_frames: DashMap<String, FrameRef>,

    /// Entity id -> state computed for the most recent tick
    state_cache: DashMap<String, CachedState>,

    origin_entity_id: String,
    cache_time_epsilon_seconds: f64,
    next_token: AtomicU64,

    pub session_subscribed_event: Event<SessionSubscription>,
    pub session_unsubscribed_event: Event<SessionUnsubscription>,
}

impl SubscriptionRegistry {
    /// Create a registry that attaches to every session `hub` connects,
    /// including sessions already connected
    pub fn new(
        hub: &Arc<SessionHub>,
        entities: Arc<EntityCollection>,
        serializer: Arc<dyn StateSerializer>,
        authorizer: Arc<dyn SubscriptionAuthorizer>,
        config: &RegistryConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            entities,
            serializer,
            authorizer,
            index: Mutex::new(SubscriberIndex::default()),
            sessions: DashMap::new(),
            target_reference_frames: DashMap::new(),
            state_cache: DashMap::new(),
            origin_entity_id: config.origin_entity_id.clone(),
            cache_time_epsilon_seconds: config.cache_time_epsilon_seconds,
            next_token: AtomicU64::new(0),
            session_subscribed_event: Event::new(),
            session_unsubscribed_event: Event::new(),
        });

        let weak = Arc::downgrade(&registry);
        hub.connect_event.add_listener(move |port| {
            if let Some(registry) = weak.upgrade() {
                registry.attach_session(port);
            }
        });
        for port in hub.sessions() {
            registry.attach_session(&port);
        }

        registry
    }

    /// Start tracking `port`: empty subscription map plus request handlers
    pub fn attach_session(self: &Arc<Self>, port: &Arc<SessionPort>) {
        let session = port.id();
        if !port.is_connected() {
            debug!(session = %session, "Ignoring closed session");
            return;
        }

        self.index
            .lock()
            .by_subscriber
            .entry(session)
            .or_default();
        self.sessions.insert(session, Arc::clone(port));

        // Same handler behind the entity.* and legacy context.* topics
        for topic in Topic::SUBSCRIBE {
            let registry = Arc::downgrade(self);
            port.on(topic, move |req: SubscribeRequest| {
                let outcome = match registry.upgrade() {
                    Some(registry) => registry.begin_subscribe(session, req.id, req.options),
                    None => future::ready(Err(SessionError::Disconnected)).boxed(),
                };
                async move { outcome.await.map(|_| Value::Null) }
            });
        }
        for topic in Topic::UNSUBSCRIBE {
            let registry = Arc::downgrade(self);
            port.on(topic, move |req: UnsubscribeRequest| {
                if let Some(registry) = registry.upgrade() {
                    registry.handle_unsubscribe(session, &req.id);
                }
                future::ready(Ok(Value::Null))
            });
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        port.close_event.add_listener(move |closed| {
            if let Some(registry) = registry.upgrade() {
                registry.detach_session(*closed);
            }
        });

        debug!(session = %session, "Subscription handlers installed");
    }

    /// Synchronous half of a subscribe request.
    ///
    /// Duplicate checks and in-flight bookkeeping happen here, in message
    /// order; the returned future runs the authorizer and commits.
    fn begin_subscribe(
        self: &Arc<Self>,
        session: SessionId,
        id: String,
        options: Option<SubscriptionOptions>,
    ) -> BoxFuture<'static, Outcome> {
        let mut index = self.index.lock();
        let entry = match index.by_subscriber.get_mut(&session) {
            Some(entry) => entry,
            None => return future::ready(Err(SessionError::Disconnected)).boxed(),
        };

        // The current subscription already matches this latest request, so
        // older requests for other options must not commit over it
        if entry.subscriptions.get(&id) == Some(&options) {
            if entry.cancel_pending(&id) {
                debug!(session = %session, entity_id = %id, "Cancelled older pending subscribes");
            }
            debug!(session = %session, entity_id = %id, "Already subscribed with same options");
            return future::ready(Ok(())).boxed();
        }

        if let Some(in_flight) = entry.in_flight.get(&id) {
            if in_flight.options == options {
                debug!(session = %session, entity_id = %id, "Joining in-flight subscribe");
                return in_flight.outcome.clone().boxed();
            }
        }

        let pending = entry.pending.entry(id.clone()).or_default();
        pending.count += 1;
        let generation = pending.generation;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);
        let authorizer = Arc::clone(&self.authorizer);
        let (pending_id, pending_options) = (id.clone(), options.clone());

        let outcome = async move {
            let verdict = authorizer
                .allow_subscription(session, &pending_id, pending_options.as_ref())
                .await;
            registry.finish_subscribe(session, pending_id, pending_options, generation, token, verdict)
        }
        .boxed()
        .shared();

        entry.in_flight.insert(
            id,
            InFlight {
                options,
                outcome: outcome.clone(),
                token,
            },
        );

        outcome.boxed()
    }

    fn finish_subscribe(
        &self,
        session: SessionId,
        id: String,
        options: Option<SubscriptionOptions>,
        generation: u64,
        token: u64,
        verdict: Outcome,
    ) -> Outcome {
        {
            let mut guard = self.index.lock();
            let index = &mut *guard;
            let entry = match index.by_subscriber.get_mut(&session) {
                Some(entry) => entry,
                None => {
                    debug!(session = %session, entity_id = %id, "Session closed during authorization");
                    return Err(SessionError::Disconnected);
                }
            };

            if entry.in_flight.get(&id).map(|f| f.token) == Some(token) {
                entry.in_flight.remove(&id);
            }
            let current = entry.settle_pending(&id, generation);

            if let Err(e) = verdict {
                info!(session = %session, entity_id = %id, error = %e, "Subscription denied");
                return Err(e);
            }

            if !current {
                info!(session = %session, entity_id = %id, "Subscription superseded");
                return Err(SessionError::Superseded);
            }

            entry.subscriptions.insert(id.clone(), options.clone());
            index.by_entity.entry(id.clone()).or_default().insert(session);
        }

        info!(session = %session, entity_id = %id, "Session subscribed");
        self.session_subscribed_event.raise(&SessionSubscription {
            session,
            id,
            options,
        });
        Ok(())
    }

    /// Drop `session`'s subscription to `id`. Returns false if it held none.
    ///
    /// Also cancels any subscribe for `id` still being authorized.
    pub fn handle_unsubscribe(&self, session: SessionId, id: &str) -> bool {
        {
            let mut guard = self.index.lock();
            let index = &mut *guard;
            let entry = match index.by_subscriber.get_mut(&session) {
                Some(entry) => entry,
                None => return false,
            };

            entry.cancel_pending(id);

            if entry.subscriptions.remove(id).is_none() {
                return false;
            }
            index.unlink(session, id);
        }

        info!(session = %session, entity_id = %id, "Session unsubscribed");
        self.session_unsubscribed_event.raise(&SessionUnsubscription {
            session,
            id: id.to_string(),
        });
        true
    }

    /// Provider-initiated unsubscribe; the consumer is told via
    /// `entity.unsubscribed`
    pub fn revoke_subscription(&self, session: SessionId, id: &str) -> bool {
        if !self.handle_unsubscribe(session, id) {
            return false;
        }
        if let Some(port) = self.sessions.get(&session).map(|p| Arc::clone(p.value())) {
            let notice = UnsubscribedNotice { id: id.to_string() };
            if let Err(e) = port.send(Topic::EntityUnsubscribed, &notice) {
                warn!(session = %session, entity_id = %id, error = %e, "Failed to send unsubscribed notice");
            }
        }
        true
    }

    /// Forget a closed session, unsubscribing it from everything it held
    fn detach_session(&self, session: SessionId) {
        self.sessions.remove(&session);

        let released: Vec<String> = {
            let mut index = self.index.lock();
            let entry = match index.by_subscriber.remove(&session) {
                Some(entry) => entry,
                None => return,
            };
            let ids: Vec<String> = entry.subscriptions.into_keys().collect();
            for id in &ids {
                index.unlink(session, id);
            }
            ids
        };

        info!(session = %session, released = released.len(), "Session detached");
        for id in released {
            self.session_unsubscribed_event
                .raise(&SessionUnsubscription { session, id });
        }
    }

    /// Write the state of every entity `session` subscribes to into `out`
    pub fn fill_entity_state_map_for_session(
        &self,
        session: SessionId,
        time: DateTime<Utc>,
        out: &mut EntityStateMap,
    ) {
        let ids: Vec<String> = match self.index.lock().by_subscriber.get(&session) {
            Some(entry) => entry.subscriptions.keys().cloned().collect(),
            None => return,
        };

        for id in ids {
            let entity = self.entities.get_by_id(&id);
            let state = self.get_cached_serialized_entity_state(entity.as_deref(), time);
            out.insert(id, state);
        }
    }

    /// Serialized state of `entity` at `time`, computed at most once per tick
    pub fn get_cached_serialized_entity_state(
        &self,
        entity: Option<&Entity>,
        time: DateTime<Utc>,
    ) -> Option<SerializedEntityState> {
        let entity = entity?;
        let id = entity.id();

        if let Some(cached) = self.state_cache.get(id) {
            if self.same_tick(cached.time, time) {
                return cached.state.clone();
            }
        }

        let frame = self.target_frame_for(id);
        let state = self.serializer.serialize_entity_state(entity, time, &frame);
        self.state_cache.insert(
            id.to_string(),
            CachedState {
                time,
                state: state.clone(),
            },
        );
        state
    }

    /// Send each connected session its entity state map for `time`.
    ///
    /// Sessions without subscriptions are skipped. Returns the number of
    /// frames sent.
    pub fn publish_frame(&self, time: DateTime<Utc>) -> usize {
        let ports: Vec<Arc<SessionPort>> =
            self.sessions.iter().map(|p| Arc::clone(p.value())).collect();

        let mut sent = 0;
        for port in ports {
            let mut entities = EntityStateMap::new();
            self.fill_entity_state_map_for_session(port.id(), time, &mut entities);
            if entities.is_empty() {
                continue;
            }

            match port.send(Topic::EntityFrame, &FrameStateMessage { time, entities }) {
                Ok(()) => sent += 1,
                Err(e) => warn!(session = %port.id(), error = %e, "Failed to publish frame"),
            }
        }
        sent
    }

    /// Serialize `id` relative to `frame` from now on
    pub fn set_target_reference_frame(&self, id: &str, frame: FrameRef) {
        self.target_reference_frames.insert(id.to_string(), frame);
        self.state_cache.remove(id);
    }

    pub fn clear_target_reference_frame(&self, id: &str) -> Option<FrameRef> {
        self.state_cache.remove(id);
        self.target_reference_frames.remove(id).map(|(_, frame)| frame)
    }

    /// Configured target frame, else the origin entity, else `Fixed`.
    ///
    /// A frame entity must exist and must not be the entity itself.
    fn target_frame_for(&self, id: &str) -> FrameRef {
        let usable = |frame_id: &str| frame_id != id && self.entities.contains(frame_id);
        let configured = self
            .target_reference_frames
            .get(id)
            .map(|f| f.value().clone());

        match configured {
            Some(FrameRef::Literal(frame)) => FrameRef::Literal(frame),
            Some(FrameRef::Entity(frame_id)) if usable(&frame_id) => FrameRef::Entity(frame_id),
            _ if usable(&self.origin_entity_id) => FrameRef::Entity(self.origin_entity_id.clone()),
            _ => FrameRef::Literal(ReferenceFrame::Fixed),
        }
    }

    fn same_tick(&self, cached: DateTime<Utc>, requested: DateTime<Utc>) -> bool {
        match (requested - cached).num_nanoseconds() {
            Some(ns) => (ns as f64 / 1e9).abs() <= self.cache_time_epsilon_seconds,
            None => false,
        }
    }

    /// Sessions currently subscribed to `id`
    pub fn subscribers_of(&self, id: &str) -> HashSet<SessionId> {
        self.index
            .lock()
            .by_entity
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscriptions held by `session`, `None` if it is not connected
    pub fn subscriptions_of(
        &self,
        session: SessionId,
    ) -> Option<HashMap<String, Option<SubscriptionOptions>>> {
        self.index
            .lock()
            .by_subscriber
            .get(&session)
            .map(|entry| entry.subscriptions.clone())
    }

    pub fn is_subscribed(&self, session: SessionId, id: &str) -> bool {
        self.index
            .lock()
            .by_subscriber
            .get(&session)
            .map(|entry| entry.subscriptions.contains_key(id))
            .unwrap_or(false)
    }

    /// Number of sessions with a live subscription map
    pub fn session_count(&self) -> usize {
        self.index.lock().by_subscriber.len()
    }

    /// Subscribes for `id` from `session` still being authorized
    #[cfg(test)]
    pub(crate) fn pending_count(&self, session: SessionId, id: &str) -> usize {
        self.index
            .lock()
            .by_subscriber
            .get(&session)
            .and_then(|entry| entry.pending.get(id))
            .map(|pending| pending.count)
            .unwrap_or(0)
    }

    /// Both directions of the index agree
    #[cfg(test)]
    pub(crate) fn index_is_consistent(&self) -> bool {
        let index = self.index.lock();
        let forward = index.by_subscriber.iter().all(|(session, entry)| {
            entry.subscriptions.keys().all(|id| {
                index
                    .by_entity
                    .get(id)
                    .map(|s| s.contains(session))
                    .unwrap_or(false)
            })
        });
        let backward = index.by_entity.iter().all(|(id, sessions)| {
            !sessions.is_empty()
                && sessions.iter().all(|session| {
                    index
                        .by_subscriber
                        .get(session)
                        .map(|entry| entry.subscriptions.contains_key(id))
                        .unwrap_or(false)
                })
        });
        forward && backward
    }
}
