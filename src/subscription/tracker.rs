use crate::entity::{Entity, EntityCollection, EntityStateMap, SerializedEntityState};
use crate::event::Event;
use crate::session::{
    FrameStateMessage, SessionError, SessionPort, SubscribeRequest, SubscribedNotice,
    SubscriptionOptions, Topic, UnsubscribeRequest, UnsubscribedNotice,
};
use crate::spatial::{Cartographic, Ellipsoid, FrameRef, PoseResolver, ReferenceFrame};
use chrono::{DateTime, Utc};
use futures::future;
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The tracker gained a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySubscription {
    pub id: String,
    pub options: Option<SubscriptionOptions>,
}

/// The tracker lost a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUnsubscription {
    pub id: String,
}

#[derive(Default)]
struct TrackerState {
    subscriptions: HashMap<String, Option<SubscriptionOptions>>,

    /// Subscribe requests awaiting an answer, per entity id
    pending: HashMap<String, Pending>,
}

#[derive(Default)]
struct Pending {
    count: usize,

    /// Bumped by an unsubscribe while requests are outstanding; an answer
    /// captured under an older generation is not recorded
    generation: u64,
}

/// Registration of one outstanding subscribe; retired on drop so a
/// cancelled `subscribe` future does not leak its entry
struct PendingSubscribe<'a> {
    state: &'a Mutex<TrackerState>,
    id: &'a str,
    generation: u64,
}

impl<'a> PendingSubscribe<'a> {
    fn begin(state: &'a Mutex<TrackerState>, id: &'a str) -> Self {
        let mut guard = state.lock();
        let pending = guard.pending.entry(id.to_string()).or_default();
        pending.count += 1;
        let generation = pending.generation;
        Self {
            state,
            id,
            generation,
        }
    }

    fn is_current(&self, state: &TrackerState) -> bool {
        state
            .pending
            .get(self.id)
            .map(|pending| pending.generation == self.generation)
            .unwrap_or(false)
    }
}

/// How `record_subscription` changed the subscription map
enum Recorded {
    Unchanged,
    Added,
    Replaced,
}

impl Drop for PendingSubscribe<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let drained = match state.pending.get_mut(self.id) {
            Some(pending) => {
                pending.count = pending.count.saturating_sub(1);
                pending.count == 0
            }
            None => false,
        };
        if drained {
            state.pending.remove(self.id);
        }
    }
}

/// Consumer-side view of which entities this side is subscribed to.
///
/// Subscribe requests go out over a session port; pushed notices and frames
/// from the provider are applied to the local entity collection.
pub struct SubscriptionTracker {
    entities: Arc<EntityCollection>,
    manager: Arc<SessionPort>,
    resolver: Arc<dyn PoseResolver>,
    state: Mutex<TrackerState>,

    pub subscribed_event: Event<EntitySubscription>,
    pub unsubscribed_event: Event<EntityUnsubscription>,

    /// Raised after every entry of an incoming frame has been applied
    pub frame_event: Event<DateTime<Utc>>,
}

impl SubscriptionTracker {
    pub fn new(
        entities: Arc<EntityCollection>,
        manager: Arc<SessionPort>,
        resolver: Arc<dyn PoseResolver>,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self {
            entities,
            manager: Arc::clone(&manager),
            resolver,
            state: Mutex::new(TrackerState::default()),
            subscribed_event: Event::new(),
            unsubscribed_event: Event::new(),
            frame_event: Event::new(),
        });
        tracker.attach(&manager);
        tracker
    }

    /// Listen for subscription notices and frames pushed on `session`
    pub fn attach(self: &Arc<Self>, session: &Arc<SessionPort>) {
        let tracker = Arc::downgrade(self);
        session.on(Topic::EntitySubscribed, move |notice: SubscribedNotice| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.handle_subscribed(&notice.id, notice.options);
            }
            future::ready(Ok(Value::Null))
        });

        let tracker = Arc::downgrade(self);
        session.on(Topic::EntityUnsubscribed, move |notice: UnsubscribedNotice| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.handle_unsubscribed(&notice.id);
            }
            future::ready(Ok(Value::Null))
        });

        let tracker = Arc::downgrade(self);
        session.on(Topic::EntityFrame, move |frame: FrameStateMessage| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.apply_entity_state_map(&frame.entities);
                tracker.frame_event.raise(&frame.time);
            }
            future::ready(Ok(Value::Null))
        });
    }

    /// Session requests go to when the caller does not name one
    pub fn manager(&self) -> &Arc<SessionPort> {
        &self.manager
    }

    /// Ask the provider for updates on `id`.
    ///
    /// Resolves with the local entity once the provider accepts. A rejected
    /// request, or one overtaken by an unsubscribe of the same id (local or
    /// pushed by the provider), leaves the tracker untouched.
    pub async fn subscribe(
        &self,
        id: impl AsRef<str>,
        options: Option<SubscriptionOptions>,
        session: Option<&Arc<SessionPort>>,
    ) -> Result<Arc<Entity>, SessionError> {
        let id = id.as_ref().to_string();
        let session = session.unwrap_or(&self.manager);
        let pending = PendingSubscribe::begin(&self.state, &id);

        let request = SubscribeRequest {
            id: id.clone(),
            options: options.clone(),
        };
        if let Err(e) = session.request(Topic::EntitySubscribe, &request).await {
            info!(entity_id = %id, error = %e, "Subscribe failed");
            return Err(e);
        }

        let recorded = match self.record_subscription(&id, &options, Some(&pending)) {
            Some(recorded) => recorded,
            None => {
                // The provider may have committed after the unsubscribe it
                // saw; make sure it lets go as well
                debug!(entity_id = %id, "Subscribe answered after unsubscribe");
                let request = UnsubscribeRequest { id: id.clone() };
                if let Err(e) = session.send(Topic::EntityUnsubscribe, &request) {
                    warn!(entity_id = %id, error = %e, "Failed to send unsubscribe");
                }
                return Err(SessionError::Superseded);
            }
        };
        drop(pending);

        let entity = self.entities.get_or_create_entity(&id);
        self.announce_subscription(&id, options, recorded);
        Ok(entity)
    }

    /// Stop updates on `id`. The local record goes away immediately; the
    /// provider is told without waiting for an answer.
    pub fn unsubscribe(&self, id: impl AsRef<str>, session: Option<&Arc<SessionPort>>) {
        let id = id.as_ref();
        let session = session.unwrap_or(&self.manager);

        let request = UnsubscribeRequest { id: id.to_string() };
        if let Err(e) = session.send(Topic::EntityUnsubscribe, &request) {
            warn!(entity_id = %id, error = %e, "Failed to send unsubscribe");
        }

        self.handle_unsubscribed(id);
    }

    /// Record an active subscription. Repeating the current options is a
    /// no-op; new options replace the old record with an unsubscribed event
    /// followed by a subscribed one.
    pub fn handle_subscribed(&self, id: &str, options: Option<SubscriptionOptions>) {
        if let Some(recorded) = self.record_subscription(id, &options, None) {
            self.announce_subscription(id, options, recorded);
        }
    }

    /// Update the subscription map. With `pending`, nothing is recorded
    /// (and `None` returned) if an unsubscribe cancelled that request.
    fn record_subscription(
        &self,
        id: &str,
        options: &Option<SubscriptionOptions>,
        pending: Option<&PendingSubscribe<'_>>,
    ) -> Option<Recorded> {
        let mut state = self.state.lock();
        if let Some(pending) = pending {
            if !pending.is_current(&state) {
                return None;
            }
        }

        if state.subscriptions.get(id) == Some(options) {
            return Some(Recorded::Unchanged);
        }
        match state.subscriptions.insert(id.to_string(), options.clone()) {
            Some(_) => Some(Recorded::Replaced),
            None => Some(Recorded::Added),
        }
    }

    fn announce_subscription(
        &self,
        id: &str,
        options: Option<SubscriptionOptions>,
        recorded: Recorded,
    ) {
        match recorded {
            Recorded::Unchanged => return,
            Recorded::Replaced => {
                self.unsubscribed_event
                    .raise(&EntityUnsubscription { id: id.to_string() });
            }
            Recorded::Added => {}
        }
        debug!(entity_id = %id, "Subscribed");
        self.subscribed_event.raise(&EntitySubscription {
            id: id.to_string(),
            options,
        });
    }

    /// Forget the subscription to `id` and cancel any subscribe for it still
    /// awaiting an answer. Returns false if there was no subscription.
    pub fn handle_unsubscribed(&self, id: &str) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(pending) = state.pending.get_mut(id) {
                pending.generation += 1;
            }
            if state.subscriptions.remove(id).is_none() {
                return false;
            }
        }

        debug!(entity_id = %id, "Unsubscribed");
        self.unsubscribed_event.raise(&EntityUnsubscription { id: id.to_string() });
        true
    }

    pub fn subscriptions(&self) -> HashMap<String, Option<SubscriptionOptions>> {
        self.state.lock().subscriptions.clone()
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.state.lock().subscriptions.contains_key(id)
    }

    /// Entity ids with a subscribe request still awaiting an answer
    pub fn pending_subscriptions(&self) -> Vec<String> {
        self.state.lock().pending.keys().cloned().collect()
    }

    /// Apply one serialized state to the local entity `id`.
    ///
    /// `None` clears the pose values and metadata but keeps the entity and
    /// its property objects. A frame naming another entity creates that
    /// entity if needed.
    pub fn update_entity_from_serialized_state(
        &self,
        id: &str,
        state: Option<&SerializedEntityState>,
    ) -> Arc<Entity> {
        let entity = self.entities.get_or_create_entity(id);

        let state = match state {
            Some(state) => state,
            None => {
                entity.clear_pose();
                return entity;
            }
        };

        if let Some(frame_id) = state.reference_frame.entity_id() {
            self.entities.get_or_create_entity(frame_id);
        }
        entity.set_pose(
            Some(state.position),
            state.orientation,
            state.reference_frame.clone(),
        );
        entity.set_meta(state.meta.clone());
        entity
    }

    pub fn apply_entity_state_map(&self, states: &EntityStateMap) {
        for (id, state) in states {
            self.update_entity_from_serialized_state(id, state.as_ref());
        }
    }

    /// Geodetic position of `entity` at `time`, if it resolves in the
    /// fixed frame
    pub fn get_cartographic(&self, entity: &Entity, time: DateTime<Utc>) -> Option<Cartographic> {
        let fixed = FrameRef::Literal(ReferenceFrame::Fixed);
        let position = self.resolver.position_in_frame(entity, time, &fixed)?;
        Ellipsoid::WGS84.cartesian_to_cartographic(&position)
    }

    /// Free-standing entity pinned at `cartographic`.
    ///
    /// `orientation` receives the fixed-frame position and the ellipsoid,
    /// e.g. [`east_north_up_to_fixed_frame`](crate::spatial::east_north_up_to_fixed_frame).
    /// The entity gets a fresh id and is not added to the collection.
    pub fn create_fixed<F>(&self, cartographic: &Cartographic, orientation: F) -> Arc<Entity>
    where
        F: FnOnce(&Vector3<f64>, &Ellipsoid) -> UnitQuaternion<f64>,
    {
        let ellipsoid = Ellipsoid::WGS84;
        let position = ellipsoid.cartographic_to_cartesian(cartographic);
        let rotation = orientation(&position, &ellipsoid);

        let entity = Entity::new(Uuid::new_v4().to_string());
        entity.set_pose(
            Some(position),
            Some(rotation),
            FrameRef::Literal(ReferenceFrame::Fixed),
        );
        Arc::new(entity)
    }
}
