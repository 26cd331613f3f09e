use super::{SessionId, SessionPort};
use crate::event::Event;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::info;

/// Provider-side registry of connected sessions
pub struct SessionHub {
    sessions: DashMap<SessionId, Arc<SessionPort>>,

    /// Raised for every session added to the hub
    pub connect_event: Event<Arc<SessionPort>>,
}

impl SessionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            connect_event: Event::new(),
        })
    }

    /// Track a provider-side port and announce it on `connect_event`.
    ///
    /// The port is forgotten when its `close_event` fires.
    pub fn add_session(self: &Arc<Self>, port: Arc<SessionPort>) {
        let id = port.id();
        self.sessions.insert(id, Arc::clone(&port));

        let hub: Weak<Self> = Arc::downgrade(self);
        port.close_event.add_listener(move |closed| {
            if let Some(hub) = hub.upgrade() {
                hub.sessions.remove(closed);
            }
        });

        info!(session = %id, "Session connected");
        self.connect_event.raise(&port);
    }

    /// Create an in-process session, keep the provider end and hand back the
    /// consumer end
    pub fn connect_loopback(self: &Arc<Self>) -> Arc<SessionPort> {
        let (provider, consumer) = SessionPort::pair();
        self.add_session(provider);
        consumer
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionPort>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn sessions(&self) -> Vec<Arc<SessionPort>> {
        self.sessions.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
