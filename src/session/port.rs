use super::{Envelope, SessionError, Topic};
use crate::event::Event;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one end of a session
pub type SessionId = Uuid;

type HandlerFuture = BoxFuture<'static, Result<Value, SessionError>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// One end of a bidirectional session.
///
/// Inbound envelopes are dispatched by a single pump task in arrival order.
/// Handlers are called inline by the pump, so any work a handler does before
/// returning its future is ordered with respect to later messages; request
/// futures then complete on their own task and answer out of band.
pub struct SessionPort {
    id: SessionId,

    /// Topic -> handler (last registration wins)
    handlers: DashMap<Topic, Handler>,

    /// Sender towards the peer; taken on close
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,

    /// Requests awaiting a response, keyed by request id
    pending: DashMap<u64, oneshot::Sender<Result<Value, SessionError>>>,

    next_request_id: AtomicU64,

    closed: AtomicBool,

    /// Raised once when the session closes, from either side
    pub close_event: Event<SessionId>,
}

impl SessionPort {
    fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            handlers: DashMap::new(),
            outbound: Mutex::new(Some(outbound)),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_event: Event::new(),
        }
    }

    /// Build a port over an existing channel pair and start its pump task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Arc<Self> {
        let port = Arc::new(Self::new(outbound));
        tokio::spawn(Arc::clone(&port).run_inbound(inbound));
        port
    }

    /// Two ports connected to each other in-process
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (into_a, a_inbound) = mpsc::unbounded_channel();
        let (into_b, b_inbound) = mpsc::unbounded_channel();
        let a = Self::spawn(into_b, a_inbound);
        let b = Self::spawn(into_a, b_inbound);
        (a, b)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Register the handler for `topic`, replacing any previous one.
    ///
    /// The payload is decoded into `P` before the handler runs; decode
    /// failures answer with `InvalidPayload` without calling it.
    pub fn on<P, F, Fut>(&self, topic: Topic, handler: F)
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SessionError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload: Value| -> HandlerFuture {
            match serde_json::from_value::<P>(payload) {
                Ok(decoded) => handler(decoded).boxed(),
                Err(e) => future::ready(Err(SessionError::from(e))).boxed(),
            }
        });
        self.handlers.insert(topic, handler);
    }

    /// Remove the handler for `topic`
    pub fn off(&self, topic: Topic) -> bool {
        self.handlers.remove(&topic).is_some()
    }

    pub fn has_handler(&self, topic: Topic) -> bool {
        self.handlers.contains_key(&topic)
    }

    /// Send a request and wait for the peer's answer
    pub async fn request<P: Serialize>(
        &self,
        topic: Topic,
        payload: &P,
    ) -> Result<Value, SessionError> {
        let payload = serde_json::to_value(payload)?;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.post(Envelope::Request { id, topic, payload }) {
            self.pending.remove(&id);
            return Err(e);
        }

        debug!(session = %self.id, topic = %topic, request_id = id, "Request sent");
        rx.await.unwrap_or(Err(SessionError::Disconnected))
    }

    /// Fire-and-forget message
    pub fn send<P: Serialize>(&self, topic: Topic, payload: &P) -> Result<(), SessionError> {
        let payload = serde_json::to_value(payload)?;
        self.post(Envelope::Message { topic, payload })
    }

    /// Close the session. Pending requests fail with `Disconnected`; the peer
    /// observes the close once its pump drains. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.outbound.lock().take();

        let pending: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(SessionError::Disconnected));
            }
        }

        info!(session = %self.id, "Session closed");
        self.close_event.raise(&self.id);
    }

    fn post(&self, envelope: Envelope) -> Result<(), SessionError> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| SessionError::Disconnected),
            None => Err(SessionError::Disconnected),
        }
    }

    fn dispatch(&self, topic: Topic, payload: Value) -> HandlerFuture {
        // Clone out of the map so the handler may re-register topics
        let handler = self.handlers.get(&topic).map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => handler(payload),
            None => future::ready(Err(SessionError::UnhandledTopic(topic))).boxed(),
        }
    }

    async fn run_inbound(self: Arc<Self>, inbound: mpsc::UnboundedReceiver<Envelope>) {
        let mut inbound = UnboundedReceiverStream::new(inbound);

        while let Some(envelope) = inbound.next().await {
            match envelope {
                Envelope::Request { id, topic, payload } => {
                    debug!(session = %self.id, topic = %topic, request_id = id, "Request received");
                    let response = self.dispatch(topic, payload);
                    let port = Arc::clone(&self);
                    tokio::spawn(async move {
                        let result = response.await;
                        if port.post(Envelope::Response { id, result }).is_err() {
                            debug!(session = %port.id, request_id = id, "Dropping response for closed session");
                        }
                    });
                }
                Envelope::Response { id, result } => match self.pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        warn!(session = %self.id, request_id = id, "Response for unknown request");
                    }
                },
                Envelope::Message { topic, payload } => {
                    debug!(session = %self.id, topic = %topic, "Message received");
                    if let Err(e) = self.dispatch(topic, payload).await {
                        warn!(session = %self.id, topic = %topic, error = %e, "Message handler failed");
                    }
                }
            }
        }

        // Peer dropped its sender
        self.close();
    }
}

impl std::fmt::Debug for SessionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPort")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .finish()
    }
}
