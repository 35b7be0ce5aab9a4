//! Single-observer session gate.
//!
//! The gate admits at most one WebSocket session at a time. A second
//! connection while one is admitted is refused, never queued and never
//! swapped in. Sends while idle are no-ops; a failed send drops the session
//! and returns the gate to idle.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes};
use futures_util::{Sink, SinkExt};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use events::{Delivery, Message, MessageSink};

/// Close reason sent to a connection refused because a session is admitted
pub const BUSY_REASON: &str = "Server busy";

const COMPLETED_REASON: &str = "Run completed";

/// Longest a single frame write may take before the peer counts as gone
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of an admitted connection
pub type OutboundSink = Pin<Box<dyn Sink<WsMessage, Error = axum::Error> + Send>>;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Admitted(SessionId),
}

struct Session {
    id: SessionId,
    sink: OutboundSink,
}

struct Inner {
    session: Mutex<Option<Session>>,
    state: watch::Sender<GateState>,
}

#[derive(Clone)]
pub struct SessionGate {
    inner: Arc<Inner>,
}

impl SessionGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Idle);
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> GateState {
        *self.inner.state.borrow()
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self.state(), GateState::Admitted(_))
    }

    /// Try to admit a new session.
    ///
    /// Returns the sink back when another session is already admitted so the
    /// caller can refuse the connection on it.
    pub async fn admit(&self, sink: OutboundSink) -> Result<SessionId, OutboundSink> {
        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            return Err(sink);
        }

        let id = Uuid::new_v4();
        *session = Some(Session { id, sink });
        self.inner.state.send_replace(GateState::Admitted(id));
        tracing::debug!(session_id = %id, "Session admitted");
        Ok(id)
    }

    /// Return to idle if `id` is still the admitted session.
    ///
    /// Releasing a session that was already dropped or replaced is a no-op.
    pub async fn release(&self, id: SessionId) {
        let mut session = self.inner.session.lock().await;
        if session.as_ref().map(|s| s.id) == Some(id) {
            *session = None;
            self.inner.state.send_replace(GateState::Idle);
            tracing::debug!(session_id = %id, "Session released");
        }
    }

    /// Resolve once any session is admitted
    pub async fn wait_admitted(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|state| matches!(state, GateState::Admitted(_)))
            .await;
    }

    /// Resolve once `id` is no longer the admitted session
    pub async fn wait_released(&self, id: SessionId) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx
            .wait_for(|state| *state != GateState::Admitted(id))
            .await;
    }

    async fn close_session(&self) {
        let mut guard = self.inner.session.lock().await;
        let Some(mut session) = guard.take() else {
            return;
        };
        self.inner.state.send_replace(GateState::Idle);

        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(COMPLETED_REASON),
        };
        match tokio::time::timeout(SEND_TIMEOUT, session.sink.send(WsMessage::Close(Some(frame)))).await {
            Ok(Ok(())) => {
                let _ = tokio::time::timeout(SEND_TIMEOUT, session.sink.close()).await;
            }
            Ok(Err(e)) => {
                tracing::debug!(session_id = %session.id, error = %e, "Close frame not delivered");
            }
            Err(_) => tracing::debug!(session_id = %session.id, "Close frame timed out"),
        }
        tracing::info!(session_id = %session.id, "Session closed");
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGate")
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl MessageSink for SessionGate {
    /// Write `message` to the admitted session, if any.
    ///
    /// The session lock is held for the whole write, so the admitted check
    /// and the send observe the same session. A peer that stops reading would
    /// otherwise hold that lock, and with it `release` and `close`, until TCP
    /// gives up; a write exceeding [`SEND_TIMEOUT`] is treated like a failed
    /// send and drops the session.
    async fn deliver(&self, message: &Message) -> Delivery {
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Delivery::Dropped;
        };

        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize message");
                return Delivery::Dropped;
            }
        };

        let sent = tokio::time::timeout(SEND_TIMEOUT, session.sink.send(WsMessage::Text(json.into()))).await;
        match sent {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(e)) => {
                tracing::info!(
                    session_id = %session.id,
                    error = %e,
                    "Client connection closed while sending message"
                );
                *guard = None;
                self.inner.state.send_replace(GateState::Idle);
                Delivery::Dropped
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session.id,
                    timeout_secs = SEND_TIMEOUT.as_secs(),
                    "Client stopped reading, dropping session"
                );
                *guard = None;
                self.inner.state.send_replace(GateState::Idle);
                Delivery::Dropped
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.is_admitted()
    }

    async fn wait_connected(&self) {
        self.wait_admitted().await
    }

    async fn close(&self) {
        self.close_session().await
    }
}
