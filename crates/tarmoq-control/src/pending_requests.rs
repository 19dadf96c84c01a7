//! Pending-request tracking for HTTP forwarding
//!
//! Each forwarded request parks a oneshot sender here under a fresh request id.
//! Whoever removes the entry first decides the outcome: the session reader
//! completing it, the deadline expiring, or the owning session closing.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tarmoq_proto::{ControlCodec, ControlMessage, ForwardRequest, ForwardResponse};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::{SessionId, SessionRegistry, TransportError, WireFrame};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Session {0} not found")]
    NotFound(SessionId),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to forward request: {0}")]
    Transport(String),
}

struct PendingSlot {
    session_id: SessionId,
    tx: oneshot::Sender<ForwardResponse>,
}

/// Manages pending requests waiting for responses
pub struct PendingRequests {
    requests: Arc<DashMap<String, PendingSlot>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request addressed to `session_id`.
    /// Returns a receiver that will receive the response.
    pub fn register(&self, request_id: &str, session_id: &str) -> oneshot::Receiver<ForwardResponse> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            request_id.to_string(),
            PendingSlot {
                session_id: session_id.to_string(),
                tx,
            },
        );
        debug!("Registered pending request {} for session {}", request_id, session_id);
        rx
    }

    /// Hand a response to its waiting caller. Responses for unknown ids, or
    /// arriving from a session other than the one the request went to, are dropped.
    pub fn complete(&self, session_id: &str, response: ForwardResponse) -> bool {
        let Some((_, slot)) = self
            .requests
            .remove_if(&response.request_id, |_, slot| slot.session_id == session_id)
        else {
            debug!(
                "No pending request {} for session {}, dropping response",
                response.request_id, session_id
            );
            return false;
        };

        let request_id = response.request_id.clone();
        if slot.tx.send(response).is_err() {
            warn!("Caller for request {} went away before the response", request_id);
            return false;
        }
        true
    }

    /// Cancel a pending request; its caller sees [`SubmitError::Cancelled`]
    pub fn cancel(&self, request_id: &str) -> bool {
        if self.requests.remove(request_id).is_some() {
            debug!("Cancelled pending request {}", request_id);
            return true;
        }
        false
    }

    /// Cancel every request addressed to a session
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .requests
            .iter()
            .filter(|slot| slot.session_id == session_id)
            .map(|slot| slot.key().clone())
            .collect();

        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Forward `request` to `session_id` and wait up to `timeout` for the reply.
    /// The deadline covers writing the request as well as waiting for the answer.
    pub async fn submit(
        &self,
        sessions: &SessionRegistry,
        session_id: &str,
        request: ForwardRequest,
        timeout: Duration,
    ) -> Result<ForwardResponse, SubmitError> {
        let session = sessions
            .lookup(session_id)
            .map_err(|_| SubmitError::NotFound(session_id.to_string()))?;

        let request_id = Uuid::new_v4().to_string();
        let text = ControlCodec::encode(&ControlMessage::forward(request_id.clone(), request))
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut rx = self.register(&request_id, session_id);

        match tokio::time::timeout_at(deadline, session.send(WireFrame::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(TransportError::Closed)) => {
                self.cancel(&request_id);
                return Err(SubmitError::Cancelled);
            }
            Ok(Err(e)) => {
                self.cancel(&request_id);
                return Err(SubmitError::Transport(e.to_string()));
            }
            Err(_) => {
                warn!(
                    "Request {} could not be written to session {} within {:?}",
                    request_id, session_id, timeout
                );
                self.cancel(&request_id);
                return Err(SubmitError::Timeout(timeout));
            }
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SubmitError::Cancelled),
            Err(_) => {
                if self.requests.remove(&request_id).is_some() {
                    debug!("Request {} timed out after {:?}", request_id, timeout);
                    return Err(SubmitError::Timeout(timeout));
                }
                // Lost the race: the slot was taken just as the deadline fired
                rx.try_recv().map_err(|_| SubmitError::Cancelled)
            }
        }
    }

    /// Whether `request_id` is still waiting on `session_id`
    pub fn is_pending(&self, session_id: &str, request_id: &str) -> bool {
        self.requests
            .get(request_id)
            .is_some_and(|slot| slot.session_id == session_id)
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn count_for_session(&self, session_id: &str) -> usize {
        self.requests
            .iter()
            .filter(|slot| slot.session_id == session_id)
            .count()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
