//! Process-local registry of live WebSocket sessions.
//!
//! One mutex-guarded map of `device_id → SessionHandle`. Binding is
//! exclusive: a new session for a device evicts the previous one, so a
//! reconnecting device never gets locked out by a socket whose close the
//! server has not yet observed. All channel traffic (including closing an
//! evicted predecessor) happens outside the mutex.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::storage::DeviceRole;

/// Close code sent to an evicted session.
pub const CLOSE_REPLACED_CODE: u16 = 1008;
pub const CLOSE_REPLACED_REASON: &str = "Replaced by new connection";

/// Upper bound on a channel send so a stuck peer cannot pin a handler.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// A frame queued for a session's writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, thiserror::Error)]
#[error("session channel closed or backlogged")]
pub struct SessionSendError;

/// Cheap clone — the live end of one device's WebSocket session.
///
/// The `session_id` is the identity used by [`SessionRegistry::unbind_if`]:
/// two handles for the same device from different connects never compare
/// equal, which keeps an evicted session from removing its successor.
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: i64,
    pub role: DeviceRole,
    session_id: Uuid,
    tx: mpsc::Sender<OutboundFrame>,
}

impl SessionHandle {
    pub fn new(device_id: i64, role: DeviceRole, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            device_id,
            role,
            session_id: Uuid::new_v4(),
            tx,
        }
    }

    fn same_session(&self, other: &SessionHandle) -> bool {
        self.session_id == other.session_id
    }

    pub async fn send_text(&self, text: String) -> Result<(), SessionSendError> {
        self.tx
            .send_timeout(OutboundFrame::Text(text), SEND_TIMEOUT)
            .await
            .map_err(|_| SessionSendError)
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SessionSendError> {
        let text = serde_json::to_string(value).map_err(|_| SessionSendError)?;
        self.send_text(text).await
    }

    /// Asks the writer task to close the socket with 1008 Replaced. Failures
    /// are irrelevant — the session is already on its way out.
    pub async fn close_replaced(&self) {
        let _ = self
            .tx
            .send_timeout(
                OutboundFrame::Close {
                    code: CLOSE_REPLACED_CODE,
                    reason: CLOSE_REPLACED_REASON,
                },
                SEND_TIMEOUT,
            )
            .await;
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<i64, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` for its device and returns the evicted
    /// predecessor, if any. The caller closes the predecessor's channel
    /// outside the mutex.
    pub async fn bind(&self, session: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.device_id, session)
    }

    /// Removes the entry only if `session` is still the registered one.
    /// Returns whether an entry was removed.
    pub async fn unbind_if(&self, session: &SessionHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(&session.device_id) {
            Some(current) if current.same_session(session) => {
                sessions.remove(&session.device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, device_id: i64) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&device_id).cloned()
    }

    pub async fn is_online(&self, device_id: i64) -> bool {
        self.sessions.lock().await.contains_key(&device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(device_id: i64) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (SessionHandle::new(device_id, DeviceRole::Host, tx), rx)
    }

    #[tokio::test]
    async fn bind_evicts_predecessor() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = handle(7);
        let (second, _rx2) = handle(7);

        assert!(registry.bind(first.clone()).await.is_none());
        let evicted = registry.bind(second.clone()).await.unwrap();
        assert!(evicted.same_session(&first));

        let current = registry.lookup(7).await.unwrap();
        assert!(current.same_session(&second));
    }

    #[tokio::test]
    async fn unbind_if_ignores_stale_session() {
        let registry = SessionRegistry::new();
        let (old, _rx1) = handle(7);
        let (new, _rx2) = handle(7);

        registry.bind(old.clone()).await;
        registry.bind(new.clone()).await;

        // The evicted session's cleanup must not remove its successor.
        assert!(!registry.unbind_if(&old).await);
        assert!(registry.is_online(7).await);

        assert!(registry.unbind_if(&new).await);
        assert!(!registry.is_online(7).await);
    }

    #[tokio::test]
    async fn send_fails_after_receiver_drops() {
        let (session, rx) = handle(1);
        drop(rx);
        assert!(session.send_text("x".to_string()).await.is_err());
    }
}
