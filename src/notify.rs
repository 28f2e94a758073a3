//! Notification sink: fire-and-forget delivery to connected clients.
//!
//! The core calls [`NotificationSink::notify`] after a state change and
//! never depends on delivery. Connection lifetime is owned explicitly by
//! [`ConnectionRegistry`] (register on open, unregister on close) rather
//! than ambient global maps.

use crate::model::{NotificationKind, UserId};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver an event to all of a user's live connections. Delivery
    /// failures are the sink's problem; callers log and move on.
    async fn notify(&self, user_id: UserId, event: &NotificationKind) -> Result<()>;
}

/// Handle identifying one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

/// Registry of live client connections keyed by user id.
///
/// A user may hold several connections (multiple tabs/devices); events
/// are fanned out to all of them and dead senders are pruned on send.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<UserId, Vec<(ConnectionId, UnboundedSender<String>)>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<UserId, Vec<(ConnectionId, UnboundedSender<String>)>>>
    {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection for a user; the returned handle must be
    /// passed back to [`unregister`](Self::unregister) on close.
    pub fn register(&self, user_id: UserId, sender: UnboundedSender<String>) -> ConnectionId {
        let id = ConnectionId(Uuid::new_v4());
        self.lock().entry(user_id).or_default().push((id, sender));
        id
    }

    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) {
        let mut connections = self.lock();
        if let Some(senders) = connections.get_mut(&user_id) {
            senders.retain(|(id, _)| *id != connection_id);
            if senders.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    /// Number of live connections for a user.
    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.lock().get(&user_id).map_or(0, |s| s.len())
    }
}

#[async_trait]
impl NotificationSink for ConnectionRegistry {
    async fn notify(&self, user_id: UserId, event: &NotificationKind) -> Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| crate::BillingError::storage(format!("serialize event: {}", e)))?;

        let mut connections = self.lock();
        if let Some(senders) = connections.get_mut(&user_id) {
            senders.retain(|(_, sender)| sender.send(payload.clone()).is_ok());
            if senders.is_empty() {
                connections.remove(&user_id);
            }
        }
        Ok(())
    }
}

/// Sink that drops every event; for tests and headless deployments.
#[derive(Default)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notify(&self, _user_id: UserId, _event: &NotificationKind) -> Result<()> {
        Ok(())
    }
}
