//!
//! src/registry.rs  Andrew Belles  Oct 7th, 2025
//!
//! Live websocket connections keyed by user id, and the loop that
//! routes bus events to them. At most one connection per user, the
//! most recent registration wins.
//!

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{ProgressEvent, Subscription};
use crate::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub found_count: u32,
    pub not_found_count: u32
}

/// Message written to a client socket
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Update(UpdatePayload),
    JobFinished(Value),
    User(bool)
}

impl ClientMessage {
    /// The socket is closed once this has been written
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientMessage::JobFinished(_))
    }
}

impl From<&ProgressEvent> for ClientMessage {
    fn from(event: &ProgressEvent) -> Self {
        match event {
            ProgressEvent::TrackProgress { found_count, not_found_count } =>
                ClientMessage::Update(UpdatePayload {
                    found_count: *found_count,
                    not_found_count: *not_found_count
                }),
            ProgressEvent::JobFinished => ClientMessage::JobFinished(Value::Null),
            ProgressEvent::JobFailed { reason } =>
                ClientMessage::JobFinished(json!({ "error": reason })),
            ProgressEvent::CsvFileError =>
                ClientMessage::JobFinished(json!({ "error": "CSV file error" }))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub identity: UserId,
    pub conn_id: Uuid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NoConnection,
    /// The connection's queue is full, the event is dropped
    Full,
    /// The connection's writer is gone but it has not unregistered yet
    Closed
}

#[derive(Debug)]
struct Entry {
    conn_id: Uuid,
    sink: mpsc::Sender<ClientMessage>
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<UserId, Entry>>
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever connection the identity had before
    pub fn register(&self, identity: UserId, sink: mpsc::Sender<ClientMessage>) -> ConnectionHandle {
        let conn_id = Uuid::new_v4();
        let replaced = self.entries.lock()
            .insert(identity.clone(), Entry { conn_id, sink })
            .is_some();

        info!(user = %identity, %conn_id, replaced, "registry.register");
        ConnectionHandle { identity, conn_id }
    }

    /// No-op when a newer connection already took the identity over
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut entries = self.entries.lock();
        let current = entries.get(&handle.identity).map(|e| e.conn_id);
        if current == Some(handle.conn_id) {
            entries.remove(&handle.identity);
            debug!(user = %handle.identity, conn_id = %handle.conn_id, "registry.unregister");
            true
        } else {
            debug!(user = %handle.identity, conn_id = %handle.conn_id, "registry.unregister.stale");
            false
        }
    }

    pub fn is_registered(&self, identity: &UserId) -> bool {
        self.entries.lock().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Never waits on a connection, a stalled client only loses its own events
    pub fn deliver(&self, identity: &UserId, event: &ProgressEvent) -> Delivery {
        // lock is released before the send
        let sink = self.entries.lock().get(identity).map(|e| e.sink.clone());
        let Some(sink) = sink else {
            debug!(user = %identity, ?event, "delivery.dropped");
            return Delivery::NoConnection;
        };

        match sink.try_send(ClientMessage::from(event)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!(user = %identity, ?event, "delivery.queue_full");
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user = %identity, "delivery.closed");
                Delivery::Closed
            }
        }
    }
}

/// Forwards every bus event to its user's connection until the bus closes
pub async fn run_delivery(registry: Arc<ConnectionRegistry>, mut subscription: Subscription) {
    info!("delivery.start");
    while let Some((identity, event)) = subscription.next().await {
        if registry.deliver(&identity, &event) == Delivery::Closed {
            warn!(user = %identity, "delivery.connection.closed");
        }
    }
    info!("delivery.stop");
}
