// Subscription registry - which WebSocket connection listens to which stream

//! # Subscription Registry
//!
//! Every open WebSocket gets a [`ConnectionId`] when it connects. Through that
//! id a connection can subscribe to a named stream (`"todos"`), giving an
//! opaque subscription id that is echoed back on every event.
//!
//! ## Rules
//!
//! - At most one subscription per stream per connection; subscribing again
//!   replaces the previous id.
//! - Unsubscribing is idempotent.
//! - [`SubscriptionRegistry::close`] removes the connection and all of its
//!   subscriptions before it returns, so no later publish can reach it.
//! - [`SubscriptionRegistry::publish`] is fire-and-forget: it snapshots the
//!   subscribers, releases the lock, and tries each one independently. A full
//!   or closed channel is logged and skipped.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! open() -> Open -> subscribe()/unsubscribe() ... -> close() -> (gone)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{JobsError, Result};

/// Identifier issued to a connection when it opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Client supplied subscription id; any JSON value, echoed back verbatim
pub type SubscriptionId = Value;

/// Frames the server sends on the `graphql-subscriptions` protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SubscriptionSuccess {
        id: SubscriptionId,
    },
    SubscriptionFail {
        id: SubscriptionId,
        payload: Value,
    },
    SubscriptionData {
        id: SubscriptionId,
        payload: Value,
    },
    Error {
        payload: Value,
    },
}

impl ServerMessage {
    pub fn fail(id: SubscriptionId, message: impl Into<String>) -> Self {
        ServerMessage::SubscriptionFail {
            id,
            payload: serde_json::json!({ "errors": [{ "message": message.into() }] }),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            payload: serde_json::json!({ "message": message.into() }),
        }
    }
}

struct Connection {
    tx: mpsc::Sender<ServerMessage>,
    /// stream name -> subscription id
    subscriptions: HashMap<String, SubscriptionId>,
}

/// Tracks open connections and their stream subscriptions
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection that receives its frames through `tx`
    pub async fn open(&self, tx: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let connection = Connection {
            tx,
            subscriptions: HashMap::new(),
        };

        self.connections.write().await.insert(id, connection);
        info!("open socket {}", id);
        id
    }

    /// Drop the connection and every subscription it holds
    pub async fn close(&self, connection_id: ConnectionId) {
        if self.connections.write().await.remove(&connection_id).is_some() {
            info!("close socket {}", connection_id);
        }
    }

    /// Subscribe `connection_id` to `stream`, replacing any earlier subscription to it
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        stream: impl Into<String>,
        subscription_id: SubscriptionId,
    ) -> Result<()> {
        let stream = stream.into();
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(JobsError::ConnectionClosed(connection_id.0))?;

        info!(
            "subscription start: subid={} stream={} conn={}",
            subscription_id, stream, connection_id
        );
        connection.subscriptions.insert(stream, subscription_id);
        debug!("subscriptions: {:?}", connection.subscriptions);
        Ok(())
    }

    /// Remove the subscription to `stream`; a no-op when there is none
    pub async fn unsubscribe(&self, connection_id: ConnectionId, stream: &str) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(&connection_id) {
            if connection.subscriptions.remove(stream).is_some() {
                info!("subscription end: stream={} conn={}", stream, connection_id);
            }
        }
    }

    /// Remove every subscription carrying `subscription_id`; a no-op when there is none
    pub async fn unsubscribe_id(&self, connection_id: ConnectionId, subscription_id: &SubscriptionId) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(&connection_id) {
            connection
                .subscriptions
                .retain(|_, existing| existing != subscription_id);
            info!("subscription end: subid={} conn={}", subscription_id, connection_id);
            debug!("subscriptions: {:?}", connection.subscriptions);
        }
    }

    /// The subscription id `connection_id` holds for `stream`, if any
    pub async fn subscription(
        &self,
        connection_id: ConnectionId,
        stream: &str,
    ) -> Option<SubscriptionId> {
        let connections = self.connections.read().await;
        connections
            .get(&connection_id)
            .and_then(|connection| connection.subscriptions.get(stream).cloned())
    }

    pub async fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queue a frame for one connection
    pub async fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) -> Result<()> {
        let tx = {
            let connections = self.connections.read().await;
            connections
                .get(&connection_id)
                .map(|connection| connection.tx.clone())
                .ok_or(JobsError::ConnectionClosed(connection_id.0))?
        };

        tx.send(message)
            .await
            .map_err(|_| JobsError::ConnectionClosed(connection_id.0))
    }

    /// Deliver `payload` to every connection subscribed to `stream`
    ///
    /// Returns how many connections accepted the event. Never fails.
    pub async fn publish(&self, stream: &str, payload: Value) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerMessage>, SubscriptionId)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter_map(|(id, connection)| {
                    connection
                        .subscriptions
                        .get(stream)
                        .map(|subscription_id| (*id, connection.tx.clone(), subscription_id.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (connection_id, tx, subscription_id) in targets {
            let message = ServerMessage::SubscriptionData {
                id: subscription_id,
                payload: payload.clone(),
            };
            match tx.try_send(message) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("dropping {} event for {}: {}", stream, connection_id, e),
            }
        }

        debug!("published {} event to {} subscriber(s)", stream, delivered);
        delivered
    }
}
