// src/api/ws/connection.rs
// Per-user WebSocket fan-out with dead-socket pruning

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Sending half of one client connection. Production sockets wrap an axum
/// WebSocket sink; tests substitute scripted sinks.
#[async_trait]
pub trait WsSink: Send + Sync {
    async fn send_json(&self, message: &Value) -> Result<()>;
}

/// A WebSocket sender shared between the receive loop and the fan-out path.
pub struct SocketSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

impl SocketSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

#[async_trait]
impl WsSink for SocketSink {
    async fn send_json(&self, message: &Value) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.sender
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await?;
        Ok(())
    }
}

/// Mapping `user_id -> active sockets`. List-based: the same socket may be
/// registered more than once, and disconnect removes one occurrence.
pub struct ConnectionManager<S: WsSink + ?Sized = dyn WsSink> {
    connections: Mutex<HashMap<String, Vec<Arc<S>>>>,
}

impl<S: WsSink + ?Sized> Default for ConnectionManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: WsSink + ?Sized> ConnectionManager<S> {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(&self, user_id: &str, socket: Arc<S>) {
        let mut connections = self.connections.lock().await;
        connections
            .entry(user_id.to_string())
            .or_default()
            .push(socket);
        debug!("WebSocket connected for user {}", user_id);
    }

    /// Remove one occurrence of the socket; drop the user key when the list
    /// empties.
    pub async fn disconnect(&self, user_id: &str, socket: &Arc<S>) {
        let mut connections = self.connections.lock().await;
        if let Some(sockets) = connections.get_mut(user_id) {
            if let Some(pos) = sockets.iter().position(|s| Arc::ptr_eq(s, socket)) {
                sockets.remove(pos);
            }
            if sockets.is_empty() {
                connections.remove(user_id);
            }
        }
    }

    /// Send to every socket of a user. Per-socket failures are swallowed;
    /// failed sockets are pruned after the iteration.
    pub async fn send_to_user(&self, user_id: &str, message: &Value) {
        let snapshot: Vec<Arc<S>> = {
            let connections = self.connections.lock().await;
            match connections.get(user_id) {
                Some(sockets) => sockets.clone(),
                None => return,
            }
        };

        let mut dead: Vec<Arc<S>> = Vec::new();
        for socket in &snapshot {
            if let Err(e) = socket.send_json(message).await {
                warn!("Dropping dead WebSocket for user {}: {}", user_id, e);
                dead.push(socket.clone());
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.lock().await;
            if let Some(sockets) = connections.get_mut(user_id) {
                sockets.retain(|s| !dead.iter().any(|d| Arc::ptr_eq(s, d)));
                if sockets.is_empty() {
                    connections.remove(user_id);
                }
            }
        }
    }

    /// Direct send to one socket; errors propagate to the caller.
    pub async fn send_to_websocket(&self, socket: &Arc<S>, message: &Value) -> Result<()> {
        socket.send_json(message).await
    }

    /// Fan a message out to every connected user. Dead-socket cleanup for
    /// one user never affects the others.
    pub async fn broadcast(&self, message: &Value) {
        let user_ids: Vec<String> = {
            let connections = self.connections.lock().await;
            connections.keys().cloned().collect()
        };
        for user_id in user_ids {
            self.send_to_user(&user_id, message).await;
        }
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        let connections = self.connections.lock().await;
        connections.get(user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub async fn user_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSink {
        alive: bool,
        received: Mutex<Vec<Value>>,
        attempts: AtomicUsize,
    }

    impl FakeSink {
        fn alive() -> Arc<Self> {
            Arc::new(Self {
                alive: true,
                received: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            })
        }

        fn dead() -> Arc<Self> {
            Arc::new(Self {
                alive: false,
                received: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WsSink for FakeSink {
        async fn send_json(&self, message: &Value) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.alive {
                self.received.lock().await.push(message.clone());
                Ok(())
            } else {
                Err(anyhow!("connection reset"))
            }
        }
    }

    #[tokio::test]
    async fn test_fresh_manager_is_empty() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        assert_eq!(manager.user_count().await, 0);
        assert_eq!(manager.connection_count("u1").await, 0);
    }

    #[tokio::test]
    async fn test_connect_then_disconnect_cleans_up() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let socket = FakeSink::alive();
        manager.connect("u1", socket.clone()).await;
        assert_eq!(manager.connection_count("u1").await, 1);
        manager.disconnect("u1", &socket).await;
        assert_eq!(manager.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_same_socket_may_appear_twice() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let socket = FakeSink::alive();
        manager.connect("u1", socket.clone()).await;
        manager.connect("u1", socket.clone()).await;
        assert_eq!(manager.connection_count("u1").await, 2);

        manager.disconnect("u1", &socket).await;
        assert_eq!(manager.connection_count("u1").await, 1);
    }

    #[tokio::test]
    async fn test_send_delivers_to_all_connections() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let sockets = [FakeSink::alive(), FakeSink::alive(), FakeSink::alive()];
        for socket in &sockets {
            manager.connect("u1", socket.clone()).await;
        }
        manager.send_to_user("u1", &json!({ "type": "ct" })).await;
        for socket in &sockets {
            assert_eq!(socket.received.lock().await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_send_does_not_cross_users() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let mine = FakeSink::alive();
        let theirs = FakeSink::alive();
        manager.connect("u1", mine.clone()).await;
        manager.connect("u2", theirs.clone()).await;

        manager.send_to_user("u1", &json!({ "type": "ct" })).await;
        assert_eq!(mine.received.lock().await.len(), 1);
        assert!(theirs.received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_socket_pruned_and_alive_still_receives() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let dead = FakeSink::dead();
        let alive = FakeSink::alive();
        manager.connect("u1", dead.clone()).await;
        manager.connect("u1", alive.clone()).await;

        manager.send_to_user("u1", &json!({ "type": "ct" })).await;

        assert_eq!(alive.received.lock().await.len(), 1);
        assert_eq!(manager.connection_count("u1").await, 1);

        // The pruned socket is not retried on the next send.
        manager.send_to_user("u1", &json!({ "type": "ct" })).await;
        assert_eq!(dead.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_dead_sockets_removes_user_key() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        manager.connect("u1", FakeSink::dead()).await;
        manager.connect("u1", FakeSink::dead()).await;
        manager.send_to_user("u1", &json!({ "type": "ct" })).await;
        assert_eq!(manager.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_dead_socket_cleanup_does_not_affect_other_users() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let other = FakeSink::alive();
        manager.connect("u1", FakeSink::dead()).await;
        manager.connect("u2", other.clone()).await;

        manager.broadcast(&json!({ "type": "uu" })).await;

        assert_eq!(manager.user_count().await, 1);
        assert_eq!(other.received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let manager: ConnectionManager<FakeSink> = ConnectionManager::new();
        let socket = FakeSink::alive();
        manager.disconnect("ghost", &socket).await;
        assert_eq!(manager.user_count().await, 0);
    }
}
