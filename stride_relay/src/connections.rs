use crate::publisher::{ChannelPush, PublishError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Duplex channels terminated by this process, keyed by opaque connection id.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, UnboundedSender<String>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and hands back the receiving half that the
    /// socket writer drains.
    pub fn register(&self) -> (String, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connections = self.connections.write();
        let connection_id = loop {
            let candidate = format!("{:016x}", rand::random::<u64>());
            if !connections.contains_key(&candidate) {
                break candidate;
            }
        };
        connections.insert(connection_id.clone(), tx);
        (connection_id, rx)
    }

    pub fn unregister(&self, connection_id: &str) {
        self.connections.write().remove(connection_id);
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChannelPush for ConnectionRegistry {
    async fn push(
        &self,
        connection_id: &str,
        _callback_address: &str,
        message: &str,
    ) -> Result<(), PublishError> {
        let sender = self
            .connections
            .read()
            .get(connection_id)
            .cloned()
            .ok_or(PublishError::Gone)?;

        if sender.send(message.to_string()).is_err() {
            self.unregister(connection_id);
            return Err(PublishError::Gone);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_to_registered_connection() {
        let registry = ConnectionRegistry::new();
        let (connection_id, mut rx) = registry.register();

        assert!(registry.contains(&connection_id));
        registry
            .push(&connection_id, "http://localhost/local", "hello")
            .await
            .unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_push_to_unknown_connection() {
        let registry = ConnectionRegistry::new();
        let result = registry.push("missing", "http://localhost/local", "hello").await;

        assert!(matches!(result, Err(PublishError::Gone)));
    }

    #[tokio::test]
    async fn test_closed_receiver_unregisters() {
        let registry = ConnectionRegistry::new();
        let (connection_id, rx) = registry.register();
        drop(rx);

        let result = registry.push(&connection_id, "", "hello").await;

        assert!(matches!(result, Err(PublishError::Gone)));
        assert!(!registry.contains(&connection_id));
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = registry.register();
        let (second, _rx2) = registry.register();

        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        registry.unregister(&first);
        registry.unregister(&second);
        assert!(registry.is_empty());
    }
}
