use std::{collections::HashMap, sync::Arc};

use {tokio::sync::RwLock, tracing::info};

use crate::{
    bridge::{ChannelBridge, ChannelError, ChannelStatus},
    message::OutgoingMessage,
};

/// Registered channel bridges, keyed by channel id.
#[derive(Default)]
pub struct ChannelRegistry {
    bridges: RwLock<HashMap<String, Arc<dyn ChannelBridge>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, bridge: Arc<dyn ChannelBridge>) {
        let id = bridge.id().to_string();
        info!(channel = %id, "channel bridge registered");
        self.bridges.write().await.insert(id, bridge);
    }

    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn ChannelBridge>> {
        self.bridges.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelBridge>> {
        self.bridges.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.bridges.read().await.len()
    }

    /// Status of every bridge, sorted by id.
    pub async fn statuses(&self) -> Vec<ChannelStatus> {
        let bridges: Vec<_> = self.bridges.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(bridges.len());
        for bridge in bridges {
            statuses.push(bridge.status().await);
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Deliver `message` through the bridge named by `message.channel`.
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
        let bridge = self
            .get(&message.channel)
            .await
            .ok_or_else(|| ChannelError::NotFound(message.channel.clone()))?;
        bridge.send_message(message).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, async_trait::async_trait, tokio::sync::Mutex};

    #[derive(Default)]
    struct RecordingBridge {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait]
    impl ChannelBridge for RecordingBridge {
        fn id(&self) -> &str {
            "webchat"
        }

        async fn send_message(&self, message: OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.lock().await.push(message);
            Ok(())
        }

        async fn status(&self) -> ChannelStatus {
            ChannelStatus {
                id: self.id().into(),
                connected: true,
                details: None,
            }
        }
    }

    #[tokio::test]
    async fn routes_by_channel_id() {
        let registry = ChannelRegistry::new();
        let bridge = Arc::new(RecordingBridge::default());
        registry.register(bridge.clone()).await;

        registry
            .send(OutgoingMessage::text("webchat", "c1", "hi"))
            .await
            .unwrap();
        assert_eq!(bridge.sent.lock().await.len(), 1);

        let err = registry
            .send(OutgoingMessage::text("telegram", "c1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotFound(ref c) if c == "telegram"));
    }

    #[tokio::test]
    async fn statuses_listed() {
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(RecordingBridge::default())).await;
        let statuses = registry.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].connected);
        assert_eq!(registry.count().await, 1);
    }
}
