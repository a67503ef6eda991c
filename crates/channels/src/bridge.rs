use {async_trait::async_trait, serde::Serialize, thiserror::Error};

use crate::message::OutgoingMessage;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel not registered: {0}")]
    NotFound(String),
    #[error("channel {channel} send failed: {reason}")]
    SendFailed { channel: String, reason: String },
    #[error("inbound bus closed")]
    BusClosed,
}

/// Bridge health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub id: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A messaging platform integration.
#[async_trait]
pub trait ChannelBridge: Send + Sync {
    /// Channel identifier (e.g. "telegram", "webchat").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str {
        self.id()
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<(), ChannelError>;

    async fn status(&self) -> ChannelStatus;
}
