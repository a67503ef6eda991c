use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    /// `image`, `audio`, `video` or `file`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A message received by a bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub channel: String,
    /// Bridge account the message arrived on.
    #[serde(default)]
    pub channel_id: String,
    pub sender_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub chat_type: ChatType,
    pub content: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn direct(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            channel_id: String::new(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            chat_type: ChatType::Direct,
            content: content.into(),
            media: Vec::new(),
            mentions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.chat_type == ChatType::Group
    }

    /// Whether `handle` is mentioned, either in the mention list or inline
    /// as `@handle`.
    pub fn mentions(&self, handle: &str) -> bool {
        self.mentions.iter().any(|m| m.eq_ignore_ascii_case(handle))
            || self
                .content
                .to_ascii_lowercase()
                .contains(&format!("@{}", handle.to_ascii_lowercase()))
    }
}

/// A reply to be delivered by a bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
}

impl OutgoingMessage {
    pub fn text(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn incoming_defaults_optional_fields() {
        let msg: IncomingMessage = serde_json::from_value(serde_json::json!({
            "channel": "telegram",
            "senderId": "u1",
            "chatId": "c1",
            "content": "hello",
        }))
        .unwrap();
        assert_eq!(msg.chat_type, ChatType::Direct);
        assert!(msg.media.is_empty());
    }

    #[test]
    fn mention_detection() {
        let mut msg = IncomingMessage::direct("slack", "c", "u", "hey @Pincer what's up");
        assert!(msg.mentions("pincer"));
        msg.content = "no mention".into();
        assert!(!msg.mentions("pincer"));
        msg.mentions = vec!["Pincer".into()];
        assert!(msg.mentions("pincer"));
    }
}
