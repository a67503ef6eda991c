use std::fmt;

use serde::{Deserialize, Serialize};

/// Session key: `agent:<id>:main` or `agent:<id>:channel:<ch>:chat:<chat_id>`.
///
/// The key string doubles as the session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn main(agent_id: &str) -> Self {
        Self(format!("agent:{agent_id}:main"))
    }

    pub fn for_chat(agent_id: &str, channel: &str, chat_id: &str) -> Self {
        Self(format!("agent:{agent_id}:channel:{channel}:chat:{chat_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Agent id embedded in the key, if it has the expected prefix.
    pub fn agent_id(&self) -> Option<&str> {
        let rest = self.0.strip_prefix("agent:")?;
        rest.split(':').next().filter(|id| !id.is_empty())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
