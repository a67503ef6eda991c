//! Conversation sessions.
//!
//! A session is keyed by agent, channel and chat id and holds a bounded
//! context window plus per-session settings. Sessions live in memory in a
//! [`SessionStore`] and are evicted by TTL.

pub mod commands;
pub mod key;
pub mod session;
pub mod store;

pub use {
    commands::{ChatCommand, CommandError, CommandOutcome},
    key::SessionKey,
    session::{
        ActivationMode, ChatMessage, Role, Session, SessionSettings, SessionSummary,
        ThinkingLevel, UsageMode,
    },
    store::{SessionError, SessionOrigin, SessionStore},
};
