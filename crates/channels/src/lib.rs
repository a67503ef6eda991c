//! Channel bridge interfaces.
//!
//! Each messaging platform (Telegram, WhatsApp, Slack, web chat, ...) is a
//! [`ChannelBridge`]. Bridges publish inbound traffic on the [`InboundBus`]
//! and receive outbound replies through [`ChannelBridge::send_message`].

pub mod bridge;
pub mod bus;
pub mod message;
pub mod registry;

pub use {
    bridge::{ChannelBridge, ChannelError, ChannelStatus},
    bus::{InboundBus, InboundReceiver},
    message::{ChatType, IncomingMessage, MediaAttachment, OutgoingMessage},
    registry::ChannelRegistry,
};
