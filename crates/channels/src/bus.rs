use {tokio::sync::mpsc, tracing::debug};

use crate::{bridge::ChannelError, message::IncomingMessage};

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Fan-in queue from all bridges to the gateway.
#[derive(Debug, Clone)]
pub struct InboundBus {
    tx: mpsc::Sender<IncomingMessage>,
}

/// Consumer side of the [`InboundBus`], owned by the gateway.
#[derive(Debug)]
pub struct InboundReceiver {
    rx: mpsc::Receiver<IncomingMessage>,
}

impl InboundBus {
    pub fn new(capacity: usize) -> (Self, InboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, InboundReceiver { rx })
    }

    /// Queue a message, waiting for room when the bus is full.
    pub async fn publish(&self, message: IncomingMessage) -> Result<(), ChannelError> {
        debug!(channel = %message.channel, chat_id = %message.chat_id, "inbound message published");
        self.tx
            .send(message)
            .await
            .map_err(|_| ChannelError::BusClosed)
    }
}

impl InboundReceiver {
    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order() {
        let (bus, mut rx) = InboundBus::new(4);
        bus.publish(IncomingMessage::direct("t", "c", "u", "one")).await.unwrap();
        bus.publish(IncomingMessage::direct("t", "c", "u", "two")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "one");
        assert_eq!(rx.recv().await.unwrap().content, "two");
    }

    #[tokio::test]
    async fn publish_fails_after_receiver_dropped() {
        let (bus, rx) = InboundBus::new(1);
        drop(rx);
        assert!(matches!(
            bus.publish(IncomingMessage::direct("t", "c", "u", "x")).await,
            Err(ChannelError::BusClosed)
        ));
    }
}
