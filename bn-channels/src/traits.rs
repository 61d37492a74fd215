use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A chat surface Benjamin listens on and answers through.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Routing key for replies; matches `InboundMessage::channel_id`.
    fn channel_id(&self) -> &str;

    /// Begin delivering inbound messages into the gateway queue.
    /// Returns once the background receiver is running.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Deliver one reply. `recipient_id` is the chat or thread from `reply_target()`.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
