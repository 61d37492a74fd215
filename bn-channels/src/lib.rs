//! Channel adapters for Benjamin.
//!
//! Adapters are pure I/O: they convert platform messages to/from Benjamin
//! `InboundMessage` / `OutboundMessage` and know nothing about plans or approvals.

mod telegram;
mod traits;
mod types;

pub use telegram::{TELEGRAM_MESSAGE_LIMIT, TelegramAdapter, split_message};
pub use traits::ChannelAdapter;
pub use types::{ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId, ThreadId};
