//! Channel multiplexer: every adapter feeds one inbound queue; each message is handled on
//! its own task so a kill phrase is never stuck behind a running execution.

use crate::config::SecurityConfig;
use crate::handler::MessageHandler;
use anyhow::Result;
use bn_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    security: SecurityConfig,
    handler: Arc<MessageHandler>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl Gateway {
    pub fn new(
        security: SecurityConfig,
        handler: Arc<MessageHandler>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            security,
            handler,
            channels,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
            tracing::info!("gateway loop exited");
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return;
            };

            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_inbound(inbound).await {
                    tracing::warn!(%e, "handle_inbound failed");
                }
            });
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %inbound.channel_id, sender = %inbound.sender_id, message_id = %inbound.message_id)
    )]
    async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        if !self.security.is_allowed(&inbound.sender_id) {
            tracing::info!("sender not allow-listed; ignoring");
            return Ok(());
        }
        if inbound.content.trim().is_empty() {
            return Ok(());
        }

        let channel = self
            .channels
            .get(inbound.channel_id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", inbound.channel_id))?
            .clone();

        let reply = self
            .handler
            .handle(&inbound.content, &inbound.sender_id)
            .await;

        channel
            .send(
                inbound.reply_target(),
                OutboundMessage::reply(reply, &inbound.message_id),
            )
            .await
    }
}
