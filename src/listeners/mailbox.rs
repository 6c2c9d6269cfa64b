//! Mailbox listener: polls an HTTP mail-gateway inbox and enqueues new
//! creator messages.
//!
//! The gateway (an external collaborator) fronts the actual mail account
//! and exposes a JSON inbox: `GET {url}?after={id}` returning messages in
//! id order. The last consumed id survives restarts in the state store.

use crate::core::ChatSender;
use crate::state::Database;
use crate::types::Channel;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CURSOR_KEY: &str = "mailbox_cursor";

#[derive(Debug, Deserialize)]
struct GatewayMessage {
    id: i64,
    #[serde(default)]
    from: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

/// Polls the gateway inbox and forwards messages into the chat queue.
pub struct MailboxListener {
    gateway_url: String,
    chat: ChatSender,
    db: Arc<Mutex<Database>>,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl MailboxListener {
    pub fn new(
        gateway_url: &str,
        chat: ChatSender,
        db: Arc<Mutex<Database>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            chat,
            db,
            poll_interval,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Mailbox listener started ({})", self.gateway_url);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Mailbox listener shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(err) = self.poll_once().await {
                        warn!("Mailbox poll failed: {err:#}");
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let cursor = self.load_cursor().await?;
        let url = format!("{}?after={cursor}", self.gateway_url);
        let messages: Vec<GatewayMessage> = self
            .http
            .get(&url)
            .send()
            .await
            .context("Mail gateway request failed")?
            .json()
            .await
            .context("Mail gateway parse failed")?;

        let mut max_id = cursor;
        for message in messages {
            max_id = max_id.max(message.id);
            let text = format!(
                "[email from {}] {}\n{}",
                message.from, message.subject, message.body
            );
            self.chat.enqueue(&text, Channel::Mail).await?;
        }
        if max_id > cursor {
            self.store_cursor(max_id).await?;
        }
        Ok(())
    }

    async fn load_cursor(&self) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db
            .kv_get(CURSOR_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn store_cursor(&self, id: i64) -> Result<()> {
        let db = self.db.lock().await;
        db.kv_set(CURSOR_KEY, &id.to_string())
    }
}
