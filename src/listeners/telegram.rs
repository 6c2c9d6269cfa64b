//! Telegram listener: long-polls the Bot API and enqueues creator messages.
//!
//! No webhook or public URL needed. Only the configured chat id (the
//! creator) is listened to; everything else is ignored.

use crate::core::ChatSender;
use crate::types::Channel;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outbound half: lets the loop push replies back to the creator.
#[derive(Debug, Clone)]
pub struct TelegramSender {
    bot_token: String,
    chat_id: String,
    http: reqwest::Client,
}

impl TelegramSender {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
        }
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({"chat_id": self.chat_id, "text": text}))
            .send()
            .await
            .context("Telegram send failed")?;
        if !resp.status().is_success() {
            bail!("Telegram API returned {}", resp.status());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: IncomingChat,
    text: Option<String>,
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncomingChat {
    id: i64,
}

/// Polls `getUpdates` and enqueues creator messages into the loop.
pub struct TelegramListener {
    bot_token: String,
    chat_id: String,
    chat: ChatSender,
    poll_interval: Duration,
    http: reqwest::Client,
    last_update_id: i64,
}

impl TelegramListener {
    pub fn new(
        bot_token: &str,
        chat_id: &str,
        chat: ChatSender,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            chat,
            poll_interval,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(40))
                .build()
                .unwrap_or_default(),
            last_update_id: 0,
        }
    }

    /// Run until cancelled. Transient API errors back off and continue.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!("Telegram listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Telegram listener shutting down");
                    return Ok(());
                }
                result = self.poll_once() => {
                    if let Err(err) = result {
                        warn!("Telegram poll failed: {err:#}");
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    } else {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        }
    }

    async fn poll_once(&mut self) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/getUpdates", self.bot_token);
        let mut request = self
            .http
            .get(&url)
            .query(&[("timeout", "30"), ("allowed_updates", "[\"message\"]")]);
        if self.last_update_id > 0 {
            request = request.query(&[("offset", (self.last_update_id + 1).to_string())]);
        }

        let resp: UpdatesResponse = request
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates parse failed")?;
        if !resp.ok {
            bail!("Telegram API returned ok=false");
        }

        for update in resp.result {
            self.last_update_id = self.last_update_id.max(update.update_id);
            let Some(message) = update.message else {
                continue;
            };
            // Creator only.
            if message.chat.id.to_string() != self.chat_id {
                info!("Ignoring non-creator chat {}", message.chat.id);
                continue;
            }
            let Some(text) = message.text.or(message.caption) else {
                continue;
            };
            // Replies flow back through the loop's delivery step.
            self.chat.enqueue(&text, Channel::Telegram).await?;
        }
        Ok(())
    }
}
