//! The director task and the handles other tasks use to reach it.
//!
//! Listeners and the API never hold a pointer into the loop; everything
//! crosses through the bounded chat queue and the wake/pause signals.

pub mod r#loop;

pub use r#loop::CoreLoop;

use crate::memory::BlobStore;
use crate::state::Database;
use crate::types::{BlobEventType, Channel, ChatRole};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::info;

/// Bound of the in-process chat queue.
pub const CHAT_QUEUE_CAPACITY: usize = 64;

/// A creator message waiting for the director.
#[derive(Debug)]
pub struct PendingChat {
    /// Persisted chat row id.
    pub id: i64,
    pub message: String,
    pub channel: Channel,
    /// Present for synchronous callers (the `/chat` endpoint).
    pub reply: Option<oneshot::Sender<ChatReply>>,
}

/// What the director sends back for one creator message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub model: String,
    pub provider: String,
    pub tokens_used: u32,
}

/// Producer handle to the chat queue. Enqueuing persists the message,
/// writes the audit event, and wakes the director.
#[derive(Clone)]
pub struct ChatSender {
    db: Arc<Mutex<Database>>,
    blob: BlobStore,
    tx: mpsc::Sender<PendingChat>,
    wake: Arc<Notify>,
}

impl ChatSender {
    pub fn new(
        db: Arc<Mutex<Database>>,
        blob: BlobStore,
        tx: mpsc::Sender<PendingChat>,
        wake: Arc<Notify>,
    ) -> Self {
        Self { db, blob, tx, wake }
    }

    /// Enqueue a creator message. Returns the receiver for the reply.
    pub async fn enqueue(
        &self,
        message: &str,
        channel: Channel,
    ) -> Result<oneshot::Receiver<ChatReply>> {
        let id = {
            let db = self.db.lock().await;
            db.append_chat(
                ChatRole::Creator,
                message,
                channel,
                &serde_json::Value::Null,
            )?
        };
        self.blob.append(
            BlobEventType::ChatCreator,
            message,
            serde_json::json!({"channel": channel.to_string(), "chat_id": id}),
        )?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingChat {
            id,
            message: message.to_string(),
            channel,
            reply: Some(reply_tx),
        };
        // A full queue drops the in-process entry; the persisted row is
        // picked up past the cursor on the next drain.
        if let Err(err) = self.tx.try_send(pending) {
            info!("Chat queue full, relying on persisted row: {err}");
        }
        self.wake.notify_one();
        info!("Chat enqueued ({channel}, {} chars)", message.len());
        Ok(reply_rx)
    }

    /// Wake the director without a message.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}
