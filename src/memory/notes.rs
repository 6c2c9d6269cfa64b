//! Short-term scratch pad: a bounded list of operational breadcrumbs.
//!
//! Capacity 50, strict FIFO at the cap; anything older than 48 hours is
//! dropped by the maintenance pass. Backed by the state store and guarded
//! by its single mutex.

use crate::state::Database;
use crate::types::Note;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use crate::state::database::{NOTE_CAP, NOTE_MAX_AGE_HOURS};

/// Handle to the scratch pad.
#[derive(Clone)]
pub struct NotePad {
    db: Arc<Mutex<Database>>,
}

impl NotePad {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Append a note, evicting the oldest past the cap.
    pub async fn add(&self, content: &str, iteration: u64) -> Result<()> {
        let db = self.db.lock().await;
        db.add_note(content, iteration)
    }

    /// All notes, most recent first.
    pub async fn list(&self) -> Result<Vec<Note>> {
        let db = self.db.lock().await;
        db.notes()
    }

    pub async fn count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        db.note_count()
    }

    /// Drop notes past the age limit; returns how many were evicted.
    pub async fn expire(&self) -> Result<usize> {
        let db = self.db.lock().await;
        db.expire_notes(Utc::now())
    }
}
