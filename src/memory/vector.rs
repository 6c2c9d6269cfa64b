//! Embedded similarity store for long-term memory.
//!
//! Entries carry an importance score, a TTL, and a permanence flag.
//! Embeddings are deterministic character-trigram feature hashes, so the
//! store needs no external model or service; similarity is cosine over
//! L2-normalized vectors.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::info;

/// Embedding dimensionality.
pub const EMBED_DIM: usize = 256;

/// Decay never pushes importance below this floor.
const IMPORTANCE_FLOOR: f64 = 0.01;

/// Default TTL for entries that do not specify one: 30 days.
pub const DEFAULT_TTL_HOURS: i64 = 720;

/// One long-term memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub importance: f64,
    pub source: String,
    pub permanent: bool,
    pub created_at: DateTime<Utc>,
    pub ttl_hours: i64,
    pub access_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, importance: f64, source: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            source: source.into(),
            permanent: false,
            created_at: Utc::now(),
            ttl_hours: DEFAULT_TTL_HOURS,
            access_count: 0,
            last_accessed: None,
        }
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn with_ttl(mut self, hours: i64) -> Self {
        self.ttl_hours = hours;
        self
    }
}

/// A retrieved entry with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub entry: MemoryEntry,
    pub similarity: f32,
}

/// Store statistics for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct VectorStats {
    pub total_entries: usize,
    pub permanent_entries: usize,
    pub mean_importance: f64,
}

const CREATE_VECTOR_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id            TEXT PRIMARY KEY,
    content       TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    importance    REAL NOT NULL DEFAULT 0.5,
    source        TEXT NOT NULL DEFAULT 'system',
    permanent     INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    ttl_hours     INTEGER NOT NULL DEFAULT 720,
    access_count  INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT
);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
"#;

/// The embedded vector store. Mutations come from the director only.
pub struct VectorStore {
    conn: Connection,
}

impl VectorStore {
    /// Open (or create) the store under the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).context("Failed to create vector directory")?;
        let conn = Connection::open(dir.join("memories.db"))
            .context("Failed to open vector database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(CREATE_VECTOR_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_VECTOR_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert an entry, embedding its content. Returns the entry id.
    pub fn add(&self, entry: &MemoryEntry) -> Result<String> {
        let embedding = embed(&entry.content);
        self.conn.execute(
            "INSERT OR REPLACE INTO memories
               (id, content, embedding, importance, source, permanent,
                created_at, ttl_hours, access_count, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                entry.content,
                embedding_bytes(&embedding),
                entry.importance,
                entry.source,
                entry.permanent as i64,
                entry.created_at.to_rfc3339(),
                entry.ttl_hours,
                entry.access_count,
                entry.last_accessed.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(entry.id.clone())
    }

    /// Top-k entries by cosine similarity, at or above the threshold.
    /// Retrieval bumps each hit's access count.
    pub fn search(&self, query: &str, k: usize, threshold: f32) -> Result<Vec<ScoredMemory>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embed(query);

        let mut stmt = self.conn.prepare(
            "SELECT id, content, embedding, importance, source, permanent,
                    created_at, ttl_hours, access_count, last_accessed
             FROM memories",
        )?;
        let mut scored: Vec<ScoredMemory> = stmt
            .query_map([], |row| {
                let entry = row_to_entry(row)?;
                let embedding: Vec<u8> = row.get(2)?;
                Ok((entry, embedding))
            })?
            .filter_map(|r| r.ok())
            .map(|(entry, blob)| {
                let similarity = cosine(&query_vec, &bytes_embedding(&blob));
                ScoredMemory { entry, similarity }
            })
            .filter(|s| s.similarity >= threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        let now = Utc::now().to_rfc3339();
        for hit in &mut scored {
            self.conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed = ?2
                 WHERE id = ?1",
                params![hit.entry.id, now],
            )?;
            hit.entry.access_count += 1;
        }
        Ok(scored)
    }

    /// Multiply every non-permanent importance by `factor` (floored).
    pub fn decay(&self, factor: f64) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE memories SET importance = MAX(?2, importance * ?1) WHERE permanent = 0",
            params![factor, IMPORTANCE_FLOOR],
        )?;
        Ok(changed)
    }

    /// Re-reinforce an entry's importance upward (capped at 1.0).
    pub fn reinforce(&self, id: &str, boost: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE memories SET importance = MIN(1.0, importance + ?2) WHERE id = ?1",
            params![id, boost.max(0.0)],
        )?;
        Ok(())
    }

    pub fn mark_permanent(&self, id: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE memories SET permanent = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Delete entries past their TTL whose importance has decayed below the
    /// threshold. Permanent entries are exempt from both conditions.
    pub fn prune_expired(&self, now: DateTime<Utc>, importance_threshold: f64) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, ttl_hours, importance FROM memories WHERE permanent = 0",
        )?;
        let candidates: Vec<(String, String, i64, f64)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut deleted = 0;
        for (id, created_at, ttl_hours, importance) in candidates {
            if ttl_hours <= 0 {
                continue;
            }
            let created = DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(now);
            let age_hours = (now - created).num_hours();
            if age_hours > ttl_hours && importance < importance_threshold {
                self.conn
                    .execute("DELETE FROM memories WHERE id = ?1", params![id])?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("Pruned {deleted} expired memories");
        }
        Ok(deleted)
    }

    /// Remove exact-content duplicates, keeping the highest-importance copy.
    pub fn deduplicate(&self) -> Result<usize> {
        // Bare `id` rides along with MAX(importance): SQLite takes it from
        // the winning row of each group.
        let removed = self.conn.execute(
            "DELETE FROM memories WHERE id NOT IN
               (SELECT id FROM
                 (SELECT id, MAX(importance) FROM memories GROUP BY content))",
            [],
        )?;
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<Option<MemoryEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, content, embedding, importance, source, permanent,
                        created_at, ttl_hours, access_count, last_accessed
                 FROM memories WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Newest-first page of entries, for the dashboard.
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<MemoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, content, embedding, importance, source, permanent,
                    created_at, ttl_hours, access_count, last_accessed
             FROM memories ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> Result<VectorStats> {
        let (total, permanent, mean): (i64, i64, Option<f64>) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(permanent), 0), AVG(importance) FROM memories",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(VectorStats {
            total_entries: total as usize,
            permanent_entries: permanent as usize,
            mean_importance: mean.unwrap_or(0.0),
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    Ok(MemoryEntry {
        id: row.get(0)?,
        content: row.get(1)?,
        importance: row.get(3)?,
        source: row.get(4)?,
        permanent: row.get::<_, i64>(5)? != 0,
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(6)?)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        ttl_hours: row.get(7)?,
        access_count: row.get(8)?,
        last_accessed: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// Hash character trigrams into a fixed-width vector, L2-normalized.
pub fn embed(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; EMBED_DIM];
    let normalized = text.to_lowercase();
    let chars: Vec<char> = normalized.chars().collect();

    if chars.len() < 3 {
        // Degenerate input: hash whole tokens instead.
        for token in normalized.split_whitespace() {
            vec[slot(token)] += 1.0;
        }
    } else {
        for window in chars.windows(3) {
            let trigram: String = window.iter().collect();
            vec[slot(&trigram)] += 1.0;
        }
    }

    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

fn slot(gram: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    gram.hash(&mut hasher);
    (hasher.finish() as usize) % EMBED_DIM
}

/// Cosine similarity; inputs are already normalized, so this is a dot product.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn embedding_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VectorStore {
        VectorStore::open_memory().unwrap()
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated() {
        let store = store();
        store
            .add(&MemoryEntry::new(
                "the telegram listener polls for creator messages",
                0.5,
                "test",
            ))
            .unwrap();
        store
            .add(&MemoryEntry::new(
                "quarterly mushroom harvest yields in scandinavia",
                0.5,
                "test",
            ))
            .unwrap();

        let hits = store
            .search("telegram messages from the creator", 2, 0.0)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].entry.content.contains("telegram"));
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn threshold_filters_weak_matches() {
        let store = store();
        store
            .add(&MemoryEntry::new("completely unrelated content", 0.5, "t"))
            .unwrap();
        let hits = store.search("budget tracker charge", 5, 0.9).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn search_bumps_access_count() {
        let store = store();
        let id = store
            .add(&MemoryEntry::new("remember the budget cap", 0.5, "t"))
            .unwrap();
        store.search("budget cap", 1, 0.0).unwrap();
        store.search("budget cap", 1, 0.0).unwrap();
        let entry = store.get(&id).unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed.is_some());
    }

    #[test]
    fn decay_multiplies_importance_except_permanent() {
        let store = store();
        let plain = store
            .add(&MemoryEntry::new("plain", 0.8, "t"))
            .unwrap();
        let forever = store
            .add(&MemoryEntry::new("forever", 0.8, "t").permanent())
            .unwrap();

        store.decay(0.9).unwrap();

        let plain = store.get(&plain).unwrap().unwrap();
        let forever = store.get(&forever).unwrap().unwrap();
        assert!((plain.importance - 0.72).abs() < 1e-9);
        assert!((forever.importance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn decay_floors_at_minimum() {
        let store = store();
        let id = store.add(&MemoryEntry::new("tiny", 0.02, "t")).unwrap();
        store.decay(0.5).unwrap();
        let entry = store.get(&id).unwrap().unwrap();
        assert!((entry.importance - IMPORTANCE_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn prune_respects_ttl_and_permanence() {
        let store = store();
        let mut old = MemoryEntry::new("old and faded", 0.01, "t").with_ttl(1);
        old.created_at = Utc::now() - chrono::Duration::hours(10);
        let old_id = store.add(&old).unwrap();

        let mut kept = MemoryEntry::new("old but permanent", 0.01, "t").with_ttl(1);
        kept.created_at = Utc::now() - chrono::Duration::hours(10);
        let kept_id = store.add(&kept.permanent()).unwrap();

        let fresh_id = store
            .add(&MemoryEntry::new("fresh", 0.01, "t").with_ttl(1))
            .unwrap();

        let deleted = store.prune_expired(Utc::now(), 0.05).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&old_id).unwrap().is_none());
        assert!(store.get(&kept_id).unwrap().is_some());
        assert!(store.get(&fresh_id).unwrap().is_some());
    }

    #[test]
    fn deduplicate_keeps_strongest_copy() {
        let store = store();
        store
            .add(&MemoryEntry::new("same fact", 0.3, "t"))
            .unwrap();
        store
            .add(&MemoryEntry::new("same fact", 0.7, "t"))
            .unwrap();
        store
            .add(&MemoryEntry::new("different fact", 0.5, "t"))
            .unwrap();

        let removed = store.deduplicate().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().unwrap(), 2);
        let hits = store.search("same fact", 5, 0.0).unwrap();
        let survivor = hits
            .iter()
            .find(|h| h.entry.content == "same fact")
            .unwrap();
        assert!((survivor.entry.importance - 0.7).abs() < 1e-9);
    }

    #[test]
    fn embeddings_are_normalized() {
        let vec = embed("some text to embed for the similarity store");
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((cosine(&vec, &vec) - 1.0).abs() < 1e-5);
    }
}
