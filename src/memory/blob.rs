//! Append-only blob log: one JSON-lines file per UTC day.
//!
//! Every event the agent produces lands here. Files are never rewritten;
//! rotation is just the date changing. A transient append failure gets a
//! single retry before surfacing.

use crate::types::BlobEventType;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// One audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: BlobEventType,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Aggregate stats over the blob directory.
#[derive(Debug, Clone, Serialize)]
pub struct BlobStats {
    pub total_files: usize,
    pub total_size_bytes: u64,
}

/// One bucket of the analytics time series.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsBucket {
    pub bucket_start: DateTime<Utc>,
    pub counts: BTreeMap<String, usize>,
    pub cost: f64,
}

/// Handle to the date-partitioned blob directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).context("Failed to create blob directory")?;
        Ok(Self { dir })
    }

    /// Whether the log can currently accept events. The safety validator
    /// refuses to dispatch actions when this is false.
    pub fn available(&self) -> bool {
        self.dir.is_dir()
            && std::fs::metadata(&self.dir)
                .map(|m| !m.permissions().readonly())
                .unwrap_or(false)
    }

    /// Append one event. Retries once on a transient I/O failure.
    pub fn append(&self, event_type: BlobEventType, content: &str, metadata: Value) -> Result<()> {
        let event = BlobEvent {
            timestamp: Utc::now(),
            event_type,
            content: content.to_string(),
            metadata,
        };
        match self.write_line(&event) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("Blob append failed, retrying once: {first}");
                self.write_line(&event)
            }
        }
    }

    fn write_line(&self, event: &BlobEvent) -> Result<()> {
        let path = self.file_for(event.timestamp);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open blob file {}", path.display()))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}").context("Failed to append blob event")?;
        Ok(())
    }

    fn file_for(&self, ts: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("{}.jsonl", ts.format("%Y-%m-%d")))
    }

    /// The most recent `limit` events across all files, oldest first.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<BlobEvent>> {
        let mut files = self.jsonl_files()?;
        files.sort();
        files.reverse();

        let mut events: Vec<BlobEvent> = Vec::new();
        for path in files {
            if events.len() >= limit {
                break;
            }
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read blob file {}", path.display()))?;
            for line in contents.lines().rev() {
                if events.len() >= limit {
                    break;
                }
                match serde_json::from_str::<BlobEvent>(line) {
                    Ok(event) => events.push(event),
                    Err(_) => continue,
                }
            }
        }
        events.reverse();
        Ok(events)
    }

    /// Events newer than the cutoff, oldest first.
    pub fn read_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<BlobEvent>> {
        let mut files = self.jsonl_files()?;
        files.sort();

        let mut events = Vec::new();
        for path in files {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Skip whole files older than the cutoff's day.
            if stem < cutoff.format("%Y-%m-%d").to_string().as_str() {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            for line in contents.lines() {
                if let Ok(event) = serde_json::from_str::<BlobEvent>(line) {
                    if event.timestamp >= cutoff {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }

    pub fn stats(&self) -> Result<BlobStats> {
        let files = self.jsonl_files()?;
        let mut total_size = 0u64;
        for path in &files {
            total_size += std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(BlobStats {
            total_files: files.len(),
            total_size_bytes: total_size,
        })
    }

    /// Bucketed event counts and cost over the trailing window, for the
    /// dashboard analytics endpoint. Cost is summed from `metadata.cost`.
    pub fn bucketed(&self, window: Duration, bucket: Duration) -> Result<Vec<AnalyticsBucket>> {
        let now = Utc::now();
        let start = now - window;
        let events = self.read_since(start)?;

        let bucket_secs = bucket.num_seconds().max(60);
        let mut buckets: BTreeMap<i64, AnalyticsBucket> = BTreeMap::new();
        for event in events {
            let offset = (event.timestamp - start).num_seconds() / bucket_secs;
            let entry = buckets.entry(offset).or_insert_with(|| AnalyticsBucket {
                bucket_start: start + Duration::seconds(offset * bucket_secs),
                counts: BTreeMap::new(),
                cost: 0.0,
            });
            *entry
                .counts
                .entry(event.event_type.to_string())
                .or_insert(0) += 1;
            if let Some(cost) = event.metadata.get("cost").and_then(Value::as_f64) {
                entry.cost += cost;
            }
        }
        Ok(buckets.into_values().collect())
    }

    fn jsonl_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir).context("Failed to list blob directory")? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "jsonl") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().join("blob")).unwrap();
        (dir, store)
    }

    #[test]
    fn append_is_visible_as_the_last_event() {
        let (_dir, store) = store();
        store
            .append(BlobEventType::System, "boot", Value::Null)
            .unwrap();
        store
            .append(
                BlobEventType::ChatCreator,
                "hi",
                serde_json::json!({"channel": "web"}),
            )
            .unwrap();

        let events = store.read_recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().content, "hi");
        assert_eq!(events.last().unwrap().event_type, BlobEventType::ChatCreator);
    }

    #[test]
    fn earlier_events_are_not_mutated_by_later_appends() {
        let (_dir, store) = store();
        store
            .append(BlobEventType::System, "first", Value::Null)
            .unwrap();
        let before = store.read_recent(10).unwrap();
        store
            .append(BlobEventType::Error, "second", Value::Null)
            .unwrap();
        let after = store.read_recent(10).unwrap();
        assert_eq!(before[0].content, after[0].content);
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn files_partition_by_day() {
        let (_dir, store) = store();
        store
            .append(BlobEventType::System, "x", Value::Null)
            .unwrap();
        let expected = format!("{}.jsonl", Utc::now().format("%Y-%m-%d"));
        let files = store.jsonl_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name().unwrap().to_str().unwrap(), expected);
    }

    #[test]
    fn bucketed_series_sums_costs() {
        let (_dir, store) = store();
        for _ in 0..3 {
            store
                .append(
                    BlobEventType::LlmResponse,
                    "r",
                    serde_json::json!({"cost": 0.01}),
                )
                .unwrap();
        }
        let buckets = store
            .bucketed(Duration::hours(1), Duration::minutes(5))
            .unwrap();
        let total: f64 = buckets.iter().map(|b| b.cost).sum();
        assert!((total - 0.03).abs() < 1e-9);
        let count: usize = buckets
            .iter()
            .filter_map(|b| b.counts.get("llm_response"))
            .sum();
        assert_eq!(count, 3);
    }

    #[test]
    fn read_recent_caps_at_limit() {
        let (_dir, store) = store();
        for i in 0..20 {
            store
                .append(BlobEventType::System, &format!("e{i}"), Value::Null)
                .unwrap();
        }
        let events = store.read_recent(5).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events.last().unwrap().content, "e19");
        assert_eq!(events[0].content, "e15");
    }
}
