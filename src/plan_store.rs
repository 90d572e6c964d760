//! Durable delivery-plan state: which batches the current plan contains and
//! which of them have already been sent. Survives process restarts so a crash
//! between planning and sending leaves a resumable record.

use crate::planner::PlannedBatch;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// The persisted plan. Batches carry their full release-id lists so a reload
/// is self-sufficient; no store round-trip is needed to resume delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanRecord {
    pub generated_at: Option<DateTime<Utc>>,
    pub batches: Vec<PlannedBatch>,
    pub sent: Vec<String>,
}

impl PlanRecord {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn is_sent(&self, batch_id: &str) -> bool {
        self.sent.iter().any(|id| id == batch_id)
    }

    /// Batches not yet in the sent set, in ascending ordinal order.
    pub fn pending(&self) -> impl Iterator<Item = &PlannedBatch> {
        self.batches.iter().filter(|b| !self.is_sent(&b.id))
    }
}

#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the durable plan with the given batches and sent set,
    /// stamped with the current time.
    pub async fn save(&self, batches: &[PlannedBatch], sent: &[String]) -> Result<()> {
        self.write_record(&PlanRecord {
            generated_at: Some(Utc::now()),
            batches: batches.to_vec(),
            sent: sent.to_vec(),
        })
        .await
    }

    /// Returns the last saved plan. A missing or unreadable file degrades to
    /// the empty plan rather than an error; corrupt state means "no plan".
    pub async fn load(&self) -> PlanRecord {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return PlanRecord::default();
            }
            Err(err) => {
                warn!(?err, path = %self.path.display(), "failed to read plan file; treating as empty");
                return PlanRecord::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(?err, path = %self.path.display(), "plan file is corrupt; treating as empty");
                PlanRecord::default()
            }
        }
    }

    /// Idempotently adds `batch_id` to the sent set and re-persists.
    pub async fn mark_batch_sent(&self, batch_id: &str) -> Result<()> {
        let mut record = self.load().await;
        if record.is_sent(batch_id) {
            return Ok(());
        }
        record.sent.push(batch_id.to_string());
        self.write_record(&record).await
    }

    /// Replaces a plan older than `max_age` with the empty plan, so an
    /// orphaned plan from a crashed run cannot block future planning forever.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<()> {
        let record = self.load().await;
        let Some(generated_at) = record.generated_at else {
            return Ok(());
        };
        if Utc::now() - generated_at > max_age {
            info!(generated_at = %generated_at, "discarding stale delivery plan");
            self.write_record(&PlanRecord::default()).await?;
        }
        Ok(())
    }

    // Write-temp-then-rename so a concurrent reader never observes a torn file.
    async fn write_record(&self, record: &PlanRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record).context("serialize plan record")?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &data)
            .await
            .with_context(|| format!("write plan temp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace plan file {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::WindowTime;

    fn batch(id: &str, index: usize, ids: Vec<i64>) -> PlannedBatch {
        PlannedBatch {
            id: id.to_string(),
            index,
            total: 2,
            window: WindowTime { hour: 8, minute: 0 },
            release_ids: ids,
        }
    }

    fn store(dir: &tempfile::TempDir) -> PlanStore {
        PlanStore::new(dir.path().join("plan.json"))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let batches = vec![batch("20240315-1", 1, vec![1, 2]), batch("20240315-2", 2, vec![3])];

        store.save(&batches, &[]).await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded.batches, batches);
        assert!(loaded.sent.is_empty());
        assert!(loaded.generated_at.is_some());
    }

    #[tokio::test]
    async fn missing_or_corrupt_file_degrades_to_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.load().await.is_empty());

        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_window_in_plan_file_degrades_to_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        // Parseable JSON, but the window fails validation on deserialize.
        let data = serde_json::json!({
            "generated_at": Utc::now(),
            "batches": [{
                "id": "20240315-1",
                "index": 1,
                "total": 1,
                "window": { "hour": 99, "minute": 0 },
                "release_ids": [1],
            }],
            "sent": [],
        });
        std::fs::write(store.path(), serde_json::to_vec(&data).unwrap()).unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn mark_batch_sent_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let batches = vec![batch("20240315-1", 1, vec![1])];
        store.save(&batches, &[]).await.unwrap();

        store.mark_batch_sent("20240315-1").await.unwrap();
        store.mark_batch_sent("20240315-1").await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.sent, vec!["20240315-1".to_string()]);
        assert!(loaded.pending().next().is_none());
    }

    #[tokio::test]
    async fn cleanup_discards_only_stale_plans() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(&[batch("20240315-1", 1, vec![1])], &[]).await.unwrap();

        store.cleanup_older_than(Duration::hours(24)).await.unwrap();
        assert!(!store.load().await.is_empty());

        // Backdate the plan, then clean again.
        let mut record = store.load().await;
        record.generated_at = Some(Utc::now() - Duration::hours(48));
        let data = serde_json::to_vec(&record).unwrap();
        std::fs::write(store.path(), data).unwrap();

        store.cleanup_older_than(Duration::hours(24)).await.unwrap();
        assert!(store.load().await.is_empty());
    }
}
