//! Ingestion boundary: source collaborators (API clients, feed parsers) hand
//! over raw release records; this layer funnels them into the release store.
//! Re-ingesting the same source data is a no-op thanks to the store's
//! uniqueness tuple.

use crate::db::{self, NewRelease, Pool};
use crate::model::{ReleaseKind, WorkKind};
use anyhow::Result;
use chrono::NaiveDate;
use tracing::{info, instrument};

/// One raw release event as produced by a source collaborator.
#[derive(Debug, Clone)]
pub struct RawRelease {
    pub title: String,
    pub work_kind: WorkKind,
    pub english_title: Option<String>,
    pub work_url: Option<String>,
    pub kind: ReleaseKind,
    pub number: Option<String>,
    pub platform: Option<String>,
    pub release_date: NaiveDate,
    pub source: String,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: usize,
    pub deduplicated: usize,
}

/// Stores a batch of raw records, creating works on first sight and skipping
/// releases already present.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn ingest(pool: &Pool, records: &[RawRelease]) -> Result<IngestStats> {
    let before = db::count_releases(pool).await?;
    for record in records {
        let work_id = db::get_or_create_work(
            pool,
            &record.title,
            record.work_kind,
            record.english_title.as_deref(),
            record.work_url.as_deref(),
        )
        .await?;
        db::create_release(
            pool,
            &NewRelease {
                work_id,
                kind: record.kind,
                number: record.number.clone(),
                platform: record.platform.clone(),
                release_date: record.release_date,
                source: record.source.clone(),
                source_url: record.source_url.clone(),
            },
        )
        .await?;
    }
    let after = db::count_releases(pool).await?;

    let inserted = (after - before) as usize;
    let stats = IngestStats {
        inserted,
        deduplicated: records.len() - inserted,
    };
    info!(
        inserted = stats.inserted,
        deduplicated = stats.deduplicated,
        "ingest pass complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn record(title: &str, number: &str) -> RawRelease {
        RawRelease {
            title: title.to_string(),
            work_kind: WorkKind::Anime,
            english_title: None,
            work_url: None,
            kind: ReleaseKind::Episode,
            number: Some(number.to_string()),
            platform: Some("crunchyroll".to_string()),
            release_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            source: "anilist".to_string(),
            source_url: None,
        }
    }

    #[tokio::test]
    async fn reingesting_the_same_feed_is_a_no_op() {
        let pool = setup_pool().await;
        let records = vec![record("Frieren", "12"), record("Dungeon Meshi", "8")];

        let first = ingest(&pool, &records).await.unwrap();
        assert_eq!(first, IngestStats { inserted: 2, deduplicated: 0 });

        let second = ingest(&pool, &records).await.unwrap();
        assert_eq!(second, IngestStats { inserted: 0, deduplicated: 2 });

        assert_eq!(db::count_unnotified(&pool).await.unwrap(), 2);
    }
}
