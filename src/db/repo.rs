use super::model::{NewRelease, UnnotifiedRelease};
use crate::model::{ReleaseKind, WorkKind};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Returns the existing work id for (title, kind) or inserts a new row.
/// Safe to call repeatedly with the same input.
#[instrument(skip_all)]
pub async fn get_or_create_work(
    pool: &Pool,
    title: &str,
    kind: WorkKind,
    english_title: Option<&str>,
    url: Option<&str>,
) -> Result<i64> {
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM works WHERE title = ? AND kind = ?")
            .bind(title)
            .bind(kind.as_str())
            .fetch_optional(pool)
            .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO works (title, kind, english_title, url) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(title)
    .bind(kind.as_str())
    .bind(english_title)
    .bind(url)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Inserts a release. If the uniqueness tuple (work, kind, number, platform,
/// date) already exists, returns the existing row's id instead of raising —
/// ingestion callers never pre-check for duplicates.
#[instrument(skip_all)]
pub async fn create_release(pool: &Pool, release: &NewRelease) -> Result<i64> {
    let number = release.number.as_deref().unwrap_or("");
    let platform = release.platform.as_deref().unwrap_or("");

    sqlx::query(
        "INSERT INTO releases (work_id, kind, number, platform, release_date, source, source_url) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (work_id, kind, number, platform, release_date) DO NOTHING",
    )
    .bind(release.work_id)
    .bind(release.kind.as_str())
    .bind(number)
    .bind(platform)
    .bind(release.release_date)
    .bind(&release.source)
    .bind(release.source_url.as_deref())
    .execute(pool)
    .await?;

    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM releases \
         WHERE work_id = ? AND kind = ? AND number = ? AND platform = ? AND release_date = ?",
    )
    .bind(release.work_id)
    .bind(release.kind.as_str())
    .bind(number)
    .bind(platform)
    .bind(release.release_date)
    .fetch_one(pool)
    .await
    .context("release row missing after upsert")?;
    Ok(id)
}

/// Lists pending releases joined with their works, oldest first so the oldest
/// items are always planned first.
#[instrument(skip_all)]
pub async fn list_unnotified(pool: &Pool, limit: Option<i64>) -> Result<Vec<UnnotifiedRelease>> {
    let mut sql = String::from(
        "SELECT r.id, r.work_id, r.kind, r.number, r.platform, r.release_date, \
                r.source, r.source_url, r.created_at, \
                w.title AS work_title, w.kind AS work_kind \
         FROM releases r \
         JOIN works w ON w.id = r.work_id \
         WHERE r.notified = 0 \
         ORDER BY r.release_date ASC, r.created_at ASC, r.id ASC",
    );
    if limit.is_some() {
        sql.push_str(" LIMIT ?");
    }
    let mut query = sqlx::query(&sql);
    if let Some(limit) = limit {
        query = query.bind(limit);
    }

    let rows = query.fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            let kind_str: String = row.get("kind");
            let kind = ReleaseKind::parse(&kind_str)
                .ok_or_else(|| anyhow!("release has unknown kind {}", kind_str))?;
            let work_kind_str: String = row.get("work_kind");
            let work_kind = WorkKind::parse(&work_kind_str)
                .ok_or_else(|| anyhow!("work has unknown kind {}", work_kind_str))?;
            // Empty strings are the storage form of "absent".
            let number: String = row.get("number");
            let platform: String = row.get("platform");
            Ok(UnnotifiedRelease {
                id: row.get("id"),
                work_id: row.get("work_id"),
                work_title: row.get("work_title"),
                work_kind,
                kind,
                number: Some(number).filter(|s| !s.is_empty()),
                platform: Some(platform).filter(|s| !s.is_empty()),
                release_date: row.get::<NaiveDate, _>("release_date"),
                source: row.get("source"),
                source_url: row.try_get::<Option<String>, _>("source_url").ok().flatten(),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn count_releases(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM releases")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn count_unnotified(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM releases WHERE notified = 0")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Sets notified=1. Returns false (not an error) when the id does not exist,
/// so callers can log-and-continue mid-batch.
#[instrument(skip_all)]
pub async fn mark_notified(pool: &Pool, release_id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE releases SET notified = 1 WHERE id = ?")
        .bind(release_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Retention GC: drops notified releases older than the given number of days.
#[instrument(skip_all)]
pub async fn delete_notified_older_than(pool: &Pool, days: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM releases \
         WHERE notified = 1 AND release_date < date('now', '-' || ? || ' days')",
    )
    .bind(days)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
