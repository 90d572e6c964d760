//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in higher layers.

use crate::model::{ReleaseKind, WorkKind};
use chrono::{DateTime, NaiveDate, Utc};

/// Input record for `create_release`; ingestion callers build these from raw
/// source data without pre-checking for duplicates.
#[derive(Debug, Clone)]
pub struct NewRelease {
    pub work_id: i64,
    pub kind: ReleaseKind,
    pub number: Option<String>,
    pub platform: Option<String>,
    pub release_date: NaiveDate,
    pub source: String,
    pub source_url: Option<String>,
}

/// Pending release joined with its work, as listed for planning and delivery.
#[derive(Debug, Clone)]
pub struct UnnotifiedRelease {
    pub id: i64,
    pub work_id: i64,
    pub work_title: String,
    pub work_kind: WorkKind,
    pub kind: ReleaseKind,
    pub number: Option<String>,
    pub platform: Option<String>,
    pub release_date: NaiveDate,
    pub source: String,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}
