//! Notification collaborators: the mail and calendar channels invoked per
//! delivery batch, plus their reqwest-backed default implementations.
//!
//! Status handling maps onto the resilience taxonomy at the HTTP boundary:
//! 429 and 5xx responses (and transport errors) are retryable, other 4xx
//! responses are fatal.

use crate::db::UnnotifiedRelease;
use crate::resilience::DependencyError;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

/// Primary channel. A batch counts as delivered only if the mail send
/// succeeds.
#[async_trait]
pub trait MailNotifier: Send + Sync {
    async fn send_digest(&self, subject: &str, body: &str) -> Result<(), DependencyError>;
}

/// Best-effort channel. Failures are logged and counted but never block a
/// batch from being marked delivered.
#[async_trait]
pub trait CalendarNotifier: Send + Sync {
    /// Returns per-release success/failure, keyed by release id.
    async fn create_events(
        &self,
        releases: &[UnnotifiedRelease],
    ) -> Result<HashMap<i64, bool>, DependencyError>;
}

fn classify_status(dependency: &str, status: StatusCode, body: String) -> DependencyError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DependencyError::retryable(anyhow!("{} returned {}: {}", dependency, status, body))
    } else {
        DependencyError::fatal(anyhow!("{} returned {}: {}", dependency, status, body))
    }
}

async fn read_error_body(res: reqwest::Response) -> (StatusCode, String) {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    (status, body)
}

/// Mail client posting batch digests to an HTTP mail API.
#[derive(Clone)]
pub struct HttpMailer {
    http: Client,
    base_url: Url,
    token: String,
    from: String,
    to: String,
}

impl fmt::Debug for HttpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMailer")
            .field("base_url", &self.base_url)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

impl HttpMailer {
    pub fn new(base_url: Url, token: String, from: String, to: String) -> Self {
        let http = Client::builder()
            .user_agent("release-herald/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            from,
            to,
        }
    }
}

#[async_trait]
impl MailNotifier for HttpMailer {
    async fn send_digest(&self, subject: &str, body: &str) -> Result<(), DependencyError> {
        let endpoint = self
            .base_url
            .join("messages")
            .context("invalid mail base URL")
            .map_err(DependencyError::fatal)?;
        let payload = json!({
            "from": self.from,
            "to": self.to,
            "subject": subject,
            "text": body,
        });

        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| DependencyError::retryable(anyhow!("mail transport error: {err}")))?;

        if res.status().is_success() {
            info!(subject, "mail digest accepted");
            return Ok(());
        }
        let (status, body) = read_error_body(res).await;
        warn!(%status, "mail send rejected");
        Err(classify_status("mail", status, body))
    }
}

/// Calendar client creating one event per release.
#[derive(Clone)]
pub struct HttpCalendar {
    http: Client,
    base_url: Url,
    token: String,
    calendar_id: String,
}

impl fmt::Debug for HttpCalendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCalendar")
            .field("base_url", &self.base_url)
            .field("calendar_id", &self.calendar_id)
            .finish_non_exhaustive()
    }
}

impl HttpCalendar {
    pub fn new(base_url: Url, token: String, calendar_id: String) -> Self {
        let http = Client::builder()
            .user_agent("release-herald/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            calendar_id,
        }
    }

    fn event_body(release: &UnnotifiedRelease) -> serde_json::Value {
        json!({
            "summary": event_summary(release),
            "date": release.release_date.to_string(),
            "source": release.source,
            "url": release.source_url,
        })
    }
}

#[async_trait]
impl CalendarNotifier for HttpCalendar {
    async fn create_events(
        &self,
        releases: &[UnnotifiedRelease],
    ) -> Result<HashMap<i64, bool>, DependencyError> {
        let endpoint = self
            .base_url
            .join(&format!("calendars/{}/events", self.calendar_id))
            .context("invalid calendar base URL")
            .map_err(DependencyError::fatal)?;

        let mut results = HashMap::with_capacity(releases.len());
        for release in releases {
            let res = self
                .http
                .post(endpoint.clone())
                .bearer_auth(&self.token)
                .json(&Self::event_body(release))
                .send()
                .await
                .map_err(|err| {
                    DependencyError::retryable(anyhow!("calendar transport error: {err}"))
                })?;

            if res.status().is_success() {
                results.insert(release.id, true);
                continue;
            }
            let (status, body) = read_error_body(res).await;
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                // Abort so the resilience wrapper can retry the whole batch.
                return Err(classify_status("calendar", status, body));
            }
            warn!(release_id = release.id, %status, "calendar rejected event");
            results.insert(release.id, false);
        }
        Ok(results)
    }
}

fn event_summary(release: &UnnotifiedRelease) -> String {
    let mut summary = release.work_title.clone();
    match (release.kind.as_str(), release.number.as_deref()) {
        (kind, Some(number)) => {
            summary.push_str(&format!(" {} {}", kind, number));
        }
        (kind, None) => {
            summary.push_str(&format!(" new {}", kind));
        }
    }
    summary
}

/// Plain-text digest for one batch, used by the binary's mail sends.
pub fn render_digest(releases: &[UnnotifiedRelease]) -> (String, String) {
    let subject = match releases.len() {
        1 => "1 new release".to_string(),
        n => format!("{} new releases", n),
    };
    let mut body = String::new();
    for release in releases {
        body.push_str(&event_summary(release));
        if let Some(platform) = release.platform.as_deref() {
            body.push_str(&format!(" on {}", platform));
        }
        body.push_str(&format!(" ({})\n", release.release_date));
    }
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReleaseKind, WorkKind};
    use chrono::{NaiveDate, Utc};

    fn release(id: i64, title: &str, number: Option<&str>) -> UnnotifiedRelease {
        UnnotifiedRelease {
            id,
            work_id: 1,
            work_title: title.to_string(),
            work_kind: WorkKind::Anime,
            kind: ReleaseKind::Episode,
            number: number.map(str::to_string),
            platform: Some("crunchyroll".to_string()),
            release_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            source: "anilist".to_string(),
            source_url: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn digest_lists_each_release() {
        let (subject, body) = render_digest(&[
            release(1, "Frieren", Some("12")),
            release(2, "Dungeon Meshi", None),
        ]);
        assert_eq!(subject, "2 new releases");
        assert!(body.contains("Frieren episode 12 on crunchyroll (2024-03-15)"));
        assert!(body.contains("Dungeon Meshi new episode"));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        let err = classify_status("mail", StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(err, DependencyError::Retryable(_)));
        let err = classify_status("mail", StatusCode::BAD_GATEWAY, String::new());
        assert!(matches!(err, DependencyError::Retryable(_)));
        let err = classify_status("mail", StatusCode::UNAUTHORIZED, String::new());
        assert!(matches!(err, DependencyError::Fatal(_)));
    }
}
