//! Delivery orchestrator: drives one cycle end to end — collect pending
//! releases, plan (or resume) batches, send the batches whose window is due,
//! then mark releases notified and batches sent.
//!
//! Single-process, single-writer: the caller must not start a new cycle while
//! one is in flight.

use crate::db::{self, Pool, UnnotifiedRelease};
use crate::model::CycleSummary;
use crate::notify::{render_digest, CalendarNotifier, MailNotifier};
use crate::plan_store::{PlanRecord, PlanStore};
use crate::planner::{self, PlannerConfig, WindowTime};
use crate::resilience::{retry, CircuitBreaker, RetryPolicy};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration: std::time::Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 5,
            open_duration: std::time::Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub planner: PlannerConfig,
    /// Fixed offset in which the window times are evaluated, so "morning"
    /// means the same local hour regardless of the host time zone.
    pub timezone: FixedOffset,
    pub window_tolerance: Duration,
    pub plan_max_age: Duration,
    pub retry: RetryPolicy,
    pub mail_breaker: BreakerSettings,
    pub calendar_breaker: BreakerSettings,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            planner: PlannerConfig::default(),
            timezone: FixedOffset::east_opt(0).expect("zero utc offset"),
            window_tolerance: Duration::minutes(5),
            plan_max_age: Duration::hours(24),
            retry: RetryPolicy::default(),
            mail_breaker: BreakerSettings::default(),
            calendar_breaker: BreakerSettings::default(),
        }
    }
}

pub struct DeliveryOrchestrator {
    pool: Pool,
    plan_store: PlanStore,
    mail: Arc<dyn MailNotifier>,
    calendar: Arc<dyn CalendarNotifier>,
    mail_breaker: CircuitBreaker,
    calendar_breaker: CircuitBreaker,
    config: DeliveryConfig,
    shutdown: Arc<AtomicBool>,
}

impl DeliveryOrchestrator {
    pub fn new(
        pool: Pool,
        plan_store: PlanStore,
        mail: Arc<dyn MailNotifier>,
        calendar: Arc<dyn CalendarNotifier>,
        config: DeliveryConfig,
    ) -> Self {
        let mail_breaker = CircuitBreaker::new(
            "mail",
            config.mail_breaker.failure_threshold,
            config.mail_breaker.open_duration,
        );
        let calendar_breaker = CircuitBreaker::new(
            "calendar",
            config.calendar_breaker.failure_threshold,
            config.calendar_breaker.open_duration,
        );
        DeliveryOrchestrator {
            pool,
            plan_store,
            mail,
            calendar,
            mail_breaker,
            calendar_breaker,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked at batch boundaries; setting it makes the current cycle
    /// finish its in-flight batch and exit cleanly.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn mail_breaker(&self) -> &CircuitBreaker {
        &self.mail_breaker
    }

    pub fn calendar_breaker(&self) -> &CircuitBreaker {
        &self.calendar_breaker
    }

    /// Runs one orchestration cycle. `force_send` treats every pending batch
    /// as due regardless of its window.
    #[instrument(skip_all, fields(force_send = force_send))]
    pub async fn run_cycle(&self, now: DateTime<Utc>, force_send: bool) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        self.plan_store
            .cleanup_older_than(self.config.plan_max_age)
            .await
            .context("plan staleness cleanup")?;

        // COLLECTING
        let releases = db::list_unnotified(&self.pool, None)
            .await
            .context("list unnotified releases")?;
        summary.releases_collected = releases.len();
        if releases.is_empty() {
            info!("no pending releases; cycle complete");
            return Ok(summary);
        }

        // PLANNING: resume a plan that still has unsent batches; otherwise
        // plan fresh and persist before any send attempt, so a crash here
        // leaves a resumable record rather than a lost one.
        let existing = self.plan_store.load().await;
        let plan = if existing.pending().next().is_some() {
            info!(
                batches = existing.batches.len(),
                sent = existing.sent.len(),
                "resuming persisted delivery plan"
            );
            existing
        } else {
            let plan_date = now.with_timezone(&self.config.timezone).date_naive();
            let ids: Vec<i64> = releases.iter().map(|r| r.id).collect();
            let batches = planner::plan(&self.config.planner, &ids, plan_date);
            self.plan_store
                .save(&batches, &[])
                .await
                .context("persist delivery plan")?;
            info!(batches = batches.len(), releases = ids.len(), "planned delivery batches");
            PlanRecord {
                generated_at: Some(now),
                batches,
                sent: Vec::new(),
            }
        };
        summary.batches_planned = plan.batches.len();

        let by_id: HashMap<i64, &UnnotifiedRelease> =
            releases.iter().map(|r| (r.id, r)).collect();

        // AWAITING_WINDOW / SENDING / MARKING, batch by batch in ordinal order.
        for batch in plan.batches.iter() {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested; stopping at batch boundary");
                break;
            }
            if plan.is_sent(&batch.id) {
                continue;
            }
            if !force_send && !self.window_due(batch.window, now) {
                info!(batch = %batch.id, "batch window not due; leaving pending");
                continue;
            }

            // Releases already notified (e.g. a crash after marking but
            // before recording the batch as sent) drop out of the payload.
            let payload: Vec<UnnotifiedRelease> = batch
                .release_ids
                .iter()
                .filter_map(|id| by_id.get(id).map(|r| (*r).clone()))
                .collect();
            if payload.is_empty() {
                warn!(batch = %batch.id, "batch has no pending releases; marking sent");
                self.plan_store.mark_batch_sent(&batch.id).await?;
                continue;
            }

            if !self.send_batch(&batch.id, &payload, &mut summary).await {
                continue;
            }

            // MARKING: one bad row must not abort an otherwise-good batch.
            for release in &payload {
                match db::mark_notified(&self.pool, release.id).await {
                    Ok(true) => summary.releases_notified += 1,
                    Ok(false) => {
                        warn!(release_id = release.id, "release vanished before marking")
                    }
                    Err(err) => {
                        warn!(?err, release_id = release.id, "failed to mark release notified")
                    }
                }
            }
            self.plan_store
                .mark_batch_sent(&batch.id)
                .await
                .context("record batch as sent")?;
            summary.batches_sent += 1;
            info!(batch = %batch.id, releases = payload.len(), "batch delivered");
        }

        info!(
            collected = summary.releases_collected,
            planned = summary.batches_planned,
            sent = summary.batches_sent,
            notified = summary.releases_notified,
            failures = summary.failures.len(),
            "cycle complete"
        );
        Ok(summary)
    }

    /// A batch is due when the wall clock in the configured time zone is
    /// within the tolerance of its window.
    fn window_due(&self, window: WindowTime, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.config.timezone).naive_local();
        let Some(target_time) = NaiveTime::from_hms_opt(window.hour, window.minute, 0) else {
            warn!(
                hour = window.hour,
                minute = window.minute,
                "batch has an invalid window time; leaving it pending"
            );
            return false;
        };
        let target = local.date().and_time(target_time);
        let diff = local - target;
        diff.abs() <= self.config.window_tolerance
    }

    /// Sends one due batch through the resilience wrappers. Mail gates the
    /// batch; calendar failures are recorded but never block delivery.
    /// Returns whether the batch should be marked delivered.
    async fn send_batch(
        &self,
        batch_id: &str,
        payload: &[UnnotifiedRelease],
        summary: &mut CycleSummary,
    ) -> bool {
        let (subject, body) = render_digest(payload);
        let mail_result = self
            .mail_breaker
            .call(|| {
                retry(&self.config.retry, "mail", || {
                    self.mail.send_digest(&subject, &body)
                })
            })
            .await;
        if let Err(err) = mail_result {
            warn!(batch = %batch_id, %err, "mail send failed; batch left pending");
            summary.record_failure(batch_id, "mail", err.to_string());
            return false;
        }

        let calendar_result = self
            .calendar_breaker
            .call(|| {
                retry(&self.config.retry, "calendar", || {
                    self.calendar.create_events(payload)
                })
            })
            .await;
        match calendar_result {
            Ok(results) => {
                // A release absent from the response map counts as failed.
                let failed = payload
                    .iter()
                    .filter(|r| !results.get(&r.id).copied().unwrap_or(false))
                    .count();
                if failed > 0 {
                    warn!(batch = %batch_id, failed, "some calendar events were rejected");
                    summary.calendar_events_failed += failed;
                }
            }
            Err(err) => {
                warn!(batch = %batch_id, %err, "calendar write failed; delivering anyway");
                summary.calendar_events_failed += payload.len();
                summary.record_failure(batch_id, "calendar", err.to_string());
            }
        }
        true
    }
}
