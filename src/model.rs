use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkKind {
    Anime,
    Manga,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Anime => "anime",
            WorkKind::Manga => "manga",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anime" => Some(WorkKind::Anime),
            "manga" => Some(WorkKind::Manga),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReleaseKind {
    Episode,
    Volume,
}

impl ReleaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseKind::Episode => "episode",
            ReleaseKind::Volume => "volume",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episode" => Some(ReleaseKind::Episode),
            "volume" => Some(ReleaseKind::Volume),
            _ => None,
        }
    }
}

/// One failed batch/dependency pair from a delivery cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub batch_id: String,
    pub dependency: String,
    pub message: String,
}

/// Per-cycle summary returned by the orchestrator and surfaced to operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleSummary {
    pub releases_collected: usize,
    pub batches_planned: usize,
    pub batches_sent: usize,
    pub releases_notified: usize,
    pub calendar_events_failed: usize,
    pub failures: Vec<FailureRecord>,
}

impl CycleSummary {
    pub fn record_failure(&mut self, batch_id: &str, dependency: &str, message: String) {
        self.failures.push(FailureRecord {
            batch_id: batch_id.to_string(),
            dependency: dependency.to_string(),
            message,
        });
    }
}
