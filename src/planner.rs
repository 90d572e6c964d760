//! Pure batch planner: partitions the current pending releases into 1-3
//! delivery windows, sized as evenly as possible.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Wall-clock delivery slot (hour:minute) in the configured fixed time zone.
/// Deserialization rejects out-of-range values, so a hand-edited plan file
/// cannot smuggle in an invalid window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawWindowTime")]
pub struct WindowTime {
    pub hour: u32,
    pub minute: u32,
}

#[derive(Debug, Deserialize)]
struct RawWindowTime {
    hour: u32,
    minute: u32,
}

impl TryFrom<RawWindowTime> for WindowTime {
    type Error = String;

    fn try_from(raw: RawWindowTime) -> Result<Self, Self::Error> {
        if raw.hour > 23 || raw.minute > 59 {
            return Err(format!(
                "window time {:02}:{:02} out of range",
                raw.hour, raw.minute
            ));
        }
        Ok(WindowTime {
            hour: raw.hour,
            minute: raw.minute,
        })
    }
}

impl WindowTime {
    /// Parses "HH:MM".
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.split_once(':')?;
        let hour: u32 = h.parse().ok()?;
        let minute: u32 = m.parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(WindowTime { hour, minute })
    }
}

/// Thresholds and window lists. More pending items means more, evenly spread
/// windows; the boundary routes up (exactly 100 items uses two windows).
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub two_window_threshold: usize,
    pub three_window_threshold: usize,
    pub windows_single: Vec<WindowTime>,
    pub windows_double: Vec<WindowTime>,
    pub windows_triple: Vec<WindowTime>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        let parse = |times: &[&str]| {
            times
                .iter()
                .map(|t| WindowTime::parse(t).expect("valid default window"))
                .collect()
        };
        PlannerConfig {
            two_window_threshold: 100,
            three_window_threshold: 200,
            windows_single: parse(&["08:00"]),
            windows_double: parse(&["08:00", "20:00"]),
            windows_triple: parse(&["08:00", "13:00", "20:00"]),
        }
    }
}

impl PlannerConfig {
    fn windows_for(&self, count: usize) -> &[WindowTime] {
        if count >= self.three_window_threshold {
            &self.windows_triple
        } else if count >= self.two_window_threshold {
            &self.windows_double
        } else {
            &self.windows_single
        }
    }
}

/// One planned delivery batch; immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedBatch {
    pub id: String,
    pub index: usize,
    pub total: usize,
    pub window: WindowTime,
    pub release_ids: Vec<i64>,
}

/// Partitions `release_ids` (already ordered oldest-first) into batches for
/// the given planning date. Every id lands in exactly one batch; batch sizes
/// differ by at most one, with the earlier windows taking the extra items.
pub fn plan(cfg: &PlannerConfig, release_ids: &[i64], date: NaiveDate) -> Vec<PlannedBatch> {
    let count = release_ids.len();
    if count == 0 {
        return Vec::new();
    }

    let windows = cfg.windows_for(count);
    let total = windows.len();
    let base = count / total;
    let remainder = count % total;

    let mut batches = Vec::with_capacity(total);
    let mut offset = 0;
    for (i, window) in windows.iter().enumerate() {
        let size = if i < remainder { base + 1 } else { base };
        let ids = release_ids[offset..offset + size].to_vec();
        offset += size;
        batches.push(PlannedBatch {
            id: format!("{}-{}", date.format("%Y%m%d"), i + 1),
            index: i + 1,
            total,
            window: *window,
            release_ids: ids,
        });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn ids(n: usize) -> Vec<i64> {
        (1..=n as i64).collect()
    }

    fn sizes(batches: &[PlannedBatch]) -> Vec<usize> {
        batches.iter().map(|b| b.release_ids.len()).collect()
    }

    #[test]
    fn zero_releases_plans_nothing() {
        assert!(plan(&PlannerConfig::default(), &[], date()).is_empty());
    }

    #[test]
    fn window_count_thresholds_route_up_at_boundaries() {
        let cfg = PlannerConfig::default();
        assert_eq!(plan(&cfg, &ids(1), date()).len(), 1);
        assert_eq!(plan(&cfg, &ids(99), date()).len(), 1);
        assert_eq!(plan(&cfg, &ids(100), date()).len(), 2);
        assert_eq!(plan(&cfg, &ids(199), date()).len(), 2);
        assert_eq!(plan(&cfg, &ids(200), date()).len(), 3);
    }

    #[test]
    fn every_release_planned_and_sizes_differ_by_at_most_one() {
        let cfg = PlannerConfig::default();
        for count in [1usize, 2, 99, 100, 101, 199, 200, 201, 250, 1000] {
            let batches = plan(&cfg, &ids(count), date());
            let all: Vec<i64> = batches.iter().flat_map(|b| b.release_ids.clone()).collect();
            assert_eq!(all, ids(count), "count={count}");

            let sizes = sizes(&batches);
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            assert!(max - min <= 1, "count={count} sizes={sizes:?}");
        }
    }

    #[test]
    fn remainder_goes_to_earlier_windows() {
        let batches = plan(&PlannerConfig::default(), &ids(250), date());
        assert_eq!(sizes(&batches), vec![84, 83, 83]);
        assert_eq!(batches[0].window, WindowTime { hour: 8, minute: 0 });
        assert_eq!(batches[1].window, WindowTime { hour: 13, minute: 0 });
        assert_eq!(batches[2].window, WindowTime { hour: 20, minute: 0 });
    }

    #[test]
    fn batch_ids_carry_date_and_ordinal() {
        let batches = plan(&PlannerConfig::default(), &ids(150), date());
        assert_eq!(batches[0].id, "20240315-1");
        assert_eq!(batches[1].id, "20240315-2");
        assert_eq!(batches[0].index, 1);
        assert_eq!(batches[1].index, 2);
        assert_eq!(batches[0].total, 2);
    }

    #[test]
    fn window_time_parse_rejects_garbage() {
        assert_eq!(WindowTime::parse("08:30"), Some(WindowTime { hour: 8, minute: 30 }));
        assert!(WindowTime::parse("24:00").is_none());
        assert!(WindowTime::parse("8").is_none());
        assert!(WindowTime::parse("ab:cd").is_none());
    }

    #[test]
    fn window_time_deserialization_rejects_out_of_range_values() {
        let ok: WindowTime = serde_json::from_str(r#"{"hour":8,"minute":30}"#).unwrap();
        assert_eq!(ok, WindowTime { hour: 8, minute: 30 });

        assert!(serde_json::from_str::<WindowTime>(r#"{"hour":99,"minute":0}"#).is_err());
        assert!(serde_json::from_str::<WindowTime>(r#"{"hour":8,"minute":60}"#).is_err());
    }
}
