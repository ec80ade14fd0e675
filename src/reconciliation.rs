use crate::models::{Channel, ChannelCount, ReconciliationSnapshot, ReconciliationStatus};
use chrono::{DateTime, Utc};

/// Relative row-count drift tolerated as a warning instead of an error.
const WARNING_DRIFT_RATIO: f64 = 0.05;

pub fn snapshot_status(source_rows: u64, store_rows: u64) -> ReconciliationStatus {
    if source_rows == store_rows {
        return ReconciliationStatus::Ok;
    }
    if source_rows == 0 || store_rows == 0 {
        return ReconciliationStatus::Error;
    }
    let larger = source_rows.max(store_rows) as f64;
    let drift = source_rows.abs_diff(store_rows) as f64 / larger;
    if drift <= WARNING_DRIFT_RATIO {
        ReconciliationStatus::Warning
    } else {
        ReconciliationStatus::Error
    }
}

pub fn build_snapshot(
    run_id: &str,
    channel: Channel,
    source: Option<&ChannelCount>,
    store: Option<&ChannelCount>,
    now: DateTime<Utc>,
) -> ReconciliationSnapshot {
    let source_rows = source.map(|count| count.rows).unwrap_or(0);
    let store_rows = store.map(|count| count.rows).unwrap_or(0);
    ReconciliationSnapshot {
        run_id: run_id.to_string(),
        channel,
        source_rows,
        store_rows,
        delta: i64::try_from(source_rows).unwrap_or(i64::MAX) - i64::try_from(store_rows).unwrap_or(i64::MAX),
        source_min_date: source.and_then(|count| count.min_date),
        source_max_date: source.and_then(|count| count.max_date),
        store_min_date: store.and_then(|count| count.min_date),
        store_max_date: store.and_then(|count| count.max_date),
        status: snapshot_status(source_rows, store_rows),
        captured_at: now,
    }
}

/// One snapshot per channel present on either side, in channel order.
pub fn build_snapshots(
    run_id: &str,
    source: &[ChannelCount],
    store: &[ChannelCount],
    now: DateTime<Utc>,
) -> Vec<ReconciliationSnapshot> {
    Channel::ALL
        .into_iter()
        .filter_map(|channel| {
            let source_count = source.iter().find(|count| count.channel == channel);
            let store_count = store.iter().find(|count| count.channel == channel);
            if source_count.is_none() && store_count.is_none() {
                return None;
            }
            Some(build_snapshot(run_id, channel, source_count, store_count, now))
        })
        .collect()
}

/// Worst status wins: error, then warning, then ok; nothing at all is unknown.
pub fn derive_overall_status<I>(statuses: I) -> ReconciliationStatus
where
    I: IntoIterator<Item = ReconciliationStatus>,
{
    let mut any_ok = false;
    let mut any_warning = false;
    for status in statuses {
        match status {
            ReconciliationStatus::Error => return ReconciliationStatus::Error,
            ReconciliationStatus::Warning => any_warning = true,
            ReconciliationStatus::Ok => any_ok = true,
            ReconciliationStatus::Unknown => {}
        }
    }
    if any_warning {
        ReconciliationStatus::Warning
    } else if any_ok {
        ReconciliationStatus::Ok
    } else {
        ReconciliationStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn overall_status_prefers_worst() {
        use ReconciliationStatus::*;
        assert_eq!(derive_overall_status(Vec::new()), Unknown);
        assert_eq!(derive_overall_status(vec![Ok, Ok]), Ok);
        assert_eq!(derive_overall_status(vec![Ok, Warning]), Warning);
        assert_eq!(derive_overall_status(vec![Warning, Error, Ok]), Error);
        assert_eq!(derive_overall_status(vec![Unknown]), Unknown);
    }

    #[test]
    fn snapshot_status_grades_drift() {
        assert_eq!(snapshot_status(100, 100), ReconciliationStatus::Ok);
        assert_eq!(snapshot_status(100, 96), ReconciliationStatus::Warning);
        assert_eq!(snapshot_status(100, 80), ReconciliationStatus::Error);
        assert_eq!(snapshot_status(10, 0), ReconciliationStatus::Error);
    }

    #[test]
    fn snapshots_cover_channels_on_either_side() {
        let day = NaiveDate::from_ymd_opt(2025, 1, 2);
        let source = vec![ChannelCount {
            channel: Channel::Facebook,
            rows: 10,
            min_date: day,
            max_date: day,
        }];
        let store = vec![
            ChannelCount {
                channel: Channel::Facebook,
                rows: 12,
                min_date: day,
                max_date: day,
            },
            ChannelCount {
                channel: Channel::Linkedin,
                rows: 3,
                min_date: None,
                max_date: None,
            },
        ];
        let snapshots = build_snapshots("run-1", &source, &store, Utc::now());
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].channel, Channel::Facebook);
        assert_eq!(snapshots[0].delta, -2);
        assert_eq!(snapshots[1].status, ReconciliationStatus::Error);
    }
}
