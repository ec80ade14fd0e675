//! Calendar bucketing in the business time zone.
//!
//! Timestamps are mapped to local calendar dates before they are bucketed, so a
//! post published at 02:00 UTC belongs to the previous local day when the
//! business offset is negative.

use crate::aggregate::{derive_metrics, ratio_pct, round_metric, MetricTotals};
use crate::models::{HeatmapCell, MetricRow, TrendGranularity, TrendPoint};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const DAY_GRANULARITY_MAX_DAYS: i64 = 90;
const WEEK_GRANULARITY_MAX_DAYS: i64 = 365;
pub const HEATMAP_MONTHS: u32 = 12;
pub const HEATMAP_WEEKDAYS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBucket {
    /// Local calendar date on which the period starts.
    pub key: NaiveDate,
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn local_date(ts: DateTime<Utc>, tz: FixedOffset) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// Local midnight of `date` expressed in UTC.
pub fn local_midnight(date: NaiveDate, tz: FixedOffset) -> DateTime<Utc> {
    let offset = Duration::seconds(i64::from(tz.local_minus_utc()));
    (date.and_time(NaiveTime::MIN) - offset).and_utc()
}

/// `day` up to 90 days, `week` up to a year, `month` beyond.
pub fn resolve_granularity(requested: TrendGranularity, window_days: i64) -> TrendGranularity {
    match requested {
        TrendGranularity::Auto if window_days <= DAY_GRANULARITY_MAX_DAYS => TrendGranularity::Day,
        TrendGranularity::Auto if window_days <= WEEK_GRANULARITY_MAX_DAYS => TrendGranularity::Week,
        TrendGranularity::Auto => TrendGranularity::Month,
        explicit => explicit,
    }
}

/// Start date of the period containing `date`. Weeks start on Monday.
pub fn period_start(date: NaiveDate, granularity: TrendGranularity) -> NaiveDate {
    match granularity {
        TrendGranularity::Week => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        TrendGranularity::Month => date.with_day(1).unwrap_or(date),
        TrendGranularity::Day | TrendGranularity::Auto => date,
    }
}

fn next_period(start: NaiveDate, granularity: TrendGranularity) -> NaiveDate {
    match granularity {
        TrendGranularity::Week => start + Duration::days(7),
        TrendGranularity::Month => {
            let (year, month) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(start + Duration::days(31))
        }
        TrendGranularity::Day | TrendGranularity::Auto => start + Duration::days(1),
    }
}

/// `YYYY-MM-DD`, ISO week `YYYY-Www` of the bucket's Thursday, or `YYYY-MM`.
pub fn bucket_label(start: NaiveDate, granularity: TrendGranularity) -> String {
    match granularity {
        TrendGranularity::Week => {
            let thursday = start + Duration::days(3);
            let iso = thursday.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        }
        TrendGranularity::Month => start.format("%Y-%m").to_string(),
        TrendGranularity::Day | TrendGranularity::Auto => start.format("%Y-%m-%d").to_string(),
    }
}

/// One bucket per period across `[start, end)`. The first and last buckets are
/// clipped to the window so consecutive buckets partition it exactly.
pub fn build_timeline(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: TrendGranularity,
    tz: FixedOffset,
) -> Vec<TimeBucket> {
    let mut buckets = Vec::new();
    if start >= end {
        return buckets;
    }

    let mut period = period_start(local_date(start, tz), granularity);
    loop {
        let next = next_period(period, granularity);
        let period_end = local_midnight(next, tz);
        buckets.push(TimeBucket {
            key: period,
            label: bucket_label(period, granularity),
            start: local_midnight(period, tz).max(start),
            end: period_end.min(end),
        });
        if period_end >= end {
            break;
        }
        period = next;
    }
    buckets
}

/// Merges rows into the pre-built timeline; rows outside it are ignored and
/// empty periods stay as zero points.
pub fn trend_series<T: AsRef<MetricRow>>(
    rows: &[T],
    timeline: &[TimeBucket],
    granularity: TrendGranularity,
    tz: FixedOffset,
) -> Vec<TrendPoint> {
    let index: HashMap<NaiveDate, usize> = timeline
        .iter()
        .enumerate()
        .map(|(position, bucket)| (bucket.key, position))
        .collect();
    let mut totals = vec![MetricTotals::default(); timeline.len()];

    for row in rows {
        let row = row.as_ref();
        let key = period_start(local_date(row.published_at, tz), granularity);
        if let Some(position) = index.get(&key) {
            let bucket = &timeline[*position];
            if row.published_at >= bucket.start && row.published_at < bucket.end {
                totals[*position].add_row(row);
            }
        }
    }

    timeline
        .iter()
        .zip(totals)
        .map(|(bucket, totals)| TrendPoint {
            bucket: bucket.label.clone(),
            start: bucket.start,
            end: bucket.end,
            posts: totals.posts,
            metrics: derive_metrics(&totals),
            totals,
        })
        .collect()
}

/// Month-of-year × weekday grid (12 × 7 = 84 cells), zero-filled.
pub fn heatmap<T: AsRef<MetricRow>>(rows: &[T], tz: FixedOffset) -> Vec<HeatmapCell> {
    let mut cells = Vec::with_capacity((HEATMAP_MONTHS * HEATMAP_WEEKDAYS) as usize);
    for month in 1..=HEATMAP_MONTHS {
        for weekday in 1..=HEATMAP_WEEKDAYS {
            cells.push(HeatmapCell {
                month,
                weekday,
                posts: 0,
                engagement: 0,
                exposure: 0,
                avg_er: 0.0,
            });
        }
    }

    for row in rows {
        let row = row.as_ref();
        let date = local_date(row.published_at, tz);
        let position = (date.month0() * HEATMAP_WEEKDAYS + date.weekday().num_days_from_monday()) as usize;
        let cell = &mut cells[position];
        cell.posts += 1;
        cell.engagement = cell.engagement.saturating_add(row.engagement);
        cell.exposure = cell.exposure.saturating_add(row.exposure);
    }

    for cell in &mut cells {
        cell.avg_er = round_metric(ratio_pct(cell.engagement as f64, cell.exposure as f64));
    }
    cells
}
