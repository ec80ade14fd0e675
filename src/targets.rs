//! Yearly engagement-rate targets per channel.
//!
//! The auto target grows last year's average monthly ER by a rate derived from
//! the Q1→Q4 momentum of that year, bounded to [3%, 18%]. A manual target
//! stored for the same (year, channel) always wins.

use crate::aggregate::{ratio_pct, round_metric, MetricTotals};
use crate::models::{Channel, KpiTarget, TargetSource};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const MIN_AUTO_GROWTH: f64 = 0.03;
pub const MAX_AUTO_GROWTH: f64 = 0.18;
const MOMENTUM_WEIGHT: f64 = 0.5;
const GROWTH_FLOOR_BONUS: f64 = 0.05;
const MIN_Q1_ER: f64 = 0.01;
const MIN_TARGET_ER: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoTarget {
    pub baseline_er: f64,
    pub momentum: f64,
    pub auto_growth_pct: f64,
    pub target_er: f64,
}

pub fn auto_growth(momentum: f64) -> f64 {
    let momentum = if momentum.is_finite() { momentum } else { 0.0 };
    (MOMENTUM_WEIGHT * momentum.max(0.0) + GROWTH_FLOOR_BONUS).clamp(MIN_AUTO_GROWTH, MAX_AUTO_GROWTH)
}

fn er(totals: &MetricTotals) -> f64 {
    ratio_pct(totals.engagement as f64, totals.exposure as f64)
}

fn quarter_er(months: &BTreeMap<u32, MetricTotals>, first_month: u32) -> f64 {
    let mut quarter = MetricTotals::default();
    for month in first_month..first_month + 3 {
        if let Some(totals) = months.get(&month) {
            quarter.merge(totals);
        }
    }
    er(&quarter)
}

/// `months` holds the prior calendar year's totals keyed by month (1..=12).
pub fn compute_auto_target(months: &BTreeMap<u32, MetricTotals>) -> AutoTarget {
    let monthly: Vec<f64> = months
        .values()
        .filter(|totals| totals.exposure > 0)
        .map(er)
        .collect();
    let baseline = if monthly.is_empty() {
        0.0
    } else {
        monthly.iter().sum::<f64>() / monthly.len() as f64
    };

    let q1 = quarter_er(months, 1);
    let q4 = quarter_er(months, 10);
    let momentum = (q4 - q1) / q1.max(MIN_Q1_ER);
    let growth = auto_growth(momentum);

    AutoTarget {
        baseline_er: baseline,
        momentum,
        auto_growth_pct: growth,
        target_er: baseline * (1.0 + growth),
    }
}

/// Returns the effective target and whether it must be persisted. Manual targets
/// are returned untouched; auto targets are refreshed and written back.
pub fn resolve_target(
    year: i32,
    channel: Channel,
    stored: Option<KpiTarget>,
    auto: &AutoTarget,
    now: DateTime<Utc>,
) -> (KpiTarget, bool) {
    if let Some(stored) = stored {
        if stored.source == TargetSource::Manual {
            return (stored, false);
        }
    }
    let target = KpiTarget {
        year,
        channel,
        baseline_er: round_metric(auto.baseline_er),
        momentum: auto.momentum,
        auto_growth_pct: auto.auto_growth_pct,
        target_er: round_metric(auto.target_er),
        source: TargetSource::Auto,
        override_reason: None,
        updated_at: now,
    };
    (target, true)
}

pub fn progress_pct(current_er: f64, target_er: f64) -> f64 {
    let target = if target_er.is_finite() { target_er.max(MIN_TARGET_ER) } else { MIN_TARGET_ER };
    round_metric(current_er / target * 100.0)
}
