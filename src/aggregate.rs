//! Metric aggregation: raw sums per group and the derived dashboard ratios.
//!
//! Every ratio floors its denominator at 1 and is reported as a percentage
//! rounded to two decimals, so empty groups produce zeros instead of NaN.

use crate::models::{MetricRow, PostRecord, Sentiment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SOV_SOURCE_WEIGHT: f64 = 0.6;
const SOV_EXPOSURE_WEIGHT: f64 = 0.4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricTotals {
    pub posts: u64,
    pub exposure: u64,
    pub engagement: u64,
    pub impressions: u64,
    pub reach: u64,
    pub clicks: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub views: u64,
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
    pub unknown: u64,
    pub source_score_sum: f64,
}

impl MetricTotals {
    pub fn add_row(&mut self, row: &MetricRow) {
        self.posts += 1;
        self.exposure = self.exposure.saturating_add(row.exposure);
        self.engagement = self.engagement.saturating_add(row.engagement);
        self.impressions = self.impressions.saturating_add(row.impressions);
        self.reach = self.reach.saturating_add(row.reach);
        self.clicks = self.clicks.saturating_add(row.clicks);
        self.likes = self.likes.saturating_add(row.likes);
        self.comments = self.comments.saturating_add(row.comments);
        self.shares = self.shares.saturating_add(row.shares);
        self.views = self.views.saturating_add(row.views);
        self.add_sentiment(row.sentiment);
        if row.source_score.is_finite() {
            self.source_score_sum += row.source_score.clamp(0.0, 1.0);
        }
    }

    pub fn add_sentiment(&mut self, sentiment: Sentiment) {
        match sentiment {
            Sentiment::Positive => self.positive += 1,
            Sentiment::Negative => self.negative += 1,
            Sentiment::Neutral => self.neutral += 1,
            Sentiment::Unknown => self.unknown += 1,
        }
    }

    pub fn merge(&mut self, other: &MetricTotals) {
        self.posts += other.posts;
        self.exposure = self.exposure.saturating_add(other.exposure);
        self.engagement = self.engagement.saturating_add(other.engagement);
        self.impressions = self.impressions.saturating_add(other.impressions);
        self.reach = self.reach.saturating_add(other.reach);
        self.clicks = self.clicks.saturating_add(other.clicks);
        self.likes = self.likes.saturating_add(other.likes);
        self.comments = self.comments.saturating_add(other.comments);
        self.shares = self.shares.saturating_add(other.shares);
        self.views = self.views.saturating_add(other.views);
        self.positive += other.positive;
        self.negative += other.negative;
        self.neutral += other.neutral;
        self.unknown += other.unknown;
        self.source_score_sum += other.source_score_sum;
    }

    /// Posts with a usable sentiment label; `unknown` is excluded.
    pub fn classified(&self) -> u64 {
        self.positive + self.negative + self.neutral
    }

    pub fn interactions(&self) -> u64 {
        self.likes.saturating_add(self.comments).saturating_add(self.shares)
    }

    /// Impressions when reported, else reach, else exposure.
    pub fn ctr_denominator(&self) -> u64 {
        if self.impressions > 0 {
            self.impressions
        } else if self.reach > 0 {
            self.reach
        } else {
            self.exposure
        }
    }

    pub fn reach_denominator(&self) -> u64 {
        if self.reach > 0 {
            self.reach
        } else {
            self.exposure
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    pub er_global: f64,
    pub ctr: f64,
    pub er_impressions: f64,
    pub er_reach: f64,
    pub view_rate: f64,
    pub likes_share: f64,
    pub comments_share: f64,
    pub shares_share: f64,
    #[serde(rename = "sentimientoNeto")]
    pub net_sentiment: f64,
    #[serde(rename = "riesgoActivo")]
    pub active_risk: f64,
    pub classified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScore {
    pub reputation: f64,
    pub reach: f64,
    pub risk_score: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiDelta {
    pub current: f64,
    pub previous: f64,
    pub delta: f64,
    pub delta_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SovEntry {
    pub key: String,
    pub contribution: f64,
    pub sov_pct: f64,
}

impl AsRef<MetricRow> for MetricRow {
    fn as_ref(&self) -> &MetricRow {
        self
    }
}

impl AsRef<MetricRow> for PostRecord {
    fn as_ref(&self) -> &MetricRow {
        &self.metrics
    }
}

/// Rounds to two decimals for display determinism. Non-finite input becomes 0.
pub fn round_metric(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let rounded = (value * 100.0).round() / 100.0;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// `numerator / max(denominator, 1) * 100`, unrounded.
pub fn ratio_pct(numerator: f64, denominator: f64) -> f64 {
    let denominator = if denominator.is_finite() { denominator.max(1.0) } else { 1.0 };
    let value = numerator / denominator * 100.0;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn pct(numerator: u64, denominator: u64) -> f64 {
    ratio_pct(numerator as f64, denominator as f64)
}

fn net_sentiment_raw(totals: &MetricTotals) -> f64 {
    ratio_pct(totals.positive as f64 - totals.negative as f64, totals.classified() as f64)
}

fn active_risk_raw(totals: &MetricTotals) -> f64 {
    pct(totals.negative, totals.classified())
}

pub fn derive_metrics(totals: &MetricTotals) -> DerivedMetrics {
    let interactions = totals.interactions();
    let ctr_denominator = totals.ctr_denominator();
    DerivedMetrics {
        er_global: round_metric(pct(totals.engagement, totals.exposure)),
        ctr: round_metric(pct(totals.clicks, ctr_denominator)),
        er_impressions: round_metric(pct(totals.engagement, ctr_denominator)),
        er_reach: round_metric(pct(totals.engagement, totals.reach_denominator())),
        view_rate: round_metric(pct(totals.views, totals.exposure)),
        likes_share: round_metric(pct(totals.likes, interactions)),
        comments_share: round_metric(pct(totals.comments, interactions)),
        shares_share: round_metric(pct(totals.shares, interactions)),
        net_sentiment: round_metric(net_sentiment_raw(totals)),
        active_risk: round_metric(active_risk_raw(totals)),
        classified: totals.classified(),
    }
}

/// Social health score: `0.5*reputation + 0.25*reach + 0.25*(100 - risk)`.
pub fn health_score(current: &MetricTotals, previous_exposure: u64) -> HealthScore {
    let reputation = (50.0 + net_sentiment_raw(current) / 2.0).clamp(0.0, 100.0);
    let reach = pct(current.exposure, previous_exposure).clamp(0.0, 100.0);
    let risk_score = 100.0 - active_risk_raw(current);
    let score = 0.5 * reputation + 0.25 * reach + 0.25 * risk_score;
    HealthScore {
        reputation: round_metric(reputation),
        reach: round_metric(reach),
        risk_score: round_metric(risk_score),
        score: round_metric(score),
    }
}

pub fn kpi_delta(current: f64, previous: f64) -> KpiDelta {
    let delta = current - previous;
    KpiDelta {
        current: round_metric(current),
        previous: round_metric(previous),
        delta: round_metric(delta),
        delta_pct: round_metric(ratio_pct(delta, previous.abs())),
    }
}

pub fn totals<T: AsRef<MetricRow>>(items: &[T]) -> MetricTotals {
    let mut totals = MetricTotals::default();
    for item in items {
        totals.add_row(item.as_ref());
    }
    totals
}

/// Sums rows into groups. `keys` may place one row in several groups (hashtags,
/// topics) or in none.
pub fn group_by<T, K, F>(items: &[T], keys: F) -> BTreeMap<K, MetricTotals>
where
    T: AsRef<MetricRow>,
    K: Ord,
    F: Fn(&T) -> Vec<K>,
{
    let mut groups: BTreeMap<K, MetricTotals> = BTreeMap::new();
    for item in items {
        for key in keys(item) {
            groups.entry(key).or_default().add_row(item.as_ref());
        }
    }
    groups
}

pub fn group_by_key<T, K, F>(items: &[T], key: F) -> BTreeMap<K, MetricTotals>
where
    T: AsRef<MetricRow>,
    K: Ord,
    F: Fn(&T) -> K,
{
    group_by(items, |item| vec![key(item)])
}

/// Per-row audience contribution used for share of voice.
pub fn sov_contribution(row: &MetricRow, max_exposure: u64) -> f64 {
    let source = if row.source_score.is_finite() {
        row.source_score.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let exposure = (row.exposure as f64 / (max_exposure.max(1)) as f64).clamp(0.0, 1.0);
    SOV_SOURCE_WEIGHT * source + SOV_EXPOSURE_WEIGHT * exposure
}

/// Share of voice per key, ordered by contribution descending then key ascending.
pub fn share_of_voice<T, F>(items: &[T], key: F) -> Vec<SovEntry>
where
    T: AsRef<MetricRow>,
    F: Fn(&T) -> String,
{
    let max_exposure = items.iter().map(|item| item.as_ref().exposure).max().unwrap_or(0);
    let mut contributions: BTreeMap<String, f64> = BTreeMap::new();
    for item in items {
        *contributions.entry(key(item)).or_insert(0.0) += sov_contribution(item.as_ref(), max_exposure);
    }
    let total: f64 = contributions.values().sum();

    // (raw contribution DESC, key ASC); rounding happens after ordering
    let mut ranked: Vec<(String, f64)> = contributions.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .map(|(key, contribution)| SovEntry {
            sov_pct: if total > 0.0 {
                round_metric(contribution / total * 100.0)
            } else {
                0.0
            },
            contribution: round_metric(contribution),
            key,
        })
        .collect()
}

/// The configured focus account, or the top contributor when none is configured.
pub fn resolve_focus_account(configured: Option<&str>, entries: &[SovEntry]) -> Option<String> {
    configured
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| entries.first().map(|entry| entry.key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;
    use chrono::{TimeZone, Utc};

    fn row(account: &str, exposure: u64, engagement: u64, sentiment: Sentiment) -> MetricRow {
        MetricRow {
            channel: Channel::Instagram,
            account_name: account.to_string(),
            exposure,
            engagement,
            impressions: 0,
            reach: 0,
            clicks: 0,
            likes: 0,
            comments: 0,
            shares: 0,
            views: 0,
            source_score: 0.5,
            sentiment,
            published_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn sentiment_scenario_matches_expected_net_and_risk() {
        let mut rows = Vec::new();
        for _ in 0..6 {
            rows.push(row("brand", 100, 10, Sentiment::Positive));
        }
        for _ in 0..2 {
            rows.push(row("brand", 100, 10, Sentiment::Negative));
        }
        for _ in 0..2 {
            rows.push(row("brand", 100, 10, Sentiment::Neutral));
        }
        rows.push(row("brand", 100, 10, Sentiment::Unknown));

        let derived = derive_metrics(&totals(&rows));
        assert_eq!(derived.classified, 10);
        assert_eq!(derived.net_sentiment, 40.0);
        assert_eq!(derived.active_risk, 20.0);
    }

    #[test]
    fn empty_totals_produce_zero_ratios() {
        let derived = derive_metrics(&MetricTotals::default());
        assert_eq!(derived, DerivedMetrics::default());
    }

    #[test]
    fn ctr_denominator_falls_back_from_impressions_to_reach_to_exposure() {
        let mut totals = MetricTotals {
            exposure: 1000,
            clicks: 50,
            engagement: 100,
            ..MetricTotals::default()
        };
        assert_eq!(derive_metrics(&totals).ctr, 5.0);

        totals.reach = 500;
        assert_eq!(derive_metrics(&totals).ctr, 10.0);
        assert_eq!(derive_metrics(&totals).er_reach, 20.0);

        totals.impressions = 250;
        assert_eq!(derive_metrics(&totals).ctr, 20.0);
        assert_eq!(derive_metrics(&totals).er_impressions, 40.0);
    }

    #[test]
    fn interaction_shares_split_likes_comments_shares() {
        let totals = MetricTotals {
            likes: 50,
            comments: 30,
            shares: 20,
            ..MetricTotals::default()
        };
        let derived = derive_metrics(&totals);
        assert_eq!(derived.likes_share, 50.0);
        assert_eq!(derived.comments_share, 30.0);
        assert_eq!(derived.shares_share, 20.0);
    }

    #[test]
    fn ratios_stay_in_range_for_mixed_inputs() {
        for positive in 0..6u64 {
            for negative in 0..6u64 {
                for neutral in 0..3u64 {
                    let totals = MetricTotals {
                        positive,
                        negative,
                        neutral,
                        exposure: positive * 10,
                        engagement: negative * 7,
                        clicks: neutral,
                        ..MetricTotals::default()
                    };
                    let derived = derive_metrics(&totals);
                    assert!((-100.0..=100.0).contains(&derived.net_sentiment));
                    assert!((0.0..=100.0).contains(&derived.active_risk));
                    assert!(derived.er_global >= 0.0);
                    assert!(derived.ctr >= 0.0);
                }
            }
        }
    }

    #[test]
    fn round_metric_keeps_two_decimals_and_stays_close() {
        let mut value = -250.0;
        while value < 250.0 {
            let rounded = round_metric(value);
            assert!((rounded - value).abs() < 0.005 + 1e-9, "{} -> {}", value, rounded);
            let scaled = rounded * 100.0;
            assert!((scaled - scaled.round()).abs() < 1e-6, "{} has more than two decimals", rounded);
            value += 0.013_7;
        }
        assert_eq!(round_metric(f64::NAN), 0.0);
        assert_eq!(round_metric(f64::INFINITY), 0.0);
    }

    #[test]
    fn health_score_blends_reputation_reach_and_risk() {
        let totals = MetricTotals {
            positive: 6,
            negative: 2,
            neutral: 2,
            exposure: 500,
            ..MetricTotals::default()
        };
        let score = health_score(&totals, 1000);
        assert_eq!(score.reputation, 70.0);
        assert_eq!(score.reach, 50.0);
        assert_eq!(score.risk_score, 80.0);
        assert_eq!(score.score, 67.5);

        let capped = health_score(&totals, 100);
        assert_eq!(capped.reach, 100.0);
    }

    #[test]
    fn share_of_voice_weights_source_and_exposure() {
        let mut a = row("alpha", 1000, 0, Sentiment::Neutral);
        a.source_score = 1.0;
        let mut b = row("beta", 0, 0, Sentiment::Neutral);
        b.source_score = 0.0;
        let rows = vec![a, b];

        let entries = share_of_voice(&rows, |row| row.account_name.clone());
        assert_eq!(entries[0].key, "alpha");
        assert_eq!(entries[0].sov_pct, 100.0);
        assert_eq!(entries[1].sov_pct, 0.0);
        assert_eq!(resolve_focus_account(None, &entries).as_deref(), Some("alpha"));
        assert_eq!(resolve_focus_account(Some("beta"), &entries).as_deref(), Some("beta"));
        assert_eq!(resolve_focus_account(Some("  "), &entries).as_deref(), Some("alpha"));
    }

    #[test]
    fn share_of_voice_orders_near_ties_by_unrounded_contribution() {
        let mut a = row("a", 0, 0, Sentiment::Neutral);
        a.source_score = 0.5;
        let mut b = row("b", 0, 0, Sentiment::Neutral);
        b.source_score = 0.504;
        let rows = vec![a, b];

        let entries = share_of_voice(&rows, |row| row.account_name.clone());
        assert_eq!(entries[0].contribution, entries[1].contribution);
        assert_eq!(entries[0].key, "b");
        assert!(entries[0].sov_pct > entries[1].sov_pct);
        assert_eq!(resolve_focus_account(None, &entries).as_deref(), Some("b"));
    }

    #[test]
    fn group_by_supports_multi_key_rows() {
        let rows = vec![row("a", 10, 1, Sentiment::Positive), row("b", 20, 2, Sentiment::Negative)];
        let groups = group_by(&rows, |row| vec![row.account_name.clone(), "all".to_string()]);
        assert_eq!(groups["all"].exposure, 30);
        assert_eq!(groups["a"].posts, 1);
        assert_eq!(groups["b"].negative, 1);
    }

    #[test]
    fn kpi_delta_floors_previous_at_one() {
        let delta = kpi_delta(5.0, 0.0);
        assert_eq!(delta.delta, 5.0);
        assert_eq!(delta.delta_pct, 500.0);
        let drop = kpi_delta(50.0, 100.0);
        assert_eq!(drop.delta_pct, -50.0);
    }
}
