use crate::aggregate::{DerivedMetrics, HealthScore, KpiDelta, MetricTotals, SovEntry};
use crate::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Facebook,
    Instagram,
    Linkedin,
    Tiktok,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Self::Facebook, Self::Instagram, Self::Linkedin, Self::Tiktok];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::Linkedin => "linkedin",
            Self::Tiktok => "tiktok",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "facebook" => Ok(Self::Facebook),
            "instagram" => Ok(Self::Instagram),
            "linkedin" => Ok(Self::Linkedin),
            "tiktok" => Ok(Self::Tiktok),
            other => Err(AppError::Validation(format!("Unknown channel '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Unknown,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            "unknown" => Ok(Self::Unknown),
            other => Err(AppError::Validation(format!("Unknown sentiment '{}'", other))),
        }
    }

    /// Classifier output that is not one of the known buckets counts as unknown.
    pub fn from_classifier(raw: Option<&str>) -> Self {
        raw.and_then(|value| Self::parse(value).ok()).unwrap_or(Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatePreset {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "y2024")]
    Y2024,
    #[serde(rename = "y2025")]
    Y2025,
    #[serde(rename = "ytd")]
    Ytd,
    #[serde(rename = "90d")]
    Last90Days,
    #[serde(rename = "30d")]
    Last30Days,
    #[serde(rename = "7d")]
    Last7Days,
    #[serde(rename = "last_quarter")]
    LastQuarter,
    #[serde(rename = "custom")]
    Custom,
}

impl DatePreset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Y2024 => "y2024",
            Self::Y2025 => "y2025",
            Self::Ytd => "ytd",
            Self::Last90Days => "90d",
            Self::Last30Days => "30d",
            Self::Last7Days => "7d",
            Self::LastQuarter => "last_quarter",
            Self::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "all" => Ok(Self::All),
            "y2024" => Ok(Self::Y2024),
            "y2025" => Ok(Self::Y2025),
            "ytd" => Ok(Self::Ytd),
            "90d" => Ok(Self::Last90Days),
            "30d" => Ok(Self::Last30Days),
            "7d" => Ok(Self::Last7Days),
            "last_quarter" => Ok(Self::LastQuarter),
            "custom" => Ok(Self::Custom),
            other => Err(AppError::Validation(format!("Unknown date preset '{}'", other))),
        }
    }

    /// Rolling presets and their length in days.
    pub fn rolling_days(self) -> Option<i64> {
        match self {
            Self::Last7Days => Some(7),
            Self::Last30Days => Some(30),
            Self::Last90Days => Some(90),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMode {
    WeekdayAlignedWeek,
    ExactDays,
    SamePeriodLastYear,
}

impl ComparisonMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WeekdayAlignedWeek => "weekday_aligned_week",
            Self::ExactDays => "exact_days",
            Self::SamePeriodLastYear => "same_period_last_year",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "weekday_aligned_week" => Ok(Self::WeekdayAlignedWeek),
            "exact_days" => Ok(Self::ExactDays),
            "same_period_last_year" => Ok(Self::SamePeriodLastYear),
            other => Err(AppError::Validation(format!("Unknown comparison mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendGranularity {
    #[default]
    Auto,
    Day,
    Week,
    Month,
}

impl TrendGranularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "auto" => Ok(Self::Auto),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(AppError::Validation(format!("Unknown trend granularity '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Ingest,
    Classify,
    Aggregate,
    Reconcile,
    Alerts,
}

impl SyncPhase {
    /// Nominal execution order.
    pub const ALL: [SyncPhase; 5] = [Self::Ingest, Self::Classify, Self::Aggregate, Self::Reconcile, Self::Alerts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Classify => "classify",
            Self::Aggregate => "aggregate",
            Self::Reconcile => "reconcile",
            Self::Alerts => "alerts",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "ingest" => Ok(Self::Ingest),
            "classify" => Ok(Self::Classify),
            "aggregate" => Ok(Self::Aggregate),
            "reconcile" => Ok(Self::Reconcile),
            "alerts" => Ok(Self::Alerts),
            other => Err(AppError::Validation(format!("Unknown sync phase '{}'", other))),
        }
    }

    pub fn ordinal(self) -> usize {
        match self {
            Self::Ingest => 0,
            Self::Classify => 1,
            Self::Aggregate => 2,
            Self::Reconcile => 3,
            Self::Alerts => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::Validation(format!("Unknown run status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(AppError::Validation(format!("Unknown trigger type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    pub state: PhaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub details: Option<serde_json::Value>,
}

/// One slot per sync phase; there is no way to address a phase outside the fixed five.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PhaseBoard {
    pub ingest: PhaseStatus,
    pub classify: PhaseStatus,
    pub aggregate: PhaseStatus,
    pub reconcile: PhaseStatus,
    pub alerts: PhaseStatus,
}

impl PhaseBoard {
    pub fn get(&self, phase: SyncPhase) -> &PhaseStatus {
        match phase {
            SyncPhase::Ingest => &self.ingest,
            SyncPhase::Classify => &self.classify,
            SyncPhase::Aggregate => &self.aggregate,
            SyncPhase::Reconcile => &self.reconcile,
            SyncPhase::Alerts => &self.alerts,
        }
    }

    pub fn get_mut(&mut self, phase: SyncPhase) -> &mut PhaseStatus {
        match phase {
            SyncPhase::Ingest => &mut self.ingest,
            SyncPhase::Classify => &mut self.classify,
            SyncPhase::Aggregate => &mut self.aggregate,
            SyncPhase::Reconcile => &mut self.reconcile,
            SyncPhase::Alerts => &mut self.alerts,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RunCounters {
    pub rows_fetched: u64,
    pub rows_upserted: u64,
    pub posts_classified: u64,
    pub comments_classified: u64,
    pub buckets_aggregated: u64,
    pub channels_reconciled: u64,
    pub incidents_raised: u64,
    pub warnings: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: String,
    pub trigger: TriggerType,
    pub status: RunStatus,
    pub phases: PhaseBoard,
    pub counters: RunCounters,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricRow {
    pub channel: Channel,
    pub account_name: String,
    pub exposure: u64,
    pub engagement: u64,
    pub impressions: u64,
    pub reach: u64,
    pub clicks: u64,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub views: u64,
    pub source_score: f64,
    pub sentiment: Sentiment,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    pub post_id: String,
    pub content_id: Option<String>,
    pub external_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub campaign: Option<String>,
    pub strategy: Option<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub comment_count: u64,
    #[serde(flatten)]
    pub metrics: MetricRow,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub comment_id: String,
    pub post_id: String,
    pub channel: Channel,
    pub external_mention_id: String,
    pub author: Option<String>,
    pub text: String,
    pub sentiment: Sentiment,
    pub sentiment_override: Option<Sentiment>,
    pub override_reason: Option<String>,
    pub override_by: Option<String>,
    pub override_at: Option<DateTime<Utc>>,
    pub published_at: DateTime<Utc>,
}

impl CommentRecord {
    pub fn effective_sentiment(&self) -> Sentiment {
        self.sentiment_override.unwrap_or(self.sentiment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentOverrideRequest {
    pub comment_id: String,
    pub sentiment: Sentiment,
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSetting {
    pub focus_account: Option<String>,
    pub sov_target_pct: f64,
    pub health_score_target: f64,
    pub risk_threshold: f64,
    pub sentiment_drop_threshold: f64,
    pub er_drop_threshold: f64,
    pub alert_cooldown_minutes: u32,
    pub metadata: serde_json::Value,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl Default for DashboardSetting {
    fn default() -> Self {
        Self {
            focus_account: None,
            sov_target_pct: 35.0,
            health_score_target: 70.0,
            risk_threshold: 40.0,
            sentiment_drop_threshold: 10.0,
            er_drop_threshold: 15.0,
            alert_cooldown_minutes: 60,
            metadata: serde_json::json!({}),
            updated_at: None,
            updated_by: None,
        }
    }
}

/// Partial settings update. An empty `focusAccount` clears the configured focus.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub focus_account: Option<String>,
    pub sov_target_pct: Option<f64>,
    pub health_score_target: Option<f64>,
    pub risk_threshold: Option<f64>,
    pub sentiment_drop_threshold: Option<f64>,
    pub er_drop_threshold: Option<f64>,
    pub alert_cooldown_minutes: Option<u32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    Auto,
    Manual,
}

impl TargetSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(AppError::Validation(format!("Unknown target source '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiTarget {
    pub year: i32,
    pub channel: Channel,
    pub baseline_er: f64,
    pub momentum: f64,
    pub auto_growth_pct: f64,
    pub target_er: f64,
    pub source: TargetSource,
    pub override_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErTargetView {
    pub year: i32,
    pub channel: Channel,
    pub current_er: f64,
    pub target_er: f64,
    pub progress_pct: f64,
    pub target: KpiTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTargetRequest {
    pub year: i32,
    pub channel: Channel,
    pub target_er: f64,
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearTargetRequest {
    pub year: i32,
    pub channel: Channel,
    pub reason: String,
    pub actor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationStatus {
    Ok,
    Warning,
    Error,
    Unknown,
}

impl ReconciliationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "ok" => Ok(Self::Ok),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            other => Err(AppError::Validation(format!("Unknown reconciliation status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCount {
    pub channel: Channel,
    pub rows: u64,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSnapshot {
    pub run_id: String,
    pub channel: Channel,
    pub source_rows: u64,
    pub store_rows: u64,
    pub delta: i64,
    pub source_min_date: Option<NaiveDate>,
    pub source_max_date: Option<NaiveDate>,
    pub store_min_date: Option<NaiveDate>,
    pub store_max_date: Option<NaiveDate>,
    pub status: ReconciliationStatus,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncidentSeverity {
    #[serde(rename = "SEV1")]
    Sev1,
    #[serde(rename = "SEV2")]
    Sev2,
    #[serde(rename = "SEV3")]
    Sev3,
    #[serde(rename = "SEV4")]
    Sev4,
}

impl IncidentSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sev1 => "SEV1",
            Self::Sev2 => "SEV2",
            Self::Sev3 => "SEV3",
            Self::Sev4 => "SEV4",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SEV1" => Ok(Self::Sev1),
            "SEV2" => Ok(Self::Sev2),
            "SEV3" => Ok(Self::Sev3),
            "SEV4" => Ok(Self::Sev4),
            other => Err(AppError::Validation(format!("Unknown incident severity '{}'", other))),
        }
    }

    /// 1 is the most severe.
    pub fn rank(self) -> u8 {
        match self {
            Self::Sev1 => 1,
            Self::Sev2 => 2,
            Self::Sev3 => 3,
            Self::Sev4 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    InProgress,
    Resolved,
    Dismissed,
}

impl IncidentStatus {
    pub const ACTIVE: [IncidentStatus; 3] = [Self::Open, Self::Acknowledged, Self::InProgress];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "open" => Ok(Self::Open),
            "acknowledged" => Ok(Self::Acknowledged),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(AppError::Validation(format!("Unknown incident status '{}'", other))),
        }
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub signal_version: String,
    pub severity: IncidentSeverity,
    pub status: IncidentStatus,
    pub risk_score: f64,
    pub classified_items: u64,
    pub sla_due_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentSignal {
    pub signal_version: String,
    pub risk_score: f64,
    pub classified_items: u64,
    pub severity_floor: Option<IncidentSeverity>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaiseMode {
    Created,
    Updated,
    Escalated,
    Deduped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaiseOutcome {
    pub mode: RaiseMode,
    pub incident: Incident,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentTransitionRequest {
    pub incident_id: String,
    pub status: IncidentStatus,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub entity: String,
    pub entity_id: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_next: bool,
    pub total_approx: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostSort {
    #[default]
    Exposure,
    Engagement,
    PublishedAt,
}

impl PostSort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exposure => "exposure",
            Self::Engagement => "engagement",
            Self::PublishedAt => "published_at",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim() {
            "exposure" => Ok(Self::Exposure),
            "engagement" => Ok(Self::Engagement),
            "published_at" => Ok(Self::PublishedAt),
            other => Err(AppError::Validation(format!("Unknown sort '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WindowRequest {
    pub preset: Option<DatePreset>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub window_days: Option<u32>,
    pub comparison: Option<ComparisonMode>,
    pub comparison_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWindow {
    pub preset: DatePreset,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub window_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonWindow {
    pub mode: Option<ComparisonMode>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WindowResolution {
    pub window: ResolvedWindow,
    pub comparison: ComparisonWindow,
}

/// Row filter shared by every window fetch. Empty lists mean "no restriction".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricFilter {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub accounts: Vec<String>,
    pub campaign: Option<String>,
    pub strategy: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DashboardQuery {
    #[serde(default)]
    pub window: WindowRequest,
    #[serde(default)]
    pub filter: MetricFilter,
    #[serde(default)]
    pub granularity: TrendGranularity,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListPostsRequest {
    #[serde(default)]
    pub window: WindowRequest,
    #[serde(default)]
    pub filter: MetricFilter,
    pub sort: Option<PostSort>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListCommentsRequest {
    pub post_id: Option<String>,
    pub channel: Option<Channel>,
    pub sentiment: Option<Sentiment>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsRequest {
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListAccountsRequest {
    #[serde(default)]
    pub query: DashboardQuery,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub bucket: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub posts: u64,
    pub totals: MetricTotals,
    pub metrics: DerivedMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiBlock {
    pub current: DerivedMetrics,
    pub previous: DerivedMetrics,
    pub current_totals: MetricTotals,
    pub previous_totals: MetricTotals,
    pub exposure: KpiDelta,
    pub engagement: KpiDelta,
    pub er_global: KpiDelta,
    pub net_sentiment: KpiDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SovSummary {
    pub focus_account: Option<String>,
    pub focus_sov_pct: f64,
    pub target_pct: f64,
    pub gap_pct: f64,
    pub accounts: Vec<SovEntry>,
    pub channels: Vec<SovEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSummary {
    pub total_posts: u64,
    pub first_published_at: Option<DateTime<Utc>>,
    pub last_published_at: Option<DateTime<Utc>>,
    pub channels: Vec<ChannelCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewResponse {
    pub resolution: WindowResolution,
    pub granularity: TrendGranularity,
    pub kpis: KpiBlock,
    pub health: HealthScore,
    pub health_target: f64,
    pub sov: SovSummary,
    pub trend: Vec<TrendPoint>,
    pub latest_run: Option<SyncRun>,
    pub coverage: CoverageSummary,
    pub reconciliation_status: ReconciliationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountRanking {
    pub rank: u64,
    pub account_name: String,
    pub channels: Vec<Channel>,
    pub totals: MetricTotals,
    pub metrics: DerivedMetrics,
    pub previous_exposure: u64,
    pub sov_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRisk {
    pub channel: Channel,
    pub classified: u64,
    pub negative: u64,
    pub active_risk: f64,
    pub severity: IncidentSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskResponse {
    pub resolution: WindowResolution,
    pub current: DerivedMetrics,
    pub previous: DerivedMetrics,
    pub net_sentiment_drop: f64,
    pub sentiment_drop_alert: bool,
    pub er_drop_pct: f64,
    pub er_drop_alert: bool,
    pub severity: IncidentSeverity,
    pub channels: Vec<ChannelRisk>,
    pub trend: Vec<TrendPoint>,
    pub active_incidents: Vec<Incident>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapCell {
    pub month: u32,
    pub weekday: u32,
    pub posts: u64,
    pub engagement: u64,
    pub exposure: u64,
    pub avg_er: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScatterPoint {
    pub post_id: String,
    pub channel: Channel,
    pub account_name: String,
    pub exposure: u64,
    pub engagement: u64,
    pub er_global: f64,
    pub sentiment: Sentiment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakdownDimension {
    Channel,
    Account,
    Campaign,
    Strategy,
    Sentiment,
    Hashtag,
    Topic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownRow {
    pub key: String,
    pub totals: MetricTotals,
    pub metrics: DerivedMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FacetValue {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FacetsResponse {
    pub channels: Vec<FacetValue>,
    pub accounts: Vec<FacetValue>,
    pub campaigns: Vec<FacetValue>,
    pub strategies: Vec<FacetValue>,
    pub sentiments: Vec<FacetValue>,
    pub hashtags: Vec<FacetValue>,
    pub topics: Vec<FacetValue>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapResponse {
    pub resolution: WindowResolution,
    pub cells: Vec<HeatmapCell>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScatterResponse {
    pub resolution: WindowResolution,
    pub points: Vec<ScatterPoint>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownRequest {
    #[serde(default)]
    pub query: DashboardQuery,
    pub dimension: BreakdownDimension,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownResponse {
    pub resolution: WindowResolution,
    pub dimension: BreakdownDimension,
    pub rows: Vec<BreakdownRow>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub run_id: String,
    pub status: ReconciliationStatus,
    pub snapshots: Vec<ReconciliationSnapshot>,
}
