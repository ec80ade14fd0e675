//! Read views assembled for the dashboard, plus the risk alert evaluation,
//! yearly ER targets and per-run reconciliation.
//!
//! Independent store reads run as concurrent blocking tasks and are joined
//! before any aggregation happens. Full-window views (heatmap, scatter,
//! breakdown, facets) walk the window in bounded keyset batches instead.

use crate::aggregate::{
    derive_metrics, group_by, group_by_key, health_score, kpi_delta, ratio_pct, round_metric, share_of_voice,
    resolve_focus_account, totals, MetricTotals,
};
use crate::bucketing::{build_timeline, heatmap, local_date, resolve_granularity, trend_series};
use crate::db::{CommentQuery, Database, PostScan};
use crate::errors::{AppError, AppResult};
use crate::incidents::severity_for_score;
use crate::models::{
    AccountRanking, BreakdownDimension, BreakdownRequest, BreakdownResponse, BreakdownRow, Channel, ChannelCount,
    ChannelRisk, ClearTargetRequest, CommentRecord, DashboardQuery, ErTargetView, FacetValue, FacetsResponse,
    HeatmapResponse, IncidentSignal, KpiBlock, KpiTarget, ListAccountsRequest, ListCommentsRequest, ListPostsRequest,
    ListRunsRequest, ManualTargetRequest, MetricFilter, MetricRow, OverviewResponse, PageResponse, PostRecord,
    PostSort, RaiseOutcome, ReconciliationReport, RiskResponse, ScatterPoint, ScatterResponse, SovSummary, SyncRun,
    TrendGranularity, TrendPoint, WindowRequest, WindowResolution,
};
use crate::pagination::{
    clamp_page_size, decode_for_sort, decode_offset, finish_keyset_page, finish_offset_page, paginate_offset, Cursor,
    MAX_LISTING_PAGE_SIZE, MAX_RANKING_PAGE_SIZE,
};
use crate::reconciliation::{build_snapshots, derive_overall_status};
use crate::targets::{compute_auto_target, progress_pct, AutoTarget};
use crate::window::{resolve_window, year_start};
use crate::AnalyticsEngine;
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use std::collections::{BTreeMap, BTreeSet};

const RISK_SIGNAL_VERSION: &str = "social-risk:v1";
const UNASSIGNED: &str = "unassigned";

impl AnalyticsEngine {
    fn resolve(&self, window: &WindowRequest) -> AppResult<WindowResolution> {
        resolve_window(window, Utc::now(), self.tz)
    }

    async fn fetch_rows(&self, start: DateTime<Utc>, end: DateTime<Utc>, filter: &MetricFilter) -> AppResult<Vec<MetricRow>> {
        let filter = filter.clone();
        self.blocking(move |db| db.fetch_metric_rows(start, end, &filter)).await
    }

    async fn scan_window(&self, resolution: &WindowResolution, filter: &MetricFilter) -> AppResult<PostScan> {
        let (start, end) = (resolution.window.start, resolution.window.end);
        let filter = filter.clone();
        let (batch_size, row_cap) = (self.config.scan_batch_size, self.config.scan_row_cap);
        self.blocking(move |db| db.scan_posts(start, end, &filter, batch_size, row_cap))
            .await
    }

    pub async fn overview(&self, query: DashboardQuery) -> AppResult<OverviewResponse> {
        let resolution = self.resolve(&query.window)?;
        let settings = self.settings.current()?;
        let tz = self.tz;

        let (current_rows, previous_rows, latest_run, coverage, snapshots) = tokio::try_join!(
            self.fetch_rows(resolution.window.start, resolution.window.end, &query.filter),
            self.fetch_rows(resolution.comparison.start, resolution.comparison.end, &query.filter),
            self.blocking(|db| db.latest_sync_run()),
            self.blocking(move |db| db.coverage(tz)),
            self.blocking(|db| db.latest_reconciliation_snapshots()),
        )?;

        let current_totals = totals(&current_rows);
        let previous_totals = totals(&previous_rows);
        let health = health_score(&current_totals, previous_totals.exposure);

        let accounts = share_of_voice(&current_rows, |row: &MetricRow| row.account_name.clone());
        let channels = share_of_voice(&current_rows, |row: &MetricRow| row.channel.as_str().to_string());
        let focus_account = resolve_focus_account(settings.focus_account.as_deref(), &accounts);
        let focus_sov_pct = focus_account
            .as_deref()
            .and_then(|focus| accounts.iter().find(|entry| entry.key == focus))
            .map(|entry| entry.sov_pct)
            .unwrap_or(0.0);

        let (granularity, trend) = trend_for(&current_rows, &resolution, query.granularity, tz);

        Ok(OverviewResponse {
            granularity,
            kpis: kpi_block(&current_totals, &previous_totals),
            health,
            health_target: settings.health_score_target,
            sov: SovSummary {
                focus_account,
                focus_sov_pct,
                target_pct: settings.sov_target_pct,
                gap_pct: round_metric(focus_sov_pct - settings.sov_target_pct),
                accounts,
                channels,
            },
            trend,
            latest_run,
            coverage,
            reconciliation_status: derive_overall_status(snapshots.iter().map(|snapshot| snapshot.status)),
            resolution,
        })
    }

    /// Accounts ordered by `(exposure DESC, account name ASC)`, paged with offset cursors.
    pub async fn accounts_ranking(&self, request: ListAccountsRequest) -> AppResult<PageResponse<AccountRanking>> {
        decode_offset(request.cursor.as_deref())?;
        let query = request.query;
        let resolution = self.resolve(&query.window)?;
        let (current_rows, previous_rows) = tokio::try_join!(
            self.fetch_rows(resolution.window.start, resolution.window.end, &query.filter),
            self.fetch_rows(resolution.comparison.start, resolution.comparison.end, &query.filter),
        )?;

        let groups = group_by_key(&current_rows, |row: &MetricRow| row.account_name.clone());
        let previous = group_by_key(&previous_rows, |row: &MetricRow| row.account_name.clone());
        let sov: BTreeMap<String, f64> = share_of_voice(&current_rows, |row: &MetricRow| row.account_name.clone())
            .into_iter()
            .map(|entry| (entry.key, entry.sov_pct))
            .collect();
        let mut channels: BTreeMap<&str, BTreeSet<Channel>> = BTreeMap::new();
        for row in &current_rows {
            channels.entry(row.account_name.as_str()).or_default().insert(row.channel);
        }

        let mut rankings: Vec<AccountRanking> = groups
            .iter()
            .map(|(account, group)| AccountRanking {
                rank: 0,
                account_name: account.clone(),
                channels: channels
                    .get(account.as_str())
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default(),
                totals: *group,
                metrics: derive_metrics(group),
                previous_exposure: previous.get(account).map(|totals| totals.exposure).unwrap_or(0),
                sov_pct: sov.get(account).copied().unwrap_or(0.0),
            })
            .collect();
        rankings.sort_by(|a, b| {
            b.totals
                .exposure
                .cmp(&a.totals.exposure)
                .then_with(|| a.account_name.cmp(&b.account_name))
        });
        for (position, ranking) in rankings.iter_mut().enumerate() {
            ranking.rank = position as u64 + 1;
        }

        paginate_offset(rankings, request.limit, MAX_RANKING_PAGE_SIZE, request.cursor.as_deref())
    }

    pub async fn risk(&self, query: DashboardQuery) -> AppResult<RiskResponse> {
        let resolution = self.resolve(&query.window)?;
        let settings = self.settings.current()?;
        let (current_rows, previous_rows, active_incidents) = tokio::try_join!(
            self.fetch_rows(resolution.window.start, resolution.window.end, &query.filter),
            self.fetch_rows(resolution.comparison.start, resolution.comparison.end, &query.filter),
            self.blocking(|db| db.list_active_incidents()),
        )?;

        let current = derive_metrics(&totals(&current_rows));
        let previous = derive_metrics(&totals(&previous_rows));
        let net_sentiment_drop = round_metric(previous.net_sentiment - current.net_sentiment);
        let er_drop_pct = round_metric(ratio_pct(previous.er_global - current.er_global, previous.er_global));

        let channels = group_by_key(&current_rows, |row: &MetricRow| row.channel)
            .into_iter()
            .map(|(channel, group)| {
                let metrics = derive_metrics(&group);
                ChannelRisk {
                    channel,
                    classified: group.classified(),
                    negative: group.negative,
                    active_risk: metrics.active_risk,
                    severity: severity_for_score(metrics.active_risk),
                }
            })
            .collect();
        let (_, trend) = trend_for(&current_rows, &resolution, query.granularity, self.tz);

        Ok(RiskResponse {
            resolution,
            net_sentiment_drop,
            sentiment_drop_alert: net_sentiment_drop > 0.0 && net_sentiment_drop >= settings.sentiment_drop_threshold,
            er_drop_pct,
            er_drop_alert: er_drop_pct > 0.0 && er_drop_pct >= settings.er_drop_threshold,
            severity: severity_for_score(current.active_risk),
            current,
            previous,
            channels,
            trend,
            active_incidents,
        })
    }

    /// Raises the risk incident for the window when its active risk reaches the
    /// configured threshold. Windows without classified items never alert.
    pub async fn evaluate_risk_alert(&self, query: DashboardQuery) -> AppResult<Option<RaiseOutcome>> {
        let resolution = self.resolve(&query.window)?;
        let settings = self.settings.current()?;
        let rows = self
            .fetch_rows(resolution.window.start, resolution.window.end, &query.filter)
            .await?;
        let group = totals(&rows);
        let metrics = derive_metrics(&group);

        if group.classified() == 0 || metrics.active_risk < settings.risk_threshold {
            tracing::debug!(
                active_risk = metrics.active_risk,
                threshold = settings.risk_threshold,
                "risk below alert threshold"
            );
            return Ok(None);
        }

        let scope = if query.filter.channels.is_empty() {
            "all".to_string()
        } else {
            let channels: BTreeSet<&str> = query.filter.channels.iter().map(|channel| channel.as_str()).collect();
            channels.into_iter().collect::<Vec<_>>().join("+")
        };
        let signal = IncidentSignal {
            signal_version: format!("{}:{}", RISK_SIGNAL_VERSION, scope),
            risk_score: metrics.active_risk,
            classified_items: group.classified(),
            severity_floor: None,
            payload: serde_json::json!({
                "preset": resolution.window.preset.as_str(),
                "start": resolution.window.start,
                "end": resolution.window.end,
                "negative": group.negative,
                "classified": group.classified(),
                "threshold": settings.risk_threshold,
            }),
        };
        self.raise_incident(signal).await.map(Some)
    }

    /// Keyset listing; legacy offset cursors are still honoured and answered with offset cursors.
    pub async fn list_posts(&self, request: ListPostsRequest) -> AppResult<PageResponse<PostRecord>> {
        let sort = request.sort.unwrap_or_default();
        let limit = clamp_page_size(request.limit, MAX_LISTING_PAGE_SIZE);
        let cursor = decode_for_sort(request.cursor.as_deref(), sort)?;
        let resolution = self.resolve(&request.window)?;
        let (start, end) = (resolution.window.start, resolution.window.end);

        let page_filter = request.filter.clone();
        let count_filter = request.filter;
        let page_cursor = cursor.clone();
        let (rows, total) = tokio::try_join!(
            self.blocking(move |db| {
                db.fetch_posts_page(start, end, &page_filter, sort, page_cursor.as_ref(), limit as usize + 1)
            }),
            self.blocking(move |db| db.count_posts(start, end, &count_filter)),
        )?;

        match cursor {
            Some(Cursor::Offset { offset }) => finish_offset_page(rows, offset, limit, Some(total)),
            _ => finish_keyset_page(rows, limit, sort, Some(total)),
        }
    }

    /// Comments newest first, keyset-paged on `(published time, comment id)`.
    pub async fn list_comments(&self, request: ListCommentsRequest) -> AppResult<PageResponse<CommentRecord>> {
        let sort = PostSort::PublishedAt;
        let limit = clamp_page_size(request.limit, MAX_LISTING_PAGE_SIZE);
        let cursor = decode_for_sort(request.cursor.as_deref(), sort)?;
        let query = CommentQuery {
            post_id: request.post_id,
            channel: request.channel,
            sentiment: request.sentiment,
        };

        let count_query = query.clone();
        let page_cursor = cursor.clone();
        let (rows, total) = tokio::try_join!(
            self.blocking(move |db| db.list_comments(&query, page_cursor.as_ref(), limit as usize + 1)),
            self.blocking(move |db| db.count_comments(&count_query)),
        )?;

        match cursor {
            Some(Cursor::Offset { offset }) => finish_offset_page(rows, offset, limit, Some(total)),
            _ => finish_keyset_page(rows, limit, sort, Some(total)),
        }
    }

    /// Runs newest first with offset cursors.
    pub async fn list_runs(&self, request: ListRunsRequest) -> AppResult<PageResponse<SyncRun>> {
        let limit = clamp_page_size(request.limit, MAX_LISTING_PAGE_SIZE);
        let offset = decode_offset(request.cursor.as_deref())?;
        let status = request.status;
        let (rows, total) = tokio::try_join!(
            self.blocking(move |db| db.list_sync_runs(status, offset, limit as usize + 1)),
            self.blocking(move |db| db.count_sync_runs(status)),
        )?;
        finish_offset_page(rows, offset, limit, Some(total))
    }

    pub async fn heatmap(&self, query: DashboardQuery) -> AppResult<HeatmapResponse> {
        let resolution = self.resolve(&query.window)?;
        let scan = self.scan_window(&resolution, &query.filter).await?;
        Ok(HeatmapResponse {
            cells: heatmap(&scan.posts, self.tz),
            truncated: scan.truncated,
            resolution,
        })
    }

    pub async fn scatter(&self, query: DashboardQuery) -> AppResult<ScatterResponse> {
        let resolution = self.resolve(&query.window)?;
        let scan = self.scan_window(&resolution, &query.filter).await?;
        let points = scan
            .posts
            .iter()
            .map(|post| ScatterPoint {
                post_id: post.post_id.clone(),
                channel: post.metrics.channel,
                account_name: post.metrics.account_name.clone(),
                exposure: post.metrics.exposure,
                engagement: post.metrics.engagement,
                er_global: round_metric(ratio_pct(post.metrics.engagement as f64, post.metrics.exposure as f64)),
                sentiment: post.metrics.sentiment,
            })
            .collect();
        Ok(ScatterResponse {
            resolution,
            points,
            truncated: scan.truncated,
        })
    }

    /// Rows ordered by `(exposure DESC, key ASC)`. Tag dimensions are empty when
    /// the store has no tag table.
    pub async fn breakdown(&self, request: BreakdownRequest) -> AppResult<BreakdownResponse> {
        let dimension = request.dimension;
        let resolution = self.resolve(&request.query.window)?;
        let scan = self.scan_window(&resolution, &request.query.filter).await?;

        let mut rows: Vec<BreakdownRow> = group_by(&scan.posts, |post: &PostRecord| breakdown_keys(post, dimension))
            .into_iter()
            .map(|(key, group)| BreakdownRow {
                key,
                metrics: derive_metrics(&group),
                totals: group,
            })
            .collect();
        rows.sort_by(|a, b| b.totals.exposure.cmp(&a.totals.exposure).then_with(|| a.key.cmp(&b.key)));

        Ok(BreakdownResponse {
            resolution,
            dimension,
            rows,
            truncated: scan.truncated,
        })
    }

    pub async fn facets(&self, query: DashboardQuery) -> AppResult<FacetsResponse> {
        let resolution = self.resolve(&query.window)?;
        let scan = self.scan_window(&resolution, &query.filter).await?;
        let posts = &scan.posts;
        Ok(FacetsResponse {
            channels: facet_values(posts.iter().map(|post| post.metrics.channel.as_str().to_string())),
            accounts: facet_values(posts.iter().map(|post| post.metrics.account_name.clone())),
            campaigns: facet_values(posts.iter().filter_map(|post| post.campaign.clone())),
            strategies: facet_values(posts.iter().filter_map(|post| post.strategy.clone())),
            sentiments: facet_values(posts.iter().map(|post| post.metrics.sentiment.as_str().to_string())),
            hashtags: facet_values(posts.iter().flat_map(|post| post.hashtags.iter().cloned())),
            topics: facet_values(posts.iter().flat_map(|post| post.topics.iter().cloned())),
            truncated: scan.truncated,
        })
    }

    /// Effective ER target and progress for every channel in `year`. Auto targets
    /// are recomputed from the prior year and written back; manual ones are kept.
    pub async fn er_targets(&self, year: i32) -> AppResult<Vec<ErTargetView>> {
        let tz = self.tz;
        self.blocking(move |db| {
            let now = Utc::now();
            let mut views = Vec::with_capacity(Channel::ALL.len());
            for channel in Channel::ALL {
                let auto = auto_target_for(db, year, channel, tz)?;
                let target = db.refresh_auto_target(year, channel, &auto, now)?;
                let current_er = year_to_date_er(db, year, channel, tz, now)?;
                views.push(ErTargetView {
                    year,
                    channel,
                    current_er,
                    target_er: target.target_er,
                    progress_pct: progress_pct(current_er, target.target_er),
                    target,
                });
            }
            Ok(views)
        })
        .await
    }

    pub async fn set_manual_target(&self, request: ManualTargetRequest) -> AppResult<KpiTarget> {
        let target = self
            .blocking(move |db| db.set_manual_target(&request, Utc::now()))
            .await?;
        tracing::info!(
            year = target.year,
            channel = target.channel.as_str(),
            target_er = target.target_er,
            "manual ER target set"
        );
        Ok(target)
    }

    pub async fn clear_manual_target(&self, request: ClearTargetRequest) -> AppResult<KpiTarget> {
        let tz = self.tz;
        let target = self
            .blocking(move |db| {
                let auto = auto_target_for(db, request.year, request.channel, tz)?;
                db.clear_manual_target(&request, &auto, Utc::now())
            })
            .await?;
        tracing::info!(
            year = target.year,
            channel = target.channel.as_str(),
            target_er = target.target_er,
            "manual ER target cleared"
        );
        Ok(target)
    }

    /// Compares the source row counts reported by ingestion with the store and
    /// replaces the run's snapshots.
    pub async fn reconcile_run(&self, run_id: &str, source: Vec<ChannelCount>) -> AppResult<ReconciliationReport> {
        let tz = self.tz;
        let id = run_id.to_string();
        let snapshots = self
            .blocking(move |db| {
                if db.get_sync_run(&id)?.is_none() {
                    return Err(AppError::NotFound(format!("Sync run not found: {}", id)));
                }
                let store = db.channel_counts(tz)?;
                let snapshots = build_snapshots(&id, &source, &store, Utc::now());
                db.replace_reconciliation_snapshots(&id, &snapshots)?;
                Ok(snapshots)
            })
            .await?;

        let status = derive_overall_status(snapshots.iter().map(|snapshot| snapshot.status));
        for snapshot in snapshots.iter().filter(|snapshot| snapshot.delta != 0) {
            tracing::warn!(
                run_id,
                channel = snapshot.channel.as_str(),
                source_rows = snapshot.source_rows,
                store_rows = snapshot.store_rows,
                status = snapshot.status.as_str(),
                "reconciliation drift"
            );
        }
        Ok(ReconciliationReport {
            run_id: run_id.to_string(),
            status,
            snapshots,
        })
    }
}

fn kpi_block(current: &MetricTotals, previous: &MetricTotals) -> KpiBlock {
    let current_metrics = derive_metrics(current);
    let previous_metrics = derive_metrics(previous);
    KpiBlock {
        exposure: kpi_delta(current.exposure as f64, previous.exposure as f64),
        engagement: kpi_delta(current.engagement as f64, previous.engagement as f64),
        er_global: kpi_delta(current_metrics.er_global, previous_metrics.er_global),
        net_sentiment: kpi_delta(current_metrics.net_sentiment, previous_metrics.net_sentiment),
        current: current_metrics,
        previous: previous_metrics,
        current_totals: *current,
        previous_totals: *previous,
    }
}

fn trend_for(
    rows: &[MetricRow],
    resolution: &WindowResolution,
    requested: TrendGranularity,
    tz: FixedOffset,
) -> (TrendGranularity, Vec<TrendPoint>) {
    let granularity = resolve_granularity(requested, resolution.window.window_days);
    let timeline = build_timeline(resolution.window.start, resolution.window.end, granularity, tz);
    (granularity, trend_series(rows, &timeline, granularity, tz))
}

fn breakdown_keys(post: &PostRecord, dimension: BreakdownDimension) -> Vec<String> {
    match dimension {
        BreakdownDimension::Channel => vec![post.metrics.channel.as_str().to_string()],
        BreakdownDimension::Account => vec![post.metrics.account_name.clone()],
        BreakdownDimension::Campaign => vec![post.campaign.clone().unwrap_or_else(|| UNASSIGNED.to_string())],
        BreakdownDimension::Strategy => vec![post.strategy.clone().unwrap_or_else(|| UNASSIGNED.to_string())],
        BreakdownDimension::Sentiment => vec![post.metrics.sentiment.as_str().to_string()],
        BreakdownDimension::Hashtag => post.hashtags.clone(),
        BreakdownDimension::Topic => post.topics.clone(),
    }
}

/// Value counts ordered by `(count DESC, value ASC)`.
fn facet_values<I: IntoIterator<Item = String>>(values: I) -> Vec<FacetValue> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut facets: Vec<FacetValue> = counts.into_iter().map(|(value, count)| FacetValue { value, count }).collect();
    facets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    facets
}

fn channel_filter(channel: Channel) -> MetricFilter {
    MetricFilter {
        channels: vec![channel],
        ..MetricFilter::default()
    }
}

/// Auto target from the local-calendar monthly totals of `year - 1`.
fn auto_target_for(db: &Database, year: i32, channel: Channel, tz: FixedOffset) -> AppResult<AutoTarget> {
    let start = year_start(year - 1, tz)?;
    let end = year_start(year, tz)?;
    let rows = db.fetch_metric_rows(start, end, &channel_filter(channel))?;
    let months = group_by_key(&rows, |row: &MetricRow| local_date(row.published_at, tz).month());
    Ok(compute_auto_target(&months))
}

fn year_to_date_er(db: &Database, year: i32, channel: Channel, tz: FixedOffset, now: DateTime<Utc>) -> AppResult<f64> {
    let start = year_start(year, tz)?;
    let end = year_start(year + 1, tz)?.min(now);
    if start >= end {
        return Ok(0.0);
    }
    let rows = db.fetch_metric_rows(start, end, &channel_filter(channel))?;
    let group = totals(&rows);
    Ok(round_metric(ratio_pct(group.engagement as f64, group.exposure as f64)))
}
