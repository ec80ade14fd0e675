use crate::audit::{audit_record, require_reason, validate_actor};
use crate::bucketing::local_date;
use crate::errors::{AppError, AppResult};
use crate::incidents::{apply_transition, decide_raise, validate_signal};
use crate::models::{
    Channel, ChannelCount, ClearTargetRequest, CommentOverrideRequest, CommentRecord, CoverageSummary,
    DashboardSetting, Incident, IncidentSeverity, IncidentSignal, IncidentStatus, IncidentTransitionRequest,
    KpiTarget, ManualTargetRequest, MetricFilter, MetricRow, PostRecord, PostSort, RaiseMode, RaiseOutcome,
    ReconciliationSnapshot, ReconciliationStatus, RunStatus, Sentiment, SettingsPatch, SyncRun, TargetSource,
    TriggerType, AuditRecord,
};
use crate::pagination::{clamp_i64, Cursor, KeysetRow};
use crate::settings::apply_patch;
use crate::targets::{resolve_target, AutoTarget};
use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "dashboard";
const TAG_LOOKUP_CHUNK: usize = 500;

const METRIC_COLUMNS: &str = "channel, account_name, exposure, engagement, impressions, reach, clicks, likes, \
     comments, shares, views, source_score, sentiment, published_ms";
const POST_COLUMNS: &str = "post_id, content_id, external_id, url, title, text, campaign, strategy, comment_count, \
     created_at, updated_at, channel, account_name, exposure, engagement, impressions, reach, clicks, likes, \
     comments, shares, views, source_score, sentiment, published_ms";
const POST_METRICS_OFFSET: usize = 11;
const COMMENT_COLUMNS: &str = "comment_id, post_id, channel, external_mention_id, author, text, sentiment, \
     sentiment_override, override_reason, override_by, override_at, published_ms";
const RUN_COLUMNS: &str = "id, trigger_type, status, phases_json, counters_json, error_message, created_at, \
     started_at, finished_at, updated_at";
const INCIDENT_COLUMNS: &str = "id, signal_version, severity, status, risk_score, classified_items, sla_due_at, \
     cooldown_until, payload_json, created_at, updated_at, resolved_at";
const TARGET_COLUMNS: &str =
    "year, channel, baseline_er, momentum, auto_growth_pct, target_er, source, override_reason, updated_at";
const SNAPSHOT_COLUMNS: &str = "run_id, channel, source_rows, store_rows, delta, source_min_date, source_max_date, \
     store_min_date, store_max_date, status, captured_at";

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Create the optional `post_tags` table when it is missing.
    pub tag_schema: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { tag_schema: true }
    }
}

/// Optional schema features, detected once when the store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCapabilities {
    pub tags: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostScan {
    pub posts: Vec<PostRecord>,
    /// The scan stopped at the row cap before the window was exhausted.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentQuery {
    pub post_id: Option<String>,
    pub channel: Option<Channel>,
    pub sentiment: Option<Sentiment>,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    capabilities: StoreCapabilities,
}

impl Database {
    pub fn new(path: &Path, options: StoreOptions) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let mut db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            capabilities: StoreCapabilities::default(),
        };

        db.capabilities = db.ensure_schema_extensions(options)?;
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ---- posts ----

    /// Idempotent on `(channel, external_id)`. The first stored `post_id` and
    /// `created_at` survive later upserts of the same post.
    pub fn upsert_posts(&self, posts: &[PostRecord]) -> AppResult<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        for post in posts {
            let metrics = &post.metrics;
            written += tx.execute(
                "INSERT INTO posts (
                   post_id, content_id, external_id, url, title, text, campaign, strategy, comment_count,
                   created_at, updated_at, channel, account_name, exposure, engagement, impressions, reach,
                   clicks, likes, comments, shares, views, source_score, sentiment, published_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                           ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
                 ON CONFLICT(channel, external_id) DO UPDATE SET
                   content_id = excluded.content_id,
                   url = excluded.url,
                   title = excluded.title,
                   text = excluded.text,
                   campaign = excluded.campaign,
                   strategy = excluded.strategy,
                   comment_count = excluded.comment_count,
                   updated_at = excluded.updated_at,
                   account_name = excluded.account_name,
                   exposure = excluded.exposure,
                   engagement = excluded.engagement,
                   impressions = excluded.impressions,
                   reach = excluded.reach,
                   clicks = excluded.clicks,
                   likes = excluded.likes,
                   comments = excluded.comments,
                   shares = excluded.shares,
                   views = excluded.views,
                   source_score = excluded.source_score,
                   sentiment = excluded.sentiment,
                   published_ms = excluded.published_ms",
                params![
                    post.post_id,
                    post.content_id,
                    post.external_id,
                    post.url,
                    post.title,
                    post.text,
                    post.campaign,
                    post.strategy,
                    clamp_i64(post.comment_count),
                    ts(post.created_at),
                    ts(post.updated_at),
                    metrics.channel.as_str(),
                    metrics.account_name,
                    clamp_i64(metrics.exposure),
                    clamp_i64(metrics.engagement),
                    clamp_i64(metrics.impressions),
                    clamp_i64(metrics.reach),
                    clamp_i64(metrics.clicks),
                    clamp_i64(metrics.likes),
                    clamp_i64(metrics.comments),
                    clamp_i64(metrics.shares),
                    clamp_i64(metrics.views),
                    metrics.source_score,
                    metrics.sentiment.as_str(),
                    metrics.published_at.timestamp_millis(),
                ],
            )?;

            if self.capabilities.tags {
                let post_id: String = tx.query_row(
                    "SELECT post_id FROM posts WHERE channel = ?1 AND external_id = ?2",
                    params![metrics.channel.as_str(), post.external_id],
                    |row| row.get(0),
                )?;
                tx.execute("DELETE FROM post_tags WHERE post_id = ?1", [&post_id])?;
                for (kind, values) in [("hashtag", &post.hashtags), ("topic", &post.topics)] {
                    for value in values {
                        tx.execute(
                            "INSERT OR IGNORE INTO post_tags (post_id, kind, value) VALUES (?1, ?2, ?3)",
                            params![post_id, kind, value],
                        )?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn fetch_metric_rows(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &MetricFilter,
    ) -> AppResult<Vec<MetricRow>> {
        let conn = self.connection()?;
        let mut query = format!("SELECT {} FROM posts WHERE 1 = 1", METRIC_COLUMNS);
        let mut values = Vec::new();
        push_window_filter(&mut query, &mut values, start, end, filter);
        query.push_str(" ORDER BY published_ms ASC, post_id ASC");

        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(params_from_iter(values.iter()), |row| parse_metric_row(row, 0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Posts in listing order `(sort key DESC, published_ms DESC, post_id DESC)`.
    /// A keyset cursor continues strictly after its tuple; a legacy offset cursor skips rows.
    pub fn fetch_posts_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &MetricFilter,
        sort: PostSort,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> AppResult<Vec<PostRecord>> {
        let conn = self.connection()?;
        let sort_column = sort_expr(sort);
        let mut query = format!("SELECT {} FROM posts WHERE 1 = 1", POST_COLUMNS);
        let mut values = Vec::new();
        push_window_filter(&mut query, &mut values, start, end, filter);

        let mut offset = 0i64;
        match cursor {
            Some(Cursor::Keyset(keyset)) => {
                query.push_str(&format!(" AND ({}, published_ms, post_id) < (?, ?, ?)", sort_column));
                values.push(SqlValue::Integer(keyset.primary));
                values.push(SqlValue::Integer(keyset.secondary));
                values.push(SqlValue::Text(keyset.id.clone()));
            }
            Some(Cursor::Offset { offset: skip }) => offset = clamp_i64(*skip),
            None => {}
        }

        query.push_str(&format!(
            " ORDER BY {} DESC, published_ms DESC, post_id DESC LIMIT ? OFFSET ?",
            sort_column
        ));
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        values.push(SqlValue::Integer(offset));

        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(params_from_iter(values.iter()), parse_post_row)?;
        let mut posts = Vec::new();
        for row in rows {
            posts.push(row?);
        }
        drop(statement);

        self.attach_tags(&conn, &mut posts)?;
        Ok(posts)
    }

    pub fn count_posts(&self, start: DateTime<Utc>, end: DateTime<Utc>, filter: &MetricFilter) -> AppResult<u64> {
        let conn = self.connection()?;
        let mut query = String::from("SELECT COUNT(1) FROM posts WHERE 1 = 1");
        let mut values = Vec::new();
        push_window_filter(&mut query, &mut values, start, end, filter);
        let count: i64 = conn.query_row(&query, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count_from_sql(count))
    }

    /// Walks the whole window newest first in keyset batches of `batch_size`,
    /// releasing the connection between batches. Stops at `row_cap` rows.
    pub fn scan_posts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &MetricFilter,
        batch_size: usize,
        row_cap: usize,
    ) -> AppResult<PostScan> {
        let batch_size = batch_size.max(1);
        let mut posts: Vec<PostRecord> = Vec::new();
        let mut cursor: Option<Cursor> = None;
        let mut truncated = false;

        loop {
            let remaining = row_cap.saturating_sub(posts.len());
            let batch_limit = batch_size.min(remaining);
            if batch_limit == 0 {
                break;
            }
            let mut batch = self.fetch_posts_page(start, end, filter, PostSort::PublishedAt, cursor.as_ref(), batch_limit + 1)?;
            let has_more = batch.len() > batch_limit;
            batch.truncate(batch_limit);
            cursor = batch
                .last()
                .map(|last| last.keyset_key(PostSort::PublishedAt).to_cursor(PostSort::PublishedAt));
            posts.extend(batch);

            if !has_more {
                break;
            }
            if posts.len() >= row_cap {
                truncated = true;
                tracing::warn!(row_cap, "window scan stopped at row cap");
                break;
            }
        }

        Ok(PostScan { posts, truncated })
    }

    fn attach_tags(&self, conn: &Connection, posts: &mut [PostRecord]) -> AppResult<()> {
        if !self.capabilities.tags || posts.is_empty() {
            return Ok(());
        }
        let mut tags: HashMap<String, (Vec<String>, Vec<String>)> = HashMap::new();
        let ids: Vec<String> = posts.iter().map(|post| post.post_id.clone()).collect();
        for chunk in ids.chunks(TAG_LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let query = format!(
                "SELECT post_id, kind, value FROM post_tags WHERE post_id IN ({}) ORDER BY post_id, kind, value",
                placeholders
            );
            let mut statement = conn.prepare(&query)?;
            let mut rows = statement.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let post_id: String = row.get(0)?;
                let kind: String = row.get(1)?;
                let value: String = row.get(2)?;
                let entry = tags.entry(post_id).or_default();
                match kind.as_str() {
                    "hashtag" => entry.0.push(value),
                    "topic" => entry.1.push(value),
                    other => tracing::warn!(kind = other, "ignoring unknown post tag kind"),
                }
            }
        }
        for post in posts.iter_mut() {
            if let Some((hashtags, topics)) = tags.remove(&post.post_id) {
                post.hashtags = hashtags;
                post.topics = topics;
            }
        }
        Ok(())
    }

    /// Stored rows per channel with local first/last publication dates.
    pub fn channel_counts(&self, tz: FixedOffset) -> AppResult<Vec<ChannelCount>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(
            "SELECT channel, COUNT(1), MIN(published_ms), MAX(published_ms) FROM posts GROUP BY channel",
        )?;
        let rows = statement.query_map([], |row| {
            let channel = parse_channel(0, &row.get::<_, String>(0)?)?;
            let rows: i64 = row.get(1)?;
            let min_ms: Option<i64> = row.get(2)?;
            let max_ms: Option<i64> = row.get(3)?;
            Ok(ChannelCount {
                channel,
                rows: count_from_sql(rows),
                min_date: min_ms.map(|ms| ms_to_local_date(2, ms, tz)).transpose()?,
                max_date: max_ms.map(|ms| ms_to_local_date(3, ms, tz)).transpose()?,
            })
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        counts.sort_by_key(|count| count.channel);
        Ok(counts)
    }

    pub fn coverage(&self, tz: FixedOffset) -> AppResult<CoverageSummary> {
        let channels = self.channel_counts(tz)?;
        let conn = self.connection()?;
        let (total, first_ms, last_ms): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(1), MIN(published_ms), MAX(published_ms) FROM posts",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CoverageSummary {
            total_posts: count_from_sql(total),
            first_published_at: first_ms.map(|ms| ms_to_time(1, ms)).transpose()?,
            last_published_at: last_ms.map(|ms| ms_to_time(2, ms)).transpose()?,
            channels,
        })
    }

    // ---- comments ----

    /// Idempotent on `external_mention_id`. Manual overrides survive re-ingestion.
    pub fn upsert_comments(&self, comments: &[CommentRecord]) -> AppResult<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        for comment in comments {
            written += tx.execute(
                "INSERT INTO comments (
                   comment_id, post_id, channel, external_mention_id, author, text, sentiment, published_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(external_mention_id) DO UPDATE SET
                   post_id = excluded.post_id,
                   channel = excluded.channel,
                   author = excluded.author,
                   text = excluded.text,
                   sentiment = excluded.sentiment,
                   published_ms = excluded.published_ms",
                params![
                    comment.comment_id,
                    comment.post_id,
                    comment.channel.as_str(),
                    comment.external_mention_id,
                    comment.author,
                    comment.text,
                    comment.sentiment.as_str(),
                    comment.published_at.timestamp_millis(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Comments newest first: `(published_ms DESC, comment_id DESC)`.
    pub fn list_comments(&self, query: &CommentQuery, cursor: Option<&Cursor>, limit: usize) -> AppResult<Vec<CommentRecord>> {
        let conn = self.connection()?;
        let mut sql = format!("SELECT {} FROM comments WHERE 1 = 1", COMMENT_COLUMNS);
        let mut values = Vec::new();
        push_comment_filter(&mut sql, &mut values, query);

        let mut offset = 0i64;
        match cursor {
            Some(Cursor::Keyset(keyset)) => {
                sql.push_str(" AND (published_ms, comment_id) < (?, ?)");
                values.push(SqlValue::Integer(keyset.secondary));
                values.push(SqlValue::Text(keyset.id.clone()));
            }
            Some(Cursor::Offset { offset: skip }) => offset = clamp_i64(*skip),
            None => {}
        }
        sql.push_str(" ORDER BY published_ms DESC, comment_id DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        values.push(SqlValue::Integer(offset));

        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values.iter()), parse_comment_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_comments(&self, query: &CommentQuery) -> AppResult<u64> {
        let conn = self.connection()?;
        let mut sql = String::from("SELECT COUNT(1) FROM comments WHERE 1 = 1");
        let mut values = Vec::new();
        push_comment_filter(&mut sql, &mut values, query);
        let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count_from_sql(count))
    }

    pub fn get_comment(&self, comment_id: &str) -> AppResult<Option<CommentRecord>> {
        let conn = self.connection()?;
        load_comment(&conn, comment_id)
    }

    pub fn override_comment_sentiment(&self, request: &CommentOverrideRequest, now: DateTime<Utc>) -> AppResult<CommentRecord> {
        let actor = validate_actor(&request.actor)?;
        let reason = require_reason(&request.reason)?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let before = load_comment(&tx, &request.comment_id)?
            .ok_or_else(|| AppError::NotFound(format!("Comment not found: {}", request.comment_id)))?;
        if before.sentiment_override == Some(request.sentiment) {
            return Err(AppError::Conflict(format!(
                "Comment {} is already overridden to {}",
                before.comment_id,
                request.sentiment.as_str()
            )));
        }

        let mut after = before.clone();
        after.sentiment_override = Some(request.sentiment);
        after.override_reason = Some(reason.to_string());
        after.override_by = Some(actor.to_string());
        after.override_at = Some(now);

        tx.execute(
            "UPDATE comments
             SET sentiment_override = ?1, override_reason = ?2, override_by = ?3, override_at = ?4
             WHERE comment_id = ?5",
            params![request.sentiment.as_str(), reason, actor, ts(now), after.comment_id],
        )?;
        let record = audit_record(actor, "comment.sentiment_override", "comment", &after.comment_id, &before, &after, now)?;
        append_audit(&tx, &record)?;
        tx.commit()?;
        Ok(after)
    }

    // ---- sync runs ----

    pub fn insert_sync_run(&self, run: &SyncRun) -> AppResult<()> {
        let conn = self.connection()?;
        if load_sync_run(&conn, &run.id)?.is_some() {
            return Err(AppError::Conflict(format!("Sync run already exists: {}", run.id)));
        }
        write_sync_run(&conn, run)
    }

    pub fn get_sync_run(&self, run_id: &str) -> AppResult<Option<SyncRun>> {
        let conn = self.connection()?;
        load_sync_run(&conn, run_id)
    }

    pub fn latest_sync_run(&self) -> AppResult<Option<SyncRun>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {} FROM sync_runs ORDER BY created_at DESC, id DESC LIMIT 1", RUN_COLUMNS),
            [],
            parse_sync_run_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_sync_runs(&self, status: Option<RunStatus>, offset: u64, limit: usize) -> AppResult<Vec<SyncRun>> {
        let conn = self.connection()?;
        let mut query = format!("SELECT {} FROM sync_runs WHERE 1 = 1", RUN_COLUMNS);
        let mut values = Vec::new();
        if let Some(status) = status {
            query.push_str(" AND status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        values.push(SqlValue::Integer(clamp_i64(offset)));

        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(params_from_iter(values.iter()), parse_sync_run_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_sync_runs(&self, status: Option<RunStatus>) -> AppResult<u64> {
        let conn = self.connection()?;
        let count: i64 = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(1) FROM sync_runs WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(1) FROM sync_runs", [], |row| row.get(0))?,
        };
        Ok(count_from_sql(count))
    }

    /// Loads the run, applies `mutate` and writes it back in one transaction.
    pub fn mutate_sync_run<F>(&self, run_id: &str, mutate: F) -> AppResult<SyncRun>
    where
        F: FnOnce(&mut SyncRun) -> AppResult<()>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut run = load_sync_run(&tx, run_id)?
            .ok_or_else(|| AppError::NotFound(format!("Sync run not found: {}", run_id)))?;
        mutate(&mut run)?;
        write_sync_run(&tx, &run)?;
        tx.commit()?;
        Ok(run)
    }

    // ---- settings ----

    pub fn get_settings(&self) -> AppResult<DashboardSetting> {
        let conn = self.connection()?;
        read_settings(&conn)
    }

    pub fn update_settings(&self, patch: &SettingsPatch, actor: &str, now: DateTime<Utc>) -> AppResult<DashboardSetting> {
        let actor = validate_actor(actor)?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let before = read_settings(&tx)?;
        let mut after = apply_patch(&before, patch)?;
        after.updated_at = Some(now);
        after.updated_by = Some(actor.to_string());

        tx.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SETTINGS_KEY, serde_json::to_string(&after)?, ts(now)],
        )?;
        let record = audit_record(actor, "settings.update", "dashboard_setting", SETTINGS_KEY, &before, &after, now)?;
        append_audit(&tx, &record)?;
        tx.commit()?;
        Ok(after)
    }

    // ---- ER targets ----

    pub fn get_kpi_target(&self, year: i32, channel: Channel) -> AppResult<Option<KpiTarget>> {
        let conn = self.connection()?;
        load_kpi_target(&conn, year, channel)
    }

    /// Effective target for `(year, channel)`. A stored manual target is returned
    /// as is; otherwise `auto` is written back. Read and write share one transaction.
    pub fn refresh_auto_target(
        &self,
        year: i32,
        channel: Channel,
        auto: &AutoTarget,
        now: DateTime<Utc>,
    ) -> AppResult<KpiTarget> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let stored = load_kpi_target(&tx, year, channel)?;
        let (target, persist) = resolve_target(year, channel, stored, auto, now);
        if persist {
            write_kpi_target(&tx, &target)?;
        }
        tx.commit()?;
        Ok(target)
    }

    /// Stores a manual target. Auto-derived fields of an existing row are kept for reference.
    pub fn set_manual_target(&self, request: &ManualTargetRequest, now: DateTime<Utc>) -> AppResult<KpiTarget> {
        let actor = validate_actor(&request.actor)?;
        let reason = require_reason(&request.reason)?;
        if !request.target_er.is_finite() || request.target_er < 0.0 {
            return Err(AppError::Validation(format!(
                "targetEr must be a non-negative number (got {})",
                request.target_er
            )));
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let before = load_kpi_target(&tx, request.year, request.channel)?;
        let after = KpiTarget {
            year: request.year,
            channel: request.channel,
            baseline_er: before.as_ref().map(|target| target.baseline_er).unwrap_or(0.0),
            momentum: before.as_ref().map(|target| target.momentum).unwrap_or(0.0),
            auto_growth_pct: before.as_ref().map(|target| target.auto_growth_pct).unwrap_or(0.0),
            target_er: request.target_er,
            source: TargetSource::Manual,
            override_reason: Some(reason.to_string()),
            updated_at: now,
        };
        write_kpi_target(&tx, &after)?;
        let entity_id = target_entity_id(request.year, request.channel);
        let record = audit_record(actor, "kpi_target.manual_set", "kpi_target", &entity_id, &before, &after, now)?;
        append_audit(&tx, &record)?;
        tx.commit()?;
        Ok(after)
    }

    /// Drops a manual override and stores the freshly computed auto target instead.
    pub fn clear_manual_target(&self, request: &ClearTargetRequest, auto: &AutoTarget, now: DateTime<Utc>) -> AppResult<KpiTarget> {
        let actor = validate_actor(&request.actor)?;
        let reason = require_reason(&request.reason)?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let before = load_kpi_target(&tx, request.year, request.channel)?;
        match &before {
            Some(target) if target.source == TargetSource::Manual => {}
            _ => {
                return Err(AppError::Conflict(format!(
                    "No manual target to clear for {} {}",
                    request.channel.as_str(),
                    request.year
                )))
            }
        }
        let (after, _) = resolve_target(request.year, request.channel, None, auto, now);
        write_kpi_target(&tx, &after)?;
        let entity_id = target_entity_id(request.year, request.channel);
        let record = audit_record(
            actor,
            "kpi_target.manual_clear",
            "kpi_target",
            &entity_id,
            &before,
            &serde_json::json!({ "target": after, "reason": reason }),
            now,
        )?;
        append_audit(&tx, &record)?;
        tx.commit()?;
        Ok(after)
    }

    // ---- reconciliation ----

    /// Replaces every snapshot of `run_id` with `snapshots`.
    pub fn replace_reconciliation_snapshots(&self, run_id: &str, snapshots: &[ReconciliationSnapshot]) -> AppResult<()> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM reconciliation_snapshots WHERE run_id = ?1", [run_id])?;
        for snapshot in snapshots {
            tx.execute(
                &format!(
                    "INSERT INTO reconciliation_snapshots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    SNAPSHOT_COLUMNS
                ),
                params![
                    run_id,
                    snapshot.channel.as_str(),
                    clamp_i64(snapshot.source_rows),
                    clamp_i64(snapshot.store_rows),
                    snapshot.delta,
                    snapshot.source_min_date.map(date_text),
                    snapshot.source_max_date.map(date_text),
                    snapshot.store_min_date.map(date_text),
                    snapshot.store_max_date.map(date_text),
                    snapshot.status.as_str(),
                    ts(snapshot.captured_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_reconciliation_snapshots(&self, run_id: &str) -> AppResult<Vec<ReconciliationSnapshot>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM reconciliation_snapshots WHERE run_id = ?1 ORDER BY channel",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = statement.query_map([run_id], parse_snapshot_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Most recent snapshot per channel.
    pub fn latest_reconciliation_snapshots(&self) -> AppResult<Vec<ReconciliationSnapshot>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {columns} FROM (
               SELECT {columns}, ROW_NUMBER() OVER (
                 PARTITION BY channel ORDER BY captured_at DESC, run_id DESC
               ) AS position
               FROM reconciliation_snapshots
             ) WHERE position = 1 ORDER BY channel",
            columns = SNAPSHOT_COLUMNS
        ))?;
        let rows = statement.query_map([], parse_snapshot_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ---- incidents ----

    /// Creates, refreshes or dedupes the active incident of the signal version in one transaction.
    pub fn raise_incident(&self, signal: &IncidentSignal, cooldown_minutes: u32, now: DateTime<Utc>) -> AppResult<RaiseOutcome> {
        validate_signal(signal)?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let existing = load_active_incident(&tx, &signal.signal_version)?;
        let outcome = decide_raise(existing, signal, cooldown_minutes, now);
        match outcome.mode {
            RaiseMode::Deduped => {}
            RaiseMode::Created | RaiseMode::Updated | RaiseMode::Escalated => write_incident(&tx, &outcome.incident)?,
        }
        tx.commit()?;
        Ok(outcome)
    }

    pub fn transition_incident(&self, request: &IncidentTransitionRequest, now: DateTime<Utc>) -> AppResult<Incident> {
        let actor = validate_actor(&request.actor)?;
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let before = load_incident(&tx, &request.incident_id)?
            .ok_or_else(|| AppError::NotFound(format!("Incident not found: {}", request.incident_id)))?;

        let mut after = before.clone();
        apply_transition(&mut after, request.status, now)?;
        if after.status.is_active() && !before.status.is_active() {
            if let Some(other) = load_active_incident(&tx, &after.signal_version)? {
                return Err(AppError::Conflict(format!(
                    "Incident {} is already active for signal {}",
                    other.id, after.signal_version
                )));
            }
        }

        write_incident(&tx, &after)?;
        let record = audit_record(actor, "incident.transition", "incident", &after.id, &before, &after, now)?;
        append_audit(&tx, &record)?;
        tx.commit()?;
        Ok(after)
    }

    pub fn get_incident(&self, incident_id: &str) -> AppResult<Option<Incident>> {
        let conn = self.connection()?;
        load_incident(&conn, incident_id)
    }

    /// Active incidents, most severe first, then most recently updated.
    pub fn list_active_incidents(&self) -> AppResult<Vec<Incident>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM incidents WHERE status IN (?1, ?2, ?3) ORDER BY severity ASC, updated_at DESC, id DESC",
            INCIDENT_COLUMNS
        ))?;
        let [open, acknowledged, in_progress] = IncidentStatus::ACTIVE;
        let rows = statement.query_map(
            params![open.as_str(), acknowledged.as_str(), in_progress.as_str()],
            parse_incident_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ---- audit ----

    pub fn list_audit(&self, entity: &str, entity_id: &str) -> AppResult<Vec<AuditRecord>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(
            "SELECT id, actor, action, entity, entity_id, before_json, after_json, created_at
             FROM audit_log WHERE entity = ?1 AND entity_id = ?2 ORDER BY created_at DESC, id DESC",
        )?;
        let rows = statement.query_map(params![entity, entity_id], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                entity: row.get(3)?,
                entity_id: row.get(4)?,
                before: json_column(5, &row.get::<_, String>(5)?)?,
                after: json_column(6, &row.get::<_, String>(6)?)?,
                created_at: parse_time(&row.get::<_, String>(7)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // ---- schema ----

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = ?1", [SETTINGS_KEY], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    SETTINGS_KEY,
                    serde_json::to_string(&DashboardSetting::default())?,
                    ts(Utc::now())
                ],
            )?;
        }
        Ok(())
    }

    fn ensure_schema_extensions(&self, options: StoreOptions) -> AppResult<StoreCapabilities> {
        let conn = self.connection()?;

        // Stores created before source scores were ingested lack the column.
        if !column_exists(&conn, "posts", "source_score")? {
            conn.execute("ALTER TABLE posts ADD COLUMN source_score REAL NOT NULL DEFAULT 0", [])?;
        }

        if options.tag_schema {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS post_tags (
                   post_id TEXT NOT NULL,
                   kind TEXT NOT NULL,
                   value TEXT NOT NULL,
                   PRIMARY KEY (post_id, kind, value)
                 );
                 CREATE INDEX IF NOT EXISTS idx_post_tags_kind_value ON post_tags(kind, value);",
            )?;
        }

        let capabilities = StoreCapabilities {
            tags: table_exists(&conn, "post_tags")?,
        };
        if !capabilities.tags {
            tracing::warn!(
                db_path = %self.db_path.display(),
                "post tag table missing; hashtag and topic views will be empty"
            );
        }
        Ok(capabilities)
    }
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn count_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn target_entity_id(year: i32, channel: Channel) -> String {
    format!("{}:{}", year, channel.as_str())
}

fn sort_expr(sort: PostSort) -> &'static str {
    match sort {
        PostSort::Exposure => "exposure",
        PostSort::Engagement => "engagement",
        PostSort::PublishedAt => "published_ms",
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn push_window_filter(
    query: &mut String,
    values: &mut Vec<SqlValue>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    filter: &MetricFilter,
) {
    query.push_str(" AND published_ms >= ? AND published_ms < ?");
    values.push(SqlValue::Integer(start.timestamp_millis()));
    values.push(SqlValue::Integer(end.timestamp_millis()));

    if !filter.channels.is_empty() {
        query.push_str(&format!(" AND channel IN ({})", vec!["?"; filter.channels.len()].join(", ")));
        values.extend(filter.channels.iter().map(|channel| SqlValue::Text(channel.as_str().to_string())));
    }
    if !filter.accounts.is_empty() {
        query.push_str(&format!(" AND account_name IN ({})", vec!["?"; filter.accounts.len()].join(", ")));
        values.extend(filter.accounts.iter().map(|account| SqlValue::Text(account.clone())));
    }
    if let Some(campaign) = &filter.campaign {
        query.push_str(" AND campaign = ?");
        values.push(SqlValue::Text(campaign.clone()));
    }
    if let Some(strategy) = &filter.strategy {
        query.push_str(" AND strategy = ?");
        values.push(SqlValue::Text(strategy.clone()));
    }
    if let Some(sentiment) = filter.sentiment {
        query.push_str(" AND sentiment = ?");
        values.push(SqlValue::Text(sentiment.as_str().to_string()));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|search| !search.is_empty()) {
        query.push_str(" AND (title LIKE ? ESCAPE '\\' OR text LIKE ? ESCAPE '\\' OR account_name LIKE ? ESCAPE '\\')");
        let pattern = format!("%{}%", escape_like(search));
        for _ in 0..3 {
            values.push(SqlValue::Text(pattern.clone()));
        }
    }
}

fn push_comment_filter(query: &mut String, values: &mut Vec<SqlValue>, filter: &CommentQuery) {
    if let Some(post_id) = &filter.post_id {
        query.push_str(" AND post_id = ?");
        values.push(SqlValue::Text(post_id.clone()));
    }
    if let Some(channel) = filter.channel {
        query.push_str(" AND channel = ?");
        values.push(SqlValue::Text(channel.as_str().to_string()));
    }
    if let Some(sentiment) = filter.sentiment {
        query.push_str(" AND COALESCE(sentiment_override, sentiment) = ?");
        values.push(SqlValue::Text(sentiment.as_str().to_string()));
    }
}

fn read_settings(conn: &Connection) -> AppResult<DashboardSetting> {
    let raw = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?1", [SETTINGS_KEY], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    match raw {
        Some(raw) => Ok(serde_json::from_str::<DashboardSetting>(&raw).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "stored dashboard settings are unreadable; using defaults");
            DashboardSetting::default()
        })),
        None => Ok(DashboardSetting::default()),
    }
}

fn append_audit(conn: &Connection, record: &AuditRecord) -> AppResult<()> {
    conn.execute(
        "INSERT INTO audit_log (id, actor, action, entity, entity_id, before_json, after_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.actor,
            record.action,
            record.entity,
            record.entity_id,
            serde_json::to_string(&record.before)?,
            serde_json::to_string(&record.after)?,
            ts(record.created_at),
        ],
    )?;
    Ok(())
}

fn load_comment(conn: &Connection, comment_id: &str) -> AppResult<Option<CommentRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM comments WHERE comment_id = ?1", COMMENT_COLUMNS),
        [comment_id],
        parse_comment_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn load_sync_run(conn: &Connection, run_id: &str) -> AppResult<Option<SyncRun>> {
    conn.query_row(
        &format!("SELECT {} FROM sync_runs WHERE id = ?1", RUN_COLUMNS),
        [run_id],
        parse_sync_run_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn write_sync_run(conn: &Connection, run: &SyncRun) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO sync_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               phases_json = excluded.phases_json,
               counters_json = excluded.counters_json,
               error_message = excluded.error_message,
               started_at = excluded.started_at,
               finished_at = excluded.finished_at,
               updated_at = excluded.updated_at",
            RUN_COLUMNS
        ),
        params![
            run.id,
            run.trigger.as_str(),
            run.status.as_str(),
            serde_json::to_string(&run.phases)?,
            serde_json::to_string(&run.counters)?,
            run.error_message,
            ts(run.created_at),
            run.started_at.map(ts),
            run.finished_at.map(ts),
            ts(run.updated_at),
        ],
    )?;
    Ok(())
}

fn load_kpi_target(conn: &Connection, year: i32, channel: Channel) -> AppResult<Option<KpiTarget>> {
    conn.query_row(
        &format!("SELECT {} FROM kpi_targets WHERE year = ?1 AND channel = ?2", TARGET_COLUMNS),
        params![year, channel.as_str()],
        parse_target_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn write_kpi_target(conn: &Connection, target: &KpiTarget) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO kpi_targets ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(year, channel) DO UPDATE SET
               baseline_er = excluded.baseline_er,
               momentum = excluded.momentum,
               auto_growth_pct = excluded.auto_growth_pct,
               target_er = excluded.target_er,
               source = excluded.source,
               override_reason = excluded.override_reason,
               updated_at = excluded.updated_at",
            TARGET_COLUMNS
        ),
        params![
            target.year,
            target.channel.as_str(),
            target.baseline_er,
            target.momentum,
            target.auto_growth_pct,
            target.target_er,
            target.source.as_str(),
            target.override_reason,
            ts(target.updated_at),
        ],
    )?;
    Ok(())
}

fn load_incident(conn: &Connection, incident_id: &str) -> AppResult<Option<Incident>> {
    conn.query_row(
        &format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS),
        [incident_id],
        parse_incident_row,
    )
    .optional()
    .map_err(AppError::from)
}

/// Most recently updated active incident of the signal version.
fn load_active_incident(conn: &Connection, signal_version: &str) -> AppResult<Option<Incident>> {
    let [open, acknowledged, in_progress] = IncidentStatus::ACTIVE;
    conn.query_row(
        &format!(
            "SELECT {} FROM incidents
             WHERE signal_version = ?1 AND status IN (?2, ?3, ?4)
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            INCIDENT_COLUMNS
        ),
        params![signal_version, open.as_str(), acknowledged.as_str(), in_progress.as_str()],
        parse_incident_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn write_incident(conn: &Connection, incident: &Incident) -> AppResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO incidents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
               severity = excluded.severity,
               status = excluded.status,
               risk_score = excluded.risk_score,
               classified_items = excluded.classified_items,
               sla_due_at = excluded.sla_due_at,
               cooldown_until = excluded.cooldown_until,
               payload_json = excluded.payload_json,
               updated_at = excluded.updated_at,
               resolved_at = excluded.resolved_at",
            INCIDENT_COLUMNS
        ),
        params![
            incident.id,
            incident.signal_version,
            incident.severity.as_str(),
            incident.status.as_str(),
            incident.risk_score,
            clamp_i64(incident.classified_items),
            ts(incident.sla_due_at),
            ts(incident.cooldown_until),
            serde_json::to_string(&incident.payload)?,
            ts(incident.created_at),
            ts(incident.updated_at),
            incident.resolved_at.map(ts),
        ],
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn invalid_data(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_channel(column: usize, raw: &str) -> rusqlite::Result<Channel> {
    Channel::parse(raw).map_err(|error| invalid_data(column, error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_data(0, error.to_string()))
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_time(&raw)).transpose()
}

fn parse_date(column: usize, raw: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    raw.map(|raw| {
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|error| invalid_data(column, error.to_string()))
    })
    .transpose()
}

fn ms_to_time(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| invalid_data(column, format!("published_ms out of range: {}", ms)))
}

fn ms_to_local_date(column: usize, ms: i64, tz: FixedOffset) -> rusqlite::Result<NaiveDate> {
    ms_to_time(column, ms).map(|time| local_date(time, tz))
}

fn json_column<T: DeserializeOwned>(column: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| invalid_data(column, error.to_string()))
}

fn sql_count(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<u64> {
    Ok(count_from_sql(row.get::<_, i64>(column)?))
}

fn parse_metric_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<MetricRow> {
    Ok(MetricRow {
        channel: parse_channel(offset, &row.get::<_, String>(offset)?)?,
        account_name: row.get(offset + 1)?,
        exposure: sql_count(row, offset + 2)?,
        engagement: sql_count(row, offset + 3)?,
        impressions: sql_count(row, offset + 4)?,
        reach: sql_count(row, offset + 5)?,
        clicks: sql_count(row, offset + 6)?,
        likes: sql_count(row, offset + 7)?,
        comments: sql_count(row, offset + 8)?,
        shares: sql_count(row, offset + 9)?,
        views: sql_count(row, offset + 10)?,
        source_score: row.get(offset + 11)?,
        sentiment: Sentiment::from_classifier(row.get::<_, Option<String>>(offset + 12)?.as_deref()),
        published_at: ms_to_time(offset + 13, row.get(offset + 13)?)?,
    })
}

fn parse_post_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostRecord> {
    Ok(PostRecord {
        post_id: row.get(0)?,
        content_id: row.get(1)?,
        external_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        text: row.get(5)?,
        campaign: row.get(6)?,
        strategy: row.get(7)?,
        hashtags: Vec::new(),
        topics: Vec::new(),
        comment_count: sql_count(row, 8)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
        metrics: parse_metric_row(row, POST_METRICS_OFFSET)?,
    })
}

fn parse_comment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommentRecord> {
    let override_raw: Option<String> = row.get(7)?;
    Ok(CommentRecord {
        comment_id: row.get(0)?,
        post_id: row.get(1)?,
        channel: parse_channel(2, &row.get::<_, String>(2)?)?,
        external_mention_id: row.get(3)?,
        author: row.get(4)?,
        text: row.get(5)?,
        sentiment: Sentiment::from_classifier(row.get::<_, Option<String>>(6)?.as_deref()),
        sentiment_override: override_raw
            .map(|raw| Sentiment::parse(&raw).map_err(|error| invalid_data(7, error.to_string())))
            .transpose()?,
        override_reason: row.get(8)?,
        override_by: row.get(9)?,
        override_at: parse_optional_time(row.get(10)?)?,
        published_at: ms_to_time(11, row.get(11)?)?,
    })
}

fn parse_sync_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRun> {
    Ok(SyncRun {
        id: row.get(0)?,
        trigger: TriggerType::parse(&row.get::<_, String>(1)?).map_err(|error| invalid_data(1, error.to_string()))?,
        status: RunStatus::parse(&row.get::<_, String>(2)?).map_err(|error| invalid_data(2, error.to_string()))?,
        phases: json_column(3, &row.get::<_, String>(3)?)?,
        counters: json_column(4, &row.get::<_, String>(4)?)?,
        error_message: row.get(5)?,
        created_at: parse_time(&row.get::<_, String>(6)?)?,
        started_at: parse_optional_time(row.get(7)?)?,
        finished_at: parse_optional_time(row.get(8)?)?,
        updated_at: parse_time(&row.get::<_, String>(9)?)?,
    })
}

fn parse_target_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KpiTarget> {
    Ok(KpiTarget {
        year: row.get(0)?,
        channel: parse_channel(1, &row.get::<_, String>(1)?)?,
        baseline_er: row.get(2)?,
        momentum: row.get(3)?,
        auto_growth_pct: row.get(4)?,
        target_er: row.get(5)?,
        source: TargetSource::parse(&row.get::<_, String>(6)?).map_err(|error| invalid_data(6, error.to_string()))?,
        override_reason: row.get(7)?,
        updated_at: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReconciliationSnapshot> {
    Ok(ReconciliationSnapshot {
        run_id: row.get(0)?,
        channel: parse_channel(1, &row.get::<_, String>(1)?)?,
        source_rows: sql_count(row, 2)?,
        store_rows: sql_count(row, 3)?,
        delta: row.get(4)?,
        source_min_date: parse_date(5, row.get(5)?)?,
        source_max_date: parse_date(6, row.get(6)?)?,
        store_min_date: parse_date(7, row.get(7)?)?,
        store_max_date: parse_date(8, row.get(8)?)?,
        status: ReconciliationStatus::parse(&row.get::<_, String>(9)?)
            .map_err(|error| invalid_data(9, error.to_string()))?,
        captured_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_incident_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        signal_version: row.get(1)?,
        severity: IncidentSeverity::parse(&row.get::<_, String>(2)?)
            .map_err(|error| invalid_data(2, error.to_string()))?,
        status: IncidentStatus::parse(&row.get::<_, String>(3)?).map_err(|error| invalid_data(3, error.to_string()))?,
        risk_score: row.get(4)?,
        classified_items: sql_count(row, 5)?,
        sla_due_at: parse_time(&row.get::<_, String>(6)?)?,
        cooldown_until: parse_time(&row.get::<_, String>(7)?)?,
        payload: json_column(8, &row.get::<_, String>(8)?)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
        resolved_at: parse_optional_time(row.get(11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncPhase;
    use crate::pagination::{compare_keyset_desc, KeysetRow};
    use crate::sync_run::PhaseUpdate;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("pulse.db"), StoreOptions::default()).expect("db")
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
    }

    fn post(index: u64, channel: Channel, exposure: u64) -> PostRecord {
        let published_at = base_time() - Duration::hours((index % 5) as i64);
        PostRecord {
            post_id: format!("post-{:03}", index),
            content_id: None,
            external_id: format!("ext-{}", index),
            url: Some(format!("https://social.example/p/{}", index)),
            title: Some(format!("Launch day {}", index)),
            text: None,
            campaign: Some(if index % 2 == 0 { "spring" } else { "always-on" }.to_string()),
            strategy: None,
            hashtags: vec!["#launch".to_string()],
            topics: if index % 3 == 0 { vec!["pricing".to_string()] } else { Vec::new() },
            comment_count: 0,
            metrics: MetricRow {
                channel,
                account_name: if index % 2 == 0 { "BrandCo" } else { "Rival" }.to_string(),
                exposure,
                engagement: exposure / 10,
                impressions: exposure,
                reach: exposure / 2,
                clicks: 3,
                likes: 5,
                comments: 1,
                shares: 1,
                views: 0,
                source_score: 0.5,
                sentiment: Sentiment::Positive,
                published_at,
            },
            created_at: base_time(),
            updated_at: base_time(),
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (base_time() - Duration::days(1), base_time() + Duration::days(1))
    }

    #[test]
    fn open_seeds_settings_and_detects_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        assert_eq!(db.path(), dir.path().join("pulse.db").as_path());
        assert!(db.capabilities().tags);
        assert_eq!(db.get_settings().expect("settings"), DashboardSetting::default());

        let bare = Database::new(&dir.path().join("bare.db"), StoreOptions { tag_schema: false }).expect("db");
        assert!(!bare.capabilities().tags);
    }

    #[test]
    fn post_upsert_is_idempotent_on_channel_and_external_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let original = post(1, Channel::Facebook, 100);
        db.upsert_posts(&[original.clone()]).expect("insert");

        let mut replay = original.clone();
        replay.post_id = "post-replayed".to_string();
        replay.metrics.exposure = 250;
        db.upsert_posts(&[replay]).expect("replay");

        let (start, end) = window();
        let rows = db
            .fetch_posts_page(start, end, &MetricFilter::default(), PostSort::Exposure, None, 10)
            .expect("page");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].post_id, "post-001");
        assert_eq!(rows[0].metrics.exposure, 250);
        assert_eq!(rows[0].hashtags, vec!["#launch".to_string()]);
    }

    #[test]
    fn sql_keyset_pages_follow_listing_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let posts: Vec<PostRecord> = (0..23).map(|index| post(index, Channel::Instagram, 100 * (index % 4))).collect();
        db.upsert_posts(&posts).expect("insert");

        let mut expected = posts.clone();
        expected.sort_by(|a, b| compare_keyset_desc(&a.keyset_key(PostSort::Exposure), &b.keyset_key(PostSort::Exposure)));
        let expected: Vec<String> = expected.into_iter().map(|post| post.post_id).collect();

        let (start, end) = window();
        let mut seen = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let mut page = db
                .fetch_posts_page(start, end, &MetricFilter::default(), PostSort::Exposure, cursor.as_ref(), 5)
                .expect("page");
            let more = page.len() > 4;
            page.truncate(4);
            cursor = page.last().map(|last| last.keyset_key(PostSort::Exposure).to_cursor(PostSort::Exposure));
            seen.extend(page.into_iter().map(|post| post.post_id));
            if !more {
                break;
            }
        }
        assert_eq!(seen, expected);

        let skipped = db
            .fetch_posts_page(start, end, &MetricFilter::default(), PostSort::Exposure, Some(&Cursor::Offset { offset: 20 }), 10)
            .expect("offset page");
        assert_eq!(skipped.len(), 3);
        assert_eq!(skipped[0].post_id, expected[20]);
    }

    #[test]
    fn filters_and_counts_apply_to_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let mut posts: Vec<PostRecord> = (0..6).map(|index| post(index, Channel::Facebook, 50)).collect();
        posts.push(post(6, Channel::Tiktok, 50));
        let mut stale = post(7, Channel::Tiktok, 50);
        stale.metrics.published_at = base_time() - Duration::days(40);
        posts.push(stale);
        db.upsert_posts(&posts).expect("insert");

        let (start, end) = window();
        assert_eq!(db.count_posts(start, end, &MetricFilter::default()).unwrap(), 7);
        let tiktok = MetricFilter {
            channels: vec![Channel::Tiktok],
            ..MetricFilter::default()
        };
        assert_eq!(db.fetch_metric_rows(start, end, &tiktok).unwrap().len(), 1);
        let search = MetricFilter {
            search: Some("day 3".to_string()),
            ..MetricFilter::default()
        };
        assert_eq!(db.count_posts(start, end, &search).unwrap(), 1);
        let spring = MetricFilter {
            campaign: Some("spring".to_string()),
            accounts: vec!["BrandCo".to_string()],
            ..MetricFilter::default()
        };
        assert_eq!(db.count_posts(start, end, &spring).unwrap(), 4);
    }

    #[test]
    fn scan_stops_at_row_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let posts: Vec<PostRecord> = (0..12).map(|index| post(index, Channel::Linkedin, index)).collect();
        db.upsert_posts(&posts).expect("insert");
        let (start, end) = window();

        let full = db.scan_posts(start, end, &MetricFilter::default(), 5, 100).expect("scan");
        assert_eq!(full.posts.len(), 12);
        assert!(!full.truncated);
        assert_eq!(full.posts.iter().filter(|post| !post.topics.is_empty()).count(), 4);

        let capped = db.scan_posts(start, end, &MetricFilter::default(), 5, 7).expect("scan");
        assert_eq!(capped.posts.len(), 7);
        assert!(capped.truncated);
    }

    #[test]
    fn comment_override_is_audited_and_conflicts_on_repeat() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let comment = CommentRecord {
            comment_id: "c-1".to_string(),
            post_id: "post-001".to_string(),
            channel: Channel::Facebook,
            external_mention_id: "mention-1".to_string(),
            author: Some("fan".to_string()),
            text: "not great".to_string(),
            sentiment: Sentiment::Neutral,
            sentiment_override: None,
            override_reason: None,
            override_by: None,
            override_at: None,
            published_at: base_time(),
        };
        db.upsert_comments(&[comment]).expect("insert");

        let request = CommentOverrideRequest {
            comment_id: "c-1".to_string(),
            sentiment: Sentiment::Negative,
            reason: "sarcasm".to_string(),
            actor: "analyst-7".to_string(),
        };
        let updated = db.override_comment_sentiment(&request, base_time()).expect("override");
        assert_eq!(updated.effective_sentiment(), Sentiment::Negative);
        assert_eq!(db.override_comment_sentiment(&request, base_time()).unwrap_err().kind(), "conflict");
        assert_eq!(db.get_comment("c-1").expect("get"), Some(updated.clone()));
        assert_eq!(db.get_comment("c-404").expect("get"), None);

        let negatives = CommentQuery {
            sentiment: Some(Sentiment::Negative),
            ..CommentQuery::default()
        };
        assert_eq!(db.count_comments(&negatives).unwrap(), 1);

        let audit = db.list_audit("comment", "c-1").expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, "analyst-7");
        assert_eq!(audit[0].after["sentimentOverride"], json!("negative"));

        let missing = CommentOverrideRequest {
            comment_id: "nope".to_string(),
            ..request
        };
        assert_eq!(db.override_comment_sentiment(&missing, base_time()).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn sync_runs_persist_each_transition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let run = SyncRun::new("run-1".to_string(), TriggerType::Scheduled, base_time());
        db.insert_sync_run(&run).expect("insert");
        assert_eq!(db.insert_sync_run(&run).unwrap_err().kind(), "conflict");

        db.mutate_sync_run("run-1", |run| {
            run.start(base_time())?;
            run.update_phase(
                SyncPhase::Ingest,
                PhaseUpdate {
                    state: crate::models::PhaseState::Running,
                    ..PhaseUpdate::default()
                },
                base_time(),
            );
            Ok(())
        })
        .expect("mutate");

        let stored = db.get_sync_run("run-1").expect("get").expect("exists");
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.current_phase(), Some(SyncPhase::Ingest));
        assert_eq!(db.latest_sync_run().unwrap().map(|run| run.id), Some("run-1".to_string()));
        assert_eq!(db.count_sync_runs(Some(RunStatus::Running)).unwrap(), 1);
        assert_eq!(db.list_sync_runs(Some(RunStatus::Failed), 0, 10).unwrap().len(), 0);

        let restarted = db
            .mutate_sync_run("run-1", |run| run.start(base_time() + Duration::hours(1)))
            .unwrap_err();
        assert_eq!(restarted.kind(), "conflict");
        assert_eq!(db.get_sync_run("run-1").expect("get").expect("exists"), stored);

        let missing = db.mutate_sync_run("run-404", |_| Ok(())).unwrap_err();
        assert_eq!(missing.kind(), "not_found");
    }

    #[test]
    fn incidents_dedupe_escalate_and_transition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let signal = IncidentSignal {
            signal_version: "social-risk:v1".to_string(),
            risk_score: 45.0,
            classified_items: 40,
            severity_floor: None,
            payload: json!({}),
        };
        let now = base_time();
        let created = db.raise_incident(&signal, 60, now).expect("raise");
        assert_eq!(created.mode, RaiseMode::Created);

        let deduped = db.raise_incident(&signal, 60, now + Duration::minutes(10)).expect("raise");
        assert_eq!(deduped.mode, RaiseMode::Deduped);
        assert_eq!(deduped.incident.id, created.incident.id);

        let noisier = IncidentSignal {
            risk_score: 95.0,
            classified_items: 400,
            ..signal.clone()
        };
        let repeated = db.raise_incident(&noisier, 60, now + Duration::minutes(20)).expect("raise");
        assert_eq!(repeated.mode, RaiseMode::Deduped);
        let stored = db.get_incident(&created.incident.id).expect("get").expect("exists");
        assert_eq!(stored, created.incident);
        assert_eq!(stored.updated_at, now);
        assert_eq!(stored.cooldown_until, now + Duration::minutes(60));
        assert_eq!(db.get_incident("missing").expect("get"), None);

        let hotter = IncidentSignal {
            risk_score: 90.0,
            ..signal.clone()
        };
        let escalated = db.raise_incident(&hotter, 60, now + Duration::minutes(90)).expect("raise");
        assert_eq!(escalated.mode, RaiseMode::Escalated);
        assert_eq!(escalated.incident.severity, IncidentSeverity::Sev1);
        assert_eq!(db.list_active_incidents().unwrap().len(), 1);

        let resolved = db
            .transition_incident(
                &IncidentTransitionRequest {
                    incident_id: created.incident.id.clone(),
                    status: IncidentStatus::Resolved,
                    actor: "oncall".to_string(),
                },
                now + Duration::hours(2),
            )
            .expect("resolve");
        assert!(resolved.resolved_at.is_some());
        assert!(db.list_active_incidents().unwrap().is_empty());
        assert_eq!(db.list_audit("incident", &created.incident.id).unwrap().len(), 1);

        let again = db.raise_incident(&signal, 60, now + Duration::hours(3)).expect("raise");
        assert_eq!(again.mode, RaiseMode::Created);
        assert_ne!(again.incident.id, created.incident.id);
    }

    #[test]
    fn auto_refresh_never_replaces_a_manual_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let auto = AutoTarget {
            baseline_er: 2.0,
            momentum: 0.0,
            auto_growth_pct: 0.05,
            target_er: 2.1,
        };

        let fresh = db
            .refresh_auto_target(2025, Channel::Facebook, &auto, base_time())
            .expect("refresh");
        assert_eq!(fresh.source, TargetSource::Auto);
        assert_eq!(db.get_kpi_target(2025, Channel::Facebook).unwrap(), Some(fresh));

        let manual = db
            .set_manual_target(
                &ManualTargetRequest {
                    year: 2025,
                    channel: Channel::Facebook,
                    target_er: 9.0,
                    reason: "campaign push".to_string(),
                    actor: "cmo".to_string(),
                },
                base_time(),
            )
            .expect("manual");

        let later = base_time() + Duration::hours(1);
        let refreshed = db
            .refresh_auto_target(2025, Channel::Facebook, &auto, later)
            .expect("refresh");
        assert_eq!(refreshed, manual);
        let stored = db.get_kpi_target(2025, Channel::Facebook).unwrap().expect("stored");
        assert_eq!(stored.source, TargetSource::Manual);
        assert_eq!(stored.target_er, 9.0);
        assert_eq!(stored.updated_at, base_time());
    }

    #[test]
    fn manual_targets_override_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let request = ManualTargetRequest {
            year: 2025,
            channel: Channel::Instagram,
            target_er: 4.5,
            reason: "board goal".to_string(),
            actor: "cmo".to_string(),
        };
        let manual = db.set_manual_target(&request, base_time()).expect("manual");
        assert_eq!(manual.source, TargetSource::Manual);
        assert_eq!(db.get_kpi_target(2025, Channel::Instagram).unwrap(), Some(manual));

        let auto = AutoTarget {
            baseline_er: 3.0,
            momentum: 0.2,
            auto_growth_pct: 0.15,
            target_er: 3.45,
        };
        let clear = ClearTargetRequest {
            year: 2025,
            channel: Channel::Instagram,
            reason: "reset".to_string(),
            actor: "cmo".to_string(),
        };
        let cleared = db.clear_manual_target(&clear, &auto, base_time()).expect("clear");
        assert_eq!(cleared.source, TargetSource::Auto);
        assert_eq!(cleared.target_er, 3.45);
        assert_eq!(db.clear_manual_target(&clear, &auto, base_time()).unwrap_err().kind(), "conflict");
        assert_eq!(db.list_audit("kpi_target", "2025:instagram").unwrap().len(), 2);

        let blank = ManualTargetRequest {
            reason: " ".to_string(),
            ..request
        };
        assert_eq!(db.set_manual_target(&blank, base_time()).unwrap_err().kind(), "validation");
    }

    #[test]
    fn latest_snapshots_pick_newest_run_per_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let snapshot = |run_id: &str, channel: Channel, store_rows: u64, captured_at: DateTime<Utc>| ReconciliationSnapshot {
            run_id: run_id.to_string(),
            channel,
            source_rows: 10,
            store_rows,
            delta: 10 - store_rows as i64,
            source_min_date: NaiveDate::from_ymd_opt(2025, 1, 1),
            source_max_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            store_min_date: None,
            store_max_date: None,
            status: crate::reconciliation::snapshot_status(10, store_rows),
            captured_at,
        };
        let earlier = base_time();
        let later = base_time() + Duration::hours(1);
        db.replace_reconciliation_snapshots(
            "run-a",
            &[snapshot("run-a", Channel::Facebook, 0, earlier), snapshot("run-a", Channel::Tiktok, 10, earlier)],
        )
        .expect("replace");
        db.replace_reconciliation_snapshots("run-b", &[snapshot("run-b", Channel::Facebook, 10, later)])
            .expect("replace");

        let latest = db.latest_reconciliation_snapshots().expect("latest");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].run_id, "run-b");
        assert_eq!(latest[0].status, ReconciliationStatus::Ok);
        assert_eq!(latest[1].channel, Channel::Tiktok);
        assert_eq!(latest[1].source_min_date, NaiveDate::from_ymd_opt(2025, 1, 1));

        db.replace_reconciliation_snapshots("run-a", &[]).expect("replace");
        assert!(db.list_reconciliation_snapshots("run-a").unwrap().is_empty());
    }

    #[test]
    fn settings_update_is_audited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let patch = SettingsPatch {
            risk_threshold: Some(55.0),
            ..SettingsPatch::default()
        };
        let updated = db.update_settings(&patch, "admin", base_time()).expect("update");
        assert_eq!(updated.risk_threshold, 55.0);
        assert_eq!(updated.updated_by.as_deref(), Some("admin"));
        assert_eq!(db.get_settings().unwrap(), updated);
        assert_eq!(db.update_settings(&patch, "admin", base_time()).unwrap_err().kind(), "conflict");
        assert_eq!(db.list_audit("dashboard_setting", SETTINGS_KEY).unwrap().len(), 1);
    }
}
