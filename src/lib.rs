pub mod aggregate;
pub mod audit;
pub mod bucketing;
pub mod config;
mod dashboard;
pub mod db;
pub mod errors;
pub mod incidents;
pub mod models;
pub mod pagination;
pub mod reconciliation;
pub mod settings;
pub mod sync_run;
pub mod targets;
pub mod window;

use crate::config::EngineConfig;
use crate::db::{Database, StoreCapabilities, StoreOptions};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AuditRecord, CommentOverrideRequest, CommentRecord, DashboardSetting, Incident, IncidentSignal,
    IncidentTransitionRequest, PostRecord, RaiseMode, RaiseOutcome, RunCounters, SettingsPatch, SyncPhase, SyncRun,
    TriggerType,
};
use crate::settings::SettingsHandle;
use crate::sync_run::PhaseUpdate;
use chrono::{FixedOffset, Utc};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Entry point for the API layer. Owns the store, the engine config and the
/// cached dashboard settings.
#[derive(Debug)]
pub struct AnalyticsEngine {
    db: Arc<Database>,
    config: EngineConfig,
    tz: FixedOffset,
    settings: SettingsHandle,
}

impl AnalyticsEngine {
    pub fn new(config: EngineConfig) -> AppResult<Arc<Self>> {
        let tz = config.business_offset()?;
        let db = Arc::new(Database::new(
            &config.database_path,
            StoreOptions {
                tag_schema: config.tag_schema,
            },
        )?);
        let settings = SettingsHandle::new(db.get_settings()?);

        tracing::info!(
            db_path = %config.database_path.display(),
            utc_offset_minutes = config.utc_offset_minutes,
            tags = db.capabilities().tags,
            "analytics engine ready"
        );

        Ok(Arc::new(Self { db, config, tz, settings }))
    }

    /// Loads the YAML config, applies environment overrides and starts file logging when configured.
    pub fn bootstrap(config_path: &Path) -> AppResult<Arc<Self>> {
        let config = EngineConfig::load(config_path)?;
        if let Some(log_dir) = &config.log_dir {
            init_tracing(log_dir, &config.log_filter)?;
        }
        Self::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn business_offset(&self) -> FixedOffset {
        self.tz
    }

    pub fn capabilities(&self) -> StoreCapabilities {
        self.db.capabilities()
    }

    pub fn settings(&self) -> AppResult<DashboardSetting> {
        self.settings.current()
    }

    /// Runs a store call on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, task: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> AppResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || task(&db)).await?
    }

    pub async fn upsert_posts(&self, posts: Vec<PostRecord>) -> AppResult<usize> {
        let received = posts.len();
        let written = self.blocking(move |db| db.upsert_posts(&posts)).await?;
        tracing::info!(received, written, "posts upserted");
        Ok(written)
    }

    pub async fn upsert_comments(&self, comments: Vec<CommentRecord>) -> AppResult<usize> {
        let received = comments.len();
        let written = self.blocking(move |db| db.upsert_comments(&comments)).await?;
        tracing::info!(received, written, "comments upserted");
        Ok(written)
    }

    pub async fn create_sync_run(&self, trigger: TriggerType) -> AppResult<SyncRun> {
        let run = SyncRun::new(Uuid::new_v4().to_string(), trigger, Utc::now());
        let stored = run.clone();
        self.blocking(move |db| db.insert_sync_run(&stored)).await?;
        tracing::info!(run_id = %run.id, trigger = trigger.as_str(), "sync run queued");
        Ok(run)
    }

    pub async fn get_sync_run(&self, run_id: &str) -> AppResult<SyncRun> {
        let id = run_id.to_string();
        self.blocking(move |db| db.get_sync_run(&id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Sync run not found: {}", run_id)))
    }

    pub async fn start_sync_run(&self, run_id: &str) -> AppResult<SyncRun> {
        let run = self
            .mutate_run(run_id, |run| {
                run.start(Utc::now())
            })
            .await?;
        tracing::info!(run_id = %run.id, "sync run started");
        Ok(run)
    }

    pub async fn update_sync_phase(&self, run_id: &str, phase: SyncPhase, update: PhaseUpdate) -> AppResult<SyncRun> {
        let state = update.state;
        let run = self
            .mutate_run(run_id, move |run| {
                run.update_phase(phase, update, Utc::now());
                Ok(())
            })
            .await?;
        tracing::info!(
            run_id = %run.id,
            phase = phase.as_str(),
            state = ?state,
            rows_upserted = run.counters.rows_upserted,
            "sync phase updated"
        );
        Ok(run)
    }

    pub async fn complete_sync_run(&self, run_id: &str, counters: RunCounters) -> AppResult<SyncRun> {
        let run = self
            .mutate_run(run_id, move |run| {
                run.complete(&counters, Utc::now())
            })
            .await?;
        tracing::info!(run_id = %run.id, counters = ?run.counters, "sync run completed");
        Ok(run)
    }

    pub async fn fail_sync_run(&self, run_id: &str, phase: Option<SyncPhase>, message: &str) -> AppResult<SyncRun> {
        let message = message.to_string();
        let run = self
            .mutate_run(run_id, move |run| {
                run.fail(phase, &message, Utc::now())
            })
            .await?;
        tracing::warn!(
            run_id = %run.id,
            phase = phase.map(SyncPhase::as_str),
            error = run.error_message.as_deref().unwrap_or_default(),
            "sync run failed"
        );
        Ok(run)
    }

    async fn mutate_run<F>(&self, run_id: &str, mutate: F) -> AppResult<SyncRun>
    where
        F: FnOnce(&mut SyncRun) -> AppResult<()> + Send + 'static,
    {
        let id = run_id.to_string();
        self.blocking(move |db| db.mutate_sync_run(&id, mutate)).await
    }

    /// Applies an audited settings patch and refreshes the cached settings.
    pub async fn update_settings(&self, patch: SettingsPatch, actor: &str) -> AppResult<DashboardSetting> {
        let actor_id = actor.to_string();
        let updated = self
            .blocking(move |db| db.update_settings(&patch, &actor_id, Utc::now()))
            .await?;
        self.settings.replace(updated.clone())?;
        tracing::info!(actor = %actor, "dashboard settings updated");
        Ok(updated)
    }

    pub async fn override_comment_sentiment(&self, request: CommentOverrideRequest) -> AppResult<CommentRecord> {
        let comment = self
            .blocking(move |db| db.override_comment_sentiment(&request, Utc::now()))
            .await?;
        tracing::info!(
            comment_id = %comment.comment_id,
            sentiment = comment.effective_sentiment().as_str(),
            "comment sentiment overridden"
        );
        Ok(comment)
    }

    /// Raises a signal using the configured alert cooldown.
    pub async fn raise_incident(&self, signal: IncidentSignal) -> AppResult<RaiseOutcome> {
        let cooldown_minutes = self.settings.current()?.alert_cooldown_minutes;
        let outcome = self
            .blocking(move |db| db.raise_incident(&signal, cooldown_minutes, Utc::now()))
            .await?;
        match outcome.mode {
            RaiseMode::Deduped => tracing::debug!(
                incident_id = %outcome.incident.id,
                signal_version = %outcome.incident.signal_version,
                "incident raise deduped during cooldown"
            ),
            mode => tracing::info!(
                incident_id = %outcome.incident.id,
                signal_version = %outcome.incident.signal_version,
                mode = ?mode,
                severity = outcome.incident.severity.as_str(),
                "incident raised"
            ),
        }
        Ok(outcome)
    }

    pub async fn transition_incident(&self, request: IncidentTransitionRequest) -> AppResult<Incident> {
        let incident = self
            .blocking(move |db| db.transition_incident(&request, Utc::now()))
            .await?;
        tracing::info!(
            incident_id = %incident.id,
            status = incident.status.as_str(),
            "incident status changed"
        );
        Ok(incident)
    }

    pub async fn list_active_incidents(&self) -> AppResult<Vec<Incident>> {
        self.blocking(|db| db.list_active_incidents()).await
    }

    pub async fn list_audit(&self, entity: &str, entity_id: &str) -> AppResult<Vec<AuditRecord>> {
        let entity = entity.to_string();
        let entity_id = entity_id.to_string();
        self.blocking(move |db| db.list_audit(&entity, &entity_id)).await
    }
}

/// JSON logs to a daily rolling file. `RUST_LOG` wins over `filter` when set.
pub fn init_tracing(log_dir: &Path, filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "brand-pulse.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IncidentStatus, PhaseState, RunStatus};
    use serde_json::json;

    fn engine(dir: &tempfile::TempDir) -> Arc<AnalyticsEngine> {
        AnalyticsEngine::new(EngineConfig {
            database_path: dir.path().join("engine.db"),
            ..EngineConfig::default()
        })
        .expect("engine")
    }

    #[tokio::test]
    async fn sync_run_lifecycle_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);

        let run = engine.create_sync_run(TriggerType::Manual).await.expect("create");
        assert_eq!(run.status, RunStatus::Queued);
        engine.start_sync_run(&run.id).await.expect("start");
        engine
            .update_sync_phase(
                &run.id,
                SyncPhase::Ingest,
                PhaseUpdate {
                    state: PhaseState::Completed,
                    details: Some(json!({"files": 3})),
                    counters: RunCounters {
                        rows_fetched: 120,
                        rows_upserted: 118,
                        ..RunCounters::default()
                    },
                },
            )
            .await
            .expect("phase");
        let failed = engine
            .fail_sync_run(&run.id, None, &"x".repeat(1500))
            .await
            .expect("fail");

        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.phases.classify.state, PhaseState::Failed);
        assert_eq!(failed.counters.rows_upserted, 118);
        assert_eq!(failed.error_message.as_ref().map(|message| message.chars().count()), Some(1000));

        let stored = engine.get_sync_run(&run.id).await.expect("get");
        assert_eq!(stored, failed);
        assert_eq!(engine.get_sync_run("missing").await.unwrap_err().kind(), "not_found");

        let late = engine
            .complete_sync_run(&run.id, RunCounters::default())
            .await
            .unwrap_err();
        assert_eq!(late.kind(), "conflict");
        assert_eq!(engine.start_sync_run(&run.id).await.unwrap_err().kind(), "conflict");
        assert_eq!(engine.get_sync_run(&run.id).await.expect("get"), failed);

        let queued = engine.create_sync_run(TriggerType::Manual).await.expect("create");
        let early = engine.fail_sync_run(&queued.id, None, "boom").await.unwrap_err();
        assert_eq!(early.kind(), "conflict");
        assert_eq!(engine.get_sync_run(&queued.id).await.expect("get").status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn settings_update_refreshes_cache_and_drives_cooldown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);

        let patch = SettingsPatch {
            alert_cooldown_minutes: Some(5),
            ..SettingsPatch::default()
        };
        engine.update_settings(patch, "admin").await.expect("update");
        assert_eq!(engine.settings().unwrap().alert_cooldown_minutes, 5);

        let outcome = engine
            .raise_incident(IncidentSignal {
                signal_version: "social-risk:v1".to_string(),
                risk_score: 85.0,
                classified_items: 10,
                severity_floor: None,
                payload: json!({}),
            })
            .await
            .expect("raise");
        assert_eq!(outcome.mode, RaiseMode::Created);
        assert_eq!(outcome.incident.cooldown_until - outcome.incident.created_at, chrono::Duration::minutes(5));
        assert_eq!(outcome.incident.sla_due_at - outcome.incident.created_at, chrono::Duration::minutes(30));

        let acknowledged = engine
            .transition_incident(IncidentTransitionRequest {
                incident_id: outcome.incident.id.clone(),
                status: IncidentStatus::Acknowledged,
                actor: "oncall".to_string(),
            })
            .await
            .expect("ack");
        assert_eq!(acknowledged.status, IncidentStatus::Acknowledged);
        assert_eq!(engine.list_active_incidents().await.unwrap().len(), 1);
        assert_eq!(engine.list_audit("incident", &outcome.incident.id).await.unwrap().len(), 1);
    }
}
