use crate::errors::{AppError, AppResult};
use anyhow::Context;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_DB_PATH: &str = "BRAND_PULSE_DB_PATH";
pub const ENV_UTC_OFFSET_MINUTES: &str = "BRAND_PULSE_UTC_OFFSET_MINUTES";
pub const ENV_LOG_DIR: &str = "BRAND_PULSE_LOG_DIR";

/// Hard ceiling on rows visited by one full-window scan.
pub const SCAN_ROW_HARD_CAP: usize = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    /// Business time zone as a fixed offset from UTC. Bogotá (UTC-5) has no DST.
    pub utc_offset_minutes: i32,
    pub scan_batch_size: usize,
    pub scan_row_cap: usize,
    /// Create the optional post tag table when opening the store.
    pub tag_schema: bool,
    pub log_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("brand-pulse.sqlite"),
            utc_offset_minutes: -300,
            scan_batch_size: 1_000,
            scan_row_cap: SCAN_ROW_HARD_CAP,
            tag_schema: true,
            log_dir: None,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(raw)?;
        config.validated()
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))
            .map_err(|error| AppError::Io(format!("{:#}", error)))?;
        Self::from_yaml_str(&raw)?.with_env_overrides()
    }

    /// Applies `BRAND_PULSE_*` environment variables on top of the file values.
    pub fn with_env_overrides(mut self) -> AppResult<Self> {
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.trim().is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }
        if let Ok(raw) = std::env::var(ENV_UTC_OFFSET_MINUTES) {
            self.utc_offset_minutes = raw.trim().parse::<i32>().map_err(|_| {
                AppError::Validation(format!("{} must be an integer (got '{}')", ENV_UTC_OFFSET_MINUTES, raw))
            })?;
        }
        if let Ok(dir) = std::env::var(ENV_LOG_DIR) {
            if !dir.trim().is_empty() {
                self.log_dir = Some(PathBuf::from(dir));
            }
        }
        self.validated()
    }

    fn validated(mut self) -> AppResult<Self> {
        self.business_offset()?;
        if self.scan_batch_size == 0 {
            return Err(AppError::Validation("scanBatchSize must be positive".to_string()));
        }
        self.scan_row_cap = self.scan_row_cap.clamp(1, SCAN_ROW_HARD_CAP);
        Ok(self)
    }

    pub fn business_offset(&self) -> AppResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            AppError::Validation(format!("utcOffsetMinutes out of range: {}", self.utc_offset_minutes))
        })
    }
}
