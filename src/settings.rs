//! Dashboard settings lifecycle.
//!
//! The store writes the default row when it is opened; the engine then loads
//! it once into a [`SettingsHandle`] and replaces the cached value after every
//! committed patch. Nothing else creates or mutates settings.

use crate::errors::{AppError, AppResult};
use crate::models::{DashboardSetting, SettingsPatch};
use std::sync::{Arc, RwLock};

const MAX_COOLDOWN_MINUTES: u32 = 7 * 24 * 60;

#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<DashboardSetting>>,
}

impl SettingsHandle {
    pub fn new(initial: DashboardSetting) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn current(&self) -> AppResult<DashboardSetting> {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))
    }

    pub fn replace(&self, settings: DashboardSetting) -> AppResult<()> {
        let mut writer = self
            .inner
            .write()
            .map_err(|_| AppError::Internal("settings lock poisoned".to_string()))?;
        *writer = settings;
        Ok(())
    }
}

fn validate_pct(name: &str, value: f64) -> AppResult<f64> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(AppError::Validation(format!("{} must be within [0, 100] (got {})", name, value)));
    }
    Ok(value)
}

/// Applies `patch` to `current`. Fails with `Conflict` when nothing would change.
pub fn apply_patch(current: &DashboardSetting, patch: &SettingsPatch) -> AppResult<DashboardSetting> {
    let mut next = current.clone();

    if let Some(focus) = &patch.focus_account {
        let focus = focus.trim();
        next.focus_account = if focus.is_empty() { None } else { Some(focus.to_string()) };
    }
    if let Some(value) = patch.sov_target_pct {
        next.sov_target_pct = validate_pct("sovTargetPct", value)?;
    }
    if let Some(value) = patch.health_score_target {
        next.health_score_target = validate_pct("healthScoreTarget", value)?;
    }
    if let Some(value) = patch.risk_threshold {
        next.risk_threshold = validate_pct("riskThreshold", value)?;
    }
    if let Some(value) = patch.sentiment_drop_threshold {
        next.sentiment_drop_threshold = validate_pct("sentimentDropThreshold", value)?;
    }
    if let Some(value) = patch.er_drop_threshold {
        next.er_drop_threshold = validate_pct("erDropThreshold", value)?;
    }
    if let Some(minutes) = patch.alert_cooldown_minutes {
        if minutes > MAX_COOLDOWN_MINUTES {
            return Err(AppError::Validation(format!(
                "alertCooldownMinutes must be at most {} (got {})",
                MAX_COOLDOWN_MINUTES, minutes
            )));
        }
        next.alert_cooldown_minutes = minutes;
    }
    if let Some(metadata) = &patch.metadata {
        if !metadata.is_object() {
            return Err(AppError::Validation("metadata must be a JSON object".to_string()));
        }
        merge_json(&mut next.metadata, metadata.clone());
    }

    if next == *current {
        return Err(AppError::Conflict("settings patch has no effective changes".to_string()));
    }
    Ok(next)
}

pub fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
