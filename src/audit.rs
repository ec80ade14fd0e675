use crate::errors::{AppError, AppResult};
use crate::models::AuditRecord;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

static ACTOR_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@:\-]{0,127}$").expect("valid actor regex"));

/// Actors are opaque identifiers from the user resolver, never display names.
pub fn validate_actor(actor: &str) -> AppResult<&str> {
    let actor = actor.trim();
    if ACTOR_ID.is_match(actor) {
        Ok(actor)
    } else {
        Err(AppError::Validation(format!("Actor '{}' is not a valid identifier", actor)))
    }
}

pub fn require_reason(reason: &str) -> AppResult<&str> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::Validation("A non-empty reason is required".to_string()));
    }
    Ok(reason)
}

pub fn audit_record<B: Serialize, A: Serialize>(
    actor: &str,
    action: &str,
    entity: &str,
    entity_id: &str,
    before: &B,
    after: &A,
    now: DateTime<Utc>,
) -> AppResult<AuditRecord> {
    Ok(AuditRecord {
        id: Uuid::new_v4().to_string(),
        actor: actor.to_string(),
        action: action.to_string(),
        entity: entity.to_string(),
        entity_id: entity_id.to_string(),
        before: serde_json::to_value(before)?,
        after: serde_json::to_value(after)?,
        created_at: now,
    })
}
