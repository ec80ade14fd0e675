use crate::errors::{AppError, AppResult};
use crate::models::{Incident, IncidentSeverity, IncidentSignal, IncidentStatus, RaiseMode, RaiseOutcome};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub fn severity_for_score(risk_score: f64) -> IncidentSeverity {
    if risk_score >= 80.0 {
        IncidentSeverity::Sev1
    } else if risk_score >= 60.0 {
        IncidentSeverity::Sev2
    } else if risk_score >= 40.0 {
        IncidentSeverity::Sev3
    } else {
        IncidentSeverity::Sev4
    }
}

pub fn more_severe(a: IncidentSeverity, b: IncidentSeverity) -> IncidentSeverity {
    if a.rank() <= b.rank() {
        a
    } else {
        b
    }
}

/// Band severity, raised to the caller's floor when the floor is more severe.
pub fn effective_severity(risk_score: f64, floor: Option<IncidentSeverity>) -> IncidentSeverity {
    let computed = severity_for_score(risk_score);
    match floor {
        Some(floor) => more_severe(computed, floor),
        None => computed,
    }
}

pub fn sla_minutes(severity: IncidentSeverity) -> i64 {
    match severity {
        IncidentSeverity::Sev1 => 30,
        IncidentSeverity::Sev2 => 240,
        IncidentSeverity::Sev3 | IncidentSeverity::Sev4 => 1440,
    }
}

pub fn validate_signal(signal: &IncidentSignal) -> AppResult<()> {
    if signal.signal_version.trim().is_empty() {
        return Err(AppError::Validation("signalVersion cannot be empty".to_string()));
    }
    if !signal.risk_score.is_finite() {
        return Err(AppError::Validation("riskScore must be a finite number".to_string()));
    }
    Ok(())
}

/// Decides what raising `signal` does given the active incident for its signal
/// version. A `Deduped` outcome carries the untouched existing incident.
pub fn decide_raise(
    existing: Option<Incident>,
    signal: &IncidentSignal,
    cooldown_minutes: u32,
    now: DateTime<Utc>,
) -> RaiseOutcome {
    let computed = effective_severity(signal.risk_score, signal.severity_floor);
    let cooldown_until = now + Duration::minutes(i64::from(cooldown_minutes));

    let Some(mut incident) = existing else {
        return RaiseOutcome {
            mode: RaiseMode::Created,
            incident: Incident {
                id: Uuid::new_v4().to_string(),
                signal_version: signal.signal_version.clone(),
                severity: computed,
                status: IncidentStatus::Open,
                risk_score: signal.risk_score,
                classified_items: signal.classified_items,
                sla_due_at: now + Duration::minutes(sla_minutes(computed)),
                cooldown_until,
                payload: signal.payload.clone(),
                created_at: now,
                updated_at: now,
                resolved_at: None,
            },
        };
    };

    if incident.cooldown_until > now {
        return RaiseOutcome {
            mode: RaiseMode::Deduped,
            incident,
        };
    }

    let stored = incident.severity;
    let severity = more_severe(stored, computed);
    if incident.status == IncidentStatus::Dismissed {
        incident.status = IncidentStatus::Open;
    }
    incident.severity = severity;
    incident.risk_score = signal.risk_score;
    incident.classified_items = signal.classified_items;
    incident.cooldown_until = cooldown_until;
    incident.sla_due_at = now + Duration::minutes(sla_minutes(severity));
    incident.payload = signal.payload.clone();
    incident.updated_at = now;

    let mode = if severity.rank() < stored.rank() {
        RaiseMode::Escalated
    } else {
        RaiseMode::Updated
    };
    RaiseOutcome { mode, incident }
}

/// Applies an operator status change. Resolved incidents are closed for good.
pub fn apply_transition(incident: &mut Incident, status: IncidentStatus, now: DateTime<Utc>) -> AppResult<()> {
    if incident.status == status {
        return Err(AppError::Conflict(format!(
            "incident {} is already {}",
            incident.id,
            status.as_str()
        )));
    }
    if incident.status == IncidentStatus::Resolved {
        return Err(AppError::Conflict(format!("incident {} is already resolved", incident.id)));
    }
    incident.status = status;
    incident.resolved_at = if status == IncidentStatus::Resolved { Some(now) } else { None };
    incident.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal(risk_score: f64) -> IncidentSignal {
        IncidentSignal {
            signal_version: "social-risk:v1".to_string(),
            risk_score,
            classified_items: 120,
            severity_floor: None,
            payload: json!({"window": "7d"}),
        }
    }

    #[test]
    fn severity_bands_follow_thresholds() {
        assert_eq!(severity_for_score(85.0), IncidentSeverity::Sev1);
        assert_eq!(severity_for_score(80.0), IncidentSeverity::Sev1);
        assert_eq!(severity_for_score(60.0), IncidentSeverity::Sev2);
        assert_eq!(severity_for_score(40.0), IncidentSeverity::Sev3);
        assert_eq!(severity_for_score(39.99), IncidentSeverity::Sev4);
    }

    #[test]
    fn floor_only_raises_severity() {
        assert_eq!(effective_severity(10.0, Some(IncidentSeverity::Sev2)), IncidentSeverity::Sev2);
        assert_eq!(effective_severity(90.0, Some(IncidentSeverity::Sev3)), IncidentSeverity::Sev1);
    }

    #[test]
    fn new_incident_gets_sla_and_cooldown() {
        let now = Utc::now();
        let outcome = decide_raise(None, &signal(85.0), 60, now);
        assert_eq!(outcome.mode, RaiseMode::Created);
        assert_eq!(outcome.incident.severity, IncidentSeverity::Sev1);
        assert_eq!(outcome.incident.sla_due_at, now + Duration::minutes(30));
        assert_eq!(outcome.incident.cooldown_until, now + Duration::minutes(60));
    }

    #[test]
    fn within_cooldown_is_deduped_without_changes() {
        let now = Utc::now();
        let created = decide_raise(None, &signal(50.0), 60, now).incident;
        let outcome = decide_raise(Some(created.clone()), &signal(95.0), 60, now + Duration::minutes(10));
        assert_eq!(outcome.mode, RaiseMode::Deduped);
        assert_eq!(outcome.incident, created);

        let repeated = decide_raise(Some(outcome.incident), &signal(20.0), 60, now + Duration::minutes(50));
        assert_eq!(repeated.mode, RaiseMode::Deduped);
        assert_eq!(repeated.incident.updated_at, now);
        assert_eq!(repeated.incident.cooldown_until, now + Duration::minutes(60));
        assert_eq!(repeated.incident, created);
    }

    #[test]
    fn escalation_and_no_downgrade_after_cooldown() {
        let now = Utc::now();
        let created = decide_raise(None, &signal(45.0), 30, now).incident;
        let later = now + Duration::minutes(31);

        let escalated = decide_raise(Some(created.clone()), &signal(70.0), 30, later);
        assert_eq!(escalated.mode, RaiseMode::Escalated);
        assert_eq!(escalated.incident.severity, IncidentSeverity::Sev2);
        assert_eq!(escalated.incident.sla_due_at, later + Duration::minutes(240));

        let even_later = later + Duration::minutes(31);
        let lower = decide_raise(Some(escalated.incident), &signal(10.0), 30, even_later);
        assert_eq!(lower.mode, RaiseMode::Updated);
        assert_eq!(lower.incident.severity, IncidentSeverity::Sev2);
        assert_eq!(lower.incident.risk_score, 10.0);
    }

    #[test]
    fn transitions_reject_noops_and_resolved() {
        let now = Utc::now();
        let mut incident = decide_raise(None, &signal(45.0), 30, now).incident;
        assert!(apply_transition(&mut incident, IncidentStatus::Open, now).is_err());
        apply_transition(&mut incident, IncidentStatus::Acknowledged, now).expect("ack");
        apply_transition(&mut incident, IncidentStatus::Resolved, now).expect("resolve");
        assert_eq!(incident.resolved_at, Some(now));
        let err = apply_transition(&mut incident, IncidentStatus::Open, now).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }
}
