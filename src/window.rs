use crate::bucketing::{local_date, local_midnight};
use crate::errors::{AppError, AppResult};
use crate::models::{
    ComparisonMode, ComparisonWindow, DatePreset, ResolvedWindow, WindowRequest, WindowResolution,
};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};

/// First day of collected data; the `all` preset starts here.
pub const DATA_EPOCH: (i32, u32, u32) = (2024, 1, 1);
const DEFAULT_PRESET: DatePreset = DatePreset::Last30Days;
const SECONDS_PER_DAY: i64 = 86_400;

pub fn resolve_window(request: &WindowRequest, now: DateTime<Utc>, tz: FixedOffset) -> AppResult<WindowResolution> {
    let preset = select_preset(request)?;
    let end = request.to.unwrap_or(now);

    let (start, end) = match preset {
        DatePreset::Custom => {
            let (Some(from), Some(to)) = (request.from, request.to) else {
                return Err(AppError::Validation(
                    "custom preset requires both 'from' and 'to'".to_string(),
                ));
            };
            if from >= to {
                return Err(AppError::Validation(format!(
                    "custom window requires from < to (from={}, to={})",
                    from.to_rfc3339(),
                    to.to_rfc3339()
                )));
            }
            (from, to)
        }
        DatePreset::Last7Days | DatePreset::Last30Days | DatePreset::Last90Days => {
            let days = preset.rolling_days().unwrap_or(30);
            (end - Duration::days(days), end)
        }
        DatePreset::Ytd => {
            let year = local_date(end, tz).year();
            (year_start(year, tz)?, end)
        }
        DatePreset::Y2024 => (year_start(2024, tz)?, year_start(2025, tz)?),
        DatePreset::Y2025 => (year_start(2025, tz)?, year_start(2026, tz)?),
        DatePreset::LastQuarter => previous_quarter(end, tz)?,
        DatePreset::All => {
            let (year, month, day) = DATA_EPOCH;
            let epoch = local_midnight(ymd(year, month, day)?, tz);
            (epoch.min(end), end)
        }
    };

    let window = ResolvedWindow {
        preset,
        start,
        end,
        window_days: window_days_between(start, end),
    };
    let comparison = resolve_comparison(&window, request, tz)?;
    Ok(WindowResolution { window, comparison })
}

fn select_preset(request: &WindowRequest) -> AppResult<DatePreset> {
    let shorthand = match request.window_days {
        None => None,
        Some(7) => Some(DatePreset::Last7Days),
        Some(30) => Some(DatePreset::Last30Days),
        Some(90) => Some(DatePreset::Last90Days),
        Some(other) => {
            return Err(AppError::Validation(format!(
                "windowDays must be one of 7, 30, 90 (got {})",
                other
            )))
        }
    };

    match (request.preset, shorthand) {
        (Some(preset), Some(short)) if preset != short => Err(AppError::Validation(format!(
            "preset '{}' conflicts with windowDays shorthand '{}'",
            preset.as_str(),
            short.as_str()
        ))),
        (Some(preset), _) => Ok(preset),
        (None, Some(short)) => Ok(short),
        (None, None) if request.from.is_some() && request.to.is_some() => Ok(DatePreset::Custom),
        (None, None) => Ok(DEFAULT_PRESET),
    }
}

fn resolve_comparison(window: &ResolvedWindow, request: &WindowRequest, tz: FixedOffset) -> AppResult<ComparisonWindow> {
    match request.comparison {
        None => {
            let length = window.end - window.start;
            Ok(ComparisonWindow {
                mode: None,
                start: window.start - length,
                end: window.start,
                label: "previous_period".to_string(),
            })
        }
        Some(ComparisonMode::ExactDays) => {
            let days = request
                .comparison_days
                .filter(|days| *days > 0)
                .ok_or_else(|| {
                    AppError::Validation("exact_days comparison requires a positive comparisonDays".to_string())
                })?;
            Ok(ComparisonWindow {
                mode: Some(ComparisonMode::ExactDays),
                start: window.start - Duration::days(i64::from(days)),
                end: window.start,
                label: format!("previous_{}_days", days),
            })
        }
        Some(ComparisonMode::WeekdayAlignedWeek) => Ok(ComparisonWindow {
            mode: Some(ComparisonMode::WeekdayAlignedWeek),
            start: window.start - Duration::days(7),
            end: window.end - Duration::days(7),
            label: "same_weekdays_previous_week".to_string(),
        }),
        Some(ComparisonMode::SamePeriodLastYear) => Ok(ComparisonWindow {
            mode: Some(ComparisonMode::SamePeriodLastYear),
            start: shift_years(window.start, -1, tz)?,
            end: shift_years(window.end, -1, tz)?,
            label: "same_period_last_year".to_string(),
        }),
    }
}

/// Moves a timestamp by whole calendar years keeping local month, day and time.
/// Feb 29 lands on Feb 28 in non-leap years.
pub fn shift_years(ts: DateTime<Utc>, years: i32, tz: FixedOffset) -> AppResult<DateTime<Utc>> {
    let local = ts.with_timezone(&tz).naive_local();
    let date = local.date();
    let year = date.year() + years;
    let shifted = NaiveDate::from_ymd_opt(year, date.month(), date.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), 28))
        .ok_or_else(|| AppError::Validation(format!("cannot shift {} by {} years", ts.to_rfc3339(), years)))?;
    let offset = Duration::seconds(i64::from(tz.local_minus_utc()));
    Ok((shifted.and_time(local.time()) - offset).and_utc())
}

fn previous_quarter(end: DateTime<Utc>, tz: FixedOffset) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
    let date = local_date(end, tz);
    let quarter_month = (date.month0() / 3) * 3 + 1;
    let current_start = ymd(date.year(), quarter_month, 1)?;
    let (prev_year, prev_month) = if quarter_month == 1 {
        (date.year() - 1, 10)
    } else {
        (date.year(), quarter_month - 3)
    };
    let previous_start = ymd(prev_year, prev_month, 1)?;
    Ok((local_midnight(previous_start, tz), local_midnight(current_start, tz)))
}

pub fn year_start(year: i32, tz: FixedOffset) -> AppResult<DateTime<Utc>> {
    Ok(local_midnight(ymd(year, 1, 1)?, tz))
}

fn ymd(year: i32, month: u32, day: u32) -> AppResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| AppError::Validation(format!("invalid calendar date {}-{}-{}", year, month, day)))
}

/// Whole days covered by `[start, end)`, rounding partial days up.
pub fn window_days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let seconds = (end - start).num_seconds().max(0);
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bogota() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).expect("offset")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 20, 15, 0, 0).unwrap()
    }

    #[test]
    fn custom_preset_rejects_inverted_or_empty_range() {
        let at = now();
        let request = WindowRequest {
            preset: Some(DatePreset::Custom),
            from: Some(at),
            to: Some(at),
            ..WindowRequest::default()
        };
        let err = resolve_window(&request, at, bogota()).expect_err("from == to");
        assert_eq!(err.kind(), "validation");

        let inverted = WindowRequest {
            preset: Some(DatePreset::Custom),
            from: Some(at),
            to: Some(at - Duration::days(1)),
            ..WindowRequest::default()
        };
        assert!(resolve_window(&inverted, at, bogota()).is_err());
    }

    #[test]
    fn rolling_presets_end_at_now() {
        let request = WindowRequest {
            preset: Some(DatePreset::Last7Days),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&request, now(), bogota()).expect("resolve");
        assert_eq!(resolved.window.end, now());
        assert_eq!(resolved.window.start, now() - Duration::days(7));
        assert_eq!(resolved.window.window_days, 7);
        assert_eq!(resolved.comparison.end, resolved.window.start);
        assert_eq!(resolved.comparison.start, now() - Duration::days(14));
    }

    #[test]
    fn window_days_shorthand_selects_preset_and_rejects_others() {
        let request = WindowRequest {
            window_days: Some(90),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&request, now(), bogota()).expect("resolve");
        assert_eq!(resolved.window.preset, DatePreset::Last90Days);

        let bad = WindowRequest {
            window_days: Some(14),
            ..WindowRequest::default()
        };
        assert!(resolve_window(&bad, now(), bogota()).is_err());

        let conflicting = WindowRequest {
            preset: Some(DatePreset::Last7Days),
            window_days: Some(30),
            ..WindowRequest::default()
        };
        assert!(resolve_window(&conflicting, now(), bogota()).is_err());
    }

    #[test]
    fn ytd_starts_at_local_new_year() {
        let request = WindowRequest {
            preset: Some(DatePreset::Ytd),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&request, now(), bogota()).expect("resolve");
        assert_eq!(resolved.window.start, Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn last_quarter_is_the_preceding_calendar_quarter() {
        let request = WindowRequest {
            preset: Some(DatePreset::LastQuarter),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&request, now(), bogota()).expect("resolve");
        assert_eq!(resolved.window.start, Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap());
        assert_eq!(resolved.window.end, Utc.with_ymd_and_hms(2025, 4, 1, 5, 0, 0).unwrap());

        let january = Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).unwrap();
        let resolved = resolve_window(&request, january, bogota()).expect("resolve");
        assert_eq!(resolved.window.start, Utc.with_ymd_and_hms(2024, 10, 1, 5, 0, 0).unwrap());
        assert_eq!(resolved.window.end, Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn year_presets_and_all_use_fixed_bounds() {
        let y2024 = WindowRequest {
            preset: Some(DatePreset::Y2024),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&y2024, now(), bogota()).expect("resolve");
        assert_eq!(resolved.window.window_days, 366);

        let all = WindowRequest {
            preset: Some(DatePreset::All),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&all, now(), bogota()).expect("resolve");
        assert_eq!(resolved.window.start, Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn comparison_modes_shift_bounds() {
        let base = WindowRequest {
            preset: Some(DatePreset::Last30Days),
            comparison: Some(ComparisonMode::WeekdayAlignedWeek),
            ..WindowRequest::default()
        };
        let resolved = resolve_window(&base, now(), bogota()).expect("resolve");
        assert_eq!(resolved.comparison.end, now() - Duration::days(7));

        let exact_missing = WindowRequest {
            comparison: Some(ComparisonMode::ExactDays),
            ..base.clone()
        };
        assert!(resolve_window(&exact_missing, now(), bogota()).is_err());

        let exact = WindowRequest {
            comparison: Some(ComparisonMode::ExactDays),
            comparison_days: Some(10),
            ..base.clone()
        };
        let resolved = resolve_window(&exact, now(), bogota()).expect("resolve");
        assert_eq!(resolved.comparison.start, resolved.window.start - Duration::days(10));
        assert_eq!(resolved.comparison.end, resolved.window.start);

        let last_year = WindowRequest {
            comparison: Some(ComparisonMode::SamePeriodLastYear),
            ..base
        };
        let resolved = resolve_window(&last_year, now(), bogota()).expect("resolve");
        assert_eq!(resolved.comparison.end, Utc.with_ymd_and_hms(2024, 5, 20, 15, 0, 0).unwrap());
    }

    #[test]
    fn leap_day_shifts_to_february_28() {
        let leap = Utc.with_ymd_and_hms(2024, 2, 29, 17, 0, 0).unwrap();
        let shifted = shift_years(leap, -1, bogota()).expect("shift");
        assert_eq!(shifted, Utc.with_ymd_and_hms(2023, 2, 28, 17, 0, 0).unwrap());
    }
}
