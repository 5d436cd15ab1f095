//! Host calendars: weekly rules and date exceptions, rendered as UTC free
//! windows.

use chrono::{Days, NaiveDate};

use crate::limits::*;
use crate::model::*;
use crate::tz;

use super::interval::normalize;
use super::EngineError;

/// Local ranges that apply to `date`. An exception replaces the weekday rules
/// outright; a blocked date has none.
pub fn ranges_for_date(host: &HostState, date: NaiveDate) -> Vec<LocalRange> {
    match host.exceptions.get(&date) {
        Some(ExceptionKind::Blocked) => Vec::new(),
        Some(ExceptionKind::Hours(ranges)) => ranges.clone(),
        None => host
            .rules_for(tz::weekday_index(date))
            .map(|r| r.range)
            .collect(),
    }
}

/// Free windows of `host` inside `range`, in UTC, sorted and disjoint.
pub fn free_windows(host: &HostState, range: &Span) -> Result<Vec<Span>, EngineError> {
    let first = tz::local_date(&host.timezone, range.start)?;
    let last = tz::local_date(&host.timezone, range.end - 1)?;

    let mut windows = Vec::new();
    let mut date = first;
    while date <= last {
        for local in ranges_for_date(host, date) {
            for piece in tz::local_range_to_utc(&host.timezone, date, local) {
                if let Some(clamped) = piece.clamp(range) {
                    windows.push(clamped);
                }
            }
        }
        let Some(next) = date.checked_add_days(Days::new(1)) else { break };
        date = next;
    }

    Ok(normalize(windows))
}

// ── Authoring-time validation ─────────────────────────────────────

pub fn validate_rule(host: &HostState, rule: &AvailabilityRule) -> Result<(), EngineError> {
    if rule.weekday > 6 {
        return Err(EngineError::InvalidConfig(format!(
            "weekday {} out of range 0-6",
            rule.weekday
        )));
    }
    if !rule.range.is_valid() {
        return Err(EngineError::InvalidConfig(format!(
            "rule range {}-{} must satisfy start < end <= 1440",
            rule.range.start_min, rule.range.end_min
        )));
    }
    if host.rules.len() >= MAX_RULES_PER_HOST {
        return Err(EngineError::LimitExceeded("too many rules on host"));
    }
    if let Some(clash) = host
        .rules_for(rule.weekday)
        .find(|r| r.range.overlaps(&rule.range))
    {
        return Err(EngineError::InvalidConfig(format!(
            "rule overlaps existing rule {}",
            clash.id
        )));
    }
    Ok(())
}

pub fn validate_exception(host: &HostState, exception: &AvailabilityException) -> Result<(), EngineError> {
    if !host.exceptions.contains_key(&exception.date)
        && host.exceptions.len() >= MAX_EXCEPTIONS_PER_HOST
    {
        return Err(EngineError::LimitExceeded("too many exceptions on host"));
    }
    let ExceptionKind::Hours(ranges) = &exception.kind else {
        return Ok(());
    };
    if ranges.is_empty() {
        return Err(EngineError::InvalidConfig(
            "special hours need at least one range; use a blocked exception instead".into(),
        ));
    }
    if ranges.len() > MAX_RANGES_PER_EXCEPTION {
        return Err(EngineError::LimitExceeded("too many ranges in exception"));
    }
    if let Some(bad) = ranges.iter().find(|r| !r.is_valid()) {
        return Err(EngineError::InvalidConfig(format!(
            "exception range {}-{} must satisfy start < end <= 1440",
            bad.start_min, bad.end_min
        )));
    }
    let mut sorted = ranges.clone();
    sorted.sort();
    if sorted.windows(2).any(|w| w[0].overlaps(&w[1])) {
        return Err(EngineError::InvalidConfig(
            "exception ranges overlap".into(),
        ));
    }
    Ok(())
}
