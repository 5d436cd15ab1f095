//! Conversions between UTC milliseconds and wall-clock time in IANA zones.
//!
//! Local times that do not exist (DST gap) resolve to the first valid instant
//! after the gap; local times that occur twice (DST overlap) resolve to the
//! earliest instant.

use chrono::{
    DateTime, Datelike, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeDelta, TimeZone,
};
use chrono_tz::Tz;

use crate::engine::EngineError;
use crate::model::{LocalRange, Ms, Span};

/// Longest run of non-existent local minutes we will step over. Covers
/// whole-day skips such as Pacific/Apia in 2011.
const MAX_GAP_MINUTES: usize = 26 * 60;

pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::InvalidTimezone(name.to_string()))
}

/// 0 = Monday … 6 = Sunday.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

/// UTC offset in seconds in effect at `ms`.
pub fn offset_secs(tz: &Tz, ms: Ms) -> i32 {
    match tz.timestamp_millis_opt(ms) {
        LocalResult::Single(dt) => dt.offset().fix().local_minus_utc(),
        _ => 0,
    }
}

pub fn to_local(tz: &Tz, ms: Ms) -> Result<DateTime<Tz>, EngineError> {
    tz.timestamp_millis_opt(ms)
        .single()
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))
}

/// Output-boundary form of an instant: wall time plus the offset in effect.
pub fn to_display(tz: &Tz, ms: Ms) -> Result<DateTime<FixedOffset>, EngineError> {
    to_local(tz, ms).map(|dt| dt.fixed_offset())
}

pub fn local_date(tz: &Tz, ms: Ms) -> Result<NaiveDate, EngineError> {
    to_local(tz, ms).map(|dt| dt.date_naive())
}

/// Resolve a wall-clock time to an instant.
pub fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<Ms> {
    let mut candidate = local;
    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt.timestamp_millis()),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.timestamp_millis()),
            LocalResult::None => candidate = candidate.checked_add_signed(TimeDelta::minutes(1))?,
        }
    }
    None
}

/// Instant of `minute` minutes after local midnight of `date`. Minute 1440 is
/// the next day's midnight.
pub fn local_minute_to_utc(tz: &Tz, date: NaiveDate, minute: u16) -> Option<Ms> {
    let local = date
        .and_time(NaiveTime::MIN)
        .checked_add_signed(TimeDelta::minutes(i64::from(minute)))?;
    resolve_local(tz, local)
}

/// Instant of local midnight starting `date`.
pub fn day_start(tz: &Tz, date: NaiveDate) -> Option<Ms> {
    local_minute_to_utc(tz, date, 0)
}

/// Convert a local range on `date` into UTC pieces, one per UTC offset the
/// range passes through.
pub fn local_range_to_utc(tz: &Tz, date: NaiveDate, range: LocalRange) -> Vec<Span> {
    let (Some(start), Some(end)) = (
        local_minute_to_utc(tz, date, range.start_min),
        local_minute_to_utc(tz, date, range.end_min),
    ) else {
        return Vec::new();
    };
    if end <= start {
        // The whole range fell inside a gap.
        return Vec::new();
    }
    split_at_transitions(tz, Span::new(start, end))
}

/// Split a span at every offset transition inside it.
pub fn split_at_transitions(tz: &Tz, span: Span) -> Vec<Span> {
    let mut pieces = Vec::new();
    let mut cursor = span.start;
    let last = span.end - 1;

    while offset_secs(tz, cursor) != offset_secs(tz, last) {
        let base = offset_secs(tz, cursor);
        // offset(lo) == base, offset(hi) != base
        let (mut lo, mut hi) = (cursor, last);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if offset_secs(tz, mid) == base {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        pieces.push(Span::new(cursor, hi));
        cursor = hi;
    }
    pieces.push(Span::new(cursor, span.end));
    pieces
}

/// Parse an instant supplied at the API boundary: RFC 3339 with an offset,
/// or a naive `YYYY-MM-DDTHH:MM[:SS]` read as wall time in `tz`.
pub fn parse_instant(input: &str, tz: &Tz) -> Result<Ms, EngineError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M"))
        .map_err(|_| EngineError::InvalidRequest(format!("unparseable instant: {input}")))?;
    resolve_local(tz, naive)
        .ok_or_else(|| EngineError::InvalidRequest(format!("unresolvable local time: {input}")))
}
