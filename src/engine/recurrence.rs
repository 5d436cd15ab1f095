//! Occurrence starts for recurring series.

use chrono::{Days, Months, NaiveDateTime};
use chrono_tz::Tz;

use crate::model::{Ms, Recurrence};
use crate::tz;

use super::EngineError;

fn shift(local: NaiveDateTime, recurrence: Recurrence, n: u32) -> Option<NaiveDateTime> {
    match recurrence {
        Recurrence::Daily => local.checked_add_days(Days::new(u64::from(n))),
        Recurrence::Weekly => local.checked_add_days(Days::new(7 * u64::from(n))),
        Recurrence::Biweekly => local.checked_add_days(Days::new(14 * u64::from(n))),
        // Counted from the first occurrence so a clamped month does not drift.
        Recurrence::Monthly => local.checked_add_months(Months::new(n)),
    }
}

/// `count` starts beginning at `first`, each at the same wall-clock time in
/// `tz`. Wall times lost to a DST gap move forward past it.
pub fn occurrences(first: Ms, recurrence: Recurrence, count: u32, tz: &Tz) -> Result<Vec<Ms>, EngineError> {
    let local = tz::to_local(tz, first)?.naive_local();
    let mut starts = Vec::with_capacity(count as usize);
    starts.push(first);
    for n in 1..count {
        let start = shift(local, recurrence, n)
            .and_then(|l| tz::resolve_local(tz, l))
            .ok_or_else(|| EngineError::InvalidRange(format!("occurrence {} is out of range", n + 1)))?;
        starts.push(start);
    }
    Ok(starts)
}
