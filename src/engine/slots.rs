//! Slicing free time into bookable slots and shaping them for display.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Days, FixedOffset, NaiveDate};
use chrono_tz::Tz;
use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::tz;

use super::EngineError;

/// A bookable start, rendered in the display timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    /// Sorted. Exactly one entry for InviteeChoice event types.
    pub host_ids: Vec<Ulid>,
    /// Open seats across `host_ids`; group event types only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seats: Option<u32>,
}

/// A slot before display conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub span: Span,
    pub host_ids: Vec<Ulid>,
    pub remaining_seats: Option<u32>,
}

/// Open seats per (host, slot start), for group event types.
pub type SeatCounts = HashMap<(Ulid, Ms), u32>;

/// Starts `window.start, window.start + step, …` while the slot still ends
/// inside the window.
pub fn slice_window(window: Span, duration: Ms, step: Ms) -> impl Iterator<Item = Span> {
    debug_assert!(duration > 0 && step > 0);
    let mut start = window.start;
    std::iter::from_fn(move || {
        if start + duration > window.end {
            return None;
        }
        let slot = Span::new(start, start + duration);
        start += step;
        Some(slot)
    })
}

/// Slot spans cut from one host's free windows, kept only when they sit fully
/// inside `bounds` (the notice/horizon window).
pub fn host_candidates(free: &[Span], duration: Ms, step: Ms, bounds: &Span) -> Vec<Span> {
    free.iter()
        .flat_map(|w| slice_window(*w, duration, step))
        .filter(|s| bounds.contains_span(s))
        .collect()
}

/// UTC day number of an instant, for per-day caps.
pub fn utc_day(ms: Ms) -> i64 {
    ms.div_euclid(DAY_MS)
}

/// Drop starts whose UTC day already holds `cap` active bookings.
pub fn apply_daily_cap(spans: &mut Vec<Span>, cap: Option<u32>, per_day: &HashMap<i64, u32>) {
    let Some(cap) = cap else { return };
    spans.retain(|s| per_day.get(&utc_day(s.start)).copied().unwrap_or(0) < cap);
}

fn seats_at(seats: Option<&SeatCounts>, hosts: &[Ulid], start: Ms) -> Option<u32> {
    seats.map(|counts| hosts.iter().filter_map(|h| counts.get(&(*h, start))).sum())
}

/// Combine per-host slot spans. With `per_host` each (span, host) pair stays
/// its own candidate; otherwise hosts sharing a start are merged and their
/// open seats summed.
pub fn combine(
    per_host_spans: Vec<(Ulid, Vec<Span>)>,
    per_host: bool,
    seats: Option<&SeatCounts>,
) -> Vec<Candidate> {
    let mut by_start: BTreeMap<(Ms, Ms), Vec<Ulid>> = BTreeMap::new();
    for (host_id, spans) in per_host_spans {
        for span in spans {
            by_start.entry((span.start, span.end)).or_default().push(host_id);
        }
    }

    let mut out = Vec::with_capacity(by_start.len());
    for ((start, end), mut hosts) in by_start {
        let span = Span::new(start, end);
        hosts.sort();
        hosts.dedup();
        if per_host {
            out.extend(hosts.into_iter().map(|h| Candidate {
                span,
                host_ids: vec![h],
                remaining_seats: seats_at(seats, &[h], start),
            }));
        } else {
            out.push(Candidate {
                span,
                remaining_seats: seats_at(seats, &hosts, start),
                host_ids: hosts,
            });
        }
    }
    out
}

/// Group candidates by display-timezone start date. Every date in
/// `[start_date, end_date]` gets an entry, empty or not.
pub fn group_by_date(
    display_tz: &Tz,
    start_date: NaiveDate,
    end_date: NaiveDate,
    candidates: Vec<Candidate>,
) -> Result<BTreeMap<NaiveDate, Vec<Slot>>, EngineError> {
    let mut out: BTreeMap<NaiveDate, Vec<Slot>> = BTreeMap::new();
    let mut date = Some(start_date);
    while let Some(day) = date.filter(|d| *d <= end_date) {
        out.insert(day, Vec::new());
        date = day.checked_add_days(Days::new(1));
    }

    for c in candidates {
        let start = tz::to_display(display_tz, c.span.start)?;
        let end = tz::to_display(display_tz, c.span.end)?;
        if let Some(day) = out.get_mut(&start.date_naive()) {
            day.push(Slot {
                start,
                end,
                host_ids: c.host_ids,
                remaining_seats: c.remaining_seats,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    const M: Ms = MINUTE_MS;

    #[test]
    fn slicing_steps_from_window_start() {
        let starts: Vec<Ms> = slice_window(Span::new(0, 60 * M), 30 * M, 15 * M)
            .map(|s| s.start)
            .collect();
        assert_eq!(starts, vec![0, 15 * M, 30 * M]);
    }

    #[test]
    fn step_independent_of_duration() {
        // 45-minute meetings every 20 minutes in a 2h window.
        let spans: Vec<Span> = slice_window(Span::new(0, 120 * M), 45 * M, 20 * M).collect();
        assert_eq!(spans.len(), 4);
        assert!(spans.iter().all(|s| s.duration_ms() == 45 * M));
        assert_eq!(spans.last().unwrap().end, 105 * M);
    }

    #[test]
    fn window_shorter_than_duration_yields_nothing() {
        assert_eq!(slice_window(Span::new(0, 20 * M), 30 * M, 15 * M).count(), 0);
    }

    #[test]
    fn odd_window_start_is_not_snapped() {
        // After a buffer the window starts at :40; slots start there.
        let starts: Vec<Ms> = slice_window(Span::new(40 * M, 120 * M), 30 * M, 15 * M)
            .map(|s| s.start)
            .collect();
        assert_eq!(starts, vec![40 * M, 55 * M, 70 * M, 85 * M]);
    }

    #[test]
    fn candidates_respect_bounds() {
        let free = vec![Span::new(0, 120 * M)];
        let bounds = Span::new(20 * M, 100 * M);
        let spans = host_candidates(&free, 30 * M, 15 * M, &bounds);
        let starts: Vec<Ms> = spans.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![30 * M, 45 * M, 60 * M]);
        assert!(spans.iter().all(|s| bounds.contains_span(s)));
    }

    #[test]
    fn daily_cap_removes_full_days() {
        let mut spans = vec![Span::new(0, 30 * M), Span::new(DAY_MS, DAY_MS + 30 * M)];
        let per_day = HashMap::from([(0, 2)]);
        apply_daily_cap(&mut spans, Some(2), &per_day);
        assert_eq!(spans, vec![Span::new(DAY_MS, DAY_MS + 30 * M)]);

        let mut untouched = vec![Span::new(0, 30 * M)];
        apply_daily_cap(&mut untouched, None, &per_day);
        assert_eq!(untouched.len(), 1);
    }

    #[test]
    fn merged_slots_carry_sorted_hosts() {
        let a = Ulid::from_parts(1, 1);
        let b = Ulid::from_parts(2, 2);
        let s1 = Span::new(0, 30 * M);
        let s2 = Span::new(15 * M, 45 * M);
        let merged = combine(vec![(b, vec![s1, s2]), (a, vec![s1])], false, None);
        assert_eq!(
            merged,
            vec![
                Candidate { span: s1, host_ids: vec![a, b], remaining_seats: None },
                Candidate { span: s2, host_ids: vec![b], remaining_seats: None },
            ]
        );
    }

    #[test]
    fn invitee_choice_keeps_one_host_per_slot() {
        let a = Ulid::from_parts(1, 1);
        let b = Ulid::from_parts(2, 2);
        let s1 = Span::new(0, 30 * M);
        let tagged = combine(vec![(b, vec![s1]), (a, vec![s1])], true, None);
        assert_eq!(tagged.len(), 2);
        assert!(tagged.iter().all(|c| c.host_ids.len() == 1));
        assert_eq!(tagged[0].host_ids, vec![a]);
        assert_eq!(tagged[1].host_ids, vec![b]);
    }

    #[test]
    fn seats_sum_when_hosts_merge() {
        let a = Ulid::from_parts(1, 1);
        let b = Ulid::from_parts(2, 2);
        let s1 = Span::new(0, 30 * M);
        let seats = SeatCounts::from([((a, 0), 3), ((b, 0), 1)]);

        let merged = combine(vec![(a, vec![s1]), (b, vec![s1])], false, Some(&seats));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].remaining_seats, Some(4));

        let tagged = combine(vec![(a, vec![s1]), (b, vec![s1])], true, Some(&seats));
        let open: Vec<Option<u32>> = tagged.iter().map(|c| c.remaining_seats).collect();
        assert_eq!(open, vec![Some(3), Some(1)]);
    }

    #[test]
    fn grouping_fills_every_date() {
        let start = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        // 2026-03-03T02:00Z is still March 2 in New York.
        let late = 1_772_409_600_000 + DAY_MS + 120 * M;
        let grouped = group_by_date(
            &New_York,
            start,
            end,
            vec![Candidate {
                span: Span::new(late, late + 30 * M),
                host_ids: vec![Ulid::nil()],
                remaining_seats: None,
            }],
        )
        .unwrap();
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped[&start].len(), 1);
        assert_eq!(grouped[&start][0].start.to_rfc3339(), "2026-03-02T21:00:00-05:00");
        assert!(grouped[&end].is_empty());
    }

    #[test]
    fn grouping_stops_at_the_last_date() {
        let last = NaiveDate::MAX;
        let grouped = group_by_date(&Tz::UTC, last, last, Vec::new()).unwrap();
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![last]);
    }
}
