use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Days, NaiveDate};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::tz;

use super::calendar;
use super::conflict::{open_seats, subtract_busy, ConflictRule};
use super::lifecycle::effective;
use super::slots::{self, SeatCounts, Slot};
use super::{Engine, EngineError};

fn check_query_width(range: &Span) -> Result<(), EngineError> {
    if range.duration_ms() > MAX_QUERY_DAYS * DAY_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Free windows from rules and exceptions alone, bookings not subtracted.
    pub async fn free_windows(&self, host_id: Ulid, range: Span) -> Result<Vec<Span>, EngineError> {
        check_query_width(&range)?;
        let hs = self.get_host(&host_id).ok_or(EngineError::InvalidHost(host_id))?;
        let guard = hs.read().await;
        calendar::free_windows(&guard, &range)
    }

    /// Bookable slots for `[start_date, end_date]` in `display_tz`, keyed by
    /// display date. Dates with nothing bookable map to an empty list.
    pub async fn list_slots(
        &self,
        event_type_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        display_tz: Tz,
    ) -> Result<BTreeMap<NaiveDate, Vec<Slot>>, EngineError> {
        if end_date < start_date {
            return Err(EngineError::InvalidRange(format!(
                "end date {end_date} is before start date {start_date}"
            )));
        }
        if (end_date - start_date).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let et = {
            let ets = self
                .get_event_type(&event_type_id)
                .ok_or(EngineError::NotFound(event_type_id))?;
            ets.read().await.config.clone()
        };

        let day_after = end_date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| EngineError::InvalidRange(format!("end date {end_date} is out of range")))?;
        let range_start = tz::day_start(&display_tz, start_date);
        let range_end = tz::day_start(&display_tz, day_after);
        let (Some(range_start), Some(range_end)) = (range_start, range_end) else {
            return Err(EngineError::InvalidRange("dates outside the timezone database".into()));
        };

        let now = self.now();
        let bounds = et.bookable_window(now);
        let Some(query) = Span::new(range_start, range_end).clamp(&bounds) else {
            return slots::group_by_date(&display_tz, start_date, end_date, Vec::new());
        };
        // Windows are read a day wider so slot starts line up with the host's
        // own window starts rather than with the query edges.
        let calendar_range = Span::new(query.start - DAY_MS, query.end + DAY_MS);

        let duration = et.duration_ms();
        let step = et.granularity_ms();
        let rule = ConflictRule::for_event_type(&et);
        let day_bookings = Span::new(
            slots::utc_day(query.start) * DAY_MS,
            (slots::utc_day(query.end) + 1) * DAY_MS,
        );

        let mut per_host = Vec::with_capacity(et.eligible_host_ids.len());
        let mut per_day: HashMap<i64, u32> = HashMap::new();
        let mut seats = SeatCounts::new();
        for host_id in &et.eligible_host_ids {
            let hs = self.get_host(host_id).ok_or(EngineError::InvalidHost(*host_id))?;
            let guard = hs.read().await;

            let free = calendar::free_windows(&guard, &calendar_range)?;
            let spans = if rule.seats.is_some() {
                // Shared slots stay listed until their last seat goes.
                let mut open = Vec::new();
                for span in slots::host_candidates(&free, duration, step, &bounds) {
                    if let Ok(n) = open_seats(&guard, &span, rule, None) {
                        seats.insert((*host_id, span.start), n);
                        open.push(span);
                    }
                }
                open
            } else {
                let open = subtract_busy(&guard, &free, rule.buffers, None);
                slots::host_candidates(&open, duration, step, &bounds)
            };
            per_host.push((*host_id, spans));

            if et.max_bookings_per_day.is_some() {
                for b in guard
                    .active_overlapping(&day_bookings)
                    .filter(|b| b.event_type_id == et.id)
                {
                    *per_day.entry(slots::utc_day(b.span.start)).or_default() += 1;
                }
            }
        }

        for (_, spans) in &mut per_host {
            slots::apply_daily_cap(spans, et.max_bookings_per_day, &per_day);
        }
        let per_host_tagging = matches!(et.policy, AssignmentPolicy::InviteeChoice);
        let seat_counts = rule.seats.is_some().then_some(&seats);
        let candidates = slots::combine(per_host, per_host_tagging, seat_counts);
        slots::group_by_date(&display_tz, start_date, end_date, candidates)
    }

    /// A booking with its derived state.
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let host_id = self.get_host_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let hs = self.get_host(&host_id).ok_or(EngineError::NotFound(host_id))?;
        let guard = hs.read().await;
        guard
            .booking(id)
            .map(|b| effective(b, self.now()))
            .ok_or(EngineError::NotFound(id))
    }

    /// `id` followed by every booking that replaced it, oldest first.
    pub async fn booking_history(&self, id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let mut chain = vec![self.get_booking(id).await?];
        let mut seen = HashSet::from([id]);
        while let Some(next) = chain.last().and_then(|b| b.superseded_by) {
            if !seen.insert(next) {
                break;
            }
            chain.push(self.get_booking(next).await?);
        }
        Ok(chain)
    }

    /// Every booking on a host overlapping `range`, in start order.
    pub async fn host_bookings(&self, host_id: Ulid, range: Span) -> Result<Vec<Booking>, EngineError> {
        check_query_width(&range)?;
        let hs = self.get_host(&host_id).ok_or(EngineError::InvalidHost(host_id))?;
        let guard = hs.read().await;
        let now = self.now();
        Ok(guard.overlapping(&range).map(|b| effective(b, now)).collect())
    }

    /// Bookings that are or were confirmed, for calendar export.
    pub async fn confirmed_bookings(&self, host_id: Ulid, range: Span) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.host_bookings(host_id, range).await?;
        bookings.retain(|b| matches!(b.state, BookingState::Confirmed | BookingState::Completed));
        Ok(bookings)
    }

    pub async fn list_hosts(&self) -> Vec<HostInfo> {
        let shared: Vec<_> = self.hosts.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for hs in shared {
            let guard = hs.read().await;
            out.push(HostInfo {
                id: guard.id,
                name: guard.name.clone(),
                timezone: guard.timezone,
                rule_count: guard.rules.len(),
                exception_count: guard.exceptions.len(),
            });
        }
        out.sort_by_key(|h| h.id);
        out
    }

    pub async fn get_rules(&self, host_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        let hs = self.get_host(&host_id).ok_or(EngineError::InvalidHost(host_id))?;
        let guard = hs.read().await;
        Ok(guard.rules.clone())
    }

    pub async fn get_event_type_config(&self, id: Ulid) -> Result<EventType, EngineError> {
        let ets = self.get_event_type(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ets.read().await;
        Ok(guard.config.clone())
    }
}
