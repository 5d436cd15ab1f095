use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tokio::sync::{oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::calendar::{self, validate_exception, validate_rule};
use super::conflict::{check_no_conflict, validate_span, ConflictRule};
use super::interval::covers;
use super::lifecycle::{self, Transition};
use super::recurrence;
use super::selector::{select_host, Selection};
use super::slots::utc_day;
use super::{Engine, EngineError, WalCommand};

/// A reservation attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub event_type_id: Ulid,
    pub start: Ms,
    /// Required for InviteeChoice, ignored otherwise.
    #[serde(default)]
    pub host_id: Option<Ulid>,
    #[serde(default)]
    pub invitee: String,
}

/// A recurring reservation: `count` occurrences of `booking`, spaced by
/// `recurrence` at the first start's wall-clock time in `timezone`.
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub booking: BookingRequest,
    pub recurrence: Recurrence,
    pub count: u32,
    pub timezone: Tz,
}

type HostGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<HostState>>;

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(super) fn validate_event_type(engine: &Engine, et: &EventType) -> Result<(), EngineError> {
    check_name(&et.name)?;
    if let Some(loc) = &et.location
        && loc.len() > MAX_LOCATION_LEN
    {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    if et.duration_min == 0 || et.duration_min > MAX_DURATION_MIN {
        return Err(EngineError::InvalidConfig(format!(
            "duration must be 1-{MAX_DURATION_MIN} minutes"
        )));
    }
    if et.granularity_min == 0 || et.granularity_min > MAX_DURATION_MIN {
        return Err(EngineError::InvalidConfig(format!(
            "granularity must be 1-{MAX_DURATION_MIN} minutes"
        )));
    }
    if et.max_horizon_days == 0 || et.max_horizon_days > MAX_HORIZON_DAYS {
        return Err(EngineError::InvalidConfig(format!(
            "horizon must be 1-{MAX_HORIZON_DAYS} days"
        )));
    }
    if et.buffer_before_min > MAX_BUFFER_MIN || et.buffer_after_min > MAX_BUFFER_MIN {
        return Err(EngineError::InvalidConfig("buffer too long".into()));
    }
    if et.min_notice_min > MAX_NOTICE_MIN {
        return Err(EngineError::InvalidConfig("minimum notice too long".into()));
    }
    if et.load_window_days == 0 || et.load_window_days > MAX_LOAD_WINDOW_DAYS {
        return Err(EngineError::InvalidConfig(format!(
            "load window must be 1-{MAX_LOAD_WINDOW_DAYS} days"
        )));
    }
    if et.max_attendees == 0 || et.max_attendees > MAX_ATTENDEES {
        return Err(EngineError::InvalidConfig(format!(
            "max attendees must be 1-{MAX_ATTENDEES}"
        )));
    }
    if et.max_bookings_per_day == Some(0) {
        return Err(EngineError::InvalidConfig(
            "daily cap must be positive when set".into(),
        ));
    }
    if minutes(et.min_notice_min) + et.duration_ms() > Ms::from(et.max_horizon_days) * DAY_MS {
        return Err(EngineError::InvalidConfig(
            "minimum notice leaves no room inside the horizon".into(),
        ));
    }

    if et.eligible_host_ids.is_empty() {
        return Err(EngineError::InvalidConfig("no eligible hosts".into()));
    }
    if et.eligible_host_ids.len() > MAX_ELIGIBLE_HOSTS {
        return Err(EngineError::LimitExceeded("too many eligible hosts"));
    }
    let mut seen = HashSet::new();
    for host_id in &et.eligible_host_ids {
        if !seen.insert(*host_id) {
            return Err(EngineError::InvalidConfig(format!(
                "host {host_id} listed twice"
            )));
        }
        if !engine.hosts.contains_key(host_id) {
            return Err(EngineError::InvalidHost(*host_id));
        }
    }
    if let AssignmentPolicy::SpecificHost { host_id } = &et.policy
        && !seen.contains(host_id)
    {
        return Err(EngineError::InvalidConfig(format!(
            "specific host {host_id} is not eligible"
        )));
    }
    Ok(())
}

/// Active bookings of `event_type_id` starting on the UTC day of `at`.
fn bookings_on_day(guards: &HostGuards, event_type_id: Ulid, at: Ms, exclude: Option<Ulid>) -> u32 {
    let day = utc_day(at);
    let span = Span::new(day * DAY_MS, (day + 1) * DAY_MS);
    let mut count = 0;
    for hs in guards.values() {
        count += hs
            .active_overlapping(&span)
            .filter(|b| b.event_type_id == event_type_id)
            .filter(|b| utc_day(b.span.start) == day)
            .filter(|b| Some(b.id) != exclude)
            .count() as u32;
    }
    count
}

/// Active bookings (any event type) per host starting in `window`.
fn host_load(guards: &HostGuards, window: &Span) -> HashMap<Ulid, usize> {
    guards
        .iter()
        .map(|(id, hs)| {
            let n = hs
                .active_overlapping(window)
                .filter(|b| window.contains_instant(b.span.start))
                .count();
            (*id, n)
        })
        .collect()
}

/// Whether a host can take a requested span.
enum Fit {
    Free,
    OffCalendar,
    Conflict(Ulid),
}

fn host_fit(hs: &HostState, span: &Span, rule: ConflictRule, exclude: Option<Ulid>) -> Result<Fit, EngineError> {
    let free = calendar::free_windows(hs, span)?;
    if !covers(&free, span) {
        return Ok(Fit::OffCalendar);
    }
    match check_no_conflict(hs, span, rule, exclude) {
        Ok(()) => Ok(Fit::Free),
        Err(EngineError::SlotConflict(id)) => Ok(Fit::Conflict(id)),
        Err(e) => Err(e),
    }
}

/// A host fits a series only if it fits every occurrence.
fn series_fit(hs: &HostState, spans: &[Span], rule: ConflictRule) -> Result<Fit, EngineError> {
    for span in spans {
        match host_fit(hs, span, rule, None)? {
            Fit::Free => {}
            other => return Ok(other),
        }
    }
    Ok(Fit::Free)
}

fn check_reason(reason: &Option<String>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("cancellation reason too long"));
    }
    Ok(())
}

impl Engine {
    /// Write locks on `ids`, acquired in ascending id order.
    async fn lock_hosts(&self, ids: impl IntoIterator<Item = Ulid>) -> Result<HostGuards, EngineError> {
        let ordered: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut guards = BTreeMap::new();
        for id in ordered {
            let hs = self.get_host(&id).ok_or(EngineError::InvalidHost(id))?;
            guards.insert(id, hs.write_owned().await);
        }
        Ok(guards)
    }

    // ── Hosts and calendars ──────────────────────────────────────

    pub async fn create_host(&self, id: Ulid, name: Option<String>, timezone: Tz) -> Result<(), EngineError> {
        check_name(&name)?;
        if self.hosts.len() >= MAX_HOSTS {
            return Err(EngineError::LimitExceeded("too many hosts"));
        }
        let _gate = self.commit_gate.read().await;

        // The id is claimed before the append; readers wait on the lock
        // until the record is durable.
        let shared = Arc::new(RwLock::new(HostState::new(id, name.clone(), timezone)));
        let guard = shared.clone().write_owned().await;
        match self.hosts.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }

        let event = Event::HostCreated { id, name, timezone };
        if let Err(e) = self.wal_append(&event).await {
            self.hosts.remove(&id);
            return Err(e);
        }
        drop(guard);
        info!("host {id} created in {timezone}");
        Ok(())
    }

    pub async fn update_host(&self, id: Ulid, name: Option<String>, timezone: Tz) -> Result<(), EngineError> {
        check_name(&name)?;
        let _gate = self.commit_gate.read().await;
        let hs = self.get_host(&id).ok_or(EngineError::InvalidHost(id))?;
        let mut guard = hs.write().await;
        let event = Event::HostUpdated { id, name, timezone };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_rule(&self, rule: AvailabilityRule) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if self.entity_to_host.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        let hs = self
            .get_host(&rule.host_id)
            .ok_or(EngineError::InvalidHost(rule.host_id))?;
        let mut guard = hs.write().await;
        validate_rule(&guard, &rule)?;

        debug!("rule {} on host {} weekday {}", rule.id, rule.host_id, rule.weekday);
        let event = Event::RuleAdded { rule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let host_id = guard.id;
        let event = Event::RuleRemoved { id, host_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(host_id)
    }

    pub async fn set_exception(&self, exception: AvailabilityException) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let hs = self
            .get_host(&exception.host_id)
            .ok_or(EngineError::InvalidHost(exception.host_id))?;
        let mut guard = hs.write().await;
        validate_exception(&guard, &exception)?;

        let mut exception = exception;
        if let ExceptionKind::Hours(ranges) = &mut exception.kind {
            ranges.sort();
        }
        let event = Event::ExceptionSet { exception };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Drop the exception on `date`. Returns false if there was none.
    pub async fn clear_exception(&self, host_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let hs = self.get_host(&host_id).ok_or(EngineError::InvalidHost(host_id))?;
        let mut guard = hs.write().await;
        if !guard.exceptions.contains_key(&date) {
            return Ok(false);
        }
        let event = Event::ExceptionCleared { host_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    // ── Event types ─────────────────────────────────────────────

    pub async fn create_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        if self.event_types.len() >= MAX_EVENT_TYPES {
            return Err(EngineError::LimitExceeded("too many event types"));
        }
        validate_event_type(self, &event_type)?;
        let _gate = self.commit_gate.read().await;

        let id = event_type.id;
        let shared = Arc::new(RwLock::new(EventTypeState {
            config: event_type.clone(),
            cursor: None,
        }));
        let guard = shared.clone().write_owned().await;
        match self.event_types.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(shared);
            }
        }

        let event = Event::EventTypeCreated { event_type };
        if let Err(e) = self.wal_append(&event).await {
            self.event_types.remove(&id);
            return Err(e);
        }
        drop(guard);
        info!("event type {id} created");
        Ok(())
    }

    /// Replace an event type's configuration. Existing bookings are untouched;
    /// the round-robin cursor carries over.
    pub async fn update_event_type(&self, event_type: EventType) -> Result<(), EngineError> {
        validate_event_type(self, &event_type)?;
        let _gate = self.commit_gate.read().await;
        let ets = self
            .get_event_type(&event_type.id)
            .ok_or(EngineError::NotFound(event_type.id))?;
        let mut guard = ets.write().await;

        let event = Event::EventTypeUpdated { event_type: event_type.clone() };
        self.wal_append(&event).await?;
        guard.config = event_type;
        Ok(())
    }

    // ── Reservations ────────────────────────────────────────────

    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let event_type_id = req.event_type_id;
        self.reserve(req, None)
            .await?
            .pop()
            .ok_or(EngineError::NotFound(event_type_id))
    }

    /// Book every occurrence of a series on one host, or none of them.
    pub async fn create_recurring_bookings(&self, series: SeriesRequest) -> Result<Vec<Booking>, EngineError> {
        if series.count == 0 {
            return Err(EngineError::InvalidRequest(
                "a series needs at least one occurrence".into(),
            ));
        }
        if series.count > MAX_SERIES_LEN {
            return Err(EngineError::LimitExceeded("too many occurrences in series"));
        }
        let plan = (series.recurrence, series.count, series.timezone);
        self.reserve(series.booking, Some(plan)).await
    }

    async fn reserve(
        &self,
        req: BookingRequest,
        series: Option<(Recurrence, u32, Tz)>,
    ) -> Result<Vec<Booking>, EngineError> {
        if req.invitee.len() > MAX_INVITEE_LEN {
            return Err(EngineError::LimitExceeded("invitee too long"));
        }
        let _gate = self.commit_gate.read().await;
        let ets = self
            .get_event_type(&req.event_type_id)
            .ok_or(EngineError::NotFound(req.event_type_id))?;
        let mut et_guard = ets.write().await;
        let et = et_guard.config.clone();
        let rule = ConflictRule::for_event_type(&et);

        let now = self.now();
        let starts = match series {
            Some((recurrence, count, tz)) => recurrence::occurrences(req.start, recurrence, count, &tz)?,
            None => vec![req.start],
        };
        let spans: Vec<Span> = starts
            .iter()
            .map(|start| Span::new(*start, start + et.duration_ms()))
            .collect();
        for span in &spans {
            validate_span(span)?;
            check_bookable(&et, span, now)?;
        }
        let buffers = rule.buffers;
        if spans
            .windows(2)
            .any(|w| w[1].overlaps(&w[0].widen(buffers.before, buffers.after)))
        {
            return Err(EngineError::InvalidRange(
                "series occurrences overlap each other".into(),
            ));
        }

        // Hosts the policy lets us consider, before looking at calendars.
        let considered: Vec<Ulid> = match &et.policy {
            AssignmentPolicy::SpecificHost { host_id } => vec![*host_id],
            AssignmentPolicy::InviteeChoice => {
                let host = req.host_id.ok_or(EngineError::HostChoiceRequired)?;
                if !et.eligible_host_ids.contains(&host) {
                    return Err(EngineError::HostUnavailable(Some(host)));
                }
                vec![host]
            }
            AssignmentPolicy::RoundRobin | AssignmentPolicy::LeastBusy => {
                et.eligible_host_ids.clone()
            }
        };

        let mut guards = self.lock_hosts(et.eligible_host_ids.iter().copied()).await?;

        if let Some(cap) = et.max_bookings_per_day {
            let mut added: HashMap<i64, u32> = HashMap::new();
            for span in &spans {
                let same_day = added.entry(utc_day(span.start)).or_default();
                if bookings_on_day(&guards, et.id, span.start, None) + *same_day >= cap {
                    debug!("event type {} is full on {}", et.id, span.start);
                    return Err(EngineError::HostUnavailable(None));
                }
                *same_day += 1;
            }
        }

        let mut candidates = Vec::new();
        let mut conflict = None;
        for host_id in &considered {
            let Some(hs) = guards.get(host_id) else { continue };
            match series_fit(hs, &spans, rule)? {
                Fit::Free => candidates.push(*host_id),
                Fit::Conflict(id) => {
                    conflict.get_or_insert(id);
                }
                Fit::OffCalendar => {}
            }
        }

        let load = match et.policy {
            AssignmentPolicy::LeastBusy => {
                let window = Span::new(now, now + Ms::from(et.load_window_days) * DAY_MS);
                host_load(&guards, &window)
            }
            _ => HashMap::new(),
        };

        let selection = Selection {
            candidates: &candidates,
            choice: req.host_id,
            cursor: et_guard.cursor,
            load: &load,
        };
        // A calendar that fits but is booked reports the booking in the way.
        let host_id = match (select_host(&et, &selection), conflict) {
            (Ok(id), _) => id,
            (Err(EngineError::HostUnavailable(_)), Some(blocker)) => {
                metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                debug!("reservation at {} for {} conflicts with {blocker}", req.start, et.id);
                return Err(EngineError::SlotConflict(blocker));
            }
            (Err(e), _) => return Err(e),
        };

        let Some(hs) = guards.get_mut(&host_id) else {
            return Err(EngineError::InvalidHost(host_id));
        };
        if hs.bookings.len() + spans.len() > MAX_BOOKINGS_PER_HOST {
            return Err(EngineError::LimitExceeded("too many bookings on host"));
        }

        let first_id = Ulid::new();
        let series_id = series.map(|_| first_id);
        let bookings: Vec<Booking> = spans
            .iter()
            .enumerate()
            .map(|(i, span)| Booking {
                id: if i == 0 { first_id } else { Ulid::new() },
                event_type_id: et.id,
                host_id,
                span: *span,
                invitee: req.invitee.clone(),
                state: et.initial_state(),
                created_at: now,
                updated_at: now,
                superseded_by: None,
                series_id,
                cancellation: None,
            })
            .collect();
        let cursor = matches!(et.policy, AssignmentPolicy::RoundRobin).then_some(host_id);
        let event = match (series, bookings.as_slice()) {
            (None, [booking]) => Event::BookingCreated {
                booking: booking.clone(),
                cursor,
            },
            _ => Event::SeriesCreated {
                bookings: bookings.clone(),
                cursor,
            },
        };
        self.persist_and_apply(hs, &event).await?;
        if cursor.is_some() {
            et_guard.cursor = cursor;
        }

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(bookings.len() as u64);
        match series_id {
            Some(sid) => info!("series {sid} of {} on host {host_id} from {}", bookings.len(), req.start),
            None => info!("booking {first_id} on host {host_id} at {}", req.start),
        }
        Ok(bookings)
    }

    /// Move a confirmed booking to `new_start` on the same host. The old
    /// booking becomes `rescheduled` and points at the new one.
    pub async fn reschedule_booking(&self, id: Ulid, new_start: Ms) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let host_id = self.get_host_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let event_type_id = {
            let hs = self.get_host(&host_id).ok_or(EngineError::NotFound(host_id))?;
            let guard = hs.read().await;
            guard.booking(id).ok_or(EngineError::NotFound(id))?.event_type_id
        };

        let ets = self
            .get_event_type(&event_type_id)
            .ok_or(EngineError::NotFound(event_type_id))?;
        // Held for the whole reservation; serializes daily-cap counting.
        let et_guard = ets.write().await;
        let et = et_guard.config.clone();

        let mut guards = self
            .lock_hosts(et.eligible_host_ids.iter().copied().chain([host_id]))
            .await?;

        let now = self.now();
        let old = guards
            .get(&host_id)
            .and_then(|hs| hs.booking(id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        lifecycle::apply(&old, Transition::Reschedule, now)?;
        // Moving closes at the same notice new bookings need.
        if old.span.start <= now + minutes(et.min_notice_min) {
            return Err(EngineError::InvalidState {
                from: old.state,
                action: Transition::Reschedule,
            });
        }

        let span = Span::new(new_start, new_start + et.duration_ms());
        validate_span(&span)?;
        check_bookable(&et, &span, now)?;

        if let Some(cap) = et.max_bookings_per_day
            && bookings_on_day(&guards, et.id, span.start, Some(id)) >= cap
        {
            return Err(EngineError::HostUnavailable(None));
        }

        let Some(hs) = guards.get_mut(&host_id) else {
            return Err(EngineError::NotFound(host_id));
        };
        match host_fit(hs, &span, ConflictRule::for_event_type(&et), Some(id))? {
            Fit::Free => {}
            Fit::OffCalendar => return Err(EngineError::HostUnavailable(Some(host_id))),
            Fit::Conflict(blocker) => {
                metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SlotConflict(blocker));
            }
        }

        let booking = Booking {
            id: Ulid::new(),
            event_type_id: et.id,
            host_id,
            span,
            invitee: old.invitee.clone(),
            state: BookingState::Confirmed,
            created_at: now,
            updated_at: now,
            superseded_by: None,
            series_id: old.series_id,
            cancellation: None,
        };
        let event = Event::BookingRescheduled { old_id: id, booking: booking.clone() };
        self.persist_and_apply(hs, &event).await?;

        info!("booking {id} rescheduled to {} as {}", span.start, booking.id);
        Ok(booking)
    }

    // ── Lifecycle transitions ───────────────────────────────────

    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, Transition::Confirm).await
    }

    pub async fn cancel_booking(
        &self,
        id: Ulid,
        by: CancelledBy,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.cancel(id, by, reason, false)
            .await?
            .pop()
            .ok_or(EngineError::NotFound(id))
    }

    /// Cancel every occurrence of `id`'s series that can still be cancelled.
    /// A booking outside any series is cancelled alone.
    pub async fn cancel_series(
        &self,
        id: Ulid,
        by: CancelledBy,
        reason: Option<String>,
    ) -> Result<Vec<Booking>, EngineError> {
        self.cancel(id, by, reason, true).await
    }

    async fn cancel(
        &self,
        id: Ulid,
        by: CancelledBy,
        reason: Option<String>,
        whole_series: bool,
    ) -> Result<Vec<Booking>, EngineError> {
        check_reason(&reason)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let now = self.now();
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;

        let mut ids: Vec<Ulid> = match booking.series_id.filter(|_| whole_series) {
            Some(series) => guard
                .bookings
                .iter()
                .filter(|b| b.series_id == Some(series))
                .filter(|b| lifecycle::apply(b, Transition::Cancel, now).is_ok())
                .map(|b| b.id)
                .collect(),
            None => Vec::new(),
        };
        if ids.is_empty() {
            lifecycle::apply(booking, Transition::Cancel, now)?;
            ids.push(id);
        }

        let event = Event::BookingsCancelled {
            host_id: guard.id,
            ids: ids.clone(),
            cancellation: Cancellation { by, reason, at: now },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("cancelled {} booking(s) starting from {id}", ids.len());

        Ok(ids
            .iter()
            .filter_map(|i| guard.booking(*i))
            .map(|b| lifecycle::effective(b, now))
            .collect())
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, Transition::Complete).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, Transition::NoShow).await
    }

    async fn transition(&self, id: Ulid, action: Transition) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_entity_write(&id).await?;
        let now = self.now();
        let booking = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        let state = lifecycle::apply(booking, action, now)?;

        let event = Event::BookingTransitioned {
            id,
            host_id: guard.id,
            state,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("booking {id}: {action} -> {state}");

        guard
            .booking(id)
            .map(|b| lifecycle::effective(b, now))
            .ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ─────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        let mut bookings = Vec::new();

        let mut host_ids: Vec<Ulid> = self.hosts.iter().map(|e| *e.key()).collect();
        host_ids.sort();
        for id in host_ids {
            let Some(hs) = self.get_host(&id) else { continue };
            let guard = hs.read().await;
            events.push(Event::HostCreated {
                id: guard.id,
                name: guard.name.clone(),
                timezone: guard.timezone,
            });
            for rule in &guard.rules {
                events.push(Event::RuleAdded { rule: rule.clone() });
            }
            for (date, kind) in &guard.exceptions {
                events.push(Event::ExceptionSet {
                    exception: AvailabilityException {
                        host_id: guard.id,
                        date: *date,
                        kind: kind.clone(),
                    },
                });
            }
            bookings.extend(guard.bookings.iter().cloned());
        }

        let mut cursors = Vec::new();
        let mut et_ids: Vec<Ulid> = self.event_types.iter().map(|e| *e.key()).collect();
        et_ids.sort();
        for id in et_ids {
            let Some(ets) = self.get_event_type(&id) else { continue };
            let guard = ets.read().await;
            events.push(Event::EventTypeCreated { event_type: guard.config.clone() });
            if let Some(cursor) = guard.cursor {
                cursors.push(Event::CursorRestored { event_type_id: id, cursor });
            }
        }

        // Bookings go in as stored, state and supersession links included.
        bookings.sort_by_key(|b| (b.created_at, b.id));
        events.extend(
            bookings
                .into_iter()
                .map(|booking| Event::BookingCreated { booking, cursor: None }),
        );
        events.extend(cursors);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Slot must start after the minimum notice and end inside the horizon.
fn check_bookable(et: &EventType, span: &Span, now: Ms) -> Result<(), EngineError> {
    let window = et.bookable_window(now);
    if span.start < window.start {
        return Err(EngineError::InvalidRange(format!(
            "start is inside the {} minute minimum notice",
            et.min_notice_min
        )));
    }
    if span.end > window.end {
        return Err(EngineError::InvalidRange(format!(
            "slot ends beyond the {} day horizon",
            et.max_horizon_days
        )));
    }
    Ok(())
}
