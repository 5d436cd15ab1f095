use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Every internal instant uses this type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

/// Minutes in a local day; the largest valid `LocalRange::end_min`.
pub const MINUTES_PER_DAY: u16 = 24 * 60;

pub fn minutes(n: u32) -> Ms {
    Ms::from(n) * MINUTE_MS
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// `[start - before, end + after)`.
    pub fn widen(&self, before: Ms, after: Ms) -> Span {
        Span::new(self.start - before, self.end + after)
    }

    /// Intersection with `bounds`, or `None` if they do not overlap.
    pub fn clamp(&self, bounds: &Span) -> Option<Span> {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end);
        (start < end).then(|| Span::new(start, end))
    }
}

/// A wall-clock range within one local day, in minutes since local midnight.
/// `end_min` may be 1440 (end of day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalRange {
    pub start_min: u16,
    pub end_min: u16,
}

impl LocalRange {
    pub fn new(start_min: u16, end_min: u16) -> Self {
        Self { start_min, end_min }
    }

    pub fn is_valid(&self) -> bool {
        self.start_min < self.end_min && self.end_min <= MINUTES_PER_DAY
    }

    pub fn overlaps(&self, other: &LocalRange) -> bool {
        self.start_min < other.end_min && other.start_min < self.end_min
    }
}

/// Weekly recurring availability. `weekday` 0 = Monday … 6 = Sunday,
/// interpreted in the owning host's timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub host_id: Ulid,
    pub weekday: u8,
    pub range: LocalRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// No availability at all on the date.
    Blocked,
    /// Replaces the weekday rules for the date.
    Hours(Vec<LocalRange>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub host_id: Ulid,
    pub date: NaiveDate,
    pub kind: ExceptionKind,
}

/// How a host is picked for a new booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    RoundRobin,
    LeastBusy,
    SpecificHost { host_id: Ulid },
    InviteeChoice,
}

fn default_horizon_days() -> u32 {
    60
}

fn default_granularity_min() -> u32 {
    15
}

fn default_load_window_days() -> u32 {
    7
}

fn default_auto_confirm() -> bool {
    true
}

fn default_max_attendees() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    pub duration_min: u32,
    #[serde(default)]
    pub buffer_before_min: u32,
    #[serde(default)]
    pub buffer_after_min: u32,
    #[serde(default)]
    pub min_notice_min: u32,
    #[serde(default = "default_horizon_days")]
    pub max_horizon_days: u32,
    #[serde(default = "default_granularity_min")]
    pub granularity_min: u32,
    pub policy: AssignmentPolicy,
    pub eligible_host_ids: Vec<Ulid>,
    #[serde(default)]
    pub location: Option<String>,
    /// New bookings start `confirmed` when true, `pending` otherwise.
    #[serde(default = "default_auto_confirm")]
    pub auto_confirm: bool,
    /// Active bookings allowed per UTC day across all hosts.
    #[serde(default)]
    pub max_bookings_per_day: Option<u32>,
    /// Forward window LeastBusy counts bookings over.
    #[serde(default = "default_load_window_days")]
    pub load_window_days: u32,
    /// Invitees that may share one slot on one host. Above 1 the event type
    /// is a group event: bookings at the exact same span share seats instead
    /// of conflicting.
    #[serde(default = "default_max_attendees")]
    pub max_attendees: u32,
}

/// Idle time kept around existing bookings when placing a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Buffers {
    pub before: Ms,
    pub after: Ms,
}

impl EventType {
    pub fn duration_ms(&self) -> Ms {
        minutes(self.duration_min)
    }

    pub fn granularity_ms(&self) -> Ms {
        minutes(self.granularity_min)
    }

    pub fn buffers(&self) -> Buffers {
        Buffers {
            before: minutes(self.buffer_before_min),
            after: minutes(self.buffer_after_min),
        }
    }

    /// Instants a slot must fit inside: `[now + min_notice, now + horizon]`.
    pub fn bookable_window(&self, now: Ms) -> Span {
        Span::new(
            now + minutes(self.min_notice_min),
            now + Ms::from(self.max_horizon_days) * DAY_MS,
        )
    }

    pub fn is_group(&self) -> bool {
        self.max_attendees > 1
    }

    pub fn initial_state(&self) -> BookingState {
        if self.auto_confirm {
            BookingState::Confirmed
        } else {
            BookingState::Pending
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rescheduled,
    NoShow,
}

impl BookingState {
    /// Only these states occupy a host's calendar.
    pub fn is_active(self) -> bool {
        matches!(self, BookingState::Pending | BookingState::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingState::Pending => "pending",
            BookingState::Confirmed => "confirmed",
            BookingState::Completed => "completed",
            BookingState::Cancelled => "cancelled",
            BookingState::Rescheduled => "rescheduled",
            BookingState::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spacing of a recurring series. Occurrences keep the first one's wall-clock
/// time in the requesting timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekly,
    Biweekly,
    /// Same day of month; short months clamp to their last day.
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    #[default]
    Invitee,
    Host,
    System,
}

/// Who cancelled a booking, when, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: CancelledBy,
    pub reason: Option<String>,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub event_type_id: Ulid,
    pub host_id: Ulid,
    pub span: Span,
    /// Opaque invitee payload; never interpreted here.
    pub invitee: String,
    pub state: BookingState,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Set when a reschedule replaced this booking.
    pub superseded_by: Option<Ulid>,
    /// First booking of the recurring series this one belongs to.
    pub series_id: Option<Ulid>,
    pub cancellation: Option<Cancellation>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Everything the engine knows about one host. Guarded by the host's lock.
#[derive(Debug, Clone)]
pub struct HostState {
    pub id: Ulid,
    pub name: Option<String>,
    pub timezone: Tz,
    pub rules: Vec<AvailabilityRule>,
    pub exceptions: BTreeMap<NaiveDate, ExceptionKind>,
    /// All bookings ever made on this host, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl HostState {
    pub fn new(id: Ulid, name: Option<String>, timezone: Tz) -> Self {
        Self {
            id,
            name,
            timezone,
            rules: Vec::new(),
            exceptions: BTreeMap::new(),
            bookings: Vec::new(),
        }
    }

    /// Rules for a weekday (0 = Monday), in start order.
    pub fn rules_for(&self, weekday: u8) -> impl Iterator<Item = &AvailabilityRule> {
        self.rules.iter().filter(move |r| r.weekday == weekday)
    }

    pub fn insert_rule(&mut self, rule: AvailabilityRule) {
        let pos = self
            .rules
            .partition_point(|r| (r.weekday, r.range) < (rule.weekday, rule.range));
        self.rules.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<AvailabilityRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (any state) whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Pending/confirmed bookings overlapping the query window.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.is_active())
    }
}

/// Event type plus its round-robin cursor. Guarded by one lock so the cursor
/// only moves together with the booking that advanced it.
#[derive(Debug, Clone)]
pub struct EventTypeState {
    pub config: EventType,
    /// Last host assigned by RoundRobin.
    pub cursor: Option<Ulid>,
}

/// The WAL record format. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HostCreated {
        id: Ulid,
        name: Option<String>,
        timezone: Tz,
    },
    HostUpdated {
        id: Ulid,
        name: Option<String>,
        timezone: Tz,
    },
    RuleAdded {
        rule: AvailabilityRule,
    },
    RuleRemoved {
        id: Ulid,
        host_id: Ulid,
    },
    ExceptionSet {
        exception: AvailabilityException,
    },
    ExceptionCleared {
        host_id: Ulid,
        date: NaiveDate,
    },
    EventTypeCreated {
        event_type: EventType,
    },
    EventTypeUpdated {
        event_type: EventType,
    },
    /// `cursor` is the new round-robin position when the booking advanced it.
    BookingCreated {
        booking: Booking,
        cursor: Option<Ulid>,
    },
    /// A whole recurring series, all on one host.
    SeriesCreated {
        bookings: Vec<Booking>,
        cursor: Option<Ulid>,
    },
    BookingTransitioned {
        id: Ulid,
        host_id: Ulid,
        state: BookingState,
        at: Ms,
    },
    BookingRescheduled {
        old_id: Ulid,
        booking: Booking,
    },
    BookingsCancelled {
        host_id: Ulid,
        ids: Vec<Ulid>,
        cancellation: Cancellation,
    },
    /// Emitted by compaction to restore a round-robin position.
    CursorRestored {
        event_type_id: Ulid,
        cursor: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub timezone: Tz,
    pub rule_count: usize,
    pub exception_count: usize,
}
