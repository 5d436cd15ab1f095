use ulid::Ulid;

use crate::model::*;

use super::interval::subtract_intervals;
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Seat sharing for group event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Seats {
    pub event_type_id: Ulid,
    pub capacity: u32,
}

/// How a candidate span is judged against a host's bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConflictRule {
    pub buffers: Buffers,
    pub seats: Option<Seats>,
}

impl ConflictRule {
    pub fn for_event_type(et: &EventType) -> Self {
        Self {
            buffers: et.buffers(),
            seats: et.is_group().then_some(Seats {
                event_type_id: et.id,
                capacity: et.max_attendees,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.seats.map_or(1, |s| s.capacity)
    }

    /// `b` holds a seat of `candidate` instead of blocking it.
    fn shares_seat(&self, b: &Booking, candidate: &Span) -> bool {
        self.seats
            .is_some_and(|s| s.event_type_id == b.event_type_id && b.span == *candidate)
    }
}

/// Window of booking spans whose buffered extent can touch `query`.
/// A booking `b` blocks `[b.start - before, b.end + after)`, so it matters
/// when `b.start < query.end + before` and `b.end > query.start - after`.
fn search_window(query: &Span, buffers: Buffers) -> Span {
    Span::new(query.start - buffers.after, query.end + buffers.before)
}

/// Buffered extents of the active bookings that can touch `query`, sorted by
/// start. `exclude` skips one booking (the one being rescheduled).
pub(crate) fn busy_spans(
    host: &HostState,
    query: &Span,
    buffers: Buffers,
    exclude: Option<Ulid>,
) -> Vec<(Ulid, Span)> {
    let mut busy: Vec<(Ulid, Span)> = host
        .active_overlapping(&search_window(query, buffers))
        .filter(|b| Some(b.id) != exclude)
        .map(|b| (b.id, b.span.widen(buffers.before, buffers.after)))
        .collect();
    busy.sort_by_key(|(_, s)| s.start);
    busy
}

/// Read path for individual event types: remove buffered active bookings
/// from `free` (sorted, disjoint).
pub(crate) fn subtract_busy(
    host: &HostState,
    free: &[Span],
    buffers: Buffers,
    exclude: Option<Ulid>,
) -> Vec<Span> {
    let (Some(first), Some(last)) = (free.first(), free.last()) else {
        return Vec::new();
    };
    let bounds = Span::new(first.start, last.end);
    let busy: Vec<Span> = busy_spans(host, &bounds, buffers, exclude)
        .into_iter()
        .map(|(_, s)| s)
        .collect();
    subtract_intervals(free, &busy)
}

/// Seats still open on `candidate`; 1 for a free individual slot.
/// `SlotConflict` names the first booking in the way, or the first seat
/// holder when a shared slot is full.
pub(crate) fn open_seats(
    host: &HostState,
    candidate: &Span,
    rule: ConflictRule,
    exclude: Option<Ulid>,
) -> Result<u32, EngineError> {
    let buffers = rule.buffers;
    let mut holders = Vec::new();
    for b in host
        .active_overlapping(&search_window(candidate, buffers))
        .filter(|b| Some(b.id) != exclude)
    {
        if rule.shares_seat(b, candidate) {
            holders.push(b.id);
        } else if b.span.widen(buffers.before, buffers.after).overlaps(candidate) {
            return Err(EngineError::SlotConflict(b.id));
        }
    }
    let taken = holders.len() as u32;
    match holders.first() {
        Some(first) if taken >= rule.capacity() => Err(EngineError::SlotConflict(*first)),
        _ => Ok(rule.capacity() - taken),
    }
}

/// Write path: `SlotConflict` unless `candidate` has a seat left.
pub(crate) fn check_no_conflict(
    host: &HostState,
    candidate: &Span,
    rule: ConflictRule,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    open_seats(host, candidate, rule, exclude).map(|_| ())
}
