//! Booking lifecycle.
//!
//! ```text
//! pending ──confirm──▶ confirmed ──complete──▶ completed
//!    │                    │ ├──reschedule──▶ rescheduled
//!    │                    │ └──no_show─────▶ no_show
//!    └──────cancel────────┴──cancel────────▶ cancelled
//! ```
//!
//! `completed` is also derived on read: a confirmed booking whose end has
//! passed reports as completed. Confirm, cancel and reschedule are judged on
//! that view; complete and no-show are judged on the stored state, since both
//! are normally recorded after the meeting. Cancel and reschedule also close
//! once the booking has started.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Booking, BookingState, Ms};

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Confirm,
    Cancel,
    Complete,
    NoShow,
    Reschedule,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transition::Confirm => "confirm",
            Transition::Cancel => "cancel",
            Transition::Complete => "complete",
            Transition::NoShow => "mark as no-show",
            Transition::Reschedule => "reschedule",
        })
    }
}

/// State a booking reports at `now`.
pub fn effective_state(booking: &Booking, now: Ms) -> BookingState {
    match booking.state {
        BookingState::Confirmed if booking.span.end <= now => BookingState::Completed,
        state => state,
    }
}

/// Copy of `booking` carrying its derived state.
pub fn effective(booking: &Booking, now: Ms) -> Booking {
    let mut view = booking.clone();
    view.state = effective_state(booking, now);
    view
}

pub fn next_state(from: BookingState, action: Transition) -> Result<BookingState, EngineError> {
    use BookingState::*;
    let to = match (from, action) {
        (Pending, Transition::Confirm) => Confirmed,
        (Pending | Confirmed, Transition::Cancel) => Cancelled,
        (Confirmed, Transition::Complete) => Completed,
        (Confirmed, Transition::NoShow) => NoShow,
        (Confirmed, Transition::Reschedule) => Rescheduled,
        _ => return Err(EngineError::InvalidState { from, action }),
    };
    Ok(to)
}

/// Validate `action` against the booking's state at `now`.
pub fn apply(booking: &Booking, action: Transition, now: Ms) -> Result<BookingState, EngineError> {
    let from = match action {
        Transition::Complete | Transition::NoShow => booking.state,
        _ => effective_state(booking, now),
    };
    let to = next_state(from, action)?;
    if matches!(action, Transition::Cancel | Transition::Reschedule) && booking.span.start <= now {
        return Err(EngineError::InvalidState { from, action });
    }
    Ok(to)
}
