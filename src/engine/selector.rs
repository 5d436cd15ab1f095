//! Host assignment. Pure: callers gather candidates and load under their
//! locks and pass them in.

use std::collections::HashMap;

use ulid::Ulid;

use crate::model::{AssignmentPolicy, EventType};

use super::EngineError;

/// Inputs to host selection for one slot.
pub struct Selection<'a> {
    /// Hosts that can take the slot, any order.
    pub candidates: &'a [Ulid],
    /// Host requested by the caller, if any.
    pub choice: Option<Ulid>,
    /// Last RoundRobin assignment.
    pub cursor: Option<Ulid>,
    /// Active bookings per host inside the load window.
    pub load: &'a HashMap<Ulid, usize>,
}

pub fn select_host(event_type: &EventType, sel: &Selection<'_>) -> Result<Ulid, EngineError> {
    match &event_type.policy {
        AssignmentPolicy::SpecificHost { host_id } => pick_required(*host_id, sel.candidates),
        AssignmentPolicy::InviteeChoice => {
            let host = sel.choice.ok_or(EngineError::HostChoiceRequired)?;
            pick_required(host, sel.candidates)
        }
        AssignmentPolicy::LeastBusy => least_busy(sel.candidates, sel.load),
        AssignmentPolicy::RoundRobin => {
            round_robin(&event_type.eligible_host_ids, sel.cursor, sel.candidates)
        }
    }
}

fn pick_required(host: Ulid, candidates: &[Ulid]) -> Result<Ulid, EngineError> {
    if candidates.contains(&host) {
        Ok(host)
    } else {
        Err(EngineError::HostUnavailable(Some(host)))
    }
}

fn least_busy(candidates: &[Ulid], load: &HashMap<Ulid, usize>) -> Result<Ulid, EngineError> {
    candidates
        .iter()
        .min_by_key(|h| (load.get(h).copied().unwrap_or(0), **h))
        .copied()
        .ok_or(EngineError::HostUnavailable(None))
}

/// First candidate after `cursor` in eligibility order, wrapping. A cursor
/// that is no longer eligible restarts from the top.
fn round_robin(
    eligible: &[Ulid],
    cursor: Option<Ulid>,
    candidates: &[Ulid],
) -> Result<Ulid, EngineError> {
    let start = cursor
        .and_then(|c| eligible.iter().position(|h| *h == c))
        .map_or(0, |i| i + 1);
    (0..eligible.len())
        .map(|offset| eligible[(start + offset) % eligible.len()])
        .find(|h| candidates.contains(h))
        .ok_or(EngineError::HostUnavailable(None))
}
