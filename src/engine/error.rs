use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingState;

use super::lifecycle::Transition;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown host: {0}")]
    InvalidHost(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("slot conflicts with booking {0}")]
    SlotConflict(Ulid),
    #[error("{}", unavailable_message(.0))]
    HostUnavailable(Option<Ulid>),
    #[error("a host must be chosen for this event type")]
    HostChoiceRequired,
    #[error("cannot {action} a {from} booking")]
    InvalidState { from: BookingState, action: Transition },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn unavailable_message(host: &Option<Ulid>) -> String {
    match host {
        Some(id) => format!("host {id} is not available for this slot"),
        None => "no eligible host is available for this slot".to_string(),
    }
}

impl EngineError {
    /// Stable label for protocol responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidHost(_) => "invalid_host",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::HostUnavailable(_) => "host_unavailable",
            EngineError::HostChoiceRequired => "host_choice_required",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::InvalidConfig(_) => "invalid_config",
            EngineError::InvalidTimezone(_) => "invalid_timezone",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_readable() {
        let id = Ulid::new();
        assert_eq!(
            EngineError::SlotConflict(id).to_string(),
            format!("slot conflicts with booking {id}")
        );
        assert_eq!(
            EngineError::HostUnavailable(None).to_string(),
            "no eligible host is available for this slot"
        );
        let err = EngineError::InvalidState {
            from: BookingState::Completed,
            action: Transition::Cancel,
        };
        assert_eq!(err.to_string(), "cannot cancel a completed booking");
        assert_eq!(err.kind(), "invalid_state");
    }
}
