use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingState, Ms};

const CHANNEL_CAPACITY: usize = 256;

/// One booking state change. `from` is `None` for a new booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub booking_id: Ulid,
    pub host_id: Ulid,
    pub event_type_id: Ulid,
    pub from: Option<BookingState>,
    pub to: BookingState,
    pub at: Ms,
}

/// Broadcast hub for booking changes, per host plus a feed of everything.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingNotice>>,
    all: broadcast::Sender<BookingNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one host's bookings. Creates the channel if needed.
    pub fn subscribe(&self, host_id: Ulid) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(host_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every booking change in the engine.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingNotice> {
        self.all.subscribe()
    }

    /// Publish a notice. No-op if nobody is listening.
    pub fn send(&self, notice: &BookingNotice) {
        if let Some(sender) = self.channels.get(&notice.host_id) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice.clone());
    }
}
