pub mod calendar;
mod conflict;
mod error;
pub mod interval;
pub mod lifecycle;
mod mutations;
mod queries;
pub mod recurrence;
pub mod selector;
pub mod slots;

pub use error::EngineError;
pub use lifecycle::Transition;
pub use mutations::{BookingRequest, SeriesRequest};
pub use slots::Slot;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::{BookingNotice, NotifyHub};
use crate::observability;
use crate::wal::Wal;

pub type SharedHostState = Arc<RwLock<HostState>>;
pub type SharedEventTypeState = Arc<RwLock<EventTypeState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that arrive while a flush is
/// being prepared share one fsync; any other command ends the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer; every caller in the batch sees the failure.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush failed for {} events: {e}", batch.len());
    }

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub hosts: DashMap<Ulid, SharedHostState>,
    pub event_types: DashMap<Ulid, SharedEventTypeState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    /// Reverse lookup: rule/booking id → host id
    pub(super) entity_to_host: DashMap<Ulid, Ulid>,
    /// Held shared by every commit and exclusively by compaction, so a
    /// snapshot never misses an append.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a host-scoped event. Caller holds the host lock.
fn apply_to_host(hs: &mut HostState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::HostUpdated { name, timezone, .. } => {
            hs.name = name.clone();
            hs.timezone = *timezone;
        }
        Event::RuleAdded { rule } => {
            entity_map.insert(rule.id, rule.host_id);
            hs.insert_rule(rule.clone());
        }
        Event::RuleRemoved { id, .. } => {
            hs.remove_rule(*id);
            entity_map.remove(id);
        }
        Event::ExceptionSet { exception } => {
            hs.exceptions.insert(exception.date, exception.kind.clone());
        }
        Event::ExceptionCleared { date, .. } => {
            hs.exceptions.remove(date);
        }
        Event::BookingCreated { booking, .. } => {
            entity_map.insert(booking.id, booking.host_id);
            hs.insert_booking(booking.clone());
        }
        Event::SeriesCreated { bookings, .. } => {
            for booking in bookings {
                entity_map.insert(booking.id, booking.host_id);
                hs.insert_booking(booking.clone());
            }
        }
        Event::BookingTransitioned { id, state, at, .. } => {
            if let Some(b) = hs.booking_mut(*id) {
                b.state = *state;
                b.updated_at = *at;
            }
        }
        Event::BookingsCancelled { ids, cancellation, .. } => {
            for id in ids {
                if let Some(b) = hs.booking_mut(*id) {
                    b.state = BookingState::Cancelled;
                    b.updated_at = cancellation.at;
                    b.cancellation = Some(cancellation.clone());
                }
            }
        }
        Event::BookingRescheduled { old_id, booking } => {
            if let Some(old) = hs.booking_mut(*old_id) {
                old.state = BookingState::Rescheduled;
                old.superseded_by = Some(booking.id);
                old.updated_at = booking.created_at;
            }
            entity_map.insert(booking.id, booking.host_id);
            hs.insert_booking(booking.clone());
        }
        // Host creation and event-type records live at the map level.
        Event::HostCreated { .. }
        | Event::EventTypeCreated { .. }
        | Event::EventTypeUpdated { .. }
        | Event::CursorRestored { .. } => {}
    }
}

/// Host an event applies to, for host-scoped events.
fn event_host_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::HostUpdated { id, .. } => Some(*id),
        Event::RuleAdded { rule } => Some(rule.host_id),
        Event::RuleRemoved { host_id, .. }
        | Event::ExceptionCleared { host_id, .. }
        | Event::BookingTransitioned { host_id, .. }
        | Event::BookingsCancelled { host_id, .. } => Some(*host_id),
        Event::ExceptionSet { exception } => Some(exception.host_id),
        Event::BookingCreated { booking, .. } | Event::BookingRescheduled { booking, .. } => {
            Some(booking.host_id)
        }
        Event::SeriesCreated { bookings, .. } => bookings.first().map(|b| b.host_id),
        Event::HostCreated { .. }
        | Event::EventTypeCreated { .. }
        | Event::EventTypeUpdated { .. }
        | Event::CursorRestored { .. } => None,
    }
}

fn created_notice(booking: &Booking) -> BookingNotice {
    BookingNotice {
        booking_id: booking.id,
        host_id: booking.host_id,
        event_type_id: booking.event_type_id,
        from: None,
        to: booking.state,
        at: booking.created_at,
    }
}

/// Booking changes an event produces, judged against the host state it is
/// about to be applied to.
fn notices_for(hs: &HostState, event: &Event) -> Vec<BookingNotice> {
    match event {
        Event::BookingCreated { booking, .. } => vec![created_notice(booking)],
        Event::SeriesCreated { bookings, .. } => bookings.iter().map(created_notice).collect(),
        Event::BookingsCancelled { host_id, ids, cancellation } => ids
            .iter()
            .filter_map(|id| hs.booking(*id))
            .map(|b| BookingNotice {
                booking_id: b.id,
                host_id: *host_id,
                event_type_id: b.event_type_id,
                from: Some(lifecycle::effective_state(b, cancellation.at)),
                to: BookingState::Cancelled,
                at: cancellation.at,
            })
            .collect(),
        Event::BookingTransitioned { id, host_id, state, at } => hs
            .booking(*id)
            .map(|b| BookingNotice {
                booking_id: *id,
                host_id: *host_id,
                event_type_id: b.event_type_id,
                from: Some(lifecycle::effective_state(b, *at)),
                to: *state,
                at: *at,
            })
            .into_iter()
            .collect(),
        Event::BookingRescheduled { old_id, booking } => {
            let mut out = Vec::with_capacity(2);
            if let Some(old) = hs.booking(*old_id) {
                out.push(BookingNotice {
                    booking_id: *old_id,
                    host_id: old.host_id,
                    event_type_id: old.event_type_id,
                    from: Some(old.state),
                    to: BookingState::Rescheduled,
                    at: booking.created_at,
                });
            }
            out.push(created_notice(booking));
            out
        }
        _ => Vec::new(),
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_host = DashMap::new();
        // Rebuild into plain maps first; nothing else can see them yet.
        let mut hosts: HashMap<Ulid, HostState> = HashMap::new();
        let mut event_types: HashMap<Ulid, EventTypeState> = HashMap::new();

        for event in &events {
            match event {
                Event::HostCreated { id, name, timezone } => {
                    hosts.insert(*id, HostState::new(*id, name.clone(), *timezone));
                }
                Event::EventTypeCreated { event_type } => {
                    event_types.insert(
                        event_type.id,
                        EventTypeState {
                            config: event_type.clone(),
                            cursor: None,
                        },
                    );
                }
                Event::EventTypeUpdated { event_type } => {
                    if let Some(ets) = event_types.get_mut(&event_type.id) {
                        ets.config = event_type.clone();
                    }
                }
                Event::CursorRestored { event_type_id, cursor } => {
                    if let Some(ets) = event_types.get_mut(event_type_id) {
                        ets.cursor = Some(*cursor);
                    }
                }
                other => {
                    let advanced = match other {
                        Event::BookingCreated { booking, cursor: Some(cursor) } => {
                            Some((booking.event_type_id, *cursor))
                        }
                        Event::SeriesCreated { bookings, cursor: Some(cursor) } => {
                            bookings.first().map(|b| (b.event_type_id, *cursor))
                        }
                        _ => None,
                    };
                    if let Some((event_type_id, cursor)) = advanced
                        && let Some(ets) = event_types.get_mut(&event_type_id)
                    {
                        ets.cursor = Some(cursor);
                    }
                    if let Some(host_id) = event_host_id(other)
                        && let Some(hs) = hosts.get_mut(&host_id)
                    {
                        apply_to_host(hs, other, &entity_to_host);
                    }
                }
            }
        }

        info!(
            "replayed {} WAL events: {} hosts, {} event types",
            events.len(),
            hosts.len(),
            event_types.len()
        );

        Ok(Self {
            hosts: hosts
                .into_iter()
                .map(|(id, hs)| (id, Arc::new(RwLock::new(hs))))
                .collect(),
            event_types: event_types
                .into_iter()
                .map(|(id, ets)| (id, Arc::new(RwLock::new(ets))))
                .collect(),
            wal_tx,
            notify,
            clock,
            entity_to_host,
            commit_gate: RwLock::new(()),
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_host(&self, id: &Ulid) -> Option<SharedHostState> {
        self.hosts.get(id).map(|e| e.value().clone())
    }

    pub fn get_event_type(&self, id: &Ulid) -> Option<SharedEventTypeState> {
        self.event_types.get(id).map(|e| e.value().clone())
    }

    pub fn get_host_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_host.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify for a host-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        hs: &mut HostState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let notices = notices_for(hs, event);
        apply_to_host(hs, event, &self.entity_to_host);
        for notice in &notices {
            self.notify.send(notice);
        }
        Ok(())
    }

    /// Lookup entity → host, get host, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<HostState>, EngineError> {
        let host_id = self
            .get_host_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let hs = self
            .get_host(&host_id)
            .ok_or(EngineError::NotFound(host_id))?;
        Ok(hs.write_owned().await)
    }
}
