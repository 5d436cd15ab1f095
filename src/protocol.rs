//! Newline-delimited JSON protocol.
//!
//! Each request line is an object tagged by `op`; each response line is
//! `{"ok": true, "result": ...}` or `{"ok": false, "error": {"kind", "message"}}`.
//! Instants are RFC 3339, or naive `YYYY-MM-DDTHH:MM[:SS]` read in the
//! request's `timezone` (UTC when absent). Rule and exception clock times are
//! `"HH:MM"`, with `"24:00"` allowed as an end.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{BookingRequest, Engine, EngineError, SeriesRequest};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::tz;

/// `"HH:MM"` local clock times.
#[derive(Debug, Clone, Deserialize)]
pub struct ClockRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListSlots {
        event_type_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        #[serde(default)]
        timezone: Option<String>,
    },
    CreateBooking {
        event_type_id: Ulid,
        start: String,
        #[serde(default)]
        timezone: Option<String>,
        #[serde(default)]
        host_id: Option<Ulid>,
        #[serde(default)]
        invitee: String,
    },
    /// `count` occurrences from `start`, at the same wall-clock time in
    /// `timezone`.
    CreateRecurringBookings {
        event_type_id: Ulid,
        start: String,
        #[serde(default)]
        timezone: Option<String>,
        #[serde(default)]
        host_id: Option<Ulid>,
        #[serde(default)]
        invitee: String,
        recurrence: Recurrence,
        count: u32,
    },
    CancelBooking {
        id: Ulid,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        cancelled_by: CancelledBy,
    },
    CancelSeries {
        id: Ulid,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        cancelled_by: CancelledBy,
    },
    RescheduleBooking {
        id: Ulid,
        start: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    ConfirmBooking {
        id: Ulid,
    },
    CompleteBooking {
        id: Ulid,
    },
    MarkNoShow {
        id: Ulid,
    },
    GetBooking {
        id: Ulid,
    },
    BookingHistory {
        id: Ulid,
    },
    HostBookings {
        host_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    ConfirmedBookings {
        host_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    FreeWindows {
        host_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    CreateHost {
        id: Ulid,
        #[serde(default)]
        name: Option<String>,
        timezone: String,
    },
    UpdateHost {
        id: Ulid,
        #[serde(default)]
        name: Option<String>,
        timezone: String,
    },
    ListHosts,
    AddRule {
        id: Ulid,
        host_id: Ulid,
        weekday: u8,
        start: String,
        end: String,
    },
    RemoveRule {
        id: Ulid,
    },
    ListRules {
        host_id: Ulid,
    },
    /// No `hours` blocks the whole date.
    SetException {
        host_id: Ulid,
        date: NaiveDate,
        #[serde(default)]
        hours: Option<Vec<ClockRange>>,
    },
    ClearException {
        host_id: Ulid,
        date: NaiveDate,
    },
    CreateEventType {
        event_type: EventType,
    },
    UpdateEventType {
        event_type: EventType,
    },
    GetEventType {
        id: Ulid,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(err: &EngineError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"{e}"}}}}"#)
        })
    }
}

/// Booking as sent to clients: instants in RFC 3339 UTC.
#[derive(Debug, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub event_type_id: Ulid,
    pub host_id: Ulid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub invitee: String,
    pub state: BookingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub superseded_by: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<CancellationView>,
}

#[derive(Debug, Serialize)]
pub struct CancellationView {
    pub by: CancelledBy,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

fn utc(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            event_type_id: b.event_type_id,
            host_id: b.host_id,
            start: utc(b.span.start),
            end: utc(b.span.end),
            invitee: b.invitee,
            state: b.state,
            created_at: utc(b.created_at),
            updated_at: utc(b.updated_at),
            superseded_by: b.superseded_by,
            series_id: b.series_id,
            cancellation: b.cancellation.map(|c| CancellationView {
                by: c.by,
                reason: c.reason,
                at: utc(c.at),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct WindowView {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Parse `"HH:MM"` into minutes after local midnight. `"24:00"` is 1440.
pub fn parse_clock(input: &str) -> Result<u16, EngineError> {
    let bad = || EngineError::InvalidRequest(format!("bad clock time: {input} (expected HH:MM)"));
    let (h, m) = input.split_once(':').ok_or_else(bad)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(bad());
    }
    let h: u16 = h.parse().map_err(|_| bad())?;
    let m: u16 = m.parse().map_err(|_| bad())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

fn parse_range(range: &ClockRange) -> Result<LocalRange, EngineError> {
    Ok(LocalRange::new(parse_clock(&range.start)?, parse_clock(&range.end)?))
}

fn request_tz(name: Option<&str>) -> Result<Tz, EngineError> {
    name.map_or(Ok(Tz::UTC), tz::parse_timezone)
}

fn parse_span(start: &str, end: &str, timezone: Option<&str>) -> Result<Span, EngineError> {
    let tz = request_tz(timezone)?;
    let (start, end) = (tz::parse_instant(start, &tz)?, tz::parse_instant(end, &tz)?);
    if start >= end {
        return Err(EngineError::InvalidRange("start must be before end".into()));
    }
    Ok(Span::new(start, end))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::InvalidRequest(e.to_string()))
}

fn bookings(list: Vec<Booking>) -> Result<Value, EngineError> {
    to_value(list.into_iter().map(BookingView::from).collect::<Vec<_>>())
}

fn booking(b: Booking) -> Result<Value, EngineError> {
    to_value(BookingView::from(b))
}

/// Execute one request against the engine.
pub async fn handle_request(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    match req {
        Request::ListSlots {
            event_type_id,
            start_date,
            end_date,
            timezone,
        } => {
            let display = request_tz(timezone.as_deref())?;
            let slots = engine
                .list_slots(event_type_id, start_date, end_date, display)
                .await?;
            to_value(slots)
        }
        Request::CreateBooking {
            event_type_id,
            start,
            timezone,
            host_id,
            invitee,
        } => {
            let start = tz::parse_instant(&start, &request_tz(timezone.as_deref())?)?;
            let req = BookingRequest {
                event_type_id,
                start,
                host_id,
                invitee,
            };
            booking(engine.create_booking(req).await?)
        }
        Request::CreateRecurringBookings {
            event_type_id,
            start,
            timezone,
            host_id,
            invitee,
            recurrence,
            count,
        } => {
            let timezone = request_tz(timezone.as_deref())?;
            let start = tz::parse_instant(&start, &timezone)?;
            let series = SeriesRequest {
                booking: BookingRequest {
                    event_type_id,
                    start,
                    host_id,
                    invitee,
                },
                recurrence,
                count,
                timezone,
            };
            bookings(engine.create_recurring_bookings(series).await?)
        }
        Request::CancelBooking {
            id,
            reason,
            cancelled_by,
        } => booking(engine.cancel_booking(id, cancelled_by, reason).await?),
        Request::CancelSeries {
            id,
            reason,
            cancelled_by,
        } => bookings(engine.cancel_series(id, cancelled_by, reason).await?),
        Request::RescheduleBooking { id, start, timezone } => {
            let start = tz::parse_instant(&start, &request_tz(timezone.as_deref())?)?;
            booking(engine.reschedule_booking(id, start).await?)
        }
        Request::ConfirmBooking { id } => booking(engine.confirm_booking(id).await?),
        Request::CompleteBooking { id } => booking(engine.complete_booking(id).await?),
        Request::MarkNoShow { id } => booking(engine.mark_no_show(id).await?),
        Request::GetBooking { id } => booking(engine.get_booking(id).await?),
        Request::BookingHistory { id } => bookings(engine.booking_history(id).await?),
        Request::HostBookings {
            host_id,
            start,
            end,
            timezone,
        } => {
            let range = parse_span(&start, &end, timezone.as_deref())?;
            bookings(engine.host_bookings(host_id, range).await?)
        }
        Request::ConfirmedBookings {
            host_id,
            start,
            end,
            timezone,
        } => {
            let range = parse_span(&start, &end, timezone.as_deref())?;
            bookings(engine.confirmed_bookings(host_id, range).await?)
        }
        Request::FreeWindows {
            host_id,
            start,
            end,
            timezone,
        } => {
            let range = parse_span(&start, &end, timezone.as_deref())?;
            let windows: Vec<WindowView> = engine
                .free_windows(host_id, range)
                .await?
                .into_iter()
                .map(|w| WindowView {
                    start: utc(w.start),
                    end: utc(w.end),
                })
                .collect();
            to_value(windows)
        }
        Request::CreateHost { id, name, timezone } => {
            engine
                .create_host(id, name, tz::parse_timezone(&timezone)?)
                .await?;
            Ok(json!({ "id": id }))
        }
        Request::UpdateHost { id, name, timezone } => {
            engine
                .update_host(id, name, tz::parse_timezone(&timezone)?)
                .await?;
            Ok(json!({ "id": id }))
        }
        Request::ListHosts => {
            let hosts: Vec<Value> = engine
                .list_hosts()
                .await
                .into_iter()
                .map(|h| {
                    json!({
                        "id": h.id,
                        "name": h.name,
                        "timezone": h.timezone.name(),
                        "rules": h.rule_count,
                        "exceptions": h.exception_count,
                    })
                })
                .collect();
            Ok(Value::Array(hosts))
        }
        Request::AddRule {
            id,
            host_id,
            weekday,
            start,
            end,
        } => {
            let range = LocalRange::new(parse_clock(&start)?, parse_clock(&end)?);
            engine
                .add_rule(AvailabilityRule {
                    id,
                    host_id,
                    weekday,
                    range,
                })
                .await?;
            Ok(json!({ "id": id }))
        }
        Request::RemoveRule { id } => {
            let host_id = engine.remove_rule(id).await?;
            Ok(json!({ "id": id, "host_id": host_id }))
        }
        Request::ListRules { host_id } => to_value(engine.get_rules(host_id).await?),
        Request::SetException {
            host_id,
            date,
            hours,
        } => {
            let kind = match hours {
                None => ExceptionKind::Blocked,
                Some(ranges) => ExceptionKind::Hours(
                    ranges.iter().map(parse_range).collect::<Result<_, _>>()?,
                ),
            };
            engine
                .set_exception(AvailabilityException {
                    host_id,
                    date,
                    kind,
                })
                .await?;
            Ok(json!({ "host_id": host_id, "date": date }))
        }
        Request::ClearException { host_id, date } => {
            let cleared = engine.clear_exception(host_id, date).await?;
            Ok(json!({ "cleared": cleared }))
        }
        Request::CreateEventType { event_type } => {
            let id = event_type.id;
            engine.create_event_type(event_type).await?;
            Ok(json!({ "id": id }))
        }
        Request::UpdateEventType { event_type } => {
            let id = event_type.id;
            engine.update_event_type(event_type).await?;
            Ok(json!({ "id": id }))
        }
        Request::GetEventType { id } => to_value(engine.get_event_type_config(id).await?),
    }
}

/// Parse, execute and encode one request line, recording RED metrics.
pub async fn respond(engine: &Engine, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            let err = EngineError::InvalidRequest(e.to_string());
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                .increment(1);
            return Response::failure(&err);
        }
    };

    let op = observability::op_label(&req);
    let started = Instant::now();
    let result = handle_request(engine, req).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(value) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            Response::success(value)
        }
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "error")
                .increment(1);
            debug!("{op} failed: {e}");
            Response::failure(&e)
        }
    }
}

/// Serve one client until it disconnects. An oversized line ends the session.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(frame) = framed.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => respond(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let refusal = Response::failure(&EngineError::LimitExceeded("request line too long"));
                framed.send(refusal.to_line()).await?;
                break;
            }
            Err(e) => return Err(e),
        };
        framed.send(response.to_line()).await?;
    }
    Ok(())
}
