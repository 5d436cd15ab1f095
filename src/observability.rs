use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotwise_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotwise_request_duration_seconds";

/// Counter: bookings created, including the replacement side of a reschedule.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotwise_bookings_created_total";

/// Counter: reservations rejected because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "slotwise_slot_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short metrics label for a request.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::ListSlots { .. } => "list_slots",
        Request::CreateBooking { .. } => "create_booking",
        Request::CreateRecurringBookings { .. } => "create_recurring_bookings",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::CancelSeries { .. } => "cancel_series",
        Request::RescheduleBooking { .. } => "reschedule_booking",
        Request::ConfirmBooking { .. } => "confirm_booking",
        Request::CompleteBooking { .. } => "complete_booking",
        Request::MarkNoShow { .. } => "mark_no_show",
        Request::GetBooking { .. } => "get_booking",
        Request::BookingHistory { .. } => "booking_history",
        Request::HostBookings { .. } => "host_bookings",
        Request::ConfirmedBookings { .. } => "confirmed_bookings",
        Request::FreeWindows { .. } => "free_windows",
        Request::CreateHost { .. } => "create_host",
        Request::UpdateHost { .. } => "update_host",
        Request::ListHosts => "list_hosts",
        Request::AddRule { .. } => "add_rule",
        Request::RemoveRule { .. } => "remove_rule",
        Request::ListRules { .. } => "list_rules",
        Request::SetException { .. } => "set_exception",
        Request::ClearException { .. } => "clear_exception",
        Request::CreateEventType { .. } => "create_event_type",
        Request::UpdateEventType { .. } => "update_event_type",
        Request::GetEventType { .. } => "get_event_type",
    }
}
