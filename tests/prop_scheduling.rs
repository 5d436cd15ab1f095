use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use proptest::prelude::*;
use ulid::Ulid;

use slotwise::clock::ManualClock;
use slotwise::engine::{BookingRequest, Engine, EngineError};
use slotwise::model::*;
use slotwise::notify::NotifyHub;
use slotwise::tz;

/// 2026-03-02T00:00:00Z, a Monday.
const MON: Ms = 1_772_409_600_000;
const H: Ms = 3_600_000;

fn fresh_engine(now: Ms) -> Engine {
    let dir = std::env::temp_dir().join("slotwise_prop");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.wal", Ulid::new()));
    Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(ManualClock::new(now))).unwrap()
}

async fn open_host(engine: &Engine, tz: Tz, start_min: u16, end_min: u16) -> Ulid {
    let id = Ulid::new();
    engine.create_host(id, None, tz).await.unwrap();
    for weekday in 0..7 {
        engine
            .add_rule(AvailabilityRule {
                id: Ulid::new(),
                host_id: id,
                weekday,
                range: LocalRange::new(start_min, end_min),
            })
            .await
            .unwrap();
    }
    id
}

fn event_type(hosts: Vec<Ulid>) -> EventType {
    EventType {
        id: Ulid::new(),
        name: None,
        duration_min: 30,
        buffer_before_min: 0,
        buffer_after_min: 0,
        min_notice_min: 0,
        max_horizon_days: 60,
        granularity_min: 15,
        policy: AssignmentPolicy::RoundRobin,
        eligible_host_ids: hosts,
        location: None,
        auto_confirm: true,
        max_bookings_per_day: None,
        load_window_days: 7,
        max_attendees: 1,
    }
}

fn req(event_type_id: Ulid, start: Ms) -> BookingRequest {
    BookingRequest {
        event_type_id,
        start,
        host_id: None,
        invitee: String::new(),
    }
}

fn zones() -> impl Strategy<Value = Tz> {
    prop::sample::select(vec![
        Tz::UTC,
        chrono_tz::America::New_York,
        chrono_tz::Europe::Berlin,
        chrono_tz::Australia::Lord_Howe,
        chrono_tz::Asia::Kolkata,
        chrono_tz::America::Sao_Paulo,
    ])
}

fn day(offset: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap() + chrono::TimeDelta::days(offset.into())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Listed slots sit inside notice and horizon, are reproducible, and the
    /// first one can actually be booked. Bookings made along the way keep
    /// their buffers pairwise.
    #[test]
    fn listing_and_booking_agree(
        host_tz in zones(),
        display_tz in zones(),
        open in 0u16..48,
        hours in 2u16..10,
        duration in prop::sample::select(vec![15u32, 30, 45, 60]),
        step in prop::sample::select(vec![5u32, 10, 15, 30]),
        before in 0u32..30,
        after in 0u32..30,
        notice_h in 0u32..72,
        horizon in 1u32..10,
        attempts in prop::collection::vec(0i64..(7 * 96), 0..12),
    ) {
        let start_min = open * 15;
        let end_min = (start_min + hours * 60).min(1440);
        let now = MON - 6 * H;

        tokio_test::block_on(async {
            let engine = fresh_engine(now);
            let host = open_host(&engine, host_tz, start_min, end_min).await;
            let mut et = event_type(vec![host]);
            et.duration_min = duration;
            et.granularity_min = step;
            et.buffer_before_min = before;
            et.buffer_after_min = after;
            et.min_notice_min = notice_h * 60;
            et.max_horizon_days = horizon.max(notice_h / 24 + 1);
            engine.create_event_type(et.clone()).await.unwrap();
            let bounds = et.bookable_window(now);

            for quarter in attempts {
                match engine.create_booking(req(et.id, MON + quarter * 15 * 60_000)).await {
                    Ok(b) => prop_assert!(bounds.contains_span(&b.span)),
                    Err(EngineError::SlotConflict(_))
                    | Err(EngineError::HostUnavailable(_))
                    | Err(EngineError::InvalidRange(_)) => {}
                    Err(e) => prop_assert!(false, "unexpected error {e}"),
                }
            }

            let week = Span::new(MON - DAY_MS, MON + 9 * DAY_MS);
            let active: Vec<Booking> = engine
                .host_bookings(host, week)
                .await
                .unwrap()
                .into_iter()
                .filter(|b| b.is_active())
                .collect();
            let buffers = et.buffers();
            for (i, a) in active.iter().enumerate() {
                for b in &active[i + 1..] {
                    let ok = !a.span.overlaps(&b.span.widen(buffers.before, buffers.after))
                        || !b.span.overlaps(&a.span.widen(buffers.before, buffers.after));
                    prop_assert!(ok, "bookings {a:?} and {b:?} violate buffers");
                }
            }

            let first = engine.list_slots(et.id, day(0), day(6), display_tz).await.unwrap();
            let second = engine.list_slots(et.id, day(0), day(6), display_tz).await.unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), 7);

            let mut earliest = None;
            for (date, slots) in &first {
                for slot in slots {
                    let span = Span::new(slot.start.timestamp_millis(), slot.end.timestamp_millis());
                    prop_assert!(bounds.contains_span(&span), "slot {slot:?} outside {bounds:?}");
                    prop_assert_eq!(span.duration_ms(), et.duration_ms());
                    prop_assert_eq!(slot.start.date_naive(), *date);
                    prop_assert_eq!(slot.host_ids.clone(), vec![host]);
                    earliest = earliest.or(Some(span.start));
                }
            }
            if let Some(start) = earliest {
                prop_assert!(engine.create_booking(req(et.id, start)).await.is_ok());
            }
            Ok(())
        })?;
    }

    /// N bookings over K always-free hosts land ⌊N/K⌋ or ⌈N/K⌉ per host,
    /// in rotating order.
    #[test]
    fn round_robin_is_fair(k in 1usize..5, n in 1usize..25) {
        tokio_test::block_on(async {
            let engine = fresh_engine(MON - H);
            let mut hosts = Vec::new();
            for _ in 0..k {
                hosts.push(open_host(&engine, Tz::UTC, 0, 1440).await);
            }
            let et = event_type(hosts.clone());
            engine.create_event_type(et.clone()).await.unwrap();

            let mut counts = vec![0usize; k];
            for i in 0..n {
                let b = engine.create_booking(req(et.id, MON + i as i64 * H)).await.unwrap();
                prop_assert_eq!(b.host_id, hosts[i % k]);
                let pos = hosts.iter().position(|h| *h == b.host_id).unwrap();
                counts[pos] += 1;
            }
            for c in counts {
                prop_assert!(c == n / k || c == n.div_ceil(k));
            }
            Ok(())
        })?;
    }

    /// UTC → display → UTC is lossless, DST transitions included.
    #[test]
    fn display_round_trip(zone in zones(), minutes in 0i64..(366 * 24 * 60)) {
        let ms = 1_767_225_600_000 + minutes * 60_000; // from 2026-01-01
        let shown = tz::to_display(&zone, ms).unwrap();
        let back = DateTime::parse_from_rfc3339(&shown.to_rfc3339()).unwrap();
        prop_assert_eq!(back.timestamp_millis(), ms);

        let local = tz::to_local(&zone, ms).unwrap().naive_local();
        let resolved = tz::resolve_local(&zone, local).unwrap();
        // Ambiguous wall times resolve to the earlier instant.
        prop_assert!(resolved <= ms);
        prop_assert_eq!(tz::to_local(&zone, resolved).unwrap().naive_local(), local);
    }
}
