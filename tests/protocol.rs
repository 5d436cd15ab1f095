use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotwise::clock::ManualClock;
use slotwise::engine::Engine;
use slotwise::model::BookingState;
use slotwise::notify::NotifyHub;
use slotwise::protocol;

/// Sunday 2026-03-01 12:00 UTC.
const NOW: i64 = 1_772_366_400_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotwise_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(
            dir.join("slotwise.wal"),
            Arc::new(NotifyHub::new()),
            Arc::new(ManualClock::new(NOW)),
        )
        .unwrap(),
    );

    let served = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = served.clone();
            tokio::spawn(async move {
                let _ = protocol::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: String) -> Value {
        self.framed.send(line).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("response timed out")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, req: Value) -> Value {
        self.send_raw(req.to_string()).await
    }

    async fn ok(&mut self, req: Value) -> Value {
        let resp = self.call(req).await;
        assert_eq!(resp["ok"], json!(true), "unexpected failure: {resp}");
        resp["result"].clone()
    }
}

/// One UTC host open Mon 09:00–17:00 and a 30-minute round-robin event type.
async fn seed(client: &mut Client) -> (Ulid, Ulid) {
    let host = Ulid::new();
    let et = Ulid::new();
    client
        .ok(json!({"op": "create_host", "id": host, "name": "Dana", "timezone": "UTC"}))
        .await;
    client
        .ok(json!({"op": "add_rule", "id": Ulid::new(), "host_id": host,
                   "weekday": 0, "start": "09:00", "end": "17:00"}))
        .await;
    client
        .ok(json!({"op": "create_event_type", "event_type": {
            "id": et, "duration_min": 30, "buffer_before_min": 10, "buffer_after_min": 10,
            "policy": "round_robin", "eligible_host_ids": [host]
        }}))
        .await;
    (host, et)
}

fn slot_starts(result: &Value, date: &str) -> Vec<String> {
    result[date]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["start"].as_str().unwrap().to_string())
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_tcp() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (host, et) = seed(&mut client).await;

    let booking = client
        .ok(json!({"op": "create_booking", "event_type_id": et,
                   "start": "2026-03-02T10:00:00Z", "invitee": "ada"}))
        .await;
    assert_eq!(booking["host_id"], json!(host.to_string()));
    assert_eq!(booking["end"], json!("2026-03-02T10:30:00Z"));
    let id = booking["id"].as_str().unwrap().to_string();

    let slots = client
        .ok(json!({"op": "list_slots", "event_type_id": et,
                   "start_date": "2026-03-02", "end_date": "2026-03-02"}))
        .await;
    let starts = slot_starts(&slots, "2026-03-02");
    assert!(starts.contains(&"2026-03-02T10:40:00+00:00".to_string()));
    assert!(!starts.contains(&"2026-03-02T10:30:00+00:00".to_string()));

    let moved = client
        .ok(json!({"op": "reschedule_booking", "id": id, "start": "2026-03-02T15:00:00+01:00"}))
        .await;
    assert_eq!(moved["start"], json!("2026-03-02T14:00:00Z"));

    let history = client.ok(json!({"op": "booking_history", "id": id})).await;
    let states: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["state"].as_str().unwrap())
        .collect();
    assert_eq!(states, vec!["rescheduled", "confirmed"]);

    let cancelled = client
        .ok(json!({"op": "cancel_booking", "id": moved["id"]}))
        .await;
    assert_eq!(cancelled["state"], json!("cancelled"));
    assert_eq!(cancelled["cancellation"]["by"], json!("invitee"));
    assert_eq!(cancelled["cancellation"]["reason"], json!(null));

    let again = client.call(json!({"op": "cancel_booking", "id": moved["id"]})).await;
    assert_eq!(again["ok"], json!(false));
    assert_eq!(again["error"]["kind"], json!("invalid_state"));

    let listed = client
        .ok(json!({"op": "host_bookings", "host_id": host,
                   "start": "2026-03-02T00:00", "end": "2026-03-03T00:00"}))
        .await;
    assert_eq!(listed.as_array().unwrap().len(), 2);
    let synced = client
        .ok(json!({"op": "confirmed_bookings", "host_id": host,
                   "start": "2026-03-02T00:00", "end": "2026-03-03T00:00"}))
        .await;
    assert!(synced.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn racing_clients_get_one_booking() {
    let (addr, engine) = start_test_server().await;
    let (host, et) = {
        let mut client = Client::connect(addr).await;
        seed(&mut client).await
    };

    let mut handles = Vec::new();
    for _ in 0..10 {
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(json!({"op": "create_booking", "event_type_id": et,
                             "start": "2026-03-02T11:00:00Z"}))
                .await
        }));
    }
    let mut kinds = Vec::new();
    for h in handles {
        let resp = h.await.unwrap();
        kinds.push(if resp["ok"] == json!(true) {
            "ok".to_string()
        } else {
            resp["error"]["kind"].as_str().unwrap().to_string()
        });
    }
    assert_eq!(kinds.iter().filter(|k| *k == "ok").count(), 1);
    assert_eq!(kinds.iter().filter(|k| *k == "slot_conflict").count(), 9);

    let monday = slotwise::model::Span::new(NOW, NOW + 2 * 86_400_000);
    let active: Vec<_> = engine
        .host_bookings(host, monday)
        .await
        .unwrap()
        .into_iter()
        .filter(|b| b.state == BookingState::Confirmed)
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn errors_do_not_close_the_connection() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.send_raw("this is not json".into()).await;
    assert_eq!(resp["error"]["kind"], json!("invalid_request"));

    let resp = client
        .call(json!({"op": "free_windows", "host_id": Ulid::new(),
                     "start": "2026-03-02T00:00", "end": "2026-03-03T00:00"}))
        .await;
    assert_eq!(resp["error"]["kind"], json!("invalid_host"));

    let hosts = client.ok(json!({"op": "list_hosts"})).await;
    assert!(hosts.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invitee_choice_over_tcp() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let hosts = [Ulid::new(), Ulid::new()];
    for h in hosts {
        client
            .ok(json!({"op": "create_host", "id": h, "timezone": "America/New_York"}))
            .await;
        client
            .ok(json!({"op": "add_rule", "id": Ulid::new(), "host_id": h,
                       "weekday": 0, "start": "09:00", "end": "10:00"}))
            .await;
    }
    let et = Ulid::new();
    client
        .ok(json!({"op": "create_event_type", "event_type": {
            "id": et, "duration_min": 60, "policy": "invitee_choice", "eligible_host_ids": hosts
        }}))
        .await;

    let slots = client
        .ok(json!({"op": "list_slots", "event_type_id": et, "start_date": "2026-03-09",
                   "end_date": "2026-03-09", "timezone": "America/New_York"}))
        .await;
    let day = slots["2026-03-09"].as_array().unwrap();
    assert_eq!(day.len(), 2);
    assert!(day.iter().all(|s| s["start"] == json!("2026-03-09T09:00:00-04:00")));

    let resp = client
        .call(json!({"op": "create_booking", "event_type_id": et,
                     "start": "2026-03-09T09:00", "timezone": "America/New_York"}))
        .await;
    assert_eq!(resp["error"]["kind"], json!("host_choice_required"));

    let booked = client
        .ok(json!({"op": "create_booking", "event_type_id": et, "host_id": hosts[1],
                   "start": "2026-03-09T09:00", "timezone": "America/New_York"}))
        .await;
    assert_eq!(booked["start"], json!("2026-03-09T13:00:00Z"));
}

#[tokio::test]
async fn exceptions_over_tcp() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let (host, et) = seed(&mut client).await;

    client
        .ok(json!({"op": "set_exception", "host_id": host, "date": "2026-03-02"}))
        .await;
    let slots = client
        .ok(json!({"op": "list_slots", "event_type_id": et,
                   "start_date": "2026-03-02", "end_date": "2026-03-02"}))
        .await;
    assert!(slots["2026-03-02"].as_array().unwrap().is_empty());

    client
        .ok(json!({"op": "set_exception", "host_id": host, "date": "2026-03-02",
                   "hours": [{"start": "13:00", "end": "14:00"}]}))
        .await;
    let slots = client
        .ok(json!({"op": "list_slots", "event_type_id": et,
                   "start_date": "2026-03-02", "end_date": "2026-03-02"}))
        .await;
    assert_eq!(
        slot_starts(&slots, "2026-03-02"),
        vec!["2026-03-02T13:00:00+00:00", "2026-03-02T13:15:00+00:00", "2026-03-02T13:30:00+00:00"]
    );

    let cleared = client
        .ok(json!({"op": "clear_exception", "host_id": host, "date": "2026-03-02"}))
        .await;
    assert_eq!(cleared["cleared"], json!(true));
}

#[tokio::test]
async fn bookings_made_over_tcp_reach_subscribers() {
    let (addr, engine) = start_test_server().await;
    let mut feed = engine.notify.subscribe_all();
    let mut client = Client::connect(addr).await;
    let (host, et) = seed(&mut client).await;

    client
        .ok(json!({"op": "create_booking", "event_type_id": et, "start": "2026-03-02T09:00:00Z"}))
        .await;
    let notice = tokio::time::timeout(Duration::from_secs(5), feed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notice.host_id, host);
    assert_eq!(notice.from, None);
    assert_eq!(notice.to, BookingState::Confirmed);
}
