use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use ulid::Ulid;

use bookd::adapters::*;
use bookd::engine::{Engine, EngineOptions};
use bookd::http::{self, ApiState};
use bookd::model::*;
use bookd::settings::InMemoryStore;

// ── Test infrastructure ──────────────────────────────────────

/// Sunday 2026-03-15 12:00 UTC.
fn sunday_noon() -> Ms {
    Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap().timestamp_millis()
}

struct OkCalendar;

#[async_trait]
impl CalendarEventPublisher for OkCalendar {
    async fn create_event(&self, _host: &Host, request: &EventRequest) -> Result<CreatedEvent, AdapterError> {
        Ok(CreatedEvent {
            event_id: format!("evt_{}", request.start),
            meeting_link: Some("https://meet.example.com/xyz".into()),
        })
    }
}

struct BrokenCalendar;

#[async_trait]
impl CalendarEventPublisher for BrokenCalendar {
    async fn create_event(&self, _host: &Host, _request: &EventRequest) -> Result<CreatedEvent, AdapterError> {
        Err(AdapterError::Transport("calendar offline".into()))
    }
}

fn store() -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    store.insert_host(Host {
        id: "alice".into(),
        name: "Alice".into(),
        email: "alice@example.com".into(),
        timezone: "UTC".into(),
        account: None,
    });
    store.insert_rule(
        "alice",
        AvailabilityRule {
            day_of_week: 1,
            start_time: LocalTime::parse("09:00").unwrap(),
            end_time: LocalTime::parse("10:00").unwrap(),
            timezone: "UTC".into(),
            active: true,
        },
    );
    store.insert_link(BookingLink {
        slug: "intro".into(),
        host_id: "alice".into(),
        title: "Intro call".into(),
        description: Some("Say hello".into()),
        duration_minutes: 30,
        meeting_type: MeetingType::Video,
        active: true,
    });
    Arc::new(store)
}

async fn start_test_server(calendar: Arc<dyn CalendarEventPublisher>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("bookd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let collaborators = Collaborators {
        store: store(),
        busy: Arc::new(NoBusyTime),
        calendar,
        notifier: Arc::new(LogNotifier),
    };
    let engine = Arc::new(Engine::new(dir.join("bookings.wal"), collaborators, EngineOptions::default()).unwrap());
    let state = Arc::new(ApiState::with_clock(engine, sunday_noon));

    tokio::spawn(async move {
        http::serve(listener, state, std::future::pending()).await.unwrap();
    });

    format!("http://{addr}")
}

fn booking_body(time: &str) -> Value {
    json!({
        "date": "2026-03-16",
        "time": time,
        "name": "Grace Hopper",
        "email": "grace@example.com",
        "company": "Navy",
    })
}

async fn book(client: &reqwest::Client, base: &str, body: &Value) -> (StatusCode, Value) {
    let resp = client
        .post(format!("{base}/book?slug=intro"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

// ── Listing ──────────────────────────────────────────────────

#[tokio::test]
async fn availability_lists_monday_slots() {
    let base = start_test_server(Arc::new(OkCalendar)).await;
    let resp = reqwest::get(format!("{base}/availability?slug=intro&days=7")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "bookingLink": {
                "slug": "intro",
                "title": "Intro call",
                "description": "Say hello",
                "duration": 30,
                "meetingType": "video",
            },
            "host": { "name": "Alice", "timezone": "UTC" },
            "slots": [{ "date": "2026-03-16", "times": ["09:00", "09:30"] }],
        })
    );
}

#[tokio::test]
async fn availability_errors_are_json() {
    let base = start_test_server(Arc::new(OkCalendar)).await;

    let resp = reqwest::get(format!("{base}/availability?slug=missing")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let resp = reqwest::get(format!("{base}/availability")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = reqwest::get(format!("{base}/availability?slug=intro&days=soon")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = reqwest::get(format!("{base}/availability?slug=intro&days=365")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_is_ok() {
    let base = start_test_server(Arc::new(OkCalendar)).await;
    let body: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

// ── Booking ──────────────────────────────────────────────────

#[tokio::test]
async fn booking_synced_with_calendar() {
    let base = start_test_server(Arc::new(OkCalendar)).await;
    let client = reqwest::Client::new();

    let (status, body) = book(&client, &base, &booking_body("09:00")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body.get("warning").is_none());
    let booking = &body["booking"];
    assert_eq!(booking["date"], "2026-03-16");
    assert_eq!(booking["time"], "09:00");
    assert_eq!(booking["duration"], 30);
    assert_eq!(booking["title"], "Intro call");
    assert_eq!(booking["hostName"], "Alice");
    assert_eq!(booking["status"], "CALENDAR_SYNCED");
    assert_eq!(booking["meetLink"], "https://meet.example.com/xyz");
    assert!(booking["calendarEventId"].as_str().unwrap().starts_with("evt_"));

    // The slot is gone from the listing.
    let listing: Value = reqwest::get(format!("{base}/availability?slug=intro&days=7"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["slots"], json!([{ "date": "2026-03-16", "times": ["09:30"] }]));
}

#[tokio::test]
async fn booking_survives_calendar_failure_with_warning() {
    let base = start_test_server(Arc::new(BrokenCalendar)).await;
    let client = reqwest::Client::new();

    let (status, body) = book(&client, &base, &booking_body("09:30")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["warning"].as_str().unwrap().contains("calendar offline"));
    assert_eq!(body["booking"]["status"], "CALENDAR_FAILED");
    assert!(body["booking"].get("calendarEventId").is_none());

    let (status, _) = book(&client, &base, &booking_body("09:30")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn booking_rejects_bad_requests() {
    let base = start_test_server(Arc::new(OkCalendar)).await;
    let client = reqwest::Client::new();

    let (status, body) = book(&client, &base, &json!({ "date": "2026-03-16" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("time, name, email"));

    let resp = client
        .post(format!("{base}/book?slug=intro"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].is_string());

    let resp = client
        .post(format!("{base}/book?slug=nope"))
        .json(&booking_body("09:00"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let (status, _) = book(&client, &base, &booking_body("11:00")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_for_one_slot_yield_one_success() {
    const K: usize = 8;
    let base = start_test_server(Arc::new(OkCalendar)).await;
    let client = reqwest::Client::new();

    let requests = (0..K).map(|i| {
        let client = client.clone();
        let base = base.clone();
        tokio::spawn(async move {
            let mut body = booking_body("09:00");
            body["email"] = json!(format!("guest{i}@example.com"));
            book(&client, &base, &body).await
        })
    });
    let results = futures::future::join_all(requests).await;

    let statuses: Vec<StatusCode> = results.into_iter().map(|r| r.unwrap().0).collect();
    let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let conflicts = statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count();
    assert_eq!(ok, 1, "{statuses:?}");
    assert_eq!(conflicts, K - 1, "{statuses:?}");

    let listing: Value = reqwest::get(format!("{base}/availability?slug=intro&days=7"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["slots"][0]["times"], json!(["09:30"]));
}
