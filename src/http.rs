//! Public HTTP surface: slot listing and booking for a booking link.
//!
//! - `GET  /availability?slug=..&days=..`
//! - `POST /book?slug=..`
//! - `GET  /health`

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::{now_ms, Availability, BookingReceipt, BookingRequest, Engine, EngineError};
use crate::model::{BookingPhase, MeetingType, Ms};
use crate::observability::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};

/// Shared handler state.
pub struct ApiState {
    pub engine: Arc<Engine>,
    clock: fn() -> Ms,
}

impl ApiState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine, clock: now_ms }
    }

    /// State with a fixed notion of "now", for deterministic tests.
    pub fn with_clock(engine: Arc<Engine>, clock: fn() -> Ms) -> Self {
        Self { engine, clock }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Both parameters arrive as strings so that bad values get a JSON 400.
#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub slug: Option<String>,
    pub days: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookQuery {
    pub slug: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkView {
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    /// Minutes.
    pub duration: u32,
    pub meeting_type: MeetingType,
}

#[derive(Debug, Serialize)]
pub struct HostView {
    pub name: String,
    pub timezone: String,
}

#[derive(Debug, Serialize)]
pub struct DaySlots {
    pub date: String,
    pub times: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub booking_link: LinkView,
    pub host: HostView,
    pub slots: Vec<DaySlots>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl From<Availability> for AvailabilityResponse {
    fn from(a: Availability) -> Self {
        Self {
            booking_link: LinkView {
                slug: a.link.slug,
                title: a.link.title,
                description: a.link.description,
                duration: a.link.duration_minutes,
                meeting_type: a.link.meeting_type,
            },
            host: HostView {
                name: a.host.name,
                timezone: a.host.timezone,
            },
            slots: a
                .slots
                .iter()
                .map(|(date, slots)| DaySlots {
                    date: date.to_string(),
                    times: slots.iter().map(|c| c.local_start.to_string()).collect(),
                })
                .collect(),
            degraded: a.degraded.is_some(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub id: String,
    pub date: String,
    pub time: String,
    /// Minutes.
    pub duration: i64,
    pub title: String,
    pub host_name: String,
    pub status: BookingPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meet_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_event_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub success: bool,
    pub booking: BookingView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<BookingReceipt> for BookResponse {
    fn from(r: BookingReceipt) -> Self {
        Self {
            success: true,
            booking: BookingView {
                id: r.booking.id.to_string(),
                date: r.date.to_string(),
                time: r.time.to_string(),
                duration: r.booking.duration_minutes(),
                title: r.title,
                host_name: r.host_name,
                status: r.phase,
                meet_link: r.booking.meeting_link,
                calendar_event_id: r.booking.external_event_id,
            },
            warning: r.warning,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: error.into() })).into_response()
}

fn engine_error_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
        EngineError::LinkNotFound(_) | EngineError::HostNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::SlotUnavailable | EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = engine_error_status(&self);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {self}");
            return error_response(status, "internal error, please try again");
        }
        error_response(status, self.to_string())
    }
}

fn required_slug(slug: Option<String>) -> Result<String, Response> {
    slug.filter(|s| !s.trim().is_empty())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "slug is required"))
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn availability_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AvailabilityQuery>,
) -> Response {
    let slug = match required_slug(query.slug) {
        Ok(slug) => slug,
        Err(resp) => return resp,
    };
    let days = match query.days.as_deref().map(str::parse::<u32>) {
        None => None,
        Some(Ok(days)) => Some(days),
        Some(Err(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "days must be a positive integer");
        }
    };

    match state.engine.list_availability(&slug, days, (state.clock)()).await {
        Ok(availability) => Json(AvailabilityResponse::from(availability)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn book_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BookQuery>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> Response {
    let slug = match required_slug(query.slug) {
        Ok(slug) => slug,
        Err(resp) => return resp,
    };
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.engine.book(&slug, request, (state.clock)()).await {
        Ok(receipt) => Json(BookResponse::from(receipt)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".into());
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

/// Build the router with metrics and permissive CORS (booking pages are
/// embedded on arbitrary sites).
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/availability", get(availability_handler))
        .route("/book", post(book_handler))
        .route("/health", get(health_handler))
        .route_layer(middleware::from_fn(track_metrics))
        .with_state(state)
        .layer(cors)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ApiState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn status_mapping() {
        let cases = [
            (EngineError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::LimitExceeded("x"), StatusCode::BAD_REQUEST),
            (EngineError::LinkNotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::HostNotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::SlotUnavailable, StatusCode::CONFLICT),
            (EngineError::Conflict(Ulid::new()), StatusCode::CONFLICT),
            (EngineError::WalError("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(engine_error_status(&err), status, "{err}");
        }
    }

    #[test]
    fn degraded_flag_omitted_when_false() {
        let view = AvailabilityResponse {
            booking_link: LinkView {
                slug: "s".into(),
                title: "t".into(),
                description: None,
                duration: 30,
                meeting_type: MeetingType::InPerson,
            },
            host: HostView {
                name: "h".into(),
                timezone: "UTC".into(),
            },
            slots: vec![],
            degraded: false,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("degraded").is_none());
        assert_eq!(json["bookingLink"]["meetingType"], "in_person");
        assert_eq!(json["bookingLink"]["duration"], 30);
    }
}
