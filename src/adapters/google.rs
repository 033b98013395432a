//! Google Calendar (free/busy, event insert with Meet link) and Gmail (send).
//!
//! Uses the host's bearer token from settings. Hosts without an account get
//! `AdapterError::NotConfigured`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::*;

pub const GOOGLE_API_BASE: &str = "https://www.googleapis.com";

/// Calendar + mail client sharing one connection pool.
#[derive(Clone)]
pub struct GoogleWorkspace {
    client: Client,
    base_url: String,
}

impl GoogleWorkspace {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

fn account(host: &Host) -> Result<&CalendarAccount, AdapterError> {
    host.account.as_ref().ok_or(AdapterError::NotConfigured)
}

fn rfc3339(ms: Ms) -> Result<String, AdapterError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .ok_or_else(|| AdapterError::Api(format!("instant out of range: {ms}")))
}

fn parse_instant(s: &str) -> Result<Ms, AdapterError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| AdapterError::Api(format!("invalid time in response: {s}")))
}

/// Map a non-2xx response to `AdapterError::Api` with the body text.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AdapterError::Api(format!("{status}: {body}")))
}

#[derive(Deserialize)]
struct FreeBusyResponse {
    #[serde(default)]
    calendars: HashMap<String, FreeBusyCalendar>,
}

#[derive(Deserialize)]
struct FreeBusyCalendar {
    #[serde(default)]
    busy: Vec<FreeBusyPeriod>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct FreeBusyPeriod {
    start: String,
    end: String,
}

#[async_trait]
impl BusyIntervalProvider for GoogleWorkspace {
    async fn get_free_busy(&self, host: &Host, range: Span) -> Result<Vec<Span>, AdapterError> {
        let account = account(host)?;
        let body = json!({
            "timeMin": rfc3339(range.start)?,
            "timeMax": rfc3339(range.end)?,
            "items": [{ "id": account.calendar_id }],
        });

        let resp = self
            .client
            .post(format!("{}/calendar/v3/freeBusy", self.base_url))
            .bearer_auth(&account.access_token)
            .json(&body)
            .send()
            .await?;
        let parsed: FreeBusyResponse = check_status(resp).await?.json().await?;

        let calendar = parsed
            .calendars
            .get(&account.calendar_id)
            .ok_or_else(|| AdapterError::Api("calendar missing from free/busy response".into()))?;
        if !calendar.errors.is_empty() {
            return Err(AdapterError::Api(format!("free/busy errors: {:?}", calendar.errors)));
        }

        let mut spans = Vec::with_capacity(calendar.busy.len());
        for period in &calendar.busy {
            let (start, end) = (parse_instant(&period.start)?, parse_instant(&period.end)?);
            if start < end {
                spans.push(Span::new(start, end));
            }
        }
        Ok(spans)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertedEvent {
    id: String,
    #[serde(default)]
    hangout_link: Option<String>,
}

#[async_trait]
impl CalendarEventPublisher for GoogleWorkspace {
    async fn create_event(&self, host: &Host, request: &EventRequest) -> Result<CreatedEvent, AdapterError> {
        let account = account(host)?;
        let attendees: Vec<_> = request.attendees.iter().map(|email| json!({ "email": email })).collect();
        let mut body = json!({
            "summary": request.title,
            "description": request.description,
            "start": { "dateTime": rfc3339(request.start)? },
            "end": { "dateTime": rfc3339(request.end)? },
            "attendees": attendees,
        });
        if request.wants_video_link {
            body["conferenceData"] = json!({
                "createRequest": {
                    "requestId": ulid::Ulid::new().to_string(),
                    "conferenceSolutionKey": { "type": "hangoutsMeet" },
                }
            });
        }

        let resp = self
            .client
            .post(format!(
                "{}/calendar/v3/calendars/{}/events",
                self.base_url, account.calendar_id
            ))
            .query(&[("conferenceDataVersion", "1"), ("sendUpdates", "all")])
            .bearer_auth(&account.access_token)
            .json(&body)
            .send()
            .await?;
        let event: InsertedEvent = check_status(resp).await?.json().await?;

        Ok(CreatedEvent {
            event_id: event.id,
            meeting_link: event.hangout_link,
        })
    }
}

/// RFC 822 message, base64url-encoded as the Gmail API expects.
fn encode_raw_message(from: &str, message: &Message) -> String {
    let raw = format!(
        "From: {from}\r\nTo: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
        message.to, message.subject, message.body
    );
    base64::engine::general_purpose::URL_SAFE.encode(raw.as_bytes())
}

#[async_trait]
impl NotificationDispatcher for GoogleWorkspace {
    async fn send(&self, host: &Host, message: &Message) -> Result<(), AdapterError> {
        let account = account(host)?;
        let resp = self
            .client
            .post(format!("{}/gmail/v1/users/me/messages/send", self.base_url))
            .bearer_auth(&account.access_token)
            .json(&json!({ "raw": encode_raw_message(&host.email, message) }))
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}
