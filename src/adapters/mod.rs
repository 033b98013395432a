//! Boundaries to systems this engine consumes but does not own: the settings
//! store, the host's external calendar, and outbound mail.
//!
//! Every call made through these traits is bounded by a timeout at the call
//! site and none of them runs while a booking commit lock is held.

pub mod google;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::*;

#[derive(Debug)]
pub enum AdapterError {
    /// The host has no connected account for this provider.
    NotConfigured,
    Timeout(Duration),
    Transport(String),
    Api(String),
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::NotConfigured => write!(f, "no calendar account connected"),
            AdapterError::Timeout(d) => write!(f, "provider timed out after {}ms", d.as_millis()),
            AdapterError::Transport(e) => write!(f, "provider unreachable: {e}"),
            AdapterError::Api(e) => write!(f, "provider error: {e}"),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        AdapterError::Transport(e.to_string())
    }
}

/// Read-only view of host settings: hosts, booking links and weekly rules.
#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn booking_link(&self, slug: &str) -> Option<BookingLink>;
    async fn host(&self, host_id: &str) -> Option<Host>;
    async fn list_rules(&self, host_id: &str) -> Vec<AvailabilityRule>;
}

/// Source of the host's externally booked time.
#[async_trait]
pub trait BusyIntervalProvider: Send + Sync {
    async fn get_free_busy(&self, host: &Host, range: Span) -> Result<Vec<Span>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest {
    pub title: String,
    pub description: String,
    pub start: Ms,
    pub end: Ms,
    pub attendees: Vec<String>,
    pub wants_video_link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEvent {
    pub event_id: String,
    pub meeting_link: Option<String>,
}

/// Mirrors a committed booking into the host's calendar.
#[async_trait]
pub trait CalendarEventPublisher: Send + Sync {
    async fn create_event(&self, host: &Host, request: &EventRequest) -> Result<CreatedEvent, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Best-effort confirmation delivery. Callers never wait on or surface failures.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, host: &Host, message: &Message) -> Result<(), AdapterError>;
}

/// The external systems an engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn AvailabilityStore>,
    pub busy: Arc<dyn BusyIntervalProvider>,
    pub calendar: Arc<dyn CalendarEventPublisher>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

/// Result of asking the provider for busy time. `Degraded` means the fetch
/// failed and the caller proceeds as if the host were free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyFetch {
    Fresh(Vec<Span>),
    Degraded(String),
}

impl BusyFetch {
    pub fn intervals(&self) -> &[Span] {
        match self {
            BusyFetch::Fresh(spans) => spans,
            BusyFetch::Degraded(_) => &[],
        }
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            BusyFetch::Fresh(_) => None,
            BusyFetch::Degraded(reason) => Some(reason),
        }
    }
}

/// Fetch busy time with a deadline. Failure degrades, it never errors.
pub async fn fetch_busy(
    provider: &dyn BusyIntervalProvider,
    host: &Host,
    range: Span,
    timeout: Duration,
) -> BusyFetch {
    match tokio::time::timeout(timeout, provider.get_free_busy(host, range)).await {
        Ok(Ok(spans)) => BusyFetch::Fresh(spans),
        Ok(Err(AdapterError::NotConfigured)) => BusyFetch::Fresh(Vec::new()),
        Ok(Err(e)) => BusyFetch::Degraded(e.to_string()),
        Err(_) => BusyFetch::Degraded(AdapterError::Timeout(timeout).to_string()),
    }
}

/// Provider for hosts without an external calendar: always free.
pub struct NoBusyTime;

#[async_trait]
impl BusyIntervalProvider for NoBusyTime {
    async fn get_free_busy(&self, _host: &Host, _range: Span) -> Result<Vec<Span>, AdapterError> {
        Ok(Vec::new())
    }
}

/// Publisher for deployments without a calendar integration.
pub struct NoCalendar;

#[async_trait]
impl CalendarEventPublisher for NoCalendar {
    async fn create_event(&self, _host: &Host, _request: &EventRequest) -> Result<CreatedEvent, AdapterError> {
        Err(AdapterError::NotConfigured)
    }
}

/// Writes confirmations to the log instead of sending them.
pub struct LogNotifier;

#[async_trait]
impl NotificationDispatcher for LogNotifier {
    async fn send(&self, host: &Host, message: &Message) -> Result<(), AdapterError> {
        tracing::info!(host = %host.id, to = %message.to, subject = %message.subject, "confirmation (log only)");
        Ok(())
    }
}
