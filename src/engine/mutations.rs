use std::sync::Arc;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Deserialize;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::adapters::{AdapterError, EventRequest, Message};
use crate::limits::*;
use crate::model::*;
use crate::observability::{outcome, record_booking, NOTIFICATION_FAILURES_TOTAL};

use super::conflict::check_no_conflict;
use super::queries::host_today;
use super::slots::Horizon;
use super::{Engine, EngineError, WalCommand};

/// A guest's booking form. Everything is optional here so that missing
/// fields can be reported together.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingRequest {
    pub date: Option<String>,
    pub time: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
    pub notes: Option<String>,
    pub phone: Option<String>,
}

/// What a successful booking reports back.
#[derive(Debug, Clone)]
pub struct BookingReceipt {
    pub booking: Booking,
    pub date: NaiveDate,
    pub time: LocalTime,
    /// Zone `date` and `time` are expressed in.
    pub timezone: Tz,
    pub title: String,
    pub host_name: String,
    /// `CalendarSynced` or `CalendarFailed`.
    pub phase: BookingPhase,
    pub warning: Option<String>,
}

struct ValidRequest {
    date: NaiveDate,
    time: LocalTime,
    guest: GuestContact,
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn optional(field: &Option<String>, max: usize, what: &'static str) -> Result<Option<String>, EngineError> {
    match present(field) {
        Some(s) if s.len() > max => Err(EngineError::LimitExceeded(what)),
        Some(s) => Ok(Some(s.to_string())),
        None => Ok(None),
    }
}

fn plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn validate_request(req: &BookingRequest) -> Result<ValidRequest, EngineError> {
    let required = [
        ("date", present(&req.date)),
        ("time", present(&req.time)),
        ("name", present(&req.name)),
        ("email", present(&req.email)),
    ];
    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| *k)
        .collect();
    let [Some(date), Some(time), Some(name), Some(email)] = required.map(|(_, v)| v) else {
        return Err(EngineError::InvalidInput(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    };

    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidInput(format!("date must be YYYY-MM-DD, got {date:?}")))?;
    let time = LocalTime::parse(time)
        .filter(|t| *t < LocalTime::END_OF_DAY)
        .ok_or_else(|| EngineError::InvalidInput(format!("time must be HH:MM, got {time:?}")))?;

    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if !plausible_email(email) {
        return Err(EngineError::InvalidInput(format!("not an email address: {email:?}")));
    }

    let guest = GuestContact {
        name: name.to_string(),
        email: email.to_string(),
        company: optional(&req.company, MAX_FIELD_LEN, "company too long")?,
        role: optional(&req.role, MAX_FIELD_LEN, "role too long")?,
        notes: optional(&req.notes, MAX_NOTES_LEN, "notes too long")?,
        phone: optional(&req.phone, MAX_FIELD_LEN, "phone too long")?,
    };
    Ok(ValidRequest { date, time, guest })
}

fn event_request(link: &BookingLink, booking: &Booking) -> EventRequest {
    let guest = &booking.guest;
    let mut description = format!("Booked by {} <{}>", guest.name, guest.email);
    for (label, value) in [
        ("Company", &guest.company),
        ("Role", &guest.role),
        ("Phone", &guest.phone),
        ("Notes", &guest.notes),
    ] {
        if let Some(v) = value {
            description.push_str(&format!("\n{label}: {v}"));
        }
    }
    if let Some(d) = &link.description {
        description.push_str(&format!("\n\n{d}"));
    }

    EventRequest {
        title: format!("{} with {}", link.title, guest.name),
        description,
        start: booking.span.start,
        end: booking.span.end,
        attendees: vec![guest.email.clone()],
        wants_video_link: link.meeting_type.wants_video_link(),
    }
}

fn confirmation(receipt: &BookingReceipt) -> Message {
    let booking = &receipt.booking;
    let mut body = format!(
        "Hi {},\n\nYour {} with {} is confirmed for {} at {} ({}), {} minutes.",
        booking.guest.name,
        receipt.title,
        receipt.host_name,
        receipt.date,
        receipt.time,
        receipt.timezone,
        booking.duration_minutes(),
    );
    if let Some(link) = &booking.meeting_link {
        body.push_str(&format!("\n\nJoin: {link}"));
    }
    Message {
        to: booking.guest.email.clone(),
        subject: format!("Confirmed: {} with {}", receipt.title, receipt.host_name),
        body,
    }
}

fn outcome_label(result: &Result<BookingReceipt, EngineError>) -> &'static str {
    match result {
        Ok(r) if r.phase == BookingPhase::CalendarSynced => outcome::SYNCED,
        Ok(_) => outcome::CALENDAR_FAILED,
        Err(EngineError::Conflict(_)) => outcome::CONFLICT,
        Err(EngineError::SlotUnavailable) => outcome::UNAVAILABLE,
        Err(EngineError::WalError(_)) => outcome::ERROR,
        Err(_) => outcome::REJECTED,
    }
}

impl Engine {
    /// Book the slot at `date`/`time` on the link `slug`.
    ///
    /// The slot is re-checked against current rules and busy time, then
    /// committed under the host's lock. Calendar failure after commit does not
    /// undo the booking; it is reported through `warning`.
    pub async fn book(
        self: &Arc<Self>,
        slug: &str,
        request: BookingRequest,
        now: Ms,
    ) -> Result<BookingReceipt, EngineError> {
        let result = self.try_book(slug, request, now).await;
        record_booking(outcome_label(&result));
        result
    }

    async fn try_book(
        self: &Arc<Self>,
        slug: &str,
        request: BookingRequest,
        now: Ms,
    ) -> Result<BookingReceipt, EngineError> {
        let ValidRequest { date, time, guest } = validate_request(&request)?;
        let (link, host) = self.resolve_link(slug).await?;

        let window = Horizon::after(host_today(&host, now), MAX_HORIZON_DAYS)
            .ok_or_else(|| EngineError::InvalidInput("date out of range".into()))?;
        if !window.contains(date) {
            return Err(EngineError::SlotUnavailable);
        }

        let (grid, _) = self.bookable_slots(&host, &link, Horizon::single(date), now).await;
        let slot = grid
            .get(&date)
            .and_then(|slots| slots.iter().find(|c| c.local_start == time))
            .copied()
            .ok_or(EngineError::SlotUnavailable)?;
        tracing::debug!(host = %host.id, phase = ?BookingPhase::Validated, "{slug} {date} {time}");

        let booking = Booking {
            id: Ulid::new(),
            host_id: host.id.clone(),
            link_slug: link.slug.clone(),
            span: slot.span,
            guest,
            status: BookingStatus::Confirmed,
            external_event_id: None,
            meeting_link: None,
            created_at: now,
        };

        // Past this point the work runs to completion even if the caller goes away.
        let engine = Arc::clone(self);
        let receipt = tokio::spawn(async move {
            let booking = engine.commit(booking).await?;
            let (booking, phase, warning) = engine.publish(&link, &host, booking).await;
            let receipt = BookingReceipt {
                booking,
                date,
                time,
                timezone: slot.timezone,
                title: link.title.clone(),
                host_name: host.name.clone(),
                phase,
                warning,
            };
            engine.notify(&host, &receipt);
            Ok::<_, EngineError>(receipt)
        })
        .await
        .map_err(|e| EngineError::WalError(format!("booking task failed: {e}")))??;
        Ok(receipt)
    }

    /// Atomic check-and-insert under the host's write lock.
    pub(super) async fn commit(&self, booking: Booking) -> Result<Booking, EngineError> {
        let _gate = self.log_gate.read().await;
        let rs = self.host_state(&booking.host_id);
        let mut guard = rs.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_HOST {
            return Err(EngineError::LimitExceeded("too many bookings for host"));
        }
        check_no_conflict(&guard, &booking.span)?;

        let event = Event::BookingCommitted {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(
            host = %booking.host_id,
            phase = ?BookingPhase::Committed,
            "booking {} committed for {}",
            booking.id,
            booking.link_slug
        );
        Ok(booking)
    }

    /// Mirror a committed booking into the host's calendar and record the result.
    async fn publish(&self, link: &BookingLink, host: &Host, mut booking: Booking) -> (Booking, BookingPhase, Option<String>) {
        let request = event_request(link, &booking);
        let timeout = self.options.provider_timeout;
        let created = match tokio::time::timeout(timeout, self.collaborators.calendar.create_event(host, &request)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout)),
        };

        match created {
            Ok(created) => {
                let event = Event::CalendarSynced {
                    id: booking.id,
                    host_id: booking.host_id.clone(),
                    event_id: created.event_id.clone(),
                    meeting_link: created.meeting_link.clone(),
                };
                self.record_calendar_outcome(&event).await;
                booking.external_event_id = Some(created.event_id);
                booking.meeting_link = created.meeting_link;
                (booking, BookingPhase::CalendarSynced, None)
            }
            Err(e) => {
                tracing::warn!(host = %host.id, "calendar event for booking {} not created: {e}", booking.id);
                let event = Event::CalendarFailed {
                    id: booking.id,
                    host_id: booking.host_id.clone(),
                    reason: e.to_string(),
                };
                self.record_calendar_outcome(&event).await;
                booking.status = BookingStatus::CalendarFailed;
                let warning =
                    format!("Booking confirmed, but the calendar invite could not be created: {e}");
                (booking, BookingPhase::CalendarFailed, Some(warning))
            }
        }
    }

    /// The booking already stands, so a log failure here is reported and dropped.
    async fn record_calendar_outcome(&self, event: &Event) {
        let _gate = self.log_gate.read().await;
        let rs = self.host_state(event.host_id());
        let mut guard = rs.write().await;
        if let Err(e) = self.persist_and_apply(&mut guard, event).await {
            tracing::error!(host = %event.host_id(), "failed to record calendar outcome: {e}");
        }
    }

    /// Fire-and-forget confirmation. Never awaited by the booking path.
    fn notify(&self, host: &Host, receipt: &BookingReceipt) {
        let notifier = Arc::clone(&self.collaborators.notifier);
        let timeout = self.options.notify_timeout;
        let message = confirmation(receipt);
        let host = host.clone();
        let booking_id = receipt.booking.id;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, notifier.send(&host, &message)).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(timeout)),
            };
            match result {
                Ok(()) => tracing::debug!(host = %host.id, "confirmation for booking {booking_id} sent"),
                Err(AdapterError::NotConfigured) => {
                    tracing::debug!(host = %host.id, "no mail account, confirmation for booking {booking_id} skipped");
                }
                Err(e) => {
                    metrics::counter!(NOTIFICATION_FAILURES_TOTAL).increment(1);
                    tracing::warn!(host = %host.id, "confirmation for booking {booking_id} not sent");
                    tracing::debug!("notification failure detail: {e}");
                }
            }
        });
    }

    /// Rewrite the log as one `BookingCommitted` per live booking, with the
    /// calendar outcome folded in. Returns the number of bookings written.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.log_gate.write().await;
        let hosts: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in hosts {
            let guard = rs.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCommitted { booking: b.clone() }));
        }
        let kept = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(kept)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
