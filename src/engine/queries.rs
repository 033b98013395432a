use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::adapters::{fetch_busy, BusyFetch};
use crate::limits::MAX_HORIZON_DAYS;
use crate::model::*;
use crate::observability::BUSY_FETCH_DEGRADED_TOTAL;

use super::conflict::{filter_conflicts, BusyIndex};
use super::slots::{generate_slots, Horizon, SlotGrid};
use super::{Engine, EngineError};

/// Bookable slots for one link, grouped by local date.
#[derive(Debug, Clone)]
pub struct Availability {
    pub link: BookingLink,
    pub host: Host,
    pub slots: SlotGrid,
    /// Set when busy time could not be fetched and the host was treated as free.
    pub degraded: Option<String>,
}

/// Calendar date at `now` in the host's timezone. Unknown zones fall back to UTC.
pub(crate) fn host_today(host: &Host, now: Ms) -> NaiveDate {
    let utc = DateTime::<Utc>::from_timestamp_millis(now).unwrap_or_default();
    match host.timezone.parse::<Tz>() {
        Ok(tz) => utc.with_timezone(&tz).date_naive(),
        Err(_) => utc.date_naive(),
    }
}

/// Smallest span covering every candidate in the grid.
fn grid_range(grid: &SlotGrid) -> Option<Span> {
    let mut slots = grid.values().flatten();
    let first = slots.next()?.span;
    let (start, end) = slots.fold((first.start, first.end), |(s, e), c| {
        (s.min(c.span.start), e.max(c.span.end))
    });
    Some(Span::new(start, end))
}

impl Engine {
    /// Active link and its host, or the 404-class error for whichever is missing.
    pub(super) async fn resolve_link(&self, slug: &str) -> Result<(BookingLink, Host), EngineError> {
        let store = &self.collaborators.store;
        let link = store
            .booking_link(slug)
            .await
            .filter(|l| l.active)
            .ok_or_else(|| EngineError::LinkNotFound(slug.to_string()))?;
        let host = store
            .host(&link.host_id)
            .await
            .ok_or_else(|| EngineError::HostNotFound(link.host_id.clone()))?;
        Ok((link, host))
    }

    /// Rule-derived slots for `horizon` minus external busy time, the host's
    /// committed bookings and anything not strictly after `now`.
    ///
    /// The provider call happens before any host lock is taken.
    pub(super) async fn bookable_slots(
        &self,
        host: &Host,
        link: &BookingLink,
        horizon: Horizon,
        now: Ms,
    ) -> (SlotGrid, BusyFetch) {
        let rules = self.collaborators.store.list_rules(&host.id).await;
        let grid = generate_slots(&rules, horizon, link.duration_minutes);
        let Some(range) = grid_range(&grid) else {
            return (grid, BusyFetch::Fresh(Vec::new()));
        };

        let fetch = fetch_busy(
            self.collaborators.busy.as_ref(),
            host,
            range,
            self.options.provider_timeout,
        )
        .await;
        if let Some(reason) = fetch.degraded_reason() {
            tracing::warn!(host = %host.id, "busy time unavailable, listing host as free: {reason}");
            metrics::counter!(BUSY_FETCH_DEGRADED_TOTAL).increment(1);
        }

        let own = self.committed_spans(&host.id, &range).await;
        let busy = BusyIndex::new(fetch.intervals().iter().copied().chain(own));
        (filter_conflicts(grid, &busy, now), fetch)
    }

    async fn committed_spans(&self, host_id: &str, range: &Span) -> Vec<Span> {
        let Some(rs) = self.existing_host_state(host_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.overlapping(range).map(|b| b.span).collect()
    }

    /// Bookable slots for the `days` calendar days after today (host timezone).
    /// `days` defaults to the configured horizon.
    pub async fn list_availability(
        &self,
        slug: &str,
        days: Option<u32>,
        now: Ms,
    ) -> Result<Availability, EngineError> {
        let days = days.unwrap_or(self.options.default_days);
        if days == 0 {
            return Err(EngineError::InvalidInput("days must be at least 1".into()));
        }
        if days > MAX_HORIZON_DAYS {
            return Err(EngineError::LimitExceeded("days beyond booking horizon"));
        }

        let (link, host) = self.resolve_link(slug).await?;
        let horizon = Horizon::after(host_today(&host, now), days)
            .ok_or_else(|| EngineError::InvalidInput("date out of range".into()))?;
        let (slots, fetch) = self.bookable_slots(&host, &link, horizon, now).await;

        Ok(Availability {
            link,
            host,
            slots,
            degraded: fetch.degraded_reason().map(str::to_owned),
        })
    }

    /// Committed bookings for a host, ordered by start.
    pub async fn bookings_for(&self, host_id: &str) -> Vec<Booking> {
        match self.existing_host_state(host_id) {
            Some(rs) => rs.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }
}
