use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::model::*;

/// Day-grouped candidate grid. Dates with no candidates are never present.
pub type SlotGrid = BTreeMap<NaiveDate, Vec<SlotCandidate>>;

/// Inclusive range of local dates to generate slots for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl Horizon {
    /// `[today + 1, today + days]`. Today itself is never offered.
    pub fn after(today: NaiveDate, days: u32) -> Option<Self> {
        if days == 0 {
            return None;
        }
        Some(Self {
            first: today.succ_opt()?,
            last: today.checked_add_days(chrono::Days::new(days as u64))?,
        })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { first: date, last: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first <= date && date <= self.last
    }
}

/// Expand weekly rules into concrete slots over the horizon.
///
/// Each matching rule is stepped from its start in `duration` increments; a slot
/// is emitted only while it ends at or before the rule's end, so a window that
/// ends mid-increment drops the partial slot. Local times are read in the rule's
/// zone: a time inside a DST gap produces no slot, an ambiguous time takes the
/// earlier instant. Slots from overlapping rules are de-duplicated by start.
pub fn generate_slots(rules: &[AvailabilityRule], horizon: Horizon, duration_minutes: u32) -> SlotGrid {
    let mut grid = SlotGrid::new();
    if duration_minutes == 0 {
        return grid;
    }

    let resolved: Vec<(&AvailabilityRule, Tz)> = rules
        .iter()
        .filter(|r| r.active)
        .filter_map(|r| match r.timezone.parse::<Tz>() {
            Ok(tz) => Some((r, tz)),
            Err(_) => {
                tracing::warn!(timezone = %r.timezone, "skipping rule with unknown timezone");
                None
            }
        })
        .collect();
    if resolved.is_empty() {
        return grid;
    }

    let step = duration_minutes;
    for date in horizon.first.iter_days().take_while(|d| *d <= horizon.last) {
        let weekday = date.weekday().num_days_from_sunday() as u8;
        let midnight = date.and_time(NaiveTime::MIN);
        let mut day: Vec<SlotCandidate> = Vec::new();

        for (rule, tz) in resolved.iter().filter(|(r, _)| r.day_of_week == weekday) {
            let end = rule.end_time.minutes() as u32;
            let mut cursor = rule.start_time.minutes() as u32;
            while cursor + step <= end {
                let local = midnight + Duration::minutes(cursor as i64);
                if let Some(start) = tz.from_local_datetime(&local).earliest() {
                    let start_ms = start.timestamp_millis();
                    day.push(SlotCandidate {
                        date,
                        // cursor < end <= 24:00, always representable
                        local_start: LocalTime::from_minutes(cursor as u16).unwrap_or(LocalTime::MIDNIGHT),
                        timezone: *tz,
                        span: Span::new(start_ms, start_ms + step as Ms * MINUTE_MS),
                    });
                }
                cursor += step;
            }
        }

        if !day.is_empty() {
            day.sort_by_key(|c| c.span.start);
            day.dedup_by_key(|c| c.span.start);
            grid.insert(date, day);
        }
    }

    grid
}
