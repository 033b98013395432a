use crate::model::*;

use super::slots::SlotGrid;
use super::EngineError;

/// Wall-clock now in unix milliseconds.
pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Collapse spans sorted by start into disjoint spans. Touching spans join.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Busy time normalized into sorted, disjoint spans for O(log n) overlap tests.
#[derive(Debug, Clone, Default)]
pub struct BusyIndex {
    merged: Vec<Span>,
}

impl BusyIndex {
    pub fn new(busy: impl IntoIterator<Item = Span>) -> Self {
        let mut spans: Vec<Span> = busy.into_iter().filter(|s| s.start < s.end).collect();
        spans.sort_by_key(|s| s.start);
        Self {
            merged: merge_overlapping(&spans),
        }
    }

    /// Half-open overlap: touching a busy span at either edge is not a conflict.
    pub fn conflicts(&self, span: &Span) -> bool {
        // Disjoint and sorted, so the last span starting before `span.end` also
        // has the greatest end among those candidates.
        let right_bound = self.merged.partition_point(|b| b.start < span.end);
        right_bound > 0 && self.merged[right_bound - 1].end > span.start
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}

/// Drop candidates that start at or before `now` or overlap busy time.
/// Dates left with no candidates are removed from the grid.
pub fn filter_conflicts(grid: SlotGrid, busy: &BusyIndex, now: Ms) -> SlotGrid {
    grid.into_iter()
        .filter_map(|(date, mut slots)| {
            slots.retain(|c| c.span.start > now && !busy.conflicts(&c.span));
            (!slots.is_empty()).then_some((date, slots))
        })
        .collect()
}

/// Committed bookings are exclusive: any overlap with `span` is a conflict.
pub(crate) fn check_no_conflict(hs: &HostState, span: &Span) -> Result<(), EngineError> {
    match hs.overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::slots::{generate_slots, Horizon};
    use chrono::{NaiveDate, TimeZone, Utc};

    const M: Ms = MINUTE_MS;

    fn utc_ms(d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(2026, 3, d, h, mi, 0).unwrap().timestamp_millis()
    }

    fn monday() -> NaiveDate {
        "2026-03-16".parse().unwrap()
    }

    fn rule(day: u8, start: &str, end: &str) -> AvailabilityRule {
        AvailabilityRule {
            day_of_week: day,
            start_time: LocalTime::parse(start).unwrap(),
            end_time: LocalTime::parse(end).unwrap(),
            timezone: "UTC".into(),
            active: true,
        }
    }

    fn monday_grid() -> SlotGrid {
        generate_slots(&[rule(1, "09:00", "10:00")], Horizon::single(monday()), 30)
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(0, 10), Span::new(5, 15), Span::new(20, 30)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 15), Span::new(20, 30)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(0, 10), Span::new(10, 20)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 20)]);
    }

    #[test]
    fn merge_overlapping_keeps_end_of_enclosing_span() {
        let spans = vec![Span::new(0, 30), Span::new(5, 10), Span::new(30, 40)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 40)]);
    }

    #[test]
    fn busy_window_spanning_both_slots_removes_the_day() {
        let busy = BusyIndex::new([Span::new(utc_ms(16, 9, 15), utc_ms(16, 9, 45))]);
        let filtered = filter_conflicts(monday_grid(), &busy, 0);
        assert!(filtered.is_empty());
        assert!(!filtered.contains_key(&monday()));
    }

    #[test]
    fn touching_busy_boundaries_do_not_conflict() {
        let busy = BusyIndex::new([
            Span::new(utc_ms(16, 8, 0), utc_ms(16, 9, 0)),
            Span::new(utc_ms(16, 10, 0), utc_ms(16, 11, 0)),
        ]);
        let filtered = filter_conflicts(monday_grid(), &busy, 0);
        assert_eq!(filtered[&monday()].len(), 2);
    }

    #[test]
    fn busy_ending_one_ms_into_slot_conflicts() {
        let busy = BusyIndex::new([Span::new(utc_ms(16, 8, 0), utc_ms(16, 9, 0) + 1)]);
        let filtered = filter_conflicts(monday_grid(), &busy, 0);
        let starts: Vec<_> = filtered[&monday()].iter().map(|c| c.local_start.to_string()).collect();
        assert_eq!(starts, ["09:30"]);
    }

    #[test]
    fn busy_inside_slot_conflicts() {
        let busy = BusyIndex::new([Span::new(utc_ms(16, 9, 40), utc_ms(16, 9, 50))]);
        assert!(busy.conflicts(&Span::new(utc_ms(16, 9, 30), utc_ms(16, 10, 0))));
        assert!(!busy.conflicts(&Span::new(utc_ms(16, 9, 0), utc_ms(16, 9, 30))));
    }

    #[test]
    fn long_busy_before_short_one_still_detected() {
        // An early, long span must not be shadowed by a later short one once merged.
        let busy = BusyIndex::new([
            Span::new(utc_ms(16, 0, 0), utc_ms(16, 12, 0)),
            Span::new(utc_ms(16, 9, 0), utc_ms(16, 9, 5)),
        ]);
        assert_eq!(busy.len(), 1);
        assert!(busy.conflicts(&Span::new(utc_ms(16, 11, 0), utc_ms(16, 11, 30))));
    }

    #[test]
    fn slots_at_or_before_now_are_dropped() {
        let now = utc_ms(16, 9, 0);
        let filtered = filter_conflicts(monday_grid(), &BusyIndex::default(), now);
        let slots = &filtered[&monday()];
        assert_eq!(slots.len(), 1);
        assert!(slots[0].span.start > now);
    }

    #[test]
    fn empty_busy_list_keeps_everything_in_future() {
        let filtered = filter_conflicts(monday_grid(), &BusyIndex::new([]), 0);
        assert_eq!(filtered, monday_grid());
    }

    #[test]
    fn no_returned_slot_overlaps_busy_or_is_past() {
        let rules = [rule(1, "08:00", "18:00"), rule(2, "08:00", "18:00"), rule(3, "12:00", "20:00")];
        let grid = generate_slots(&rules, Horizon::after(monday(), 14).unwrap(), 25);
        let busy_spans: Vec<Span> = (0..40)
            .map(|i| {
                let start = utc_ms(17, 7, 0) + i * 97 * M;
                Span::new(start, start + (i % 5 + 1) * 17 * M)
            })
            .collect();
        let busy = BusyIndex::new(busy_spans.clone());
        let now = utc_ms(17, 10, 3);

        let filtered = filter_conflicts(grid, &busy, now);
        for slot in filtered.values().flatten() {
            assert!(slot.span.start > now);
            for b in &busy_spans {
                assert!(!(slot.span.start < b.end && slot.span.end > b.start));
            }
        }
        assert!(filtered.values().all(|v| !v.is_empty()));
    }

    #[test]
    fn listing_is_idempotent() {
        let busy = BusyIndex::new([Span::new(utc_ms(16, 9, 0), utc_ms(16, 9, 10))]);
        let a = filter_conflicts(monday_grid(), &busy, utc_ms(15, 0, 0));
        let b = filter_conflicts(monday_grid(), &busy, utc_ms(15, 0, 0));
        assert_eq!(a, b);
    }

    #[test]
    fn check_no_conflict_reports_existing_booking() {
        let mut hs = HostState::new("h".into());
        let existing = test_booking("h", Span::new(utc_ms(16, 9, 0), utc_ms(16, 9, 30)));
        let existing_id = existing.id;
        hs.insert_booking(existing);

        let clash = check_no_conflict(&hs, &Span::new(utc_ms(16, 9, 15), utc_ms(16, 9, 45)));
        assert!(matches!(clash, Err(EngineError::Conflict(id)) if id == existing_id));

        assert!(check_no_conflict(&hs, &Span::new(utc_ms(16, 9, 30), utc_ms(16, 10, 0))).is_ok());
    }
}
