use std::fmt;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Hosts are identified by the id they carry in the settings file.
pub type HostId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Local wall-clock time as minutes after midnight. `24:00` is accepted so a
/// window can run to the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalTime(u16);

impl LocalTime {
    pub const MIDNIGHT: LocalTime = LocalTime(0);
    pub const END_OF_DAY: LocalTime = LocalTime(24 * 60);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= Self::END_OF_DAY.0).then_some(Self(minutes))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Parse `HH:MM`. Hours run 00..=24, and 24 only with `:00`.
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.trim().split_once(':')?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return None;
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let h: u16 = h.parse().ok()?;
        let m: u16 = m.parse().ok()?;
        if m > 59 || h > 24 || (h == 24 && m != 0) {
            return None;
        }
        Some(Self(h * 60 + m))
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl TryFrom<String> for LocalTime {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        LocalTime::parse(&s).ok_or_else(|| format!("invalid local time {s:?}, expected HH:MM"))
    }
}

impl From<LocalTime> for String {
    fn from(t: LocalTime) -> Self {
        t.to_string()
    }
}

/// A recurring weekly window during which a host takes meetings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: LocalTime,
    pub end_time: LocalTime,
    /// IANA zone the wall-clock times are read in.
    pub timezone: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Credentials for the host's calendar/mail provider. Absent means the host
/// has no connected provider and the null adapters are used.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarAccount {
    pub access_token: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
}

fn default_calendar_id() -> String {
    "primary".into()
}

impl fmt::Debug for CalendarAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalendarAccount")
            .field("access_token", &"<redacted>")
            .field("calendar_id", &self.calendar_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub email: String,
    pub timezone: String,
    #[serde(default)]
    pub account: Option<CalendarAccount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingType {
    Video,
    Phone,
    InPerson,
}

impl MeetingType {
    pub fn wants_video_link(self) -> bool {
        matches!(self, MeetingType::Video)
    }
}

/// Public booking page configuration. Scopes duration and host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLink {
    pub slug: String,
    pub host_id: HostId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub duration_minutes: u32,
    pub meeting_type: MeetingType,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl BookingLink {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

/// A bookable window derived from a rule. `span.end - span.start` is always
/// the link duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCandidate {
    pub date: NaiveDate,
    pub local_start: LocalTime,
    /// Zone of the rule that produced the slot; `date` and `local_start` are read in it.
    pub timezone: Tz,
    pub span: Span,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestContact {
    pub name: String,
    pub email: String,
    pub company: Option<String>,
    pub role: Option<String>,
    pub notes: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    CalendarFailed,
}

/// Where a booking attempt ended. Only the last two are ever returned to a
/// caller; the earlier ones show up in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingPhase {
    Validated,
    Committed,
    CalendarSynced,
    CalendarFailed,
}

/// A committed claim on one slot. Both statuses hold the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub host_id: HostId,
    pub link_slug: String,
    pub span: Span,
    pub guest: GuestContact,
    pub status: BookingStatus,
    pub external_event_id: Option<String>,
    pub meeting_link: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    pub fn duration_minutes(&self) -> i64 {
        self.span.duration_ms() / MINUTE_MS
    }
}

#[derive(Debug, Clone)]
pub struct HostState {
    pub host_id: HostId,
    /// Committed bookings, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl HostState {
    pub fn new(host_id: HostId) -> Self {
        Self {
            host_id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCommitted {
        booking: Booking,
    },
    CalendarSynced {
        id: Ulid,
        host_id: HostId,
        event_id: String,
        meeting_link: Option<String>,
    },
    CalendarFailed {
        id: Ulid,
        host_id: HostId,
        reason: String,
    },
}

impl Event {
    pub fn host_id(&self) -> &str {
        match self {
            Event::BookingCommitted { booking } => &booking.host_id,
            Event::CalendarSynced { host_id, .. } | Event::CalendarFailed { host_id, .. } => host_id,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_booking(host_id: &str, span: Span) -> Booking {
    Booking {
        id: Ulid::new(),
        host_id: host_id.into(),
        link_slug: "intro".into(),
        span,
        guest: GuestContact {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            ..Default::default()
        },
        status: BookingStatus::Confirmed,
        external_event_id: None,
        meeting_link: None,
        created_at: 0,
    }
}
