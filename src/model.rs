use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds. Reservation spans are time-of-day offsets from local midnight;
/// creation timestamps are unix milliseconds.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

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

    /// Like `new`, but returns `None` for empty or inverted intervals.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
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

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_time_of_day(self.start), format_time_of_day(self.end))
    }
}

/// Offset of a wall-clock time from midnight.
pub fn time_of_day_ms(t: NaiveTime) -> Ms {
    t.num_seconds_from_midnight() as Ms * 1000 + (t.nanosecond() / 1_000_000) as Ms
}

/// `HH:MM` rendering of a time-of-day offset. `24:00` is printed for end-of-day.
pub fn format_time_of_day(ms: Ms) -> String {
    let minutes = ms.div_euclid(MINUTE_MS);
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

// ── Identifiers ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacilityId(pub String);

impl FacilityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FacilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Facilities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacilityStatus {
    Open,
    Maintenance,
    Closed,
}

impl FacilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityStatus::Open => "Open",
            FacilityStatus::Maintenance => "Maintenance",
            FacilityStatus::Closed => "Closed",
        }
    }
}

impl FromStr for FacilityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FacilityStatus::Open),
            "maintenance" => Ok(FacilityStatus::Maintenance),
            "closed" => Ok(FacilityStatus::Closed),
            other => Err(format!("unknown facility status: {other}")),
        }
    }
}

/// A bookable shared resource. Owned by the catalog; read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: FacilityId,
    pub name: String,
    /// Category used for grouping, e.g. "badminton" or "pool".
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Max simultaneous overlapping reservations.
    #[serde(rename = "maxCapacity", alias = "max_capacity")]
    pub max_capacity: u32,
    pub status: FacilityStatus,
}

impl Facility {
    pub fn is_open(&self) -> bool {
        self.status == FacilityStatus::Open
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }
}

/// Who is acting: the authenticated user plus the role from their profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: UserId::new(user_id),
            name: name.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    /// Terminal. Kept for history, never counted toward capacity.
    Cancelled,
}

impl ReservationStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub owner: UserId,
    pub requester_name: String,
    pub facility_id: FacilityId,
    pub date: NaiveDate,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
}

impl Reservation {
    pub fn key(&self) -> PartitionKey {
        PartitionKey::new(self.facility_id.clone(), self.date)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// The unit of transactional isolation: one facility on one day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub facility_id: FacilityId,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(facility_id: FacilityId, date: NaiveDate) -> Self {
        Self { facility_id, date }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.facility_id, self.date)
    }
}

/// All reservations of one facility on one day, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: PartitionKey,
    pub reservations: Vec<Reservation>,
    /// Advisory running count of active reservations, for display only.
    /// Admission never reads it; `recount` restores it from the ledger.
    pub occupancy: u32,
}

impl Partition {
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
            occupancy: 0,
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }

    /// Exact count of active reservations overlapping `span`. This is the
    /// authoritative load figure.
    pub fn active_overlap_count(&self, span: &Span) -> u32 {
        self.overlapping(span).filter(|r| r.is_active()).count() as u32
    }

    pub fn active_count(&self) -> u32 {
        self.active().count() as u32
    }

    /// Reset the advisory counter from the ledger.
    pub fn recount(&mut self) {
        self.occupancy = self.active_count();
    }
}

/// WAL record format. One committed transaction is one or more of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        key: PartitionKey,
    },
    ReservationCancelled {
        id: Ulid,
        key: PartitionKey,
        cancelled_by: UserId,
    },
}

impl Event {
    pub fn key(&self) -> PartitionKey {
        match self {
            Event::ReservationCreated { reservation } => reservation.key(),
            Event::ReservationConfirmed { key, .. } | Event::ReservationCancelled { key, .. } => {
                key.clone()
            }
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Load of one display bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketInfo {
    pub span: Span,
    pub active: u32,
    pub capacity: u32,
    pub full: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilitySummary {
    pub facility: Facility,
    pub date: NaiveDate,
    pub occupancy: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    fn reservation(start: Ms, end: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            owner: UserId::new("SW01"),
            requester_name: "Aina".into(),
            facility_id: FacilityId::new("pool"),
            date: date(),
            span: Span::new(start, end),
            status,
            created_at: 0,
        }
    }

    fn partition(items: Vec<Reservation>) -> Partition {
        let mut p = Partition::new(PartitionKey::new(FacilityId::new("pool"), date()));
        for r in items {
            p.insert_reservation(r);
        }
        p
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(9 * HOUR_MS, 10 * HOUR_MS);
        let b = Span::new(9 * HOUR_MS + 30 * MINUTE_MS, 11 * HOUR_MS);
        let c = Span::new(10 * HOUR_MS, 11 * HOUR_MS);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 200), Some(Span::new(100, 200)));
    }

    #[test]
    fn time_of_day_conversions() {
        let t = NaiveTime::from_hms_opt(14, 30, 0).unwrap();
        assert_eq!(time_of_day_ms(t), 14 * HOUR_MS + 30 * MINUTE_MS);
        assert_eq!(format_time_of_day(14 * HOUR_MS + 30 * MINUTE_MS), "14:30");
        assert_eq!(format_time_of_day(DAY_MS), "24:00");
        assert_eq!(Span::new(8 * HOUR_MS, 9 * HOUR_MS).to_string(), "[08:00, 09:00)");
    }

    #[test]
    fn facility_status_parses_case_insensitively() {
        assert_eq!("open".parse::<FacilityStatus>(), Ok(FacilityStatus::Open));
        assert_eq!("Maintenance".parse::<FacilityStatus>(), Ok(FacilityStatus::Maintenance));
        assert!("broken".parse::<FacilityStatus>().is_err());
    }

    #[test]
    fn facility_json_uses_source_field_names() {
        let json = r#"{"id":"pool","name":"Swimming Pool","type":"pool","maxCapacity":30,"status":"Open"}"#;
        let f: Facility = serde_json::from_str(json).unwrap();
        assert_eq!(f.max_capacity, 30);
        assert_eq!(f.kind, "pool");
        assert_eq!(f.display_label(), "Swimming Pool");
        assert!(f.is_open());
    }

    #[test]
    fn partition_keeps_start_order() {
        let p = partition(vec![
            reservation(300, 400, ReservationStatus::Pending),
            reservation(100, 200, ReservationStatus::Pending),
            reservation(200, 300, ReservationStatus::Confirmed),
        ]);
        let starts: Vec<Ms> = p.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlap_count_ignores_cancelled() {
        let p = partition(vec![
            reservation(100, 200, ReservationStatus::Pending),
            reservation(150, 250, ReservationStatus::Cancelled),
            reservation(120, 180, ReservationStatus::Confirmed),
        ]);
        assert_eq!(p.active_overlap_count(&Span::new(100, 200)), 2);
        assert_eq!(p.active_count(), 2);
    }

    #[test]
    fn overlapping_skips_adjacent_and_future() {
        let p = partition(vec![
            reservation(100, 200, ReservationStatus::Pending),
            reservation(450, 600, ReservationStatus::Pending),
            reservation(1000, 1100, ReservationStatus::Pending),
        ]);
        let hits: Vec<_> = p.overlapping(&Span::new(200, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_long_reservation_spanning_query() {
        let p = partition(vec![reservation(0, DAY_MS - 1, ReservationStatus::Confirmed)]);
        assert_eq!(p.active_overlap_count(&Span::new(500, 600)), 1);
    }

    #[test]
    fn recount_restores_advisory_counter() {
        let mut p = partition(vec![
            reservation(100, 200, ReservationStatus::Pending),
            reservation(300, 400, ReservationStatus::Cancelled),
        ]);
        p.occupancy = 17;
        p.recount();
        assert_eq!(p.occupancy, 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: reservation(100, 200, ReservationStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.key().facility_id, FacilityId::new("pool"));
    }
}
