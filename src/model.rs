use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open stay interval `[start, end)` in calendar days.
///
/// The end date is the checkout day and is exclusive, so a stay ending on a
/// given day never overlaps a stay starting that same day (same-day turnover).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl StayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "StayRange start must be before end");
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// The strict half-open overlap predicate: adjacent ranges do not overlap.
    pub fn overlaps(&self, other: &StayRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

impl std::fmt::Display for StayRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A room in the catalog. Names are lowercased on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A guest booking request. Name and email are lowercased on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub stay: StayRange,
    pub room_id: Ulid,
    /// False until staff mark the reservation as handled.
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A date interval during which a room cannot be booked. Booking-linked
/// restrictions carry the reservation id; maintenance blocks carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub id: Ulid,
    pub stay: StayRange,
    pub room_id: Ulid,
    pub reservation_id: Option<Ulid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-room live state: the room record plus its restrictions, sorted by
/// `stay.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub restrictions: Vec<Restriction>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            restrictions: Vec::new(),
        }
    }

    /// Insert a restriction maintaining sort order by stay.start.
    pub fn insert_restriction(&mut self, restriction: Restriction) {
        let pos = self
            .restrictions
            .binary_search_by_key(&restriction.stay.start, |r| r.stay.start)
            .unwrap_or_else(|e| e);
        self.restrictions.insert(pos, restriction);
    }

    /// Remove a restriction by id.
    pub fn remove_restriction(&mut self, id: Ulid) -> Option<Restriction> {
        if let Some(pos) = self.restrictions.iter().position(|r| r.id == id) {
            Some(self.restrictions.remove(pos))
        } else {
            None
        }
    }

    pub fn get_restriction(&self, id: Ulid) -> Option<&Restriction> {
        self.restrictions.iter().find(|r| r.id == id)
    }

    /// Restrictions whose stay overlaps the query window, using the strict
    /// predicate. Binary search skips restrictions starting at or after
    /// `query.end`.
    pub fn overlapping(&self, query: &StayRange) -> impl Iterator<Item = &Restriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.stay.start < query.end);
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| r.stay.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// `BookingCommitted` carries both rows of a guest booking so the pair is a
/// single atomic record: replay either sees both or neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomRenamed {
        id: Ulid,
        name: String,
        at: DateTime<Utc>,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingCommitted {
        reservation: Reservation,
        restriction: Restriction,
    },
    ReservationCancelled {
        reservation_id: Ulid,
        restriction_id: Option<Ulid>,
        room_id: Ulid,
    },
    GuestUpdated {
        reservation_id: Ulid,
        room_id: Ulid,
        first_name: String,
        last_name: String,
        email: String,
        phone: String,
        at: DateTime<Utc>,
    },
    ProcessedChanged {
        reservation_id: Ulid,
        room_id: Ulid,
        processed: bool,
        at: DateTime<Utc>,
    },
    RestrictionAdded {
        restriction: Restriction,
    },
    RestrictionRemoved {
        restriction_id: Ulid,
        room_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Room> for RoomInfo {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            created_at: room.created_at,
            updated_at: room.updated_at,
        }
    }
}

/// A reservation with its room name joined in, the shape staff listings use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationView {
    pub reservation: Reservation,
    pub room_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> StayRange {
        StayRange::new(day(start), day(end))
    }

    fn block(start: &str, end: &str) -> Restriction {
        Restriction {
            id: Ulid::new(),
            stay: range(start, end),
            room_id: Ulid::new(),
            reservation_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_room() -> RoomState {
        RoomState::new(Room {
            id: Ulid::new(),
            name: "generals quarters".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn stay_range_basics() {
        let r = range("2024-06-10", "2024-06-15");
        assert_eq!(r.nights(), 5);
        assert!(r.contains_day(day("2024-06-10")));
        assert!(r.contains_day(day("2024-06-14")));
        assert!(!r.contains_day(day("2024-06-15"))); // half-open
    }

    #[test]
    fn stay_range_overlap() {
        let a = range("2024-06-10", "2024-06-15");
        let b = range("2024-06-14", "2024-06-16");
        let c = range("2024-06-15", "2024-06-20");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn restriction_ordering() {
        let mut rs = make_room();
        rs.insert_restriction(block("2024-07-01", "2024-07-05"));
        rs.insert_restriction(block("2024-06-01", "2024-06-05"));
        rs.insert_restriction(block("2024-06-15", "2024-06-20"));
        assert_eq!(rs.restrictions[0].stay.start, day("2024-06-01"));
        assert_eq!(rs.restrictions[1].stay.start, day("2024-06-15"));
        assert_eq!(rs.restrictions[2].stay.start, day("2024-07-01"));
    }

    #[test]
    fn restriction_remove() {
        let mut rs = make_room();
        let r = block("2024-06-01", "2024-06-05");
        let id = r.id;
        rs.insert_restriction(r);
        assert_eq!(rs.restrictions.len(), 1);
        assert!(rs.remove_restriction(id).is_some());
        assert!(rs.restrictions.is_empty());
        assert!(rs.remove_restriction(id).is_none());
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut rs = make_room();
        rs.insert_restriction(block("2024-05-01", "2024-05-05"));
        rs.insert_restriction(block("2024-06-12", "2024-06-18"));
        rs.insert_restriction(block("2024-08-01", "2024-08-05"));

        let query = range("2024-06-10", "2024-06-20");
        let hits: Vec<_> = rs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].stay, range("2024-06-12", "2024-06-18"));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // A restriction ending exactly at query.start does not overlap.
        let mut rs = make_room();
        rs.insert_restriction(block("2024-06-10", "2024-06-15"));
        let query = range("2024-06-15", "2024-06-20");
        assert!(rs.overlapping(&query).next().is_none());
    }

    #[test]
    fn overlapping_large_restriction_spanning_query() {
        let mut rs = make_room();
        rs.insert_restriction(block("2024-01-01", "2024-12-31"));
        let query = range("2024-06-10", "2024-06-12");
        assert_eq!(rs.overlapping(&query).count(), 1);
    }

    #[test]
    fn overlapping_empty_room() {
        let rs = make_room();
        let query = range("2024-06-10", "2024-06-20");
        assert!(rs.overlapping(&query).next().is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::RoomCreated {
            room: Room {
                id: Ulid::new(),
                name: "majors suite".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn booking_event_roundtrip_keeps_pair() {
        let room_id = Ulid::new();
        let res = Reservation {
            id: Ulid::new(),
            first_name: "john".into(),
            last_name: "smith".into(),
            email: "john@smith.com".into(),
            phone: "555-0100".into(),
            stay: range("2024-06-10", "2024-06-15"),
            room_id,
            processed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let restriction = Restriction {
            id: Ulid::new(),
            stay: res.stay,
            room_id,
            reservation_id: Some(res.id),
            created_at: res.created_at,
            updated_at: res.updated_at,
        };
        let event = Event::BookingCommitted {
            reservation: res,
            restriction,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
