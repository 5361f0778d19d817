use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type inside the engine.
pub type Ms = i64;

/// Rejected `[begin, end)` pair: `begin` must be strictly before `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRange {
    pub begin: Ms,
    pub end: Ms,
}

impl std::fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid range [{}, {}): begin must be before end", self.begin, self.end)
    }
}

impl std::error::Error for InvalidRange {}

/// Half-open interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: Ms,
    pub end: Ms,
}

impl TimeRange {
    pub fn new(begin: Ms, end: Ms) -> Result<Self, InvalidRange> {
        if begin >= end {
            return Err(InvalidRange { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Ulid,
    pub environment_id: Ulid,
    pub range: TimeRange,
    pub note: Option<String>,
    pub by_user: String,
    pub last_changed: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub id: Ulid,
    pub org_id: String,
    pub owner: String,
    pub note: Option<String>,
    pub last_changed: Ms,
}

#[derive(Debug, Clone)]
pub struct EnvironmentState {
    pub id: Ulid,
    pub org_id: String,
    pub owner: String,
    pub note: Option<String>,
    pub last_changed: Ms,
    /// All reservations on this environment, sorted by `range.begin`.
    pub reservations: Vec<Reservation>,
}

impl EnvironmentState {
    pub fn new(id: Ulid, org_id: String, owner: String, note: Option<String>, last_changed: Ms) -> Self {
        Self {
            id,
            org_id,
            owner,
            note,
            last_changed,
            reservations: Vec::new(),
        }
    }

    pub fn info(&self) -> EnvironmentInfo {
        EnvironmentInfo {
            id: self.id,
            org_id: self.org_id.clone(),
            owner: self.owner.clone(),
            note: self.note.clone(),
            last_changed: self.last_changed,
        }
    }

    /// Insert keeping sort order by `range.begin`.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.range.begin <= reservation.range.begin);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations whose range overlaps `query`.
    /// Everything at or after the partition point begins at or after `query.end`.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.range.begin < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.range.end > query.begin)
    }
}

/// WAL record format. Row-mutating events carry the `last_changed` they assign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EnvironmentCreated {
        id: Ulid,
        org_id: String,
        owner: String,
        note: Option<String>,
        at: Ms,
    },
    EnvironmentUpdated {
        id: Ulid,
        owner: String,
        note: Option<String>,
        at: Ms,
    },
    EnvironmentDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        environment_id: Ulid,
        range: TimeRange,
        by_user: String,
        note: Option<String>,
        at: Ms,
    },
    ReservationUpdated {
        id: Ulid,
        environment_id: Ulid,
        range: TimeRange,
        note: Option<String>,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: Ms, end: Ms) -> TimeRange {
        TimeRange::new(begin, end).unwrap()
    }

    fn reservation(begin: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            environment_id: Ulid::nil(),
            range: range(begin, end),
            note: None,
            by_user: "alice".into(),
            last_changed: 0,
        }
    }

    fn environment() -> EnvironmentState {
        EnvironmentState::new(Ulid::new(), "org".into(), "ops".into(), None, 0)
    }

    #[test]
    fn range_rejects_empty_and_inverted() {
        assert_eq!(TimeRange::new(100, 100), Err(InvalidRange { begin: 100, end: 100 }));
        assert!(TimeRange::new(200, 100).is_err());
        assert_eq!(range(100, 250), TimeRange { begin: 100, end: 250 });
    }

    #[test]
    fn range_overlap() {
        let a = range(100, 200);
        let b = range(150, 250);
        let c = range(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, half-open
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_containment_overlaps() {
        let outer = range(0, 1000);
        let inner = range(400, 500);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert!(outer.overlaps(&outer));
    }

    #[test]
    fn reservations_kept_sorted_by_begin() {
        let mut es = environment();
        es.insert_reservation(reservation(300, 400));
        es.insert_reservation(reservation(100, 200));
        es.insert_reservation(reservation(200, 300));
        let begins: Vec<Ms> = es.reservations.iter().map(|r| r.range.begin).collect();
        assert_eq!(begins, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut es = environment();
        let rs: Vec<Reservation> = (0..3).map(|i| reservation(i * 100, i * 100 + 50)).collect();
        for r in &rs {
            es.insert_reservation(r.clone());
        }
        assert!(es.remove_reservation(rs[1].id).is_some());
        assert_eq!(es.reservations.len(), 2);
        assert_eq!(es.reservations[0].id, rs[0].id);
        assert_eq!(es.reservations[1].id, rs[2].id);
        assert!(es.remove_reservation(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut es = environment();
        es.insert_reservation(reservation(100, 200));
        es.insert_reservation(reservation(450, 600));
        es.insert_reservation(reservation(1000, 1100));

        let hits: Vec<_> = es.overlapping(&range(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].range, range(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut es = environment();
        es.insert_reservation(reservation(100, 200));
        es.insert_reservation(reservation(300, 400));
        assert_eq!(es.overlapping(&range(200, 300)).count(), 0);
    }

    #[test]
    fn overlapping_single_ms() {
        let mut es = environment();
        es.insert_reservation(reservation(100, 201));
        assert_eq!(es.overlapping(&range(200, 300)).count(), 1);
    }

    #[test]
    fn overlapping_long_reservation_spanning_query() {
        let mut es = environment();
        es.insert_reservation(reservation(0, 10_000));
        assert_eq!(es.overlapping(&range(500, 600)).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            environment_id: Ulid::new(),
            range: range(1_000, 2_000),
            by_user: "bob".into(),
            note: Some("load test".into()),
            at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
