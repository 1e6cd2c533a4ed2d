use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Days since the Unix epoch — the only date type.
pub type Day = i64;

/// A person placed into a capacity-limited cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupant {
    pub id: Ulid,
    pub name: String,
    pub surname: String,
    /// Birth date; must not be in the future at validation time.
    pub born: Option<Day>,
}

/// A time-bounded stay of one occupant in one cell.
///
/// The owning cell is implied by which [`CellState`] holds the assignment;
/// events and query results carry the cell id explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub occupant_id: Ulid,
    pub start_day: Day,
    /// Exclusive: an assignment ending on day `d` is no longer active at `d`.
    pub end_day: Day,
    /// Free-text descriptor (e.g. the punishment).
    pub note: Option<String>,
}

impl Assignment {
    /// Active at `d` iff the end day is strictly after `d`.
    pub fn is_active(&self, d: Day) -> bool {
        self.end_day > d
    }
}

/// Full in-memory state of a cell: its attributes plus every assignment
/// referencing it, sorted by `start_day`.
#[derive(Debug, Clone)]
pub struct CellState {
    pub id: Ulid,
    /// Floor index of the cell.
    pub floor: i32,
    /// Max concurrent active assignments. Always >= 1.
    pub capacity: u32,
    pub assignments: Vec<Assignment>,
}

impl CellState {
    pub fn new(id: Ulid, floor: i32, capacity: u32) -> Self {
        Self {
            id,
            floor,
            capacity,
            assignments: Vec::new(),
        }
    }

    /// Insert assignment maintaining sort order by start_day.
    pub fn insert_assignment(&mut self, assignment: Assignment) {
        let pos = self
            .assignments
            .binary_search_by_key(&assignment.start_day, |a| a.start_day)
            .unwrap_or_else(|e| e);
        self.assignments.insert(pos, assignment);
    }

    /// Remove assignment by id.
    pub fn remove_assignment(&mut self, id: Ulid) -> Option<Assignment> {
        if let Some(pos) = self.assignments.iter().position(|a| a.id == id) {
            Some(self.assignments.remove(pos))
        } else {
            None
        }
    }

    pub fn get_assignment(&self, id: Ulid) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    /// Number of assignments active at `d`. Recomputed on every call —
    /// "active" is derived from the end day, never stored.
    pub fn active_count(&self, d: Day) -> u32 {
        self.assignments.iter().filter(|a| a.is_active(d)).count() as u32
    }

    /// `capacity − active_count`, saturating at zero.
    pub fn free_capacity(&self, d: Day) -> u32 {
        self.capacity.saturating_sub(self.active_count(d))
    }

    pub fn is_empty_at(&self, d: Day) -> bool {
        self.assignments.iter().all(|a| !a.is_active(d))
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OccupantCreated {
        id: Ulid,
        name: String,
        surname: String,
        born: Option<Day>,
    },
    OccupantUpdated {
        id: Ulid,
        name: String,
        surname: String,
        born: Option<Day>,
    },
    OccupantDeleted {
        id: Ulid,
    },
    CellCreated {
        id: Ulid,
        floor: i32,
        capacity: u32,
    },
    CellUpdated {
        id: Ulid,
        floor: i32,
        capacity: u32,
    },
    CellDeleted {
        id: Ulid,
    },
    AssignmentCreated {
        id: Ulid,
        occupant_id: Ulid,
        cell_id: Ulid,
        start_day: Day,
        end_day: Day,
        note: Option<String>,
    },
    /// Delete+insert semantics: the assignment with this id is replaced
    /// wholesale, possibly moving to a different cell.
    AssignmentUpdated {
        id: Ulid,
        occupant_id: Ulid,
        cell_id: Ulid,
        start_day: Day,
        end_day: Day,
        note: Option<String>,
    },
    AssignmentDeleted {
        id: Ulid,
        cell_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    pub id: Ulid,
    pub floor: i32,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentInfo {
    pub id: Ulid,
    pub occupant_id: Ulid,
    pub cell_id: Ulid,
    pub start_day: Day,
    pub end_day: Day,
    pub note: Option<String>,
}

impl AssignmentInfo {
    pub fn from_assignment(a: &Assignment, cell_id: Ulid) -> Self {
        Self {
            id: a.id,
            occupant_id: a.occupant_id,
            cell_id,
            start_day: a.start_day,
            end_day: a.end_day,
            note: a.note.clone(),
        }
    }
}
