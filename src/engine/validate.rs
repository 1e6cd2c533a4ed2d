use crate::limits::*;
use crate::model::{CellState, Day};

use super::EngineError;

fn check_day_range(day: Day, what: &'static str) -> Result<(), EngineError> {
    if !(MIN_VALID_DAY..=MAX_VALID_DAY).contains(&day) {
        return Err(EngineError::InvalidAssignment(what));
    }
    Ok(())
}

/// Structural validation of a candidate assignment. Needs no store access,
/// so callers can re-run it freely (e.g. per keystroke in a form).
pub(crate) fn validate_assignment_shape(
    start_day: Day,
    end_day: Day,
    note: Option<&str>,
) -> Result<(), EngineError> {
    check_day_range(start_day, "start day out of range")?;
    check_day_range(end_day, "end day out of range")?;
    if start_day > end_day {
        return Err(EngineError::InvalidAssignment("start day after end day"));
    }
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN {
            return Err(EngineError::InvalidAssignment("note too long"));
        }
    Ok(())
}

pub(crate) fn validate_occupant(
    name: &str,
    surname: &str,
    born: Option<Day>,
    today: Day,
) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::InvalidOccupant("name is empty"));
    }
    if surname.is_empty() {
        return Err(EngineError::InvalidOccupant("surname is empty"));
    }
    if name.len() > MAX_NAME_LEN || surname.len() > MAX_NAME_LEN {
        return Err(EngineError::InvalidOccupant("name too long"));
    }
    if let Some(born) = born {
        if born > today {
            return Err(EngineError::InvalidOccupant("born in the future"));
        }
        check_day_range(born, "born out of range")
            .map_err(|_| EngineError::InvalidOccupant("born out of range"))?;
    }
    Ok(())
}

pub(crate) fn validate_cell(capacity: u32) -> Result<(), EngineError> {
    if capacity < 1 {
        return Err(EngineError::InvalidCell("capacity must be at least 1"));
    }
    Ok(())
}

/// Capacity gate for `create_assignment`. Caller holds the cell's write lock
/// across this check and the subsequent insert — that lock is what makes
/// check-then-insert atomic per cell.
pub(crate) fn check_capacity(cs: &CellState, today: Day) -> Result<(), EngineError> {
    if cs.active_count(today) >= cs.capacity {
        return Err(EngineError::CellFull {
            cell_id: cs.id,
            capacity: cs.capacity,
        });
    }
    Ok(())
}
