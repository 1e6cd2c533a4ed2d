//! Hard limits. Everything a caller can grow without bound gets a cap.

use crate::model::Day;

pub const MAX_CELLS: usize = 100_000;
pub const MAX_OCCUPANTS: usize = 1_000_000;
pub const MAX_ASSIGNMENTS_PER_CELL: usize = 10_000;

/// Applies to occupant name and surname.
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 1_024;

/// Accepted day range: 1900-01-01 .. 2200-01-01.
pub const MIN_VALID_DAY: Day = -25_567;
pub const MAX_VALID_DAY: Day = 84_006;
