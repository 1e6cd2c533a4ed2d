use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed assignment input (bad date ordering, out-of-range day,
    /// oversized note). Detected before any store access.
    InvalidAssignment(&'static str),
    InvalidOccupant(&'static str),
    InvalidCell(&'static str),
    OccupantNotFound(Ulid),
    CellNotFound(Ulid),
    AssignmentNotFound(Ulid),
    /// Capacity exhausted at validation time. Retryable against another cell.
    CellFull { cell_id: Ulid, capacity: u32 },
    /// Delete refused: assignments still reference the entity.
    HasAssignments(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// Persistence failed; the operation was not applied.
    Storage(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidAssignment(msg) => write!(f, "invalid assignment: {msg}"),
            EngineError::InvalidOccupant(msg) => write!(f, "invalid occupant: {msg}"),
            EngineError::InvalidCell(msg) => write!(f, "invalid cell: {msg}"),
            EngineError::OccupantNotFound(id) => write!(f, "occupant not found: {id}"),
            EngineError::CellNotFound(id) => write!(f, "cell not found: {id}"),
            EngineError::AssignmentNotFound(id) => write!(f, "assignment not found: {id}"),
            EngineError::CellFull { cell_id, capacity } => {
                write!(f, "cell {cell_id} is full: all {capacity} places occupied")
            }
            EngineError::HasAssignments(id) => {
                write!(f, "cannot delete {id}: assignments still reference it")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
