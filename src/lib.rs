//! Occupancy allocation engine: occupants are placed into capacity-limited
//! cells by time-bounded assignments, and a cell can never hold more
//! concurrent active assignments than its declared capacity.

pub mod clock;
pub mod engine;
pub mod events;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod wal;
