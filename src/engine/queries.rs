use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedCellState};

impl Engine {
    fn snapshot_cells(&self) -> Vec<SharedCellState> {
        // Collect the Arcs first; never hold a DashMap shard ref across await.
        self.cells.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_occupants(&self) -> Vec<Occupant> {
        let mut out: Vec<Occupant> = self.occupants.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|o| o.id);
        out
    }

    pub fn get_occupant(&self, id: &Ulid) -> Option<Occupant> {
        self.occupants.get(id).map(|e| e.value().clone())
    }

    /// Occupants whose surname matches exactly.
    pub fn occupants_by_surname(&self, surname: &str) -> Vec<Occupant> {
        let mut out: Vec<Occupant> = self
            .occupants
            .iter()
            .filter(|e| e.value().surname == surname)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|o| o.id);
        out
    }

    pub async fn list_cells(&self) -> Vec<CellInfo> {
        let mut out = Vec::new();
        for cs in self.snapshot_cells() {
            let guard = cs.read().await;
            out.push(CellInfo {
                id: guard.id,
                floor: guard.floor,
                capacity: guard.capacity,
            });
        }
        out.sort_by_key(|c| c.id);
        out
    }

    pub async fn get_cell_info(&self, id: &Ulid) -> Option<CellInfo> {
        let cs = self.get_cell(id)?;
        let guard = cs.read().await;
        Some(CellInfo {
            id: guard.id,
            floor: guard.floor,
            capacity: guard.capacity,
        })
    }

    /// Every assignment in the registry, active or not.
    pub async fn list_assignments(&self) -> Vec<AssignmentInfo> {
        let mut out = Vec::new();
        for cs in self.snapshot_cells() {
            let guard = cs.read().await;
            for a in &guard.assignments {
                out.push(AssignmentInfo::from_assignment(a, guard.id));
            }
        }
        // Cells are scanned one at a time, so an assignment moving between
        // cells mid-scan can show up under both; keep one entry per id.
        out.sort_by_key(|a| a.id);
        out.dedup_by_key(|a| a.id);
        out.sort_by_key(|a| (a.start_day, a.id));
        out
    }

    /// All assignments referencing the cell, active or not.
    pub async fn assignments_for_cell(
        &self,
        cell_id: Ulid,
    ) -> Result<Vec<AssignmentInfo>, EngineError> {
        let cs = self
            .get_cell(&cell_id)
            .ok_or(EngineError::CellNotFound(cell_id))?;
        let guard = cs.read().await;
        Ok(guard
            .assignments
            .iter()
            .map(|a| AssignmentInfo::from_assignment(a, cell_id))
            .collect())
    }

    /// All assignments referencing the occupant, active or not.
    pub async fn assignments_for_occupant(
        &self,
        occupant_id: Ulid,
    ) -> Result<Vec<AssignmentInfo>, EngineError> {
        if !self.occupants.contains_key(&occupant_id) {
            return Err(EngineError::OccupantNotFound(occupant_id));
        }
        let ids: Vec<Ulid> = self
            .occupant_assignments
            .get(&occupant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        for aid in ids {
            if let Some(cell_id) = self.get_cell_for_assignment(&aid)
                && let Some(cs) = self.get_cell(&cell_id)
            {
                let guard = cs.read().await;
                if let Some(a) = guard.get_assignment(aid) {
                    out.push(AssignmentInfo::from_assignment(a, cell_id));
                }
            }
        }
        out.sort_by_key(|a| (a.start_day, a.id));
        Ok(out)
    }

    /// `capacity − active_count` at `day`; never negative.
    pub async fn free_capacity(&self, cell_id: Ulid, day: Day) -> Result<u32, EngineError> {
        let cs = self
            .get_cell(&cell_id)
            .ok_or(EngineError::CellNotFound(cell_id))?;
        let guard = cs.read().await;
        Ok(guard.free_capacity(day))
    }

    /// The cell holding the occupant's active assignment today, or `None`.
    ///
    /// Nothing enforces one-active-assignment-per-occupant, so on the
    /// anomalous multi-assignment case the winner is deterministic: lowest
    /// start day, then lowest assignment id.
    pub async fn cell_for_occupant(
        &self,
        occupant_id: Ulid,
    ) -> Result<Option<CellInfo>, EngineError> {
        let today = self.today();
        let assignments = self.assignments_for_occupant(occupant_id).await?;

        let winner = assignments
            .iter()
            .filter(|a| a.end_day > today)
            .min_by_key(|a| (a.start_day, a.id));

        match winner {
            Some(a) => Ok(self.get_cell_info(&a.cell_id).await),
            None => Ok(None),
        }
    }

    /// Cells with zero active assignments today. Expired history does not
    /// count — a cell whose last sentence ended yesterday is empty.
    ///
    /// Each cell is judged under its own read lock; the result is consistent
    /// per cell, not across cells.
    pub async fn empty_cells(&self) -> Vec<CellInfo> {
        let today = self.today();
        let mut out = Vec::new();
        for cs in self.snapshot_cells() {
            let guard = cs.read().await;
            if guard.is_empty_at(today) {
                out.push(CellInfo {
                    id: guard.id,
                    floor: guard.floor,
                    capacity: guard.capacity,
                });
            }
        }
        out.sort_by_key(|c| c.id);
        out
    }

    /// Occupants with an active assignment in the cell today.
    pub async fn occupants_in_cell(&self, cell_id: Ulid) -> Result<Vec<Occupant>, EngineError> {
        let cs = self
            .get_cell(&cell_id)
            .ok_or(EngineError::CellNotFound(cell_id))?;
        let today = self.today();
        let guard = cs.read().await;
        let mut out = Vec::new();
        for a in guard.assignments.iter().filter(|a| a.is_active(today)) {
            if let Some(o) = self.occupants.get(&a.occupant_id) {
                out.push(o.value().clone());
            }
        }
        Ok(out)
    }
}
