use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::validate::{
    check_capacity, validate_assignment_shape, validate_cell, validate_occupant,
};
use super::{Engine, EngineError, WalCommand, apply_to_cell, detach_assignment};

impl Engine {
    // ── Occupants ────────────────────────────────────────────

    pub async fn create_occupant(
        &self,
        id: Ulid,
        name: String,
        surname: String,
        born: Option<Day>,
    ) -> Result<(), EngineError> {
        if self.occupants.len() >= MAX_OCCUPANTS {
            return Err(EngineError::LimitExceeded("too many occupants"));
        }
        validate_occupant(&name, &surname, born, self.today())?;
        if self.occupants.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::OccupantCreated {
            id,
            name: name.clone(),
            surname: surname.clone(),
            born,
        };
        let _fence = self.compaction_fence.read().await;
        self.wal_append(&event).await?;
        self.occupants.insert(
            id,
            Occupant {
                id,
                name,
                surname,
                born,
            },
        );
        metrics::gauge!(observability::OCCUPANTS_ACTIVE).set(self.occupants.len() as f64);
        self.events.send(id, &event);
        Ok(())
    }

    pub async fn update_occupant(
        &self,
        id: Ulid,
        name: String,
        surname: String,
        born: Option<Day>,
    ) -> Result<(), EngineError> {
        validate_occupant(&name, &surname, born, self.today())?;
        if !self.occupants.contains_key(&id) {
            return Err(EngineError::OccupantNotFound(id));
        }

        let event = Event::OccupantUpdated {
            id,
            name: name.clone(),
            surname: surname.clone(),
            born,
        };
        let _fence = self.compaction_fence.read().await;
        self.wal_append(&event).await?;
        self.occupants.insert(
            id,
            Occupant {
                id,
                name,
                surname,
                born,
            },
        );
        self.events.send(id, &event);
        Ok(())
    }

    /// Refuses while any assignment still references the occupant — deleting
    /// would leave dangling references in cell histories.
    pub async fn delete_occupant(&self, id: Ulid) -> Result<(), EngineError> {
        let _fence = self.compaction_fence.read().await;
        // Remove before the guard check: assignment creators link into
        // occupant_assignments before re-verifying the occupant, so whichever
        // side's map operation lands second observes the other and backs off.
        let (_, occupant) = self
            .occupants
            .remove(&id)
            .ok_or(EngineError::OccupantNotFound(id))?;
        if self
            .occupant_assignments
            .get(&id)
            .is_some_and(|list| !list.is_empty())
        {
            self.occupants.insert(id, occupant);
            return Err(EngineError::HasAssignments(id));
        }

        let event = Event::OccupantDeleted { id };
        if let Err(e) = self.wal_append(&event).await {
            self.occupants.insert(id, occupant);
            return Err(e);
        }
        self.occupant_assignments.remove(&id);
        metrics::gauge!(observability::OCCUPANTS_ACTIVE).set(self.occupants.len() as f64);
        self.events.send(id, &event);
        self.events.remove(&id);
        Ok(())
    }

    // ── Cells ────────────────────────────────────────────────

    pub async fn create_cell(&self, id: Ulid, floor: i32, capacity: u32) -> Result<(), EngineError> {
        if self.cells.len() >= MAX_CELLS {
            return Err(EngineError::LimitExceeded("too many cells"));
        }
        validate_cell(capacity)?;
        if self.cells.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CellCreated {
            id,
            floor,
            capacity,
        };
        let _fence = self.compaction_fence.read().await;
        self.wal_append(&event).await?;
        let cs = CellState::new(id, floor, capacity);
        self.cells.insert(id, Arc::new(RwLock::new(cs)));
        metrics::gauge!(observability::CELLS_ACTIVE).set(self.cells.len() as f64);
        self.events.send(id, &event);
        Ok(())
    }

    /// Capacity changes are re-validated: shrinking below the number of
    /// currently active assignments fails with `CellFull`.
    pub async fn update_cell(&self, id: Ulid, floor: i32, capacity: u32) -> Result<(), EngineError> {
        validate_cell(capacity)?;
        let cs = self.get_cell(&id).ok_or(EngineError::CellNotFound(id))?;
        let mut guard = cs.write().await;
        if !self.cells.contains_key(&id) {
            // Deleted while we waited for the lock.
            return Err(EngineError::CellNotFound(id));
        }

        if capacity < guard.active_count(self.today()) {
            return Err(EngineError::CellFull {
                cell_id: id,
                capacity,
            });
        }

        let event = Event::CellUpdated {
            id,
            floor,
            capacity,
        };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Refuses while the cell holds any assignment, active or not.
    pub async fn delete_cell(&self, id: Ulid) -> Result<(), EngineError> {
        let cs = self.get_cell(&id).ok_or(EngineError::CellNotFound(id))?;
        // Hold the write lock across check + delete so a concurrent
        // create_assignment can't slip into a cell being removed.
        let guard = cs.write().await;
        if !guard.assignments.is_empty() {
            return Err(EngineError::HasAssignments(id));
        }

        let event = Event::CellDeleted { id };
        let _fence = self.compaction_fence.read().await;
        self.wal_append(&event).await?;
        self.cells.remove(&id);
        drop(guard);
        metrics::gauge!(observability::CELLS_ACTIVE).set(self.cells.len() as f64);
        self.events.send(id, &event);
        self.events.remove(&id);
        Ok(())
    }

    // ── Assignments ──────────────────────────────────────────

    /// Validate and persist a new assignment. Shape first (no store access),
    /// then referenced entities, then the capacity gate — the cell's write
    /// lock is held from the capacity read through the insert, so two
    /// concurrent creators can never jointly overshoot capacity.
    pub async fn create_assignment(
        &self,
        id: Ulid,
        occupant_id: Ulid,
        cell_id: Ulid,
        start_day: Day,
        end_day: Day,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        validate_assignment_shape(start_day, end_day, note.as_deref())?;
        if !self.occupants.contains_key(&occupant_id) {
            return Err(EngineError::OccupantNotFound(occupant_id));
        }
        if self.assignment_to_cell.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let cs = self
            .get_cell(&cell_id)
            .ok_or(EngineError::CellNotFound(cell_id))?;
        let mut guard = cs.write().await;
        if !self.cells.contains_key(&cell_id) {
            // Deleted while we waited for the lock.
            return Err(EngineError::CellNotFound(cell_id));
        }
        if self.assignment_to_cell.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.assignments.len() >= MAX_ASSIGNMENTS_PER_CELL {
            return Err(EngineError::LimitExceeded("too many assignments in cell"));
        }

        if let Err(e) = check_capacity(&guard, self.today()) {
            metrics::counter!(observability::ASSIGNMENTS_REJECTED_FULL_TOTAL).increment(1);
            return Err(e);
        }

        // Link into the occupant index, then re-verify the occupant: a
        // delete_occupant racing us either sees the link (HasAssignments)
        // or has already removed the occupant, which we see here.
        if !self.link_occupant(occupant_id, id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.occupants.contains_key(&occupant_id) {
            self.unlink_occupant(occupant_id, id);
            return Err(EngineError::OccupantNotFound(occupant_id));
        }

        let event = Event::AssignmentCreated {
            id,
            occupant_id,
            cell_id,
            start_day,
            end_day,
            note,
        };
        if let Err(e) = self.persist_and_apply(cell_id, &mut guard, &event).await {
            self.unlink_occupant(occupant_id, id);
            return Err(e);
        }
        metrics::counter!(observability::ASSIGNMENTS_CREATED_TOTAL).increment(1);
        debug!("assignment {id} created: occupant {occupant_id} into cell {cell_id}");
        Ok(())
    }

    /// Replace the assignment wholesale (delete+insert semantics). The new
    /// value is re-validated structurally; capacity is deliberately not
    /// re-checked against other occupants — an edit is a correction, not a
    /// new admission.
    pub async fn update_assignment(
        &self,
        id: Ulid,
        occupant_id: Ulid,
        cell_id: Ulid,
        start_day: Day,
        end_day: Day,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        validate_assignment_shape(start_day, end_day, note.as_deref())?;
        if !self.occupants.contains_key(&occupant_id) {
            return Err(EngineError::OccupantNotFound(occupant_id));
        }
        let old_cell_id = self
            .get_cell_for_assignment(&id)
            .ok_or(EngineError::AssignmentNotFound(id))?;

        let event = Event::AssignmentUpdated {
            id,
            occupant_id,
            cell_id,
            start_day,
            end_day,
            note,
        };

        if cell_id == old_cell_id {
            let cs = self
                .get_cell(&cell_id)
                .ok_or(EngineError::CellNotFound(cell_id))?;
            let mut guard = cs.write().await;
            if guard.get_assignment(id).is_none() {
                // Deleted while we waited for the lock; applying anyway
                // would resurrect it past the capacity gate.
                return Err(EngineError::AssignmentNotFound(id));
            }
            let newly = self.link_occupant(occupant_id, id);
            if !self.occupants.contains_key(&occupant_id) {
                if newly {
                    self.unlink_occupant(occupant_id, id);
                }
                return Err(EngineError::OccupantNotFound(occupant_id));
            }
            if let Err(e) = self.persist_and_apply(cell_id, &mut guard, &event).await {
                if newly {
                    self.unlink_occupant(occupant_id, id);
                }
                return Err(e);
            }
            return Ok(());
        }

        // Cell move: lock both cells in sorted id order to prevent deadlocks
        // between concurrent opposite-direction moves.
        let old_cs = self
            .get_cell(&old_cell_id)
            .ok_or(EngineError::CellNotFound(old_cell_id))?;
        let new_cs = self
            .get_cell(&cell_id)
            .ok_or(EngineError::CellNotFound(cell_id))?;
        let (mut old_guard, mut new_guard) = if old_cell_id < cell_id {
            let o = old_cs.write_owned().await;
            let n = new_cs.write_owned().await;
            (o, n)
        } else {
            let n = new_cs.write_owned().await;
            let o = old_cs.write_owned().await;
            (o, n)
        };
        if old_guard.get_assignment(id).is_none() {
            // Deleted while we waited for the locks.
            return Err(EngineError::AssignmentNotFound(id));
        }
        if new_guard.assignments.len() >= MAX_ASSIGNMENTS_PER_CELL {
            return Err(EngineError::LimitExceeded("too many assignments in cell"));
        }
        let newly = self.link_occupant(occupant_id, id);
        if !self.occupants.contains_key(&occupant_id) {
            if newly {
                self.unlink_occupant(occupant_id, id);
            }
            return Err(EngineError::OccupantNotFound(occupant_id));
        }

        let _fence = self.compaction_fence.read().await;
        if let Err(e) = self.wal_append(&event).await {
            if newly {
                self.unlink_occupant(occupant_id, id);
            }
            return Err(e);
        }
        detach_assignment(&mut old_guard, id, &self.occupant_assignments);
        apply_to_cell(
            &mut new_guard,
            &event,
            &self.assignment_to_cell,
            &self.occupant_assignments,
        );
        self.events.send(old_cell_id, &event);
        self.events.send(cell_id, &event);
        debug!("assignment {id} moved from cell {old_cell_id} to {cell_id}");
        Ok(())
    }

    pub async fn delete_assignment(&self, id: Ulid) -> Result<(), EngineError> {
        let (cell_id, mut guard) = self.resolve_assignment_write(&id).await?;
        let event = Event::AssignmentDeleted { id, cell_id };
        self.persist_and_apply(cell_id, &mut guard, &event).await?;
        metrics::counter!(observability::ASSIGNMENTS_DELETED_TOTAL).increment(1);
        debug!("assignment {id} deleted from cell {cell_id}");
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state:
    /// occupants first, then each cell followed by its assignments.
    ///
    /// Two phases. The writer first starts recording every append it flushes,
    /// then the snapshot is taken behind the compaction fence; an append
    /// acknowledged at any point lands in the snapshot or in the recorded
    /// tail, never in neither, so compaction cannot drop a durable write.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::CompactBegin { response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?;

        // Wait out every mutation acknowledged before recording started that
        // has not applied to the maps yet.
        drop(self.compaction_fence.write().await);

        let mut events = Vec::new();

        for entry in self.occupants.iter() {
            let o = entry.value();
            events.push(Event::OccupantCreated {
                id: o.id,
                name: o.name.clone(),
                surname: o.surname.clone(),
                born: o.born,
            });
        }

        let cells: Vec<_> = self
            .cells
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for cs in cells {
            let guard = cs.read().await;
            events.push(Event::CellCreated {
                id: guard.id,
                floor: guard.floor,
                capacity: guard.capacity,
            });
            for a in &guard.assignments {
                events.push(Event::AssignmentCreated {
                    id: a.id,
                    occupant_id: a.occupant_id,
                    cell_id: guard.id,
                    start_day: a.start_day,
                    end_day: a.end_day,
                    note: a.note.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
