mod error;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::events::EventBus;
use crate::model::*;
use crate::wal::Wal;

pub type SharedCellState = Arc<RwLock<CellState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start recording flushed appends ahead of a `Compact`.
    CompactBegin {
        response: oneshot::Sender<()>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block until the first append arrives, drain everything immediately
/// available, then a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    // Events flushed between CompactBegin and Compact; the compacted file
    // keeps them even when the compaction snapshot predates them.
    let mut tail: Option<Vec<Event>> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch, &mut tail);
                            handle_non_append(&mut wal, other, &mut tail);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch, &mut tail);
                }
            }
            other => handle_non_append(&mut wal, other, &mut tail),
        }
    }
}

fn flush_and_respond(
    wal: &mut Wal,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    tail: &mut Option<Vec<Event>>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if result.is_ok()
        && let Some(recorded) = tail.as_mut()
    {
        recorded.extend(batch.iter().map(|(event, _)| event.clone()));
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, tail: &mut Option<Vec<Event>>) {
    match cmd {
        WalCommand::CompactBegin { response } => {
            *tail = Some(Vec::new());
            let _ = response.send(());
        }
        WalCommand::Compact {
            mut events,
            response,
        } => {
            if let Some(recorded) = tail.take() {
                events.extend(recorded);
            }
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The allocation manager: validates and persists assignments, enforces
/// per-cell capacity, and answers occupancy queries. Cells, occupants, and
/// assignments live in memory, rebuilt from the WAL at startup.
pub struct Engine {
    pub cells: DashMap<Ulid, SharedCellState>,
    pub occupants: DashMap<Ulid, Occupant>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub events: Arc<EventBus>,
    /// Reverse lookup: assignment id → owning cell id.
    pub(super) assignment_to_cell: DashMap<Ulid, Ulid>,
    /// Occupant id → assignment ids referencing them.
    pub(super) occupant_assignments: DashMap<Ulid, Vec<Ulid>>,
    /// Held for read across every WAL append + in-memory apply. Compaction
    /// takes it for write once after CompactBegin, so the snapshot cannot
    /// miss an acknowledged mutation that has not reached the maps yet.
    /// Lock order: cell lock first, fence second.
    pub(super) compaction_fence: RwLock<()>,
    clock: Arc<dyn Clock>,
}

/// Remove an assignment from a cell state and from the occupant index.
fn detach_assignment(
    cs: &mut CellState,
    id: Ulid,
    occupant_index: &DashMap<Ulid, Vec<Ulid>>,
) -> Option<Assignment> {
    let old = cs.remove_assignment(id)?;
    if let Some(mut list) = occupant_index.get_mut(&old.occupant_id) {
        list.retain(|a| *a != id);
    }
    Some(old)
}

/// Apply an assignment or cell-update event to a CellState (no locking —
/// caller holds the lock). An AssignmentUpdated that moves cells must have
/// been detached from the old cell by the caller first.
fn apply_to_cell(
    cs: &mut CellState,
    event: &Event,
    assignment_index: &DashMap<Ulid, Ulid>,
    occupant_index: &DashMap<Ulid, Vec<Ulid>>,
) {
    match event {
        Event::AssignmentCreated {
            id,
            occupant_id,
            cell_id,
            start_day,
            end_day,
            note,
        }
        | Event::AssignmentUpdated {
            id,
            occupant_id,
            cell_id,
            start_day,
            end_day,
            note,
        } => {
            // Replace any previous copy and skip an existing index link, so
            // applying the same event twice is a no-op — a compacted file
            // can repeat events around its snapshot point.
            detach_assignment(cs, *id, occupant_index);
            cs.insert_assignment(Assignment {
                id: *id,
                occupant_id: *occupant_id,
                start_day: *start_day,
                end_day: *end_day,
                note: note.clone(),
            });
            assignment_index.insert(*id, *cell_id);
            let mut list = occupant_index.entry(*occupant_id).or_default();
            if !list.contains(id) {
                list.push(*id);
            }
        }
        Event::AssignmentDeleted { id, .. } => {
            detach_assignment(cs, *id, occupant_index);
            assignment_index.remove(id);
        }
        Event::CellUpdated {
            floor, capacity, ..
        } => {
            cs.floor = *floor;
            cs.capacity = *capacity;
        }
        // Occupant events and cell create/delete are handled at the map
        // level, not here.
        _ => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> std::io::Result<Self> {
        let replayed = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            cells: DashMap::new(),
            occupants: DashMap::new(),
            wal_tx,
            events,
            assignment_to_cell: DashMap::new(),
            occupant_assignments: DashMap::new(),
            compaction_fence: RwLock::new(()),
            clock,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context.
        for event in &replayed {
            engine.replay_event(event);
        }

        metrics::gauge!(crate::observability::CELLS_ACTIVE).set(engine.cells.len() as f64);
        metrics::gauge!(crate::observability::OCCUPANTS_ACTIVE).set(engine.occupants.len() as f64);

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::OccupantCreated {
                id,
                name,
                surname,
                born,
            }
            | Event::OccupantUpdated {
                id,
                name,
                surname,
                born,
            } => {
                self.occupants.insert(
                    *id,
                    Occupant {
                        id: *id,
                        name: name.clone(),
                        surname: surname.clone(),
                        born: *born,
                    },
                );
            }
            Event::OccupantDeleted { id } => {
                self.occupants.remove(id);
                self.occupant_assignments.remove(id);
            }
            Event::CellCreated {
                id,
                floor,
                capacity,
            } => {
                // A repeated create (compacted file) keeps the assignments
                // already replayed into the cell.
                if let Some(entry) = self.cells.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    guard.floor = *floor;
                    guard.capacity = *capacity;
                } else {
                    let cs = CellState::new(*id, *floor, *capacity);
                    self.cells.insert(*id, Arc::new(RwLock::new(cs)));
                }
            }
            Event::CellDeleted { id } => {
                self.cells.remove(id);
            }
            Event::AssignmentUpdated { id, cell_id, .. } => {
                // May move between cells: detach from the old owner first.
                let old_cell = self.assignment_to_cell.get(id).map(|e| *e.value());
                if let Some(old_cid) = old_cell
                    && old_cid != *cell_id
                    && let Some(entry) = self.cells.get(&old_cid)
                {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    detach_assignment(&mut guard, *id, &self.occupant_assignments);
                }
                if let Some(entry) = self.cells.get(cell_id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_cell(
                        &mut guard,
                        event,
                        &self.assignment_to_cell,
                        &self.occupant_assignments,
                    );
                }
            }
            Event::AssignmentCreated { cell_id, .. }
            | Event::AssignmentDeleted { cell_id, .. } => {
                if let Some(entry) = self.cells.get(cell_id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_cell(
                        &mut guard,
                        event,
                        &self.assignment_to_cell,
                        &self.occupant_assignments,
                    );
                }
            }
            Event::CellUpdated { id, .. } => {
                if let Some(entry) = self.cells.get(id) {
                    let arc = entry.value().clone();
                    let mut guard = arc.try_write().expect("replay: uncontended write");
                    apply_to_cell(
                        &mut guard,
                        event,
                        &self.assignment_to_cell,
                        &self.occupant_assignments,
                    );
                }
            }
        }
    }

    /// Current date from the injected clock.
    pub fn today(&self) -> Day {
        self.clock.today()
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub fn get_cell(&self, id: &Ulid) -> Option<SharedCellState> {
        self.cells.get(id).map(|e| e.value().clone())
    }

    pub fn get_cell_for_assignment(&self, assignment_id: &Ulid) -> Option<Ulid> {
        self.assignment_to_cell
            .get(assignment_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + broadcast in one call.
    pub(super) async fn persist_and_apply(
        &self,
        cell_id: Ulid,
        cs: &mut CellState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _fence = self.compaction_fence.read().await;
        self.wal_append(event).await?;
        apply_to_cell(cs, event, &self.assignment_to_cell, &self.occupant_assignments);
        self.events.send(cell_id, event);
        Ok(())
    }

    /// Lookup assignment → cell, get the cell, acquire its write lock. The
    /// lookup is re-verified under the lock: a concurrent delete may have
    /// removed the assignment while we waited.
    pub(super) async fn resolve_assignment_write(
        &self,
        assignment_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<CellState>), EngineError> {
        let cell_id = self
            .get_cell_for_assignment(assignment_id)
            .ok_or(EngineError::AssignmentNotFound(*assignment_id))?;
        let cs = self
            .get_cell(&cell_id)
            .ok_or(EngineError::CellNotFound(cell_id))?;
        let guard = cs.write_owned().await;
        if guard.get_assignment(*assignment_id).is_none() {
            return Err(EngineError::AssignmentNotFound(*assignment_id));
        }
        Ok((cell_id, guard))
    }

    /// Add the assignment to the occupant's index unless already present.
    /// Returns whether it was newly added. Callers link before re-verifying
    /// the occupant exists; delete_occupant removes the occupant before its
    /// own guard check, so one of the two races always sees the other.
    pub(super) fn link_occupant(&self, occupant_id: Ulid, assignment_id: Ulid) -> bool {
        let mut list = self.occupant_assignments.entry(occupant_id).or_default();
        if list.contains(&assignment_id) {
            false
        } else {
            list.push(assignment_id);
            true
        }
    }

    pub(super) fn unlink_occupant(&self, occupant_id: Ulid, assignment_id: Ulid) {
        if let Some(mut list) = self.occupant_assignments.get_mut(&occupant_id) {
            list.retain(|a| *a != assignment_id);
        }
    }
}
