//! End-to-end checks through the public API: capacity holds under
//! concurrency and state survives a restart.

use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use warden::clock::FixedClock;
use warden::engine::{Engine, EngineError};
use warden::events::EventBus;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("warden_test_integration");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(path: PathBuf) -> Arc<Engine> {
    Arc::new(Engine::new(path, Arc::new(FixedClock(100)), Arc::new(EventBus::new())).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_never_exceeded_under_concurrency() {
    let engine = open_engine(test_wal_path("stampede.wal"));

    let cell = Ulid::new();
    engine.create_cell(cell, 0, 3).await.unwrap();

    let mut occupants = Vec::new();
    for i in 0..10 {
        let id = Ulid::new();
        engine
            .create_occupant(id, format!("Occupant{i}"), "Test".into(), None)
            .await
            .unwrap();
        occupants.push(id);
    }

    // Ten concurrent admissions into three places.
    let mut tasks = Vec::new();
    for occupant in occupants {
        let e = engine.clone();
        tasks.push(tokio::spawn(async move {
            e.create_assignment(Ulid::new(), occupant, cell, 0, 5000, None)
                .await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(EngineError::CellFull { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(rejected, 7);
    assert_eq!(engine.free_capacity(cell, 100).await.unwrap(), 0);
    assert_eq!(engine.assignments_for_cell(cell).await.unwrap().len(), 3);
}

#[tokio::test]
async fn registry_survives_restart() {
    let path = test_wal_path("restart.wal");

    let cell = Ulid::new();
    let occupant = Ulid::new();
    let assignment = Ulid::new();
    {
        let engine = open_engine(path.clone());
        engine.create_cell(cell, 2, 2).await.unwrap();
        engine
            .create_occupant(occupant, "Jan".into(), "Novak".into(), None)
            .await
            .unwrap();
        engine
            .create_assignment(assignment, occupant, cell, 10, 900, Some("fraud".into()))
            .await
            .unwrap();
    }

    let engine = open_engine(path);
    assert_eq!(engine.free_capacity(cell, 100).await.unwrap(), 1);

    let found = engine.cell_for_occupant(occupant).await.unwrap().unwrap();
    assert_eq!(found.id, cell);

    // An admission that fills the reopened cell still enforces capacity.
    let o2 = Ulid::new();
    engine
        .create_occupant(o2, "Petr".into(), "Svoboda".into(), None)
        .await
        .unwrap();
    engine
        .create_assignment(Ulid::new(), o2, cell, 0, 5000, None)
        .await
        .unwrap();
    let o3 = Ulid::new();
    engine
        .create_occupant(o3, "Karel".into(), "Dvorak".into(), None)
        .await
        .unwrap();
    let overflow = engine
        .create_assignment(Ulid::new(), o3, cell, 0, 5000, None)
        .await;
    assert!(matches!(overflow, Err(EngineError::CellFull { .. })));
}
