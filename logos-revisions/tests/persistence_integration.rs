//! Persistence integration tests.
//!
//! Verifies:
//! - Offline saves survive an engine restart through RocksDB
//! - Replay order and dependency links are kept across restarts
//! - A corrupt snapshot is discarded with a single warning
//! - A drained queue leaves nothing to replay on the next start

mod common;

use common::*;
use logos_revisions::{
    DocPath, Effect, EngineConfig, EngineEvent, ManualClock, Notice, OfflineQueue, QueueStore,
    RevisionEngine, RevisionError, RocksQueueStore, ServerMessage, SingleUser, StoreConfig,
    TransportCommand,
};
use std::path::Path;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(dir: &Path) -> RocksQueueStore {
    RocksQueueStore::open(StoreConfig::for_testing(dir)).unwrap()
}

fn engine_on(store: RocksQueueStore, clock: &ManualClock) -> RevisionEngine {
    init_logging();
    let config = EngineConfig::for_testing();
    let offline = OfflineQueue::open(Box::new(store), config.offline_queue_capacity);
    RevisionEngine::new(&config, offline, Box::new(SingleUser), Box::new(clock.clone()))
}

fn open_document(engine: &mut RevisionEngine, surface: &FakeSurface, path: &str) {
    engine.handle(
        EngineEvent::Opened {
            path: DocPath::new(path),
        },
        surface,
    );
    engine.handle(
        EngineEvent::Server(ServerMessage::RevisionHistory {
            path: DocPath::new(path),
            revisions: Some(vec![revision(100, "v0")]),
            id: None,
            next_action: None,
        }),
        surface,
    );
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn test_offline_saves_survive_restart() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let surface = FakeSurface::new();
    surface.set("notes.md", "v0");

    {
        let mut engine = engine_on(open_store(dir.path()), &clock);
        open_document(&mut engine, &surface, "notes.md");
        engine.handle(EngineEvent::ConnectivityChanged { online: false }, &surface);

        for (i, text) in ["first", "second", "third"].iter().enumerate() {
            clock.set(2_000 + i as u64 * 100);
            surface.set("notes.md", text);
            engine.handle(
                EngineEvent::SaveRequested {
                    path: DocPath::new("notes.md"),
                    silent: false,
                },
                &surface,
            );
        }
        assert_eq!(engine.offline().len(), 3);
        engine.shutdown();
    }

    let engine = engine_on(open_store(dir.path()), &clock);
    let entries: Vec<_> = engine.offline().iter().cloned().collect();
    let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
    assert_eq!(entries[0].depends_on, None);
    assert_eq!(entries[1].depends_on, Some(entries[0].created_at));
    assert_eq!(entries[2].depends_on, Some(entries[1].created_at));
    assert!(entries.iter().all(|e| e.path == DocPath::new("notes.md")));
}

#[test]
fn test_restored_queue_replays_on_startup() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(5_000);
    let surface = FakeSurface::new();
    surface.set("a.txt", "v0");

    {
        let mut engine = engine_on(open_store(dir.path()), &clock);
        open_document(&mut engine, &surface, "a.txt");
        engine.handle(EngineEvent::ConnectivityChanged { online: false }, &surface);
        surface.set("a.txt", "offline text");
        engine.handle(
            EngineEvent::SaveRequested {
                path: DocPath::new("a.txt"),
                silent: false,
            },
            &surface,
        );
    }

    let mut engine = engine_on(open_store(dir.path()), &clock);
    let fx = engine.startup();
    assert_eq!(
        transport(&fx),
        vec![TransportCommand::GetRevisionHistory {
            path: DocPath::new("a.txt"),
            id: None,
            next_action: None,
        }]
    );
    assert!(fx.iter().all(|e| !matches!(e, Effect::Notify(_))));
}

#[test]
fn test_corrupt_snapshot_is_discarded() {
    let dir = tempdir().unwrap();
    {
        let store = open_store(dir.path());
        store.save(b"definitely not a queue snapshot").unwrap();
    }

    let clock = ManualClock::new(1_000);
    let mut engine = engine_on(open_store(dir.path()), &clock);
    assert!(engine.offline().is_empty());

    let fx = engine.startup();
    assert!(matches!(
        fx.as_slice(),
        [Effect::Notify(Notice::Degraded(RevisionError::PersistenceCorruption(_)))]
    ));
    // Reported once.
    assert!(engine.startup().is_empty());
    drop(engine);

    assert_eq!(open_store(dir.path()).load().unwrap(), None);
}

#[test]
fn test_drained_queue_is_not_replayed_again() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let surface = FakeSurface::new();
    surface.set("a.txt", "v0");

    {
        let mut engine = engine_on(open_store(dir.path()), &clock);
        open_document(&mut engine, &surface, "a.txt");
        engine.handle(EngineEvent::ConnectivityChanged { online: false }, &surface);
        surface.set("a.txt", "queued");
        engine.handle(
            EngineEvent::SaveRequested {
                path: DocPath::new("a.txt"),
                silent: false,
            },
            &surface,
        );

        let mut backend = SnapshotBackend::default();
        let fx = engine.handle(EngineEvent::ConnectivityChanged { online: true }, &surface);
        let mut confirmed = Vec::new();
        for request in diff_requests(&fx) {
            if let Some(response) = logos_revisions::process(&mut backend, request) {
                confirmed.extend(engine.handle(EngineEvent::Diff(response), &surface));
            }
        }
        let (path, record) = saves(&confirmed).pop().unwrap();
        engine.handle(
            EngineEvent::Server(ServerMessage::ConfirmSave { path, id: record.id }),
            &surface,
        );
        assert!(engine.offline().is_empty());
        engine.shutdown();
    }

    let mut engine = engine_on(open_store(dir.path()), &clock);
    assert!(engine.offline().is_empty());
    assert!(engine.startup().is_empty());
}

#[test]
fn test_snapshot_metadata_tracks_writes() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(1_000);
    let surface = FakeSurface::new();
    surface.set("a.txt", "v0");

    {
        let mut engine = engine_on(open_store(dir.path()), &clock);
        open_document(&mut engine, &surface, "a.txt");
        engine.handle(EngineEvent::ConnectivityChanged { online: false }, &surface);
        surface.set("a.txt", "v1");
        engine.handle(
            EngineEvent::SaveRequested {
                path: DocPath::new("a.txt"),
                silent: true,
            },
            &surface,
        );
    }

    let store = open_store(dir.path());
    let snapshot = store.load().unwrap().unwrap();
    let meta = store.metadata().unwrap().unwrap();
    assert_eq!(meta.size, snapshot.len() as u64);
    assert!(meta.saved_at > 0);
}
