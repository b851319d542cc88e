//! On-disk durability: everything written through one handle is visible,
//! bit-identical, through a fresh handle on the same file.

use serde_json::json;

use strand_domain::config::StorageConfig;
use strand_domain::event::EventKind;
use strand_store::{AppendRequest, Database, EventStore, SearchFilters};

fn open(path: &std::path::Path) -> EventStore {
    EventStore::new(
        Database::open(path).unwrap(),
        "ws-durability",
        StorageConfig::default(),
    )
}

#[test]
fn events_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strand.db");

    let session_id = {
        let store = open(&path);
        let session = store.create_session("/w", "m1").unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::SessionStart,
                    json!({"workingDirectory": "/w", "model": "m1"}),
                ),
            )
            .unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::MessageUser,
                    json!({"content": "durable greetings", "turn": 1}),
                )
                .with_run("r1"),
            )
            .unwrap();
        session.id
    };

    let store = open(&path);
    let events = store.get_events(&session_id).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::SessionStart);
    assert_eq!(events[1].kind, EventKind::MessageUser);
    assert_eq!(events[1].payload_str("content"), Some("durable greetings"));
    assert_eq!(events[1].run_id.as_deref(), Some("r1"));

    let row = store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(row.head_event_id.as_deref(), Some(events[1].id.as_str()));
    assert_eq!(row.root_event_id.as_deref(), Some(events[0].id.as_str()));
}

#[test]
fn search_index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strand.db");

    let session_id = {
        let store = open(&path);
        let session = store.create_session("/w", "m1").unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::SessionStart,
                    json!({"workingDirectory": "/w", "model": "m1"}),
                ),
            )
            .unwrap();
        store
            .append(
                &session.id,
                AppendRequest::new(
                    EventKind::MessageUser,
                    json!({"content": "remember the zanzibar deployment", "turn": 1}),
                ),
            )
            .unwrap();
        session.id
    };

    let store = open(&path);
    let hits = store.search("zanzibar", &SearchFilters::default()).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].session_id, session_id);
}

#[test]
fn blobs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strand.db");

    let blob_id = {
        let store = open(&path);
        store.store_blob(b"large artifact bytes", "application/octet-stream").unwrap()
    };

    let store = open(&path);
    let blob = store.get_blob(&blob_id).unwrap().unwrap();
    assert_eq!(blob.data, b"large artifact bytes");
}
