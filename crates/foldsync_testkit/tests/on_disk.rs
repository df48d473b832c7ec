//! The engine on the real filesystem.

use foldsync_core::{Config, CoreError, Engine, FlushPolicy, MoveState};
use foldsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    Config {
        state_dir: dir.path().join("state"),
        ..test_config()
    }
}

#[test]
fn content_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut editor = TextEditor::new();

    let engine = Engine::open(config(&dir), YrsModel).unwrap();
    let root = engine.add_root(&dir.path().join("notes")).unwrap();
    let doc = engine.create_document(&root, Some("inbox".into())).unwrap();
    engine.apply_local_update(&doc, editor.append("persisted")).unwrap();
    engine.close().unwrap();

    let engine = Engine::open(config(&dir), YrsModel).unwrap();
    assert_eq!(engine.document_entry(&doc).unwrap().folder.as_deref(), Some("inbox"));
    engine.open_document(&doc).unwrap();
    assert_eq!(engine.with_document(&doc, |d| d.text()).unwrap(), "persisted");
}

#[test]
fn state_directory_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let _first = Engine::open(config(&dir), YrsModel).unwrap();
    let err = Engine::open(config(&dir), YrsModel).unwrap_err();
    assert!(matches!(err, CoreError::StateLocked));
}

#[test]
fn buffered_updates_wait_for_the_policy() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir).flush_policy(FlushPolicy::UpdateCount(3));
    let engine = Engine::open(config, YrsModel).unwrap();
    let root = engine.add_root(&dir.path().join("notes")).unwrap();
    let doc = engine.create_document(&root, None).unwrap();
    engine.open_document(&doc).unwrap();

    let mut editor = TextEditor::new();
    engine.apply_local_update(&doc, editor.append("a")).unwrap();
    engine.apply_local_update(&doc, editor.append("b")).unwrap();
    // Only the initial state is on disk; the open replica sees everything.
    assert_eq!(engine.read_new_updates("probe", &doc).unwrap().updates.len(), 1);
    assert_eq!(engine.with_document(&doc, |d| d.text()).unwrap(), "ab");

    engine.apply_local_update(&doc, editor.append("c")).unwrap();
    assert_eq!(engine.read_new_updates("probe", &doc).unwrap().updates.len(), 4);
}

#[test]
fn move_between_directories() {
    let temp = TempEngine::new();
    let other = temp
        .engine
        .add_root(&temp.dir.path().join("archive"))
        .unwrap();
    let doc = temp.engine.create_document(&temp.root, None).unwrap();
    let mut editor = TextEditor::new();
    temp.engine
        .apply_local_update(&doc, editor.append("archived"))
        .unwrap();

    let record = temp.engine.move_document(&doc, &other, None).unwrap();
    assert_eq!(record.state, MoveState::Completed);
    assert!(!temp
        .dir
        .path()
        .join("notes/notes")
        .join(doc.as_str())
        .exists());
    assert!(temp
        .dir
        .path()
        .join("archive/notes")
        .join(doc.as_str())
        .is_dir());

    temp.engine.open_document(&doc).unwrap();
    assert_eq!(
        temp.engine.with_document(&doc, |d| d.text()).unwrap(),
        "archived"
    );
}

#[test]
fn background_tasks_flush_idle_documents() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        flush_interval: Duration::from_millis(10),
        ..config(&dir).flush_policy(FlushPolicy::Idle(Duration::from_millis(20)))
    };
    let engine = Arc::new(Engine::open(config, YrsModel).unwrap());
    let root = engine.add_root(&dir.path().join("notes")).unwrap();
    let doc = engine.create_document(&root, None).unwrap();
    let mut editor = TextEditor::new();
    engine.apply_local_update(&doc, editor.append("later")).unwrap();

    let tasks = engine.start_background().unwrap();
    let start = Instant::now();
    while engine.read_new_updates("probe", &doc).unwrap().updates.len() < 2
        && start.elapsed() < Duration::from_secs(5)
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    tasks.stop();
    assert_eq!(engine.read_new_updates("probe", &doc).unwrap().updates.len(), 2);
}
