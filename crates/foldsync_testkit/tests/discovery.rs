//! Discovery of moved documents by an instance that only holds the target
//! root.
//!
//! Instance A holds roots R1 and R2, instance B holds only R2. A moves a
//! document from R1 to R2. However the sync client orders the activity log
//! and the document's files, B must end up with the document under R2 and
//! must never register it under R1.

use foldsync_core::{DocumentId, RootId, ROOT_ID_FILE};
use foldsync_testkit::prelude::*;
use std::path::Path;

struct Scenario {
    pair: DevicePair,
    a: TestInstance,
    b: TestInstance,
    r1: RootId,
    r2: RootId,
    doc: DocumentId,
}

fn moved_document() -> Scenario {
    let pair = DevicePair::new("/r2");
    let clock = test_clock();
    let a = TestInstance::new("inst-a", pair.a.clone(), clock.clone());
    let r1 = a.add_root("/r1");
    let r2 = a.add_root("/r2");
    pair.a_to_b()
        .transfer(&Path::new("/r2").join(ROOT_ID_FILE))
        .unwrap();
    let b = TestInstance::new("inst-b", pair.b.clone(), clock);
    assert_eq!(b.add_root("/r2"), r2);

    let doc = scenarios::document_with_text(&a, &r1, &["moved ", "text"]);
    let record = a.engine().move_document(&doc, &r2, None).unwrap();
    assert_eq!(record.state, foldsync_core::MoveState::Completed);

    Scenario {
        pair,
        a,
        b,
        r1,
        r2,
        doc,
    }
}

impl Scenario {
    fn assert_never_under_r1(&self) {
        if let Some(entry) = self.b.engine().document_entry(&self.doc) {
            assert_eq!(entry.root_id, self.r2);
            assert_ne!(entry.root_id, self.r1);
        }
    }

    fn poll(&self) -> foldsync_core::DiscoveryReport {
        let report = self.b.engine().poll_activity().unwrap();
        self.assert_never_under_r1();
        report
    }
}

#[test]
fn activity_before_files() {
    let s = moved_document();
    let link = s.pair.a_to_b();

    for t in link.pending_matching("/activity/") {
        link.transfer(&t.path).unwrap();
    }
    let report = s.poll();
    assert_eq!(report.entries, 1);
    assert!(report.imported.is_empty());
    assert_eq!(report.pending, 1);
    assert!(s.b.engine().document_entry(&s.doc).is_none());

    // Nothing arrived yet: the import keeps waiting.
    assert_eq!(s.b.engine().retry_pending().unwrap(), 0);
    assert_eq!(s.b.engine().pending_imports()[0].attempts, 1);

    link.sync_all().unwrap();
    assert_eq!(s.b.engine().retry_pending().unwrap(), 1);
    s.assert_never_under_r1();

    let entry = s.b.engine().document_entry(&s.doc).unwrap();
    assert_eq!(entry.root_id, s.r2);
    assert_eq!(s.b.text(&s.doc).unwrap(), "moved text");
    assert!(s.b.engine().pending_imports().is_empty());
}

#[test]
fn files_before_activity() {
    let s = moved_document();
    let link = s.pair.a_to_b();

    for t in link.pending_matching("/notes/") {
        link.transfer(&t.path).unwrap();
    }
    let report = s.poll();
    assert_eq!(report.entries, 0);
    assert!(s.b.engine().document_entry(&s.doc).is_none());

    link.sync_all().unwrap();
    let report = s.poll();
    assert_eq!(report.imported, vec![s.doc.clone()]);
    assert_eq!(s.b.engine().document_entry(&s.doc).unwrap().root_id, s.r2);
    assert_eq!(s.b.text(&s.doc).unwrap(), "moved text");
}

#[test]
fn torn_activity_line_is_read_once_complete() {
    let s = moved_document();
    let link = s.pair.a_to_b();
    for t in link.pending_matching("/notes/") {
        link.transfer(&t.path).unwrap();
    }

    let log = link.pending_matching("/activity/").remove(0);
    link.transfer_prefix(&log.path, log.len - 3).unwrap();
    assert_eq!(s.poll().entries, 0);

    link.transfer(&log.path).unwrap();
    let report = s.poll();
    assert_eq!(report.entries, 1);
    assert_eq!(report.imported, vec![s.doc.clone()]);
}

#[test]
fn files_arrive_one_by_one() {
    let s = moved_document();
    let link = s.pair.a_to_b();
    for t in link.pending_matching("/activity/") {
        link.transfer(&t.path).unwrap();
    }
    s.poll();

    for t in link.pending() {
        link.transfer(&t.path).unwrap();
        s.b.engine().retry_pending().unwrap();
        s.assert_never_under_r1();
    }
    assert_eq!(s.b.engine().document_entry(&s.doc).unwrap().root_id, s.r2);
    assert_eq!(s.b.fresh_text(&s.doc).unwrap(), "moved text");
}

#[test]
fn holder_of_both_roots_follows_the_move() {
    // C shares A's storage and knows the document under R1 already.
    let s = moved_document();
    let c = TestInstance::new("inst-c", s.pair.a.clone(), test_clock());
    c.add_root("/r1");
    c.add_root("/r2");
    assert_eq!(c.engine().document_entry(&s.doc).unwrap().root_id, s.r2);

    // A fresh document that moves after C indexed it.
    let doc = scenarios::document_with_text(&s.a, &s.r1, &["late"]);
    c.engine().poll_activity().unwrap();
    assert_eq!(c.engine().document_entry(&doc).unwrap().root_id, s.r1);

    s.a.engine().move_document(&doc, &s.r2, None).unwrap();
    let report = c.engine().poll_activity().unwrap();
    assert_eq!(report.reassigned, vec![doc.clone()]);
    assert_eq!(c.engine().document_entry(&doc).unwrap().root_id, s.r2);
    assert_eq!(c.fresh_text(&doc).unwrap(), "late");
}

#[test]
fn restart_keeps_pending_imports() {
    let mut s = moved_document();
    let link = s.pair.a_to_b();
    for t in link.pending_matching("/activity/") {
        link.transfer(&t.path).unwrap();
    }
    s.poll();
    assert_eq!(s.b.engine().pending_imports().len(), 1);

    s.b.restart();
    assert_eq!(s.b.engine().pending_imports().len(), 1);
    link.sync_all().unwrap();
    s.b.restart();
    assert!(s.b.engine().pending_imports().is_empty());
    assert_eq!(s.b.engine().document_entry(&s.doc).unwrap().root_id, s.r2);
}

#[test]
fn nothing_is_known_before_sync() {
    let s = moved_document();
    assert!(s.b.engine().list_documents().is_empty());
    assert_eq!(s.poll().entries, 0);
    assert!(s.b.engine().pending_imports().is_empty());
}
