//! Replication properties across instances that only share files.

use foldsync_codec::FileName;
use foldsync_core::{DocumentId, ROOT_ID_FILE};
use foldsync_storage::Storage;
use foldsync_testkit::generators::{arrival_order, edits_strategy, gapped_sequences};
use foldsync_testkit::prelude::*;
use proptest::prelude::*;
use std::path::Path;

/// Instance A on device `a`, instance B on device `b`, both holding the
/// root `/cloud` mirrored by the pair.
struct Peers {
    pair: DevicePair,
    a: TestInstance,
    b: TestInstance,
}

fn peers() -> Peers {
    let pair = DevicePair::new("/cloud");
    let clock = test_clock();
    let a = TestInstance::new("inst-a", pair.a.clone(), clock.clone());
    a.add_root("/cloud");
    pair.a_to_b()
        .transfer(&Path::new("/cloud").join(ROOT_ID_FILE))
        .unwrap();
    let b = TestInstance::new("inst-b", pair.b.clone(), clock);
    b.add_root("/cloud");
    Peers { pair, a, b }
}

fn root_of(instance: &TestInstance) -> foldsync_core::RootId {
    instance.engine().list_roots()[0].id.clone()
}

fn sequence_of(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    match FileName::parse(name).ok()? {
        FileName::Update { sequence, .. } => Some(sequence),
        _ => None,
    }
}

fn discover(instance: &TestInstance) {
    instance.engine().poll_activity().unwrap();
    instance.engine().retry_pending().unwrap();
}

#[test]
fn both_instances_agree_on_the_root() {
    let p = peers();
    assert_eq!(root_of(&p.a), root_of(&p.b));
}

#[test]
fn duplicate_files_are_applied_once() {
    let p = peers();
    let root = root_of(&p.a);
    let doc = scenarios::document_with_text(&p.a, &root, &["one ", "two ", "three"]);

    // Packing without garbage collection leaves every update twice on disk.
    assert!(p.a.engine().pack_all().unwrap() >= 1);
    p.pair.settle().unwrap();
    discover(&p.b);

    assert_eq!(p.b.text(&doc).unwrap(), "one two three");
    p.b.engine().sync_document(&doc).unwrap();
    assert_eq!(p.b.text(&doc).unwrap(), "one two three");
}

#[test]
fn concurrent_edits_converge() {
    let p = peers();
    let root = root_of(&p.a);
    let doc = scenarios::document_with_text(&p.a, &root, &["shared"]);
    p.pair.settle().unwrap();
    discover(&p.b);

    p.a.append(&doc, " from a").unwrap();
    p.b.append(&doc, " from b").unwrap();
    p.pair.settle().unwrap();
    discover(&p.a);
    discover(&p.b);

    let a_text = p.a.fresh_text(&doc).unwrap();
    assert_eq!(a_text, p.b.fresh_text(&doc).unwrap());
    assert!(a_text.contains(" from a") && a_text.contains(" from b"));
}

#[test]
fn reader_cursor_never_skips_a_late_file() {
    let p = peers();
    let root = root_of(&p.a);
    let doc = scenarios::document_with_text(&p.a, &root, &["a", "b", "c", "d"]);
    let link = p.pair.a_to_b();

    // Deliver everything except update 3.
    let late: Vec<_> = link
        .pending()
        .into_iter()
        .filter(|t| sequence_of(&t.path) == Some(3))
        .collect();
    assert_eq!(late.len(), 1);
    for transfer in link.pending() {
        if transfer.path != late[0].path {
            link.transfer(&transfer.path).unwrap();
        }
    }
    discover(&p.b);
    assert!(p.b.engine().document_entry(&doc).is_some());

    let first = p.b.engine().read_new_updates("search", &doc).unwrap();
    assert_eq!(first.cursor.clock.get(p.a.id()), 2);
    p.b.engine().acknowledge("search", &doc, first.cursor).unwrap();

    link.transfer(&late[0].path).unwrap();
    let second = p.b.engine().read_new_updates("search", &doc).unwrap();
    assert!(second.updates.iter().any(|u| u.sequence == 3));
    assert_eq!(second.cursor.clock.get(p.a.id()), 5);
}

#[test]
fn independent_snapshots_keep_both_histories() {
    let p = peers();
    let root = root_of(&p.a);
    let doc = scenarios::document_with_text(&p.a, &root, &["base"]);
    p.pair.settle().unwrap();
    discover(&p.b);
    assert_eq!(p.b.text(&doc).unwrap(), "base");

    // No sync in between: each side snapshots and collects its own history.
    for chunk in [" a1", " a2", " a3"] {
        p.a.append(&doc, chunk).unwrap();
    }
    for chunk in [" b1", " b2", " b3"] {
        p.b.append(&doc, chunk).unwrap();
    }
    assert_eq!(p.a.engine().run_maintenance().unwrap().snapshots, 1);
    assert_eq!(p.b.engine().run_maintenance().unwrap().snapshots, 1);

    p.pair.settle().unwrap();
    let text = p.b.fresh_text(&doc).unwrap();
    assert_eq!(p.a.fresh_text(&doc).unwrap(), text);
    for chunk in ["base", " a3", " b3"] {
        assert!(text.contains(chunk), "{chunk:?} missing from {text:?}");
    }

    // The next round folds both snapshots into one.
    p.a.engine().run_maintenance().unwrap();
    p.pair.settle().unwrap();
    p.b.engine().run_maintenance().unwrap();
    assert_eq!(p.b.fresh_text(&doc).unwrap(), text);
    assert_eq!(p.a.fresh_text(&doc).unwrap(), text);
}

#[test]
fn maintenance_is_invisible_to_peers() {
    let p = peers();
    let root = root_of(&p.a);
    let chunks = ["la ", "le ", "li ", "lo ", "lu"];
    let doc = scenarios::document_with_text(&p.a, &root, &chunks);
    let before = p.a.fresh_text(&doc).unwrap();

    let report = p.a.engine().run_maintenance().unwrap();
    assert!(report.packs >= 1);
    assert_eq!(report.snapshots, 1);
    assert_eq!(p.a.fresh_text(&doc).unwrap(), before);

    p.pair.settle().unwrap();
    discover(&p.b);
    assert_eq!(p.b.fresh_text(&doc).unwrap(), chunks.concat());
}

#[test]
fn restart_seals_a_crashed_draft() {
    let mut p = peers();
    let root = root_of(&p.a);
    let doc = scenarios::document_with_text(&p.a, &root, &["kept"]);

    // A draft update left behind by a crash mid-write.
    let dirs_path = Path::new("/cloud/notes")
        .join(doc.as_str())
        .join("updates")
        .join(format!("inst-a_{}_1-3.upd", doc.as_str()));
    let mut editor = TextEditor::new();
    let payload = editor.append("!");
    p.pair
        .a
        .write_new(&dirs_path, &foldsync_codec::envelope::draft(&payload))
        .unwrap();

    p.a.restart();
    p.pair.settle().unwrap();
    discover(&p.b);
    let text = p.b.fresh_text(&doc).unwrap();
    assert!(text.starts_with("kept") || text.ends_with("kept"));
    let reader = p.b.engine().read_new_updates("probe", &doc).unwrap();
    assert_eq!(reader.cursor.clock.get(p.a.id()), 3);
}

fn deliver_in_order(p: &Peers, doc: &DocumentId, order: &[usize]) -> String {
    let link = p.pair.a_to_b();
    let pending = link.pending();
    for &i in order {
        link.transfer(&pending[i].path).unwrap();
        discover(&p.b);
    }
    p.b.fresh_text(doc).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_arrival_order_converges(
        (edits, order) in edits_strategy(6).prop_flat_map(|edits| {
            // The document's files plus the activity log line.
            let files = edits.len() + 2;
            (Just(edits), arrival_order(files))
        })
    ) {
        let p = peers();
        let root = root_of(&p.a);
        let refs: Vec<&str> = edits.iter().map(String::as_str).collect();
        let doc = scenarios::document_with_text(&p.a, &root, &refs);
        let pending = p.pair.a_to_b().pending();
        prop_assume!(pending.len() == order.len());

        let text = deliver_in_order(&p, &doc, &order);
        prop_assert_eq!(text, edits.concat());
    }

    #[test]
    fn gaps_hold_the_cursor_back((present, missing) in gapped_sequences(5)) {
        let p = peers();
        let root = root_of(&p.a);
        // Sequence 1 is the initial state; edits take 2..=5.
        let doc = scenarios::document_with_text(&p.a, &root, &["a", "b", "c", "d"]);
        let link = p.pair.a_to_b();
        for transfer in link.pending() {
            match sequence_of(&transfer.path) {
                Some(seq) if !present.contains(&seq) => {}
                _ => link.transfer(&transfer.path).unwrap(),
            }
        }
        discover(&p.b);
        prop_assume!(p.b.engine().document_entry(&doc).is_some());

        let read = p.b.engine().read_new_updates("probe", &doc).unwrap();
        prop_assert_eq!(read.cursor.clock.get(p.a.id()), missing - 1);
    }

    #[test]
    fn consolidation_is_transparent(edits in edits_strategy(8)) {
        let p = peers();
        let root = root_of(&p.a);
        let refs: Vec<&str> = edits.iter().map(String::as_str).collect();
        let doc = scenarios::document_with_text(&p.a, &root, &refs);
        let before = p.a.fresh_text(&doc).unwrap();

        p.a.engine().run_maintenance().unwrap();
        prop_assert_eq!(p.a.fresh_text(&doc).unwrap(), before.clone());
        p.a.engine().run_maintenance().unwrap();
        prop_assert_eq!(p.a.fresh_text(&doc).unwrap(), before);
    }
}
