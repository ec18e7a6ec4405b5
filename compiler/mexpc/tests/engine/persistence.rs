use std::fs;

use mexpc::testing::CountingExpander;
use mexpc::{
    CancellationToken, EngineError, IndexSnapshot, NoProgress, RunOutcome, SharedExpansionCache,
    StorageError,
};
use pretty_assertions::assert_eq;

use crate::common::{engine, engine_with, project, render, run, test_config, verify, Engine};

const MAIN: &str = "outer!(twice!(1)) pair!(a, b) missing!(2)";

fn resumed(path: &std::path::Path) -> Engine<CountingExpander> {
    let snapshot = IndexSnapshot::load(path)
        .expect("snapshot loads")
        .expect("snapshot exists");
    // A fresh process: new host, new expander, empty in-memory cache.
    mexpc::ExpansionCoordinator::new(
        project(&[("main.mx", MAIN)]),
        CountingExpander::new(),
        SharedExpansionCache::new(),
        test_config(),
    )
    .with_snapshot(snapshot)
}

#[test]
fn resumed_run_reuses_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    let first = engine(&[("main.mx", MAIN)]);
    run(&first);
    first.save_snapshot(&path).unwrap();
    let expected = render(&first);

    let second = resumed(&path);
    let report = run(&second);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.changes(), 0, "{report}");
    assert_eq!(second.expander().expansions(), 0);
    assert_eq!(render(&second), expected);
    verify(&second);
}

#[test]
fn resumed_run_picks_up_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    let first = engine(&[("main.mx", MAIN)]);
    run(&first);
    first.save_snapshot(&path).unwrap();

    let second = resumed(&path);
    second.host().set_file("main.mx", "outer!(twice!(9)) pair!(a, b) missing!(2)");
    let report = run(&second);
    assert_eq!(report.outcome, RunOutcome::Done);
    // outer, inner and twice are re-expanded; pair and missing are not.
    assert_eq!(second.expander().expansions(), 3);
    assert_eq!(report.written, 3);
    verify(&second);
}

#[test]
fn missing_snapshot_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = IndexSnapshot::load(&dir.path().join("absent.bin")).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn garbage_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");
    fs::write(&path, b"definitely not a snapshot").unwrap();

    let err = IndexSnapshot::load(&path).unwrap_err();
    assert!(matches!(
        err,
        StorageError::Decode { .. } | StorageError::VersionMismatch { .. }
    ));
}

#[test]
fn clean_start_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    let first = engine_with(
        project(&[("main.mx", MAIN)]),
        CountingExpander::new(),
        test_config(),
    );
    run(&first);
    let blob = {
        let index = first.index().read();
        let blob = index
            .iter()
            .find_map(|(_, record)| record.output_blob())
            .unwrap();
        blob
    };
    first.store().write().delete(blob);
    let aborted = first.run(&CancellationToken::new(), &NoProgress);
    assert!(matches!(aborted, Err(EngineError::Storage(_))));
    assert!(first.clean_start_requested());
    first.save_snapshot(&path).unwrap();

    let second = resumed(&path);
    assert!(second.clean_start_requested());
    let report = run(&second);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert!(!second.clean_start_requested());
    // Everything is rebuilt: outer, inner, twice and pair.
    assert_eq!(second.expander().expansions(), 4);
    verify(&second);
}
