use mexp_ir::{ExpansionErrorKind, ExpansionPipelineError, FileId};
use mexpc::testing::{CountingExpander, FlakyExpander};
use mexpc::{CancellationToken, EngineError, NoProgress, RunOutcome};
use pretty_assertions::assert_eq;

use crate::common::{
    engine, engine_with, expansion_text, project, render, run, test_config, verify,
};

#[test]
fn unchanged_project_runs_without_changes() {
    let engine = engine(&[
        ("main.mx", "outer!(twice!(1)) pair!(a, b)"),
        ("lib.mx", "#[cfg(off)] twice!(2) missing!(3)"),
    ]);
    let first = run(&engine);
    assert!(first.changes() > 0);
    let before = render(&engine);

    for _ in 0..3 {
        let again = run(&engine);
        assert_eq!(again.outcome, RunOutcome::Done);
        assert_eq!(again.changes(), 0, "{again}");
        assert_eq!(render(&engine), before);
    }
    verify(&engine);
}

#[test]
fn depth_d_takes_d_plus_one_steps() {
    // outer -> inner -> twice -> plain text
    let engine = engine(&[("main.mx", "outer!(twice!(1))")]);
    let report = run(&engine);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.steps, 4);
    assert_eq!(
        render(&engine),
        vec![
            "main.mx#0 => inner!(twice!(1))",
            "main.mx#0/0 => [twice!(1)]",
            "main.mx#0/0/0 => 1, 1",
        ]
    );
}

#[test]
fn depth_equal_to_the_limit_completes() {
    let engine = engine_with(
        project(&[("main.mx", "outer!(twice!(1))")]),
        mexpc::TemplateExpander::new(),
        test_config().with_recursion_limit(3),
    );
    let report = run(&engine);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.steps, 4);
}

#[test]
fn unbounded_recursion_stops_at_the_limit() {
    let engine = engine_with(
        project(&[("main.mx", "rec!(x)")]),
        mexpc::TemplateExpander::new(),
        test_config().with_recursion_limit(5),
    );
    let report = run(&engine);
    assert_eq!(report.outcome, RunOutcome::RecursionLimit);
    assert_eq!(report.steps, 6);
    assert_eq!(report.blobs_per_step, vec![1; 6]);
    verify(&engine);
}

#[test]
fn identical_output_is_not_rewritten() {
    let engine = engine(&[("main.mx", "twice!(1)")]);
    run(&engine);
    let file = engine.host().file_id("main.mx").unwrap();
    let call = mexp_ir::CallId::new(file, 0);
    let (blob, hashes) = {
        let index = engine.index().read();
        let record = index.record(call).unwrap();
        (record.output_blob().unwrap(), record.hashes)
    };

    engine.host().set_file("main.mx", "twice!(  1  )");
    let report = run(&engine);
    assert_eq!(report.written, 0);
    assert_eq!(report.refreshed, 1);

    let index = engine.index().read();
    let record = index.record(call).unwrap();
    assert_eq!(record.output_blob(), Some(blob));
    assert_ne!(record.hashes, hashes);
}

#[test]
fn identical_calls_expand_once() {
    let files: Vec<(String, String)> = (0..12)
        .map(|i| (format!("f{i}.mx"), "outer!(7) twice!(7)".to_string()))
        .collect();
    let project = project(&[]);
    for (path, text) in &files {
        project.set_file(path, text.as_str());
    }
    let engine = engine_with(project, CountingExpander::new(), test_config());

    let report = run(&engine);
    // outer!(7), twice!(7) and the nested inner!(7), once each.
    assert_eq!(engine.expander().expansions(), 3);
    assert_eq!(report.written, 36);
    assert_eq!(report.cache.misses, 3);

    engine.expander().reset();
    run(&engine);
    assert_eq!(engine.expander().expansions(), 0);
}

#[test]
fn cancelled_run_leaves_no_orphans() {
    let engine = engine(&[("main.mx", "outer!(twice!(1)) outer!(2)")]);
    let cancel = CancellationToken::new();
    let sink = |_fraction: f64, phase: &str| {
        if phase.contains("step 1") {
            cancel.cancel();
        }
    };
    let report = engine.run(&cancel, &sink).unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.steps, 2);
    verify(&engine);

    let finished = run(&engine);
    assert_eq!(finished.outcome, RunOutcome::Done);
    verify(&engine);
}

#[test]
fn edits_drop_stale_nested_output() {
    let engine = engine(&[("main.mx", "outer!(twice!(1))")]);
    run(&engine);
    assert_eq!(engine.store().read().len(), 3);

    engine.host().set_file("main.mx", "twice!(5)");
    run(&engine);
    assert_eq!(render(&engine), vec!["main.mx#0 => 5, 5"]);
    assert_eq!(engine.store().read().len(), 1);
    verify(&engine);
}

#[test]
fn corruption_is_fatal_then_rebuilt() {
    let engine = engine(&[("main.mx", "outer!(1)")]);
    run(&engine);
    let expected = render(&engine);
    let blob = {
        let index = engine.index().read();
        let file = engine.host().file_id("main.mx").unwrap();
        index.record(mexp_ir::CallId::new(file, 0)).unwrap().output_blob().unwrap()
    };
    engine.store().write().delete(blob);

    match engine.run(&CancellationToken::new(), &NoProgress) {
        Err(EngineError::Storage(storage)) => assert!(storage.is_corruption()),
        other => panic!("expected a storage error, got {other:?}"),
    }

    let rebuilt = run(&engine);
    assert_eq!(rebuilt.outcome, RunOutcome::Done);
    assert_eq!(render(&engine), expected);
    verify(&engine);
}

#[test]
fn unavailable_expander_is_retried_until_it_works() {
    let engine = engine_with(
        project(&[("main.mx", "twice!(1)")]),
        FlakyExpander::new(),
        test_config(),
    );
    let first = run(&engine);
    assert_eq!(first.failed, 1);
    assert_eq!(engine.expander().attempts(), 1);
    let file = engine.host().file_id("main.mx").unwrap();
    let error = engine
        .index()
        .read()
        .record(mexp_ir::CallId::new(file, 0))
        .and_then(|record| record.error().cloned());
    assert!(matches!(
        error,
        Some(ExpansionPipelineError::Expansion(ref err)) if err.kind == ExpansionErrorKind::ToolUnavailable
    ));

    // Unchanged inputs, but the failure is not memoized.
    run(&engine);
    assert_eq!(engine.expander().attempts(), 2);

    engine.expander().set_available(true);
    let fixed = run(&engine);
    assert_eq!(fixed.written, 1);
    assert_eq!(expansion_text(&engine, "main.mx", 0).as_deref(), Some("1, 1"));

    run(&engine);
    assert_eq!(engine.expander().attempts(), 3);
}

#[test]
fn removed_file_with_a_retried_failure_is_dropped() {
    let engine = engine_with(
        project(&[("gone.mx", "twice!(1)"), ("main.mx", "pair!(a, b)")]),
        FlakyExpander::new(),
        test_config(),
    );
    run(&engine);
    assert_eq!(engine.expander().attempts(), 2);
    let call = mexp_ir::CallId::new(engine.host().file_id("gone.mx").unwrap(), 0);
    assert!(engine.index().read().record(call).is_some());

    engine.host().remove_file("gone.mx");
    let report = run(&engine);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert!(engine.index().read().record(call).is_none());
    assert!(!engine.index().read().files().contains(&call.file));

    for _ in 0..3 {
        run(&engine);
    }
    // Only main.mx's call is still retried.
    assert_eq!(engine.expander().attempts(), 6);
    verify(&engine);
}

#[test]
fn deferred_unit_is_retried_in_the_next_step() {
    let engine = engine(&[("main.mx", "outer!(1)")]);
    run(&engine);
    let blob = {
        let file = engine.host().file_id("main.mx").unwrap();
        let index = engine.index().read();
        index.record(mexp_ir::CallId::new(file, 0)).unwrap().output_blob().unwrap()
    };

    // The edit rewrites the blob in place; its file is not ready the first
    // time it is scheduled.
    engine.host().set_file("main.mx", "outer!(2)");
    engine.host().defer_extraction(FileId::Expansion(blob), 1);
    let report = run(&engine);

    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(report.pending, 0);
    assert_eq!(report.written, 2);
    assert_eq!(
        render(&engine),
        vec!["main.mx#0 => inner!(2)", "main.mx#0/0 => [2]"]
    );
    verify(&engine);
}

#[test]
fn disabled_proc_macros_fail_softly() {
    let engine = engine(&[("main.mx", "tool!(a, b) twice!(1)")]);
    engine.host().set_proc_capability(mexpc::Capability::Off);
    let report = run(&engine);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert_eq!(
        render(&engine),
        vec!["main.mx#0 !! expansion-disabled", "main.mx#1 => 1, 1"]
    );

    engine.host().set_proc_capability(mexpc::Capability::Enabled);
    run(&engine);
    assert_eq!(expansion_text(&engine, "main.mx", 0).as_deref(), Some("tool_output(a, b)"));
}

#[test]
fn out_of_range_placeholder_fails_only_its_calls() {
    let engine = engine(&[
        ("big.mx", "macro big(decl) { $18446744073709551615 }"),
        ("main.mx", "big!(1) twice!(2)"),
    ]);
    let report = run(&engine);
    assert_eq!(report.outcome, RunOutcome::Done);
    assert!(!engine.clean_start_requested());
    assert_eq!(
        render(&engine),
        vec!["main.mx#0 !! def-syntax", "main.mx#1 => 2, 2"]
    );
    verify(&engine);
}
