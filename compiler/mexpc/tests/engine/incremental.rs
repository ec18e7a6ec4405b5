//! Incremental runs must end where a clean run over the same sources ends.

#![allow(
    clippy::doc_markdown,
    clippy::uninlined_format_args,
    reason = "Proptest macros generate code with these patterns"
)]

use std::collections::BTreeMap;

use mexpc::{RunOutcome, TemplateExpander, TextProject};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::common::{engine_with, project, render, run, test_config, verify, DEFS};

/// Statements files are assembled from. Covers nesting, cached and
/// uncached failures, invalid calls and gated calls.
const STATEMENTS: &[&str] = &[
    "twice!(1)",
    "twice!(x)",
    "outer!(2)",
    "outer!(twice!(3))",
    "pair!(a, b)",
    "pair!(a)",
    "missing!(1)",
    "#[cfg(off)] twice!(4)",
    "inner!(outer!(5))",
    "let s = \"twice!(no)\";",
];

const PATHS: &[&str] = &["a.mx", "b.mx", "c.mx"];

/// An alternative definition set with one changed body and one removed macro.
const DEFS_EDITED: &str = "\
macro twice(decl) { $0 + $0 }
macro outer(decl) { inner!($0) }
macro inner(decl) { [$0] }
macro rec(decl) { rec!($0) }
";

#[derive(Clone, Debug)]
enum Edit {
    /// Replace a file's statements; an empty list removes the file.
    File { path: usize, statements: Vec<usize> },
    /// Swap between the two definition sets.
    ToggleDefs,
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (0..PATHS.len(), prop::collection::vec(0..STATEMENTS.len(), 0..4))
            .prop_map(|(path, statements)| Edit::File { path, statements }),
        1 => Just(Edit::ToggleDefs),
    ]
}

fn source_of(statements: &[usize]) -> String {
    statements
        .iter()
        .map(|&i| STATEMENTS[i])
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_render(files: &BTreeMap<&str, String>) -> Vec<String> {
    let project = TextProject::new();
    for (path, text) in files {
        project.set_file(path, text.as_str());
    }
    let engine = engine_with(project, TemplateExpander::new(), test_config());
    assert_eq!(run(&engine).outcome, RunOutcome::Done);
    render(&engine)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn incremental_matches_clean(edits in prop::collection::vec(edit_strategy(), 1..8)) {
        let engine = engine_with(project(&[]), TemplateExpander::new(), test_config());
        let mut files: BTreeMap<&str, String> = BTreeMap::new();
        files.insert("defs.mx", DEFS.to_string());
        run(&engine);

        for edit in edits {
            match edit {
                Edit::File { path, statements } => {
                    let path = PATHS[path];
                    if statements.is_empty() {
                        engine.host().remove_file(path);
                        files.remove(path);
                    } else {
                        let text = source_of(&statements);
                        engine.host().set_file(path, text.as_str());
                        files.insert(path, text);
                    }
                }
                Edit::ToggleDefs => {
                    let next = if files["defs.mx"] == DEFS { DEFS_EDITED } else { DEFS };
                    engine.host().set_file("defs.mx", next);
                    files.insert("defs.mx", next.to_string());
                }
            }

            let report = run(&engine);
            prop_assert_eq!(report.outcome, RunOutcome::Done);
            verify(&engine);
            prop_assert_eq!(render(&engine), clean_render(&files));
        }
    }
}

#[test]
fn removing_a_definition_fails_its_calls() {
    let engine = engine_with(
        project(&[("main.mx", "pair!(1, 2) twice!(3)")]),
        TemplateExpander::new(),
        test_config(),
    );
    run(&engine);
    engine.host().set_file("defs.mx", DEFS_EDITED);
    run(&engine);
    assert_eq!(
        render(&engine),
        vec!["main.mx#0 !! unresolved", "main.mx#1 => 3 + 3"]
    );
    verify(&engine);
}
