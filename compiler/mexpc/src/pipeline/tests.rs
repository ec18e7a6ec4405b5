use mexp_expand::{SharedExpansionCache, TemplateExpander};
use mexp_ir::{
    BlobId, ExpansionErrorKind, ExpansionPipelineError, FileId, ResolveErrorKind, Step,
};
use mexp_store::{Changeset, ContentStore, ExpansionIndex};
use pretty_assertions::assert_eq;

use super::*;
use crate::host::{Capability, ExpansionHost, ExtractableUnit, MacroCall};
use crate::text_host::TextProject;

const DEFS: &str = "macro twice(decl) { $0, $0 }\n\
                    macro outer(decl) { inner!($0) }\n\
                    macro inner(decl) { [$0] }\n\
                    macro pair(decl) { ($0 $1) }\n\
                    macro broken(decl) { $x }\n\
                    macro tool(proc) { $* }";

struct Fixture {
    project: TextProject,
    expander: TemplateExpander,
    cache: SharedExpansionCache,
    index: ExpansionIndex,
    store: ContentStore,
    file: FileId,
}

impl Fixture {
    fn new(source: &str) -> Self {
        let project = TextProject::new();
        project.set_file("defs.mx", DEFS);
        let file = project.set_file("main.mx", source);
        Fixture {
            project,
            expander: TemplateExpander::new(),
            cache: SharedExpansionCache::new(),
            index: ExpansionIndex::new(),
            store: ContentStore::new(),
            file,
        }
    }

    fn edit(&self, source: &str) {
        self.project.set_file("main.mx", source);
    }

    fn calls_in(&self, file: FileId) -> Vec<MacroCall> {
        let unit = ExtractableUnit::whole_file(file, Step::ZERO);
        self.project.extract(&unit, &self.store).unwrap().calls
    }

    fn calls(&self) -> Vec<MacroCall> {
        self.calls_in(self.file)
    }

    fn stage1(&self, call: &MacroCall) -> Stage1Result {
        let cx = Stage1Context {
            host: &self.project,
            expander: &self.expander,
            cache: &self.cache,
            index: &self.index,
            store: &self.store,
        };
        resolve_and_expand(&cx, call).unwrap()
    }

    /// All three stages for `calls`, as one step would run them.
    fn process(&mut self, calls: &[MacroCall], step: Step) -> Vec<CommitOutcome> {
        let results: Vec<Stage1Result> = calls.iter().map(|call| self.stage1(call)).collect();
        let mut changeset = Changeset::new();
        let staged: Vec<Stage2Result> = results
            .into_iter()
            .map(|result| materialize(result, step, &mut changeset))
            .collect();
        let applied = self.store.apply(changeset).unwrap();
        staged
            .into_iter()
            .map(|result| commit(result, &applied, step, &mut self.index, &self.store).unwrap())
            .collect()
    }

    fn blob_of(&self, call: &MacroCall) -> BlobId {
        self.index.record(call.id).unwrap().output_blob().unwrap()
    }

    fn error_of(&self, call: &MacroCall) -> ExpansionPipelineError {
        self.index.record(call.id).unwrap().error().unwrap().clone()
    }
}

#[test]
fn new_call_is_written() {
    let mut fx = Fixture::new("twice!(1)");
    let calls = fx.calls();
    match fx.stage1(&calls[0]) {
        Stage1Result::NewOutput { text, previous, .. } => {
            assert_eq!(text, "1, 1");
            assert_eq!(previous, None);
        }
        other => panic!("expected new output, got {other:?}"),
    }

    let outcomes = fx.process(&calls, Step::ZERO);
    let blob = fx.blob_of(&calls[0]);
    assert_eq!(fx.store.read_text(blob), Some("1, 1"));
    assert_eq!(outcomes[0].fresh.map(|fresh| fresh.blob), Some(blob));
    assert!(fx.index.verify(&fx.store).is_ok());
}

#[test]
fn unchanged_call_is_noop() {
    let mut fx = Fixture::new("twice!(1)");
    let calls = fx.calls();
    fx.process(&calls, Step::ZERO);
    let blob = fx.blob_of(&calls[0]);

    assert_eq!(
        fx.stage1(&calls[0]),
        Stage1Result::NoOp {
            call: calls[0].id,
            blob: Some(blob),
        }
    );
    let outcomes = fx.process(&calls, Step::ZERO);
    assert_eq!(outcomes[0].fresh.map(|fresh| fresh.blob), Some(blob));
}

#[test]
fn identical_bytes_only_refresh_metadata() {
    let mut fx = Fixture::new("twice!(1)");
    fx.process(&fx.calls(), Step::ZERO);
    let blob = fx.blob_of(&fx.calls()[0]);
    let old_hashes = fx.index.record(fx.calls()[0].id).unwrap().hashes;

    // Same arguments after trimming, different call body.
    fx.edit("twice!( 1 )");
    let calls = fx.calls();
    assert!(matches!(fx.stage1(&calls[0]), Stage1Result::RangesOnly { .. }));

    fx.process(&calls, Step::ZERO);
    let record = fx.index.record(calls[0].id).unwrap();
    assert_eq!(record.output_blob(), Some(blob));
    assert_ne!(record.hashes, old_hashes);
    assert_eq!(record.hashes.call_hash, calls[0].body_hash);
    assert_eq!(fx.store.read_text(blob), Some("1, 1"));
}

#[test]
fn changed_bytes_overwrite_in_place() {
    let mut fx = Fixture::new("twice!(1)");
    fx.process(&fx.calls(), Step::ZERO);
    let blob = fx.blob_of(&fx.calls()[0]);

    fx.edit("twice!(2)");
    let calls = fx.calls();
    fx.process(&calls, Step::ZERO);
    assert_eq!(fx.blob_of(&calls[0]), blob);
    assert_eq!(fx.store.read_text(blob), Some("2, 2"));
}

#[test]
fn failure_deletes_previous_output() {
    let mut fx = Fixture::new("twice!(1)");
    fx.process(&fx.calls(), Step::ZERO);
    let blob = fx.blob_of(&fx.calls()[0]);

    fx.edit("twice!(1) twice!(2)");
    fx.project.disable_macro("twice");
    let calls = fx.calls();
    let outcomes = fx.process(&calls, Step::ZERO);

    assert!(!fx.store.contains(blob));
    assert_eq!(outcomes[0].fresh, None);
    assert_eq!(
        fx.error_of(&calls[0]),
        ExpansionPipelineError::Unresolved {
            kind: ResolveErrorKind::Disabled,
            transient: false,
        }
    );
    assert!(fx.index.verify(&fx.store).is_ok());
}

#[test]
fn repeated_identical_failure_is_noop() {
    let mut fx = Fixture::new("missing!(1)");
    let calls = fx.calls();
    assert!(matches!(fx.stage1(&calls[0]), Stage1Result::Fail { .. }));
    fx.process(&calls, Step::ZERO);
    assert_eq!(
        fx.stage1(&calls[0]),
        Stage1Result::NoOp {
            call: calls[0].id,
            blob: None,
        }
    );
}

#[test]
fn gated_calls_fail_without_resolving() {
    let mut fx = Fixture::new("#[cfg(off)] twice!(1) tool!(2)");
    fx.project.set_proc_capability(Capability::Off);
    let calls = fx.calls();
    fx.process(&calls, Step::ZERO);
    assert_eq!(fx.error_of(&calls[0]), ExpansionPipelineError::CfgDisabled);
    assert_eq!(fx.error_of(&calls[1]), ExpansionPipelineError::ExpansionDisabled);

    fx.project.set_proc_capability(Capability::Absent);
    fx.process(&calls, Step::ZERO);
    assert_eq!(fx.error_of(&calls[1]), ExpansionPipelineError::Skipped);
}

#[test]
fn unusable_definition_is_def_syntax() {
    let mut fx = Fixture::new("broken!(1)");
    let calls = fx.calls();
    fx.process(&calls, Step::ZERO);
    assert_eq!(fx.error_of(&calls[0]), ExpansionPipelineError::MacroDefSyntax);
}

#[test]
fn expander_failure_is_memoized_until_inputs_change() {
    let mut fx = Fixture::new("pair!(1)");
    let calls = fx.calls();
    fx.process(&calls, Step::ZERO);
    match fx.error_of(&calls[0]) {
        ExpansionPipelineError::Expansion(err) => {
            assert_eq!(err.kind, ExpansionErrorKind::BadArguments);
            assert!(err.cacheable);
        }
        other => panic!("expected expander failure, got {other:?}"),
    }
    assert!(fx.stage1(&calls[0]).is_noop());

    fx.edit("pair!(1, 2)");
    let calls = fx.calls();
    fx.process(&calls, Step::ZERO);
    assert_eq!(fx.store.read_text(fx.blob_of(&calls[0])), Some("(1 2)"));
}

#[test]
fn invalid_call_drops_its_record() {
    let mut fx = Fixture::new("twice!(1)");
    fx.process(&fx.calls(), Step::ZERO);
    let blob = fx.blob_of(&fx.calls()[0]);

    fx.edit("twice!(1");
    let calls = fx.calls();
    assert!(!calls[0].is_valid());
    assert_eq!(
        fx.stage1(&calls[0]),
        Stage1Result::Invalidate {
            call: calls[0].id,
            blob: Some(blob),
        }
    );
    fx.process(&calls, Step::ZERO);
    assert!(fx.index.record(calls[0].id).is_none());
    assert!(!fx.store.contains(blob));
    assert_eq!(fx.index.file_count(), 0);
}

#[test]
fn invalid_call_without_record_is_noop() {
    let fx = Fixture::new("twice!(1");
    let calls = fx.calls();
    assert!(fx.stage1(&calls[0]).is_noop());
}

#[test]
fn missing_output_is_corruption() {
    let mut fx = Fixture::new("twice!(1)");
    fx.process(&fx.calls(), Step::ZERO);
    let blob = fx.blob_of(&fx.calls()[0]);
    fx.store.delete(blob);

    let cx = Stage1Context {
        host: &fx.project,
        expander: &fx.expander,
        cache: &fx.cache,
        index: &fx.index,
        store: &fx.store,
    };
    let err = resolve_and_expand(&cx, &fx.calls()[0]).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn dropping_an_expansion_orphans_nested_output() {
    let mut fx = Fixture::new("outer!(1)");
    let outer = fx.calls();
    fx.process(&outer, Step::ZERO);
    let outer_blob = fx.blob_of(&outer[0]);
    assert_eq!(fx.store.read_text(outer_blob), Some("inner!(1)"));

    let inner = fx.calls_in(FileId::Expansion(outer_blob));
    assert_eq!(inner.len(), 1);
    fx.process(&inner, Step::new(1));
    let inner_blob = fx.blob_of(&inner[0]);
    assert_eq!(fx.store.read_text(inner_blob), Some("[1]"));

    fx.edit("outer!(1");
    let outcomes = fx.process(&fx.calls(), Step::ZERO);
    assert_eq!(outcomes[0].orphaned, vec![inner_blob]);
    assert!(fx.index.record(inner[0].id).is_none());
    assert!(!fx.store.contains(outer_blob));
}

#[test]
fn materialize_queues_the_right_operation() {
    let call = mexp_ir::CallId::new(FileId::Real(0), 0);
    let mut changeset = Changeset::new();

    let noop = materialize(Stage1Result::NoOp { call, blob: None }, Step::ZERO, &mut changeset);
    assert_eq!(noop, Stage2Result::NoOp { call, blob: None });
    assert!(changeset.is_empty());

    let invalidate = materialize(
        Stage1Result::Invalidate {
            call,
            blob: Some(BlobId::from_raw(3)),
        },
        Step::ZERO,
        &mut changeset,
    );
    assert_eq!(invalidate, Stage2Result::Invalidate { call });
    assert_eq!(changeset.len(), 1);
}
