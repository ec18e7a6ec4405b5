//! Shared setup for engine tests.

use std::time::Duration;

use mexp_ir::FileId;
use mexp_store::{ContentStore, ExpansionIndex};
use mexpc::{
    CancellationToken, EngineConfig, Expander, ExpansionCoordinator, NoProgress, RunReport,
    SharedExpansionCache, TemplateExpander, TextProject,
};

/// Definitions every test project starts with.
pub const DEFS: &str = "\
macro twice(decl) { $0, $0 }
macro outer(decl) { inner!($0) }
macro inner(decl) { [$0] }
macro pair(decl) { ($0 $1) }
macro rec(decl) { rec!($0) }
macro tool(proc) { tool_output($*) }
";

pub type Engine<E = TemplateExpander> = ExpansionCoordinator<TextProject, E>;

pub fn test_config() -> EngineConfig {
    EngineConfig::default().with_tick(Duration::from_millis(5))
}

/// A project holding `defs.mx` plus `files`.
pub fn project(files: &[(&str, &str)]) -> TextProject {
    let project = TextProject::new();
    project.set_file("defs.mx", DEFS);
    for (path, text) in files {
        project.set_file(path, *text);
    }
    project
}

pub fn engine(files: &[(&str, &str)]) -> Engine {
    engine_with(project(files), TemplateExpander::new(), test_config())
}

pub fn engine_with<E: Expander>(project: TextProject, expander: E, config: EngineConfig) -> Engine<E> {
    ExpansionCoordinator::new(project, expander, SharedExpansionCache::new(), config)
}

pub fn run<E: Expander>(engine: &Engine<E>) -> RunReport {
    engine
        .run(&CancellationToken::new(), &NoProgress)
        .expect("run failed")
}

pub fn verify<E: Expander>(engine: &Engine<E>) {
    let index = engine.index().read();
    let store = engine.store().read();
    index.verify(&store).expect("index and store disagree");
}

/// Every recorded outcome reachable from a real file, independent of blob
/// ids, sorted.
///
/// ```text
/// main.mx#0 => inner!(1)
/// main.mx#0/0 => [1]
/// ```
pub fn render<E: Expander>(engine: &Engine<E>) -> Vec<String> {
    let index = engine.index().read();
    let store = engine.store().read();
    let mut out = Vec::new();
    for file in index.files() {
        if let FileId::Real(_) = file {
            let label = engine.host().describe(file);
            render_file(&index, &store, file, &label, &mut out);
        }
    }
    out.sort();
    out
}

fn render_file(
    index: &ExpansionIndex,
    store: &ContentStore,
    file: FileId,
    prefix: &str,
    out: &mut Vec<String>,
) {
    for call in index.calls_in_file(file) {
        let Some(record) = index.record(call) else {
            continue;
        };
        let sep = if file.is_expansion() { '/' } else { '#' };
        let label = format!("{prefix}{sep}{}", call.slot);
        match &record.outcome {
            Ok(output) => {
                let text = store.read_text(output.blob).unwrap_or("<missing>");
                out.push(format!("{label} => {text}"));
                render_file(index, store, FileId::Expansion(output.blob), &label, out);
            }
            Err(err) => out.push(format!("{label} !! {}", err.code())),
        }
    }
}

/// Text of the expansion recorded for `slot` in a real file.
pub fn expansion_text<E: Expander>(engine: &Engine<E>, path: &str, slot: u32) -> Option<String> {
    let file = engine.host().file_id(path)?;
    let index = engine.index().read();
    let blob = index.record(mexp_ir::CallId::new(file, slot))?.output_blob()?;
    engine.store().read().read_text(blob).map(str::to_string)
}
