//! Implementations of the `mexp` subcommands.
//!
//! Each command reports problems on stderr and exits the process with status
//! 1, like a compiler driver would.

use std::io::Write;
use std::path::{Path, PathBuf};

use mexp_expand::{SharedExpansionCache, TemplateExpander};
use mexp_ir::CallId;
use mexp_store::{ContentStore, ExpansionIndex, IndexSnapshot};
use rustc_hash::FxHashMap;

use crate::config::EngineConfig;
use crate::coordinator::ExpansionCoordinator;
use crate::progress::{CancellationToken, NoProgress, ProgressSink};
use crate::text_host::TextProject;

/// Options of `mexp expand`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpandOptions {
    pub limit: Option<u16>,
    pub jobs: Option<usize>,
    pub parallel: bool,
    /// Snapshot file to resume from and save to.
    pub state: Option<PathBuf>,
    /// Print every recorded expansion after the run.
    pub print: bool,
    /// Only expand files under this path prefix.
    pub workspace: Option<String>,
    pub progress: bool,
}

impl ExpandOptions {
    /// Parse `--flag` style options. Returns the first argument that is not
    /// understood as the error.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut options = ExpandOptions {
            parallel: true,
            ..ExpandOptions::default()
        };
        for arg in args {
            if let Some(value) = arg.strip_prefix("--limit=") {
                options.limit = Some(value.parse().map_err(|_| arg.clone())?);
            } else if let Some(value) = arg.strip_prefix("--jobs=") {
                options.jobs = Some(value.parse().map_err(|_| arg.clone())?);
            } else if let Some(value) = arg.strip_prefix("--state=") {
                options.state = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--workspace=") {
                options.workspace = Some(value.to_string());
            } else if arg == "--no-parallel" {
                options.parallel = false;
            } else if arg == "--print" {
                options.print = true;
            } else if arg == "--progress" {
                options.progress = true;
            } else {
                return Err(arg.clone());
            }
        }
        Ok(options)
    }

    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env().with_parallel(self.parallel);
        if let Some(limit) = self.limit {
            config = config.with_recursion_limit(limit);
        }
        if let Some(jobs) = self.jobs {
            config = config.with_jobs(jobs);
        }
        config
    }
}

/// Writes `[ 42%] phase` lines over each other on stderr.
struct TerminalProgress;

impl ProgressSink for TerminalProgress {
    fn report(&self, fraction: f64, phase: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r[{:>3.0}%] {phase:<40}", fraction * 100.0);
        if fraction >= 1.0 {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    }
}

/// Expand every macro call in the `.mx` files under `dir`.
pub fn expand_dir(dir: &str, options: &ExpandOptions) {
    let mut project = match TextProject::load_dir(Path::new(dir)) {
        Ok(project) => project,
        Err(e) => {
            eprintln!("error: cannot read '{dir}': {e}");
            std::process::exit(1);
        }
    };
    if let Some(prefix) = &options.workspace {
        project = project.with_workspace(prefix.clone());
    }

    let mut engine = ExpansionCoordinator::new(
        project,
        TemplateExpander::new(),
        SharedExpansionCache::new(),
        options.config(),
    );
    if let Some(state) = &options.state {
        match IndexSnapshot::load(state) {
            Ok(Some(snapshot)) => engine = engine.with_snapshot(snapshot),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %state.display(), error = %e, "discarding unreadable state");
                eprintln!("warning: ignoring state file '{}': {e}", state.display());
            }
        }
    }

    let cancel = CancellationToken::new();
    let result = if options.progress {
        engine.run(&cancel, &TerminalProgress)
    } else {
        engine.run(&cancel, &NoProgress)
    };

    if let Some(state) = &options.state {
        if let Err(e) = engine.save_snapshot(state) {
            eprintln!("error: cannot save state to '{}': {e}", state.display());
            std::process::exit(1);
        }
    }

    match result {
        Ok(report) => {
            if options.print {
                let index = engine.index().read();
                let store = engine.store().read();
                print_expansions(engine.host(), &index, &store);
            }
            println!("{report}");
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn print_expansions(project: &TextProject, index: &ExpansionIndex, store: &ContentStore) {
    let mut records: Vec<_> = index.iter().collect();
    records.sort_unstable_by_key(|(call, _)| *call);
    for (call, record) in records {
        let site = describe_call(project, call);
        match &record.outcome {
            Ok(output) => {
                let text = store.read_text(output.blob).unwrap_or("<missing>");
                println!("{site} => {text}");
            }
            Err(err) => println!("{site} !! {err}"),
        }
    }
}

fn describe_call(project: &TextProject, call: CallId) -> String {
    format!("{}#{}", project.describe(call.file), call.slot)
}

/// Summarize a saved state file.
pub fn print_stats(state: &Path) {
    let snapshot = match IndexSnapshot::load(state) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            println!("no state at '{}'", state.display());
            return;
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let index = &snapshot.index;
    let failed = index.iter().filter(|(_, record)| record.error().is_some()).count();
    println!("records:  {} ({} failed)", index.len(), failed);
    println!("files:    {}", index.file_count());
    println!("blobs:    {}", snapshot.store.len());
    for (step, count) in snapshot.store.step_histogram().iter().enumerate() {
        println!("  step {step:>3}: {count}");
    }

    let mut by_code: FxHashMap<&'static str, usize> = FxHashMap::default();
    for (_, record) in index.iter() {
        if let Some(err) = record.error() {
            *by_code.entry(err.code()).or_default() += 1;
        }
    }
    let mut codes: Vec<_> = by_code.into_iter().collect();
    codes.sort_unstable();
    for (code, count) in codes {
        println!("  {code}: {count}");
    }

    if snapshot.clean_start {
        println!("next run starts clean (last run aborted)");
    }
}

/// Delete a saved state file.
pub fn clean_state(state: &Path) {
    match std::fs::remove_file(state) {
        Ok(()) => println!("removed '{}'", state.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("error: cannot remove '{}': {e}", state.display());
            std::process::exit(1);
        }
    }
}
