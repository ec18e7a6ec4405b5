//! An in-memory project of text files.
//!
//! Files hold macro definitions and calls in a small surface syntax (see
//! [`scan`]). Definitions are global: a call resolves against every real file
//! in the project. Expansion files are read back from the content store, so
//! calls produced by an expansion are found in the next step.
//!
//! The project can be edited between runs and can inject host faults (units
//! that are not ready, denied reads, a failing warm-up pass) for testing the
//! engine's retry paths.

mod scan;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use mexp_ir::{CallId, FileId, ResolveErrorKind, Step};
use mexp_store::ContentStore;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::host::{
    CallFlags, Capability, ExpansionHost, ExtractError, ExtractableUnit, ExtractedFile,
    FreshOutput, HostError, MacroCall, MacroDefinition, MacroKind, ResolveError,
};

/// File extension of project sources loaded from disk.
pub const SOURCE_EXTENSION: &str = "mx";

/// Behaviour of the warm-up pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WarmUp {
    #[default]
    Succeed,
    Fail,
    Panic,
}

#[derive(Clone, Debug)]
struct SourceText {
    path: String,
    text: String,
}

#[derive(Debug)]
struct ProjectState {
    files: BTreeMap<u32, SourceText>,
    ids: FxHashMap<String, u32>,
    next_id: u32,
    /// Definitions by name, in file order.
    defs: FxHashMap<String, Vec<(MacroKind, String)>>,
    workspace: Option<String>,
    proc_capability: Capability,
    disabled: FxHashSet<String>,
    consistent: bool,
    resolver_transient: bool,
}

impl Default for ProjectState {
    fn default() -> Self {
        ProjectState {
            files: BTreeMap::new(),
            ids: FxHashMap::default(),
            next_id: 0,
            defs: FxHashMap::default(),
            workspace: None,
            proc_capability: Capability::Enabled,
            disabled: FxHashSet::default(),
            consistent: true,
            resolver_transient: false,
        }
    }
}

impl ProjectState {
    fn rebuild_defs(&mut self) {
        self.defs.clear();
        for source in self.files.values() {
            for def in scan::scan(&source.text).defs {
                self.defs.entry(def.name).or_default().push((def.kind, def.body));
            }
        }
    }

    fn in_workspace(&self, path: &str) -> bool {
        self.workspace
            .as_deref()
            .map_or(true, |prefix| path.starts_with(prefix))
    }
}

#[derive(Debug, Default)]
struct Faults {
    not_ready: FxHashMap<FileId, u32>,
    read_denied: FxHashMap<FileId, u32>,
    warm_up: WarmUp,
}

/// Take one charge from a fault counter.
fn take_charge(counters: &mut FxHashMap<FileId, u32>, file: FileId) -> bool {
    match counters.get_mut(&file) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// An in-memory [`ExpansionHost`].
#[derive(Debug, Default)]
pub struct TextProject {
    state: RwLock<ProjectState>,
    faults: Mutex<Faults>,
    heavy_log: Mutex<Vec<bool>>,
}

impl TextProject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.mx` file under `root`, keyed by its `/`-separated path
    /// relative to `root`.
    pub fn load_dir(root: &Path) -> io::Result<Self> {
        let mut paths = Vec::new();
        discover_recursive(root, &mut paths)?;
        paths.sort();

        let project = TextProject::new();
        for path in paths {
            let text = fs::read_to_string(&path)?;
            let relative = path.strip_prefix(root).unwrap_or(&path);
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            project.set_file(&key, text);
        }
        tracing::debug!(root = %root.display(), files = project.file_count(), "loaded project");
        Ok(project)
    }

    /// Restrict step-0 units to files whose path starts with `prefix`.
    /// Definitions outside the workspace still resolve.
    #[must_use]
    pub fn with_workspace(self, prefix: impl Into<String>) -> Self {
        self.state.write().workspace = Some(prefix.into());
        self
    }

    /// Add or replace a file. Returns its id, stable across edits.
    pub fn set_file(&self, path: &str, text: impl Into<String>) -> FileId {
        let mut state = self.state.write();
        let id = match state.ids.get(path) {
            Some(&id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                state.ids.insert(path.to_string(), id);
                id
            }
        };
        state.files.insert(
            id,
            SourceText {
                path: path.to_string(),
                text: text.into(),
            },
        );
        state.rebuild_defs();
        FileId::Real(id)
    }

    /// Remove a file. Its id is not reused.
    pub fn remove_file(&self, path: &str) -> bool {
        let mut state = self.state.write();
        let Some(&id) = state.ids.get(path) else {
            return false;
        };
        let removed = state.files.remove(&id).is_some();
        state.rebuild_defs();
        removed
    }

    pub fn file_id(&self, path: &str) -> Option<FileId> {
        let state = self.state.read();
        let id = *state.ids.get(path)?;
        state.files.contains_key(&id).then_some(FileId::Real(id))
    }

    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    /// Human-readable name of a file.
    pub fn describe(&self, file: FileId) -> String {
        match file {
            FileId::Real(id) => self
                .state
                .read()
                .files
                .get(&id)
                .map_or_else(|| file.to_string(), |source| source.path.clone()),
            FileId::Expansion(_) => file.to_string(),
        }
    }

    /// Availability of procedural macros.
    pub fn set_proc_capability(&self, capability: Capability) {
        self.state.write().proc_capability = capability;
    }

    /// Make calls to `name` resolve as disabled.
    pub fn disable_macro(&self, name: &str) {
        self.state.write().disabled.insert(name.to_string());
    }

    pub fn enable_macro(&self, name: &str) {
        self.state.write().disabled.remove(name);
    }

    pub fn set_consistent(&self, consistent: bool) {
        self.state.write().consistent = consistent;
    }

    /// Report unresolved names as transient failures.
    pub fn set_resolver_transient(&self, transient: bool) {
        self.state.write().resolver_transient = transient;
    }

    /// The next `times` extractions of `file` report the file as not ready.
    pub fn defer_extraction(&self, file: FileId, times: u32) {
        self.faults.lock().not_ready.insert(file, times);
    }

    /// The next `times` extractions of `file` are denied read access.
    pub fn deny_reads(&self, file: FileId, times: u32) {
        self.faults.lock().read_denied.insert(file, times);
    }

    pub fn set_warm_up(&self, behaviour: WarmUp) {
        self.faults.lock().warm_up = behaviour;
    }

    /// Heavy-mode notifications received, in order.
    pub fn heavy_mode_log(&self) -> Vec<bool> {
        self.heavy_log.lock().clone()
    }

    fn text_of(&self, file: FileId, expansions: &ContentStore) -> String {
        match file {
            FileId::Real(id) => self
                .state
                .read()
                .files
                .get(&id)
                .map(|source| source.text.clone())
                .unwrap_or_default(),
            FileId::Expansion(blob) => expansions.read_text(blob).unwrap_or_default().to_string(),
        }
    }
}

impl ExpansionHost for TextProject {
    fn units_for_step(&self, step: Step, fresh: &[FreshOutput]) -> Vec<ExtractableUnit> {
        let mut units = Vec::new();
        if step == Step::ZERO {
            let state = self.state.read();
            units.extend(
                state
                    .files
                    .iter()
                    .filter(|(_, source)| state.in_workspace(&source.path))
                    .map(|(&id, _)| ExtractableUnit::whole_file(FileId::Real(id), step)),
            );
        }
        let mut seen = FxHashSet::default();
        for output in fresh {
            if seen.insert(output.blob) {
                units.push(ExtractableUnit::whole_file(FileId::Expansion(output.blob), step));
            }
        }
        units
    }

    fn extract(
        &self,
        unit: &ExtractableUnit,
        expansions: &ContentStore,
    ) -> Result<ExtractedFile, ExtractError> {
        {
            let mut faults = self.faults.lock();
            if take_charge(&mut faults.not_ready, unit.file) {
                return Err(ExtractError::NotReady);
            }
            if take_charge(&mut faults.read_denied, unit.file) {
                return Err(ExtractError::ReadDenied);
            }
        }

        let text = self.text_of(unit.file, expansions);
        let calls = scan::scan(&text)
            .calls
            .into_iter()
            .zip(0u32..)
            .map(|(call, slot)| {
                let mut flags = CallFlags::empty();
                flags.set(CallFlags::VALID, call.valid);
                flags.set(CallFlags::CFG_ENABLED, call.cfg_enabled);
                MacroCall::new(CallId::new(unit.file, slot), call.path, call.body).with_flags(flags)
            })
            .collect();
        Ok(ExtractedFile { calls })
    }

    fn resolve(&self, call: &MacroCall) -> Result<MacroDefinition, ResolveError> {
        let state = self.state.read();
        match state.defs.get(&call.path).map(Vec::as_slice) {
            None | Some([]) => {
                let err = ResolveError::new(ResolveErrorKind::Unresolved);
                Err(if state.resolver_transient {
                    err.transient()
                } else {
                    err
                })
            }
            Some([_, _, ..]) => Err(ResolveError::new(ResolveErrorKind::Ambiguous)),
            Some([(kind, body)]) => {
                if state.disabled.contains(&call.path) {
                    return Err(ResolveError::new(ResolveErrorKind::Disabled));
                }
                Ok(MacroDefinition::new(*kind, body.clone()))
            }
        }
    }

    fn capability(&self, call: &MacroCall) -> Capability {
        let state = self.state.read();
        match state.defs.get(&call.path).map(Vec::as_slice) {
            Some([(MacroKind::Procedural, _)]) => state.proc_capability,
            _ => Capability::Enabled,
        }
    }

    fn is_consistent(&self) -> bool {
        self.state.read().consistent
    }

    fn warm_up(&self) -> Result<(), HostError> {
        let behaviour = self.faults.lock().warm_up;
        match behaviour {
            WarmUp::Succeed => Ok(()),
            WarmUp::Fail => Err(HostError::new("warm-up pass failed")),
            WarmUp::Panic => panic!("warm-up pass panicked"),
        }
    }

    fn heavy_mode(&self, enabled: bool) {
        self.heavy_log.lock().push(enabled);
    }
}

fn discover_recursive(dir: &Path, paths: &mut Vec<std::path::PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        // Skip hidden files and directories
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with('.'))
        {
            continue;
        }

        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == "target") {
                continue;
            }
            discover_recursive(&path, paths)?;
        } else if path.extension().is_some_and(|e| e == SOURCE_EXTENSION) {
            paths.push(path);
        }
    }
    Ok(())
}
