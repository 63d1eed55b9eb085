//! Module registry (C4) — tracks, per module name, a current version and at
//! most one retained old version, following BEAM's code-replacement model:
//! loading a new version demotes the current one to "old" rather than
//! discarding it, and the old version can only be purged once no process
//! still has a saved instruction pointer into it.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use crate::bytecode::BytecodeProgram;
use crate::error::{LoaderError, LoaderResult};
use crate::types::Pid;

/// One loaded version of a module: its code plus the set of processes
/// whose call stack still references it (tracked so `purge` can refuse a
/// busy old version per spec §4.4). The program is kept behind an `Arc` so
/// that `ModuleRegistry::current` — called on every `call` crossing a
/// module boundary, including every iteration of a tight loop — hands out a
/// refcount bump rather than a deep clone of the whole instruction/constant
/// table.
#[derive(Debug, Clone)]
pub struct ModuleVersion {
    pub program: Arc<BytecodeProgram>,
    referenced_by: std::collections::HashSet<Pid>,
}

impl ModuleVersion {
    fn new(program: BytecodeProgram) -> Self {
        ModuleVersion { program: Arc::new(program), referenced_by: std::collections::HashSet::new() }
    }

    pub fn mark_referenced(&mut self, pid: Pid) {
        self.referenced_by.insert(pid);
    }

    pub fn unmark_referenced(&mut self, pid: Pid) {
        self.referenced_by.remove(&pid);
    }

    pub fn is_busy(&self) -> bool {
        !self.referenced_by.is_empty()
    }
}

/// Current/old version pair for one module name.
struct ModuleSlot {
    current: ModuleVersion,
    old: Option<ModuleVersion>,
}

/// The module registry (C4): a name -> current/old version table shared by
/// the loader (writer) and the execution engine (reader, on every `call`
/// crossing a module boundary). Publish/replace/purge are serialized with
/// a single lock; lookups during normal execution take a read path.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, ModuleSlot>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry { modules: RwLock::new(HashMap::new()) }
    }

    /// Publish a module for the first time, or replace its current version.
    /// Fails if an old (unpurged) version already exists — the caller must
    /// purge before loading a third generation, matching BEAM's "only two
    /// versions resident at once" rule.
    pub fn load(&self, name: &str, program: BytecodeProgram) -> LoaderResult<()> {
        let mut modules = self.modules.write();
        match modules.get_mut(name) {
            None => {
                modules.insert(name.to_string(), ModuleSlot {
                    current: ModuleVersion::new(program),
                    old: None,
                });
                Ok(())
            }
            Some(slot) if slot.old.is_some() => {
                Err(LoaderError::OldVersionExists(name.to_string()))
            }
            Some(slot) => {
                let demoted = std::mem::replace(&mut slot.current, ModuleVersion::new(program));
                slot.old = Some(demoted);
                Ok(())
            }
        }
    }

    /// Purge a module's old version. Fails if it's still referenced by a
    /// live process, or if there's no old version to purge.
    pub fn purge(&self, name: &str) -> LoaderResult<()> {
        let mut modules = self.modules.write();
        let slot = modules.get_mut(name)
            .ok_or_else(|| LoaderError::NothingToPurge(name.to_string()))?;
        match &slot.old {
            None => Err(LoaderError::NothingToPurge(name.to_string())),
            Some(old) if old.is_busy() => Err(LoaderError::Busy(name.to_string())),
            Some(_) => {
                slot.old = None;
                Ok(())
            }
        }
    }

    /// Look up the current version's program by module name. Cheap: this
    /// is an `Arc` clone (one refcount bump), not a copy of the program.
    pub fn current(&self, name: &str) -> Option<Arc<BytecodeProgram>> {
        self.modules.read().get(name).map(|s| Arc::clone(&s.current.program))
    }

    /// Record that `pid` has an active call frame into `name`'s old
    /// version (called when a process's instruction pointer is already
    /// inside the old code at the moment a new version is loaded).
    pub fn mark_old_referenced(&self, name: &str, pid: Pid) {
        if let Some(slot) = self.modules.write().get_mut(name) {
            if let Some(old) = &mut slot.old {
                old.mark_referenced(pid);
            }
        }
    }

    pub fn unmark_old_referenced(&self, name: &str, pid: Pid) {
        if let Some(slot) = self.modules.write().get_mut(name) {
            if let Some(old) = &mut slot.old {
                old.unmark_referenced(pid);
            }
        }
    }

    /// Whether a module has an old (unpurged) version resident.
    pub fn has_old_version(&self, name: &str) -> bool {
        self.modules.read().get(name).map(|s| s.old.is_some()).unwrap_or(false)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Bytecode, BytecodeProgram, Value};
    use crate::types::EffectGrade;

    fn trivial_program(name: &str) -> BytecodeProgram {
        let mut p = BytecodeProgram::new(name.to_string());
        let c = p.add_constant(Value::Int(1));
        p.add_instruction(Bytecode::Const(c, EffectGrade::Pure));
        p.add_instruction(Bytecode::Ret(EffectGrade::Pure));
        p
    }

    #[test]
    fn test_load_and_lookup() {
        let registry = ModuleRegistry::new();
        registry.load("m", trivial_program("m")).unwrap();
        assert!(registry.current("m").is_some());
        assert!(registry.current("missing").is_none());
    }

    #[test]
    fn test_replace_creates_old_version() {
        let registry = ModuleRegistry::new();
        registry.load("m", trivial_program("m")).unwrap();
        registry.load("m", trivial_program("m")).unwrap();
        assert!(registry.has_old_version("m"));

        // A third load without purging first is rejected.
        assert!(registry.load("m", trivial_program("m")).is_err());
    }

    #[test]
    fn test_purge_respects_busy() {
        let registry = ModuleRegistry::new();
        registry.load("m", trivial_program("m")).unwrap();
        registry.load("m", trivial_program("m")).unwrap();

        let pid = Pid::new();
        registry.mark_old_referenced("m", pid);
        assert!(registry.purge("m").is_err());

        registry.unmark_old_referenced("m", pid);
        assert!(registry.purge("m").is_ok());
        assert!(!registry.has_old_version("m"));
    }
}
