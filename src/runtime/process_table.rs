//! Process table (C3) — the pid -> process handle map shared by every
//! scheduler worker. Grounded on the teacher's `DashMap`-backed process map
//! in `runtime/mod.rs`'s old `ReamRuntime`; lookups are wait-free reads via
//! `dashmap`'s sharded locking, writes (spawn/remove) take the per-shard
//! lock. `Pid` is a never-reused monotonic counter (see `types::Pid`), so
//! there is no ABA hazard in holding a pid across a lookup.

use dashmap::DashMap;
use std::sync::Arc;

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::process::ProcessHandle;
use crate::types::Pid;

/// Wait-free-read process directory. One instance is shared (via `Arc`)
/// across every scheduler worker thread and the NIF sandbox.
#[derive(Default)]
pub struct ProcessTable {
    processes: DashMap<Pid, ProcessHandle>,
}

impl ProcessTable {
    pub fn new() -> Arc<Self> {
        Arc::new(ProcessTable { processes: DashMap::new() })
    }

    pub fn insert(&self, pid: Pid, handle: ProcessHandle) -> RuntimeResult<()> {
        if self.processes.contains_key(&pid) {
            return Err(RuntimeError::ProcessExists(pid));
        }
        self.processes.insert(pid, handle);
        Ok(())
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessHandle> {
        self.processes.get(&pid).map(|e| e.value().clone())
    }

    pub fn remove(&self, pid: Pid) -> Option<ProcessHandle> {
        self.processes.remove(&pid).map(|(_, h)| h)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn all_pids(&self) -> Vec<Pid> {
        self.processes.iter().map(|e| *e.key()).collect()
    }

    pub fn all_handles(&self) -> Vec<(Pid, ProcessHandle)> {
        self.processes.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process::Process;
    use crate::types::Priority;

    fn handle() -> (Pid, ProcessHandle) {
        let pid = Pid::new();
        let process = Process::new(pid, Priority::Normal, "test".to_string(), "main".to_string(), 0);
        (pid, ProcessHandle::new(process))
    }

    #[test]
    fn insert_and_lookup() {
        let table = ProcessTable::new();
        let (pid, h) = handle();
        table.insert(pid, h).unwrap();
        assert!(table.get(pid).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let table = ProcessTable::new();
        let (pid, h) = handle();
        table.insert(pid, h.clone()).unwrap();
        assert!(table.insert(pid, h).is_err());
    }

    #[test]
    fn remove_drops_entry() {
        let table = ProcessTable::new();
        let (pid, h) = handle();
        table.insert(pid, h).unwrap();
        assert!(table.remove(pid).is_some());
        assert!(table.get(pid).is_none());
    }
}
