//! Runtime boot/control surface (C11): the single entry point that wires
//! together the process table (C2), bytecode module registry (C4/C5), NIF
//! sandbox (C10), and the scheduler pool (C8) into one running system, and
//! exposes the operations a host embedding REAM actually calls: load code,
//! spawn the first process, inspect what's running, shut everything down.
//!
//! Grounded on the teacher's `runtime/mod.rs` (`ReamRuntime`: config held
//! alongside `Arc`-shared subsystems, a `start`/`stop` lifecycle, a
//! `RuntimeStats` snapshot) entirely rewired from its actor-framework
//! surface (`spawn_actor`/`ask_actor`/the hypervisor monitoring block, all
//! placeholder stubs returning dummy values — see git history) onto the
//! real bytecode-VM subsystems built out in this module's siblings.

pub mod executor;
pub mod memory;
pub mod message;
pub mod preemption;
pub mod process;
pub mod process_table;
pub mod scheduler;
pub mod supervisor;
pub mod term;
pub mod work_stealing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bytecode::registry::ModuleRegistry;
use crate::bytecode::BytecodeProgram;
use crate::error::{ReamError, ReamResult, RuntimeError, RuntimeResult};
use crate::nif::NifRegistry;
use crate::types::{Pid, Priority, ProcessInfo, ReamConfig, RuntimeStats};

pub use preemption::DirtyWatchdog;
pub use process::{Process, ProcessHandle};
pub use process_table::ProcessTable;
pub use work_stealing::WorkStealingPool;

/// A running REAM system: one process table, one module registry, one NIF
/// registry, one scheduler pool, shared by every process spawned through
/// it. Construct with `new`/`with_config`, call `start` once, then
/// `spawn`/`load_module` as needed, and `shutdown` to tear everything down.
pub struct ReamRuntime {
    config: ReamConfig,
    processes: Arc<ProcessTable>,
    modules: Arc<ModuleRegistry>,
    nifs: Arc<NifRegistry>,
    pool: Arc<WorkStealingPool>,
    watchdog: Arc<DirtyWatchdog>,
    start_time: Instant,
}

impl ReamRuntime {
    /// Build a runtime with default configuration. Does not start the
    /// scheduler pool — call `start` before spawning anything.
    pub fn new() -> ReamResult<Self> {
        Self::with_config(ReamConfig::default())
    }

    pub fn with_config(config: ReamConfig) -> ReamResult<Self> {
        let processes = ProcessTable::new();
        let modules = Arc::new(ModuleRegistry::new());
        let nifs = Arc::new(NifRegistry::new());
        let worker_count = config.resolved_scheduler_count();
        let watchdog = Arc::new(DirtyWatchdog::new());
        let pool = Arc::new(WorkStealingPool::new(
            worker_count,
            config.scheduler_quantum,
            Arc::clone(&processes),
            Arc::clone(&modules),
            Arc::clone(&nifs),
            Arc::clone(&watchdog),
        ));

        Ok(ReamRuntime { config, processes, modules, nifs, pool, watchdog, start_time: Instant::now() })
    }

    /// Start the scheduler pool and the dirty-call watchdog. Idempotent.
    pub fn start(&self) -> ReamResult<()> {
        self.pool.start()?;
        self.watchdog.start();
        log::info!(
            "ream runtime started: {} scheduler(s), quantum={} reductions",
            self.config.resolved_scheduler_count(),
            self.config.scheduler_quantum
        );
        Ok(())
    }

    /// Stop the scheduler pool and watchdog, dropping every in-flight
    /// process without running any further reductions. Links/monitors are
    /// not notified — this is a hard stop (spec §4.11's `Shutdown` exit
    /// reason is for cooperative supervisor-driven shutdown, which callers
    /// get by terminating processes individually before calling this).
    pub fn shutdown(&self) {
        self.pool.stop();
        self.watchdog.stop();
        log::info!("ream runtime stopped after {:?}", self.start_time.elapsed());
    }

    /// Load (or hot-reload) a compiled module. See `ModuleRegistry::load`
    /// for the current/old-version semantics this delegates to (C4).
    pub fn load_module(&self, name: &str, program: BytecodeProgram) -> ReamResult<()> {
        self.modules.load(name, program).map_err(ReamError::from)
    }

    /// Purge a module's old version once no process still references it.
    pub fn purge_module(&self, name: &str) -> ReamResult<()> {
        self.modules.purge(name).map_err(ReamError::from)
    }

    pub fn load_nif(&self, path: impl AsRef<std::path::Path>) -> ReamResult<String> {
        self.nifs.load(path).map_err(ReamError::from)
    }

    /// Spawn a new process at `module:function/arity` with priority
    /// `Normal`, enqueue it onto the scheduler pool, and return its pid.
    pub fn spawn(&self, module: &str, function: &str, arity: u8) -> ReamResult<Pid> {
        self.spawn_with_priority(module, function, arity, Priority::Normal)
    }

    pub fn spawn_with_priority(
        &self,
        module: &str,
        function: &str,
        arity: u8,
        priority: Priority,
    ) -> ReamResult<Pid> {
        let program = self
            .modules
            .current(module)
            .ok_or_else(|| RuntimeError::InvalidMessage(format!("module {module} not loaded")))?;
        let start_pc = program
            .get_function_by_name(function)
            .map(|f| f.start_pc as u32)
            .ok_or_else(|| RuntimeError::InvalidMessage(format!("{module}:{function}/{arity} not exported")))?;

        let pid = Pid::new();
        let mut process = Process::new(pid, priority, module.to_string(), function.to_string(), arity);
        process.set_ip(start_pc);
        self.processes.insert(pid, ProcessHandle::new(process))?;
        self.pool.enqueue(pid, priority);
        Ok(pid)
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn process_info(&self, pid: Pid) -> Option<ProcessInfo> {
        self.processes.get(pid).map(|h| h.info())
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.processes.get(pid).map(|h| h.is_alive()).unwrap_or(false)
    }

    pub fn list_processes(&self) -> Vec<Pid> {
        self.processes.all_pids()
    }

    /// Send an uncatchable kill signal to `pid`, bypassing `trap_exit`.
    pub fn terminate_process(&self, pid: Pid) -> RuntimeResult<()> {
        let handle = self.processes.get(pid).ok_or(RuntimeError::ProcessNotFound(pid))?;
        handle.terminate(&crate::error::ExitReason::Killed)
    }

    pub fn stats(&self) -> RuntimeStats {
        let handles = self.processes.all_handles();
        let process_count = handles.len();
        let running_processes =
            handles.iter().filter(|(_, h)| h.state() == crate::types::ProcessState::Running).count();
        let memory_usage = handles.iter().map(|(_, h)| h.info().memory_usage).sum();
        let scheduler_utilization =
            if self.pool.is_running() { self.pool.stats().total_quanta as f64 } else { 0.0 };

        RuntimeStats {
            process_count,
            running_processes,
            memory_usage,
            message_rate: 0.0,
            scheduler_utilization,
            gc_collections: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn config(&self) -> &ReamConfig {
        &self.config
    }

    pub fn watchdog(&self) -> &Arc<DirtyWatchdog> {
        &self.watchdog
    }
}

impl Drop for ReamRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::program::FunctionSignature;
    use crate::bytecode::{Bytecode, BytecodeFunction, TypeInfo, Value};
    use crate::types::EffectGrade;

    fn trivial_program() -> BytecodeProgram {
        let func = BytecodeFunction {
            id: 0,
            name: "run".into(),
            param_count: 0,
            local_count: 0,
            start_pc: 0,
            instructions: vec![Bytecode::Const(0, EffectGrade::Pure)],
            signature: FunctionSignature { params: vec![], return_type: TypeInfo::Unit, effects: EffectGrade::Pure },
            effect_grade: EffectGrade::Pure,
        };
        let mut program = BytecodeProgram::new("boot".into());
        program.add_constant(Value::Int(1));
        program.add_function(func);
        program.exports.insert("run".to_string(), 0);
        program
    }

    #[test]
    fn runtime_boots_loads_spawns_and_runs() {
        let runtime = ReamRuntime::new().unwrap();
        runtime.load_module("boot", trivial_program()).unwrap();
        runtime.start().unwrap();

        let pid = runtime.spawn("boot", "run", 0).unwrap();
        assert_eq!(runtime.process_count(), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!runtime.is_alive(pid));
        runtime.shutdown();
    }

    #[test]
    fn spawn_fails_for_unloaded_module() {
        let runtime = ReamRuntime::new().unwrap();
        assert!(runtime.spawn("nope", "run", 0).is_err());
    }
}
