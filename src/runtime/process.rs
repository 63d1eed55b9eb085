//! Process object (C2) — identity, scheduling state, heap/stack/registers,
//! reduction budget, mailbox, and link/monitor sets for one lightweight
//! process.
//!
//! Grounded on the teacher's `runtime/process.rs` (`Process`/`ProcessHandle`
//! split: an owned struct behind `Arc<RwLock<_>>` with a cheaply-cloneable
//! handle delegating every operation through the lock) generalized from an
//! actor-trait-dispatch model to the spec's bytecode-driven process object:
//! the actor's `receive` callback is replaced by an X-register file, an
//! operand stack, a heap (`runtime::term::Heap`), and an instruction
//! pointer into a loaded module's code.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::bytecode::Value;
use crate::error::{ExitReason, GcResult, RuntimeError, RuntimeResult};
use crate::runtime::memory::{GcStats, GenerationalGc};
use crate::runtime::message::Mailbox;
use crate::runtime::term::{Heap, Term};
use crate::types::{Message, MonitorRef, Pid, Priority, ProcessInfo, ProcessState};

/// Default number of X registers allocated to a fresh call frame.
const DEFAULT_REGISTER_COUNT: usize = 16;

/// Saved caller context pushed by `Bytecode::Call` and popped by
/// `Bytecode::Ret` (C6) — everything needed to resume the caller exactly
/// where it left off, including its own register file, since registers are
/// local to a call frame rather than shared across the whole process the
/// way the operand stack is.
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub return_module: String,
    pub return_function: String,
    pub return_arity: u8,
    pub return_ip: u32,
    pub saved_registers: Vec<Term>,
}

/// A `try` region pushed by `Bytecode::Try` and popped by `Bytecode::PopTry`
/// or unwound by a raised exception — records where to jump on a caught
/// exception and how far to rewind the operand stack first.
#[derive(Debug, Clone, Copy)]
pub struct TryFrame {
    pub catch_ip: u32,
    pub stack_len: usize,
}

/// A lightweight process: everything the scheduler, the execution engine,
/// and the messaging subsystem need to run, suspend, and tear one down.
pub struct Process {
    pid: Pid,
    priority: Priority,
    state: ProcessState,

    heap: Heap,
    stack: Vec<Term>,
    registers: Vec<Term>,

    /// Current module/function/arity and instruction pointer — the process's
    /// program counter.
    module: String,
    function: String,
    arity: u8,
    ip: u32,

    /// Reductions consumed so far (lifetime counter, surfaced via
    /// `ProcessInfo::reductions`) and remaining in the current quantum.
    total_reductions: u64,
    reduction_budget: u64,

    mailbox: Mailbox,

    parent: Option<Pid>,
    links: Vec<Pid>,
    /// Processes this one is watching: (target, ref).
    monitoring: Vec<(Pid, MonitorRef)>,
    /// Processes watching this one: (watcher, ref).
    watched_by: Vec<(Pid, MonitorRef)>,

    group_leader: Option<Pid>,
    dictionary: HashMap<String, Value>,
    trap_exit: bool,
    trace: bool,

    /// Caller contexts for in-flight `Call`s, innermost last.
    call_stack: Vec<CallFrame>,
    /// Active `try` regions, innermost last.
    try_stack: Vec<TryFrame>,
    /// `LoadGlobal`/`StoreGlobal` storage, indexed by the loaded module's
    /// `globals` table (spec's `MemoryLayout::globals` region).
    globals: Vec<Term>,
    /// PRNG state for `Bytecode::Random`/`RandomSeed` — xorshift64, seeded
    /// from the process's pid so runs are reproducible given a fixed pid
    /// sequence, and reseedable at the language level.
    rng_state: u64,

    created_at: Instant,
    cpu_time: Duration,

    /// Per-process generational copying collector (C7). One instance per
    /// process since BEAM-style GC is per-process, not a shared heap pause.
    gc: GenerationalGc,
}

impl Process {
    pub fn new(pid: Pid, priority: Priority, module: String, function: String, arity: u8) -> Self {
        Process {
            pid,
            priority,
            state: ProcessState::Runnable,
            heap: Heap::new(),
            stack: Vec::new(),
            registers: vec![Term::nil(); DEFAULT_REGISTER_COUNT],
            module,
            function,
            arity,
            ip: 0,
            total_reductions: 0,
            reduction_budget: 0,
            mailbox: Mailbox::new(),
            parent: None,
            links: Vec::new(),
            monitoring: Vec::new(),
            watched_by: Vec::new(),
            group_leader: None,
            dictionary: HashMap::new(),
            trap_exit: false,
            trace: false,
            call_stack: Vec::new(),
            try_stack: Vec::new(),
            globals: Vec::new(),
            rng_state: pid.raw().wrapping_mul(0x9E3779B97F4A7C15).max(1),
            created_at: Instant::now(),
            cpu_time: Duration::ZERO,
            gc: GenerationalGc::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Run a GC cycle (C7), tracing from every `Term`-shaped root this
    /// process holds: the register file, the operand stack, every saved
    /// call frame's register snapshot, and the globals table. Messages and
    /// the process dictionary are plain Rust values, not heap terms, so
    /// they're never roots.
    pub fn run_gc(&mut self, major: bool) -> GcResult<()> {
        let mut roots: Vec<&mut Term> = Vec::new();
        roots.extend(self.registers.iter_mut());
        roots.extend(self.stack.iter_mut());
        roots.extend(self.globals.iter_mut());
        for frame in self.call_stack.iter_mut() {
            roots.extend(frame.saved_registers.iter_mut());
        }

        let new_heap = self.gc.collect(&self.heap, &mut roots, major)?;
        self.heap = new_heap;
        Ok(())
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    pub fn stack(&self) -> &[Term] {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Vec<Term> {
        &mut self.stack
    }

    pub fn registers(&self) -> &[Term] {
        &self.registers
    }

    pub fn register(&self, idx: u32) -> Option<Term> {
        self.registers.get(idx as usize).copied()
    }

    pub fn set_register(&mut self, idx: u32, value: Term) -> RuntimeResult<()> {
        let idx = idx as usize;
        if idx >= self.registers.len() {
            self.registers.resize(idx + 1, Term::nil());
        }
        self.registers[idx] = value;
        Ok(())
    }

    /// Swap in a fresh register file (sized for the callee's locals),
    /// returning the one it replaces so the caller's frame can save it.
    pub fn replace_registers(&mut self, new_registers: Vec<Term>) -> Vec<Term> {
        std::mem::replace(&mut self.registers, new_registers)
    }

    pub fn push_call_frame(&mut self, frame: CallFrame) {
        self.call_stack.push(frame);
    }

    pub fn pop_call_frame(&mut self) -> Option<CallFrame> {
        self.call_stack.pop()
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn push_try_frame(&mut self, frame: TryFrame) {
        self.try_stack.push(frame);
    }

    pub fn pop_try_frame(&mut self) -> Option<TryFrame> {
        self.try_stack.pop()
    }

    pub fn peek_try_frame(&self) -> Option<TryFrame> {
        self.try_stack.last().copied()
    }

    pub fn global_get(&self, idx: u32) -> Term {
        self.globals.get(idx as usize).copied().unwrap_or_else(Term::nil)
    }

    pub fn global_set(&mut self, idx: u32, value: Term) {
        let idx = idx as usize;
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, Term::nil());
        }
        self.globals[idx] = value;
    }

    /// Next xorshift64 draw, advancing the process's PRNG state.
    pub fn next_random(&mut self) -> u64 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    pub fn seed_random(&mut self, seed: u64) {
        self.rng_state = seed.max(1);
    }

    pub fn current_mfa(&self) -> (&str, &str, u8) {
        (&self.module, &self.function, self.arity)
    }

    pub fn set_mfa(&mut self, module: String, function: String, arity: u8) {
        self.module = module;
        self.function = function;
        self.arity = arity;
        self.ip = 0;
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }

    pub fn set_ip(&mut self, ip: u32) {
        self.ip = ip;
    }

    pub fn advance_ip(&mut self) {
        self.ip += 1;
    }

    /// Grant a fresh reduction budget for the upcoming quantum. Called by
    /// the scheduler immediately before dispatching this process to a
    /// worker (C8/C6 boundary).
    pub fn begin_quantum(&mut self, budget: u64) {
        self.reduction_budget = budget;
    }

    /// Consume one reduction. Returns `false` once the budget is exhausted,
    /// the execution engine's cue to yield back to the scheduler at the next
    /// safepoint — this is REAM's entire preemption mechanism (spec §1, §9:
    /// cooperative yielding at bytecode-instruction boundaries, never a
    /// signal-driven timer).
    pub fn consume_reduction(&mut self, cost: u64) -> bool {
        self.total_reductions += cost;
        self.reduction_budget = self.reduction_budget.saturating_sub(cost);
        self.reduction_budget > 0
    }

    pub fn reductions(&self) -> u64 {
        self.total_reductions
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn mailbox_mut(&mut self) -> &mut Mailbox {
        &mut self.mailbox
    }

    pub fn set_parent(&mut self, parent: Pid) {
        self.parent = Some(parent);
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn links(&self) -> &[Pid] {
        &self.links
    }

    /// Links are symmetric; the caller is responsible for establishing both
    /// directions (spec §4.9) by calling this on both processes.
    pub fn add_link(&mut self, other: Pid) {
        if !self.links.contains(&other) {
            self.links.push(other);
        }
    }

    pub fn remove_link(&mut self, other: Pid) {
        self.links.retain(|&p| p != other);
    }

    pub fn add_monitor(&mut self, target: Pid, monitor_ref: MonitorRef) {
        self.monitoring.push((target, monitor_ref));
    }

    pub fn remove_monitor(&mut self, monitor_ref: MonitorRef) {
        self.monitoring.retain(|&(_, r)| r != monitor_ref);
    }

    pub fn monitoring(&self) -> &[(Pid, MonitorRef)] {
        &self.monitoring
    }

    pub fn add_watcher(&mut self, watcher: Pid, monitor_ref: MonitorRef) {
        self.watched_by.push((watcher, monitor_ref));
    }

    pub fn remove_watcher(&mut self, monitor_ref: MonitorRef) {
        self.watched_by.retain(|&(_, r)| r != monitor_ref);
    }

    pub fn watched_by(&self) -> &[(Pid, MonitorRef)] {
        &self.watched_by
    }

    pub fn trap_exit(&self) -> bool {
        self.trap_exit
    }

    pub fn set_trap_exit(&mut self, trap: bool) {
        self.trap_exit = trap;
    }

    pub fn group_leader(&self) -> Option<Pid> {
        self.group_leader
    }

    pub fn set_group_leader(&mut self, leader: Pid) {
        self.group_leader = Some(leader);
    }

    pub fn dictionary_get(&self, key: &str) -> Option<&Value> {
        self.dictionary.get(key)
    }

    pub fn dictionary_put(&mut self, key: String, value: Value) {
        self.dictionary.insert(key, value);
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn add_cpu_time(&mut self, delta: Duration) {
        self.cpu_time += delta;
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Terminated)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            state: self.state,
            priority: self.priority,
            parent: self.parent,
            links: self.links.clone(),
            monitors: self.monitoring.iter().map(|&(p, _)| p).collect(),
            message_queue_len: self.mailbox.len(),
            memory_usage: self.heap.byte_size(),
            cpu_time: self.cpu_time.as_micros() as u64,
            trap_exit: self.trap_exit,
            reductions: self.total_reductions,
        }
    }
}

/// Shared, cheaply-cloneable handle to a `Process`. Every scheduler worker,
/// the process table, and the messaging subsystem hold handles rather than
/// the process itself; `parking_lot::RwLock` keeps contention cheap on the
/// hot read path (`info`, `mailbox` peeks).
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<RwLock<Process>>,
}

impl ProcessHandle {
    pub fn new(process: Process) -> Self {
        ProcessHandle { inner: Arc::new(RwLock::new(process)) }
    }

    pub fn pid(&self) -> Pid {
        self.inner.read().pid()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.read().state()
    }

    pub fn set_state(&self, state: ProcessState) {
        self.inner.write().set_state(state);
    }

    pub fn priority(&self) -> Priority {
        self.inner.read().priority()
    }

    pub fn is_runnable(&self) -> bool {
        self.inner.read().state().is_runnable()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.read().is_alive()
    }

    pub fn traps_exit(&self) -> bool {
        self.inner.read().trap_exit()
    }

    pub fn set_trap_exit(&self, trap: bool) {
        self.inner.write().set_trap_exit(trap);
    }

    pub fn deliver_message(&self, message: Message) {
        self.inner.write().mailbox_mut().enqueue(message);
    }

    /// Pending message count, used by the scheduler pool to decide whether a
    /// `Waiting` process has become runnable again without taking a quantum.
    pub fn mailbox_len(&self) -> usize {
        self.inner.read().mailbox().len()
    }

    pub fn info(&self) -> ProcessInfo {
        self.inner.read().info()
    }

    pub fn links(&self) -> Vec<Pid> {
        self.inner.read().links().to_vec()
    }

    pub fn add_link(&self, other: Pid) {
        self.inner.write().add_link(other);
    }

    pub fn remove_link(&self, other: Pid) {
        self.inner.write().remove_link(other);
    }

    pub fn add_monitor(&self, target: Pid, monitor_ref: MonitorRef) {
        self.inner.write().add_monitor(target, monitor_ref);
    }

    pub fn remove_monitor(&self, monitor_ref: MonitorRef) {
        self.inner.write().remove_monitor(monitor_ref);
    }

    pub fn add_watcher(&self, watcher: Pid, monitor_ref: MonitorRef) {
        self.inner.write().add_watcher(watcher, monitor_ref);
    }

    pub fn monitoring(&self) -> Vec<(Pid, MonitorRef)> {
        self.inner.read().monitoring().to_vec()
    }

    pub fn watched_by(&self) -> Vec<(Pid, MonitorRef)> {
        self.inner.read().watched_by().to_vec()
    }

    pub fn set_parent(&self, parent: Pid) {
        self.inner.write().set_parent(parent);
    }

    pub fn parent(&self) -> Option<Pid> {
        self.inner.read().parent()
    }

    /// Terminate the process with `reason`. Mailbox contents are dropped;
    /// link/monitor propagation is the caller's responsibility (it needs the
    /// process table to reach other processes — see `runtime::message`).
    pub fn terminate(&self, _reason: &ExitReason) -> RuntimeResult<()> {
        let mut process = self.inner.write();
        process.set_state(ProcessState::Terminated);
        process.mailbox_mut().clear();
        Ok(())
    }

    pub fn suspend(&self) -> RuntimeResult<()> {
        let mut process = self.inner.write();
        if process.state().is_runnable() || process.state() == ProcessState::Running {
            process.set_state(ProcessState::Suspended);
            Ok(())
        } else {
            Err(RuntimeError::InvalidMessage(format!(
                "cannot suspend process {} in state {:?}",
                process.pid(),
                process.state()
            )))
        }
    }

    pub fn resume(&self) -> RuntimeResult<()> {
        let mut process = self.inner.write();
        if process.state() == ProcessState::Suspended {
            process.set_state(ProcessState::Runnable);
            Ok(())
        } else {
            Err(RuntimeError::InvalidMessage(format!(
                "cannot resume process {} in state {:?}",
                process.pid(),
                process.state()
            )))
        }
    }

    pub fn uptime(&self) -> Duration {
        self.inner.read().uptime()
    }

    /// Run `f` with exclusive access to the process. Used by the execution
    /// engine (C6), which needs sustained mutable access across many
    /// instruction dispatches within one quantum.
    pub fn with_mut<T>(&self, f: impl FnOnce(&mut Process) -> T) -> T {
        f(&mut self.inner.write())
    }

    pub fn with<T>(&self, f: impl FnOnce(&Process) -> T) -> T {
        f(&self.inner.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_process() -> Process {
        Process::new(Pid::new(), Priority::Normal, "main".into(), "run".into(), 0)
    }

    #[test]
    fn process_starts_runnable() {
        let p = new_process();
        assert_eq!(p.state(), ProcessState::Runnable);
        assert!(p.is_alive());
    }

    #[test]
    fn reduction_budget_exhausts() {
        let mut p = new_process();
        p.begin_quantum(10);
        assert!(p.consume_reduction(5));
        assert!(!p.consume_reduction(5));
        assert_eq!(p.reductions(), 10);
    }

    #[test]
    fn handle_lifecycle() {
        let handle = ProcessHandle::new(new_process());
        handle.suspend().unwrap();
        assert_eq!(handle.state(), ProcessState::Suspended);
        handle.resume().unwrap();
        assert_eq!(handle.state(), ProcessState::Runnable);
        handle.terminate(&ExitReason::Normal).unwrap();
        assert!(!handle.is_alive());
    }

    #[test]
    fn process_info_reports_trap_exit_and_reductions() {
        let mut p = new_process();
        p.set_trap_exit(true);
        p.begin_quantum(100);
        p.consume_reduction(42);
        let info = p.info();
        assert!(info.trap_exit);
        assert_eq!(info.reductions, 42);
    }

    #[test]
    fn links_are_stored_unordered_dedup() {
        let mut p = new_process();
        let other = Pid::new();
        p.add_link(other);
        p.add_link(other);
        assert_eq!(p.links().len(), 1);
        p.remove_link(other);
        assert!(p.links().is_empty());
    }
}
