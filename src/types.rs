//! Core types and data structures for REAM

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Process identifier - unique across the runtime.
///
/// A bare monotonic counter, never recycled. Distribution (node, serial)
/// is out of scope, so there is no need for anything richer than this —
/// it is already ABA-safe for the lifetime of one runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u64);

impl Pid {
    /// Generate a new unique PID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Pid(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw PID value
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Parse a PID from a string
    pub fn from_string(s: &str) -> Result<Self, std::num::ParseIntError> {
        let s = s.strip_prefix('#').unwrap_or(s);
        s.parse::<u64>().map(Pid)
    }

    /// Create a PID from a raw value
    pub fn from_raw(raw: u64) -> Self {
        Pid(raw)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A monitor reference — returned by `monitor` and matched against a later
/// `{'DOWN', ref, ...}` message or `demonitor` call. Distinct from `Pid`
/// because a process may hold several monitors on the same target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonitorRef(pub u64);

impl MonitorRef {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        MonitorRef(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#Ref<{}>", self.0)
    }
}

/// Process priority levels. `Max` is strictly preferred over the rest; the
/// scheduler only looks at `High`/`Normal`/`Low` once the `Max` queue is
/// empty, and gives `Low` roughly 1-in-8 slots among the non-empty queues
/// (see `runtime::work_stealing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Strictly preferred over every other queue — reserved for system
    /// processes (supervisors, the boot process).
    Max = 0,
    /// High priority - system processes
    High = 1,
    /// Normal priority - user processes
    Normal = 2,
    /// Low priority - background tasks
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Effect grades for tracking side effects in bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EffectGrade {
    /// Pure computation - no side effects
    Pure,
    /// Memory reads
    Read,
    /// Memory writes
    Write,
    /// Memory operations (allocation/deallocation)
    Memory,
    /// Message sends
    Send,
    /// Process creation
    Spawn,
    /// External I/O
    IO,
}

impl EffectGrade {
    /// Combine two effect grades, taking the maximum
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }
}

impl Default for EffectGrade {
    fn default() -> Self {
        EffectGrade::Pure
    }
}

/// Restart strategies for supervision trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartStrategy {
    /// Restart only the failed child
    OneForOne,
    /// Restart all children when one fails
    OneForAll,
    /// Restart the failed child and all children started after it
    RestForOne,
}

impl Default for RestartStrategy {
    fn default() -> Self {
        RestartStrategy::OneForOne
    }
}

/// Message envelope for inter-process communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sender process ID
    pub from: Pid,
    /// Recipient process ID
    pub to: Pid,
    /// Message payload
    pub payload: MessagePayload,
    /// Message timestamp
    pub timestamp: u64,
}

/// A term detached from any process heap: the external term format (spec
/// §1.1/§8) used both for mailbox payloads (C9) and for
/// `term_to_binary`/`binary_to_term`. Heap-relative `runtime::Term`s are
/// only meaningful against the heap that allocated them, so anything that
/// crosses a process boundary — a message, a binary blob — has to be
/// rebuilt into this shape first and rematerialized into the destination
/// heap on the other side. Resource handles that are genuinely local to one
/// heap (NIF references, monitor references, maps, funs) have no
/// representation here; converting one fails rather than silently
/// producing a different term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortableTerm {
    Int(i64),
    BigInt(i128),
    Float(f64),
    Atom(u32),
    Bool(bool),
    Nil,
    Binary(Vec<u8>),
    Pid(Pid),
    Tuple(Vec<PortableTerm>),
    /// A single cons cell; an ordinary list is a right-nested chain of
    /// these terminated by `Nil`, same as `HeapObject::Cons`.
    Cons(Box<PortableTerm>, Box<PortableTerm>),
}

/// Message payload types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Text message
    Text(String),
    /// Structured data
    Data(serde_json::Value),
    /// A full term, sent by `Bytecode::SendMessage` (C9) and rebuilt into
    /// the receiver's own heap by `Bytecode::ReceiveMessage`.
    Term(PortableTerm),
    /// System control message
    Control(ControlMessage),
}

/// System control messages — these carry signals (C9), not ordinary
/// mailbox traffic; the scheduler acts on them directly rather than
/// handing them to user bytecode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Terminate process
    Terminate,
    /// Suspend process
    Suspend,
    /// Resume process
    Resume,
    /// Link to another process
    Link(Pid),
    /// Unlink from another process
    Unlink(Pid),
    /// Monitor another process
    Monitor { watcher: Pid, target: Pid, monitor_ref: MonitorRef },
    /// Cancel a monitor
    Demonitor(MonitorRef),
    /// Process exit notification, propagated along a link
    Exit { pid: Pid, reason: String },
    /// Monitor fired: the watched process went down
    Down { monitor_ref: MonitorRef, pid: Pid, reason: String },
}

/// Process state.
///
/// BEAM distinguishes more states than "running/waiting/suspended" once
/// the scheduler, GC, and signal subsystems are real: a process can be
/// runnable-but-not-yet-scheduled, blocked on a dirty (NIF) call, mid-GC,
/// or exiting while still draining pending signals. Kept as an explicit
/// enum rather than a bitset — at most one of these is true at a time for
/// a given process, BEAM's internal flags notwithstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// On a run queue, not yet given a scheduler
    Runnable,
    /// Currently executing on a scheduler thread
    Running,
    /// Blocked in `receive` with an empty-matching mailbox
    Waiting,
    /// Suspended by an external call (e.g. a debugger, or backpressure)
    Suspended,
    /// Undergoing garbage collection; not schedulable
    GarbageCollecting,
    /// Running a NIF on a dirty scheduler
    DirtyRunning,
    /// Exit signal received, draining effects before final removal
    Exiting,
    /// Fully terminated and removed from the process table
    Terminated,
}

impl ProcessState {
    /// Whether this state can be placed on (or is already on) a scheduler
    /// run queue.
    pub fn is_runnable(&self) -> bool {
        matches!(self, ProcessState::Runnable)
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self, ProcessState::Terminated)
    }
}

/// Process information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: Pid,
    /// Current state
    pub state: ProcessState,
    /// Priority level
    pub priority: Priority,
    /// Parent process (if any)
    pub parent: Option<Pid>,
    /// Linked processes
    pub links: Vec<Pid>,
    /// Monitored processes
    pub monitors: Vec<Pid>,
    /// Message queue size
    pub message_queue_len: usize,
    /// Memory usage in bytes
    pub memory_usage: usize,
    /// CPU time used (microseconds)
    pub cpu_time: u64,
    /// Whether this process currently traps exits
    pub trap_exit: bool,
    /// Total reductions consumed over the process's lifetime
    pub reductions: u64,
}

/// Runtime statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStats {
    /// Total number of processes
    pub process_count: usize,
    /// Number of running processes
    pub running_processes: usize,
    /// Total memory usage
    pub memory_usage: usize,
    /// Messages sent per second
    pub message_rate: f64,
    /// Scheduler utilization
    pub scheduler_utilization: f64,
    /// GC collections performed
    pub gc_collections: u64,
}

/// Configuration for REAM runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReamConfig {
    /// Maximum number of processes
    pub max_processes: usize,
    /// Scheduler quantum in microseconds
    pub scheduler_quantum: u64,
    /// Maximum message queue size per process
    pub max_message_queue_size: usize,
    /// GC threshold in bytes
    pub gc_threshold: usize,
    /// Number of normal scheduler threads; `0` means "one per logical CPU"
    pub scheduler_count: usize,
    /// Soft total memory ceiling across all process heaps, in bytes
    pub memory_limit: usize,
    /// Preallocated capacity of the global atom table
    pub atom_table_size: usize,
    /// Whether distribution (inter-node messaging) is enabled. Out of
    /// scope for this runtime's implementation; kept as a config knob so
    /// callers can observe it's always `false` rather than the field not
    /// existing at all.
    pub distribution_enabled: bool,
    /// This node's name, used only for crash-dump labeling while
    /// `distribution_enabled` is false
    pub node_name: String,
    /// Distribution cookie; unused while `distribution_enabled` is false
    pub distribution_cookie: String,
}

impl Default for ReamConfig {
    fn default() -> Self {
        ReamConfig {
            max_processes: 1_000_000,
            scheduler_quantum: 1000, // 1ms
            max_message_queue_size: 10_000,
            gc_threshold: 64 * 1024 * 1024, // 64MB
            scheduler_count: 0,
            memory_limit: 1024 * 1024 * 1024, // 1GB
            atom_table_size: 8192,
            distribution_enabled: false,
            node_name: "ream@localhost".to_string(),
            distribution_cookie: String::new(),
        }
    }
}

impl ReamConfig {
    /// Load configuration from a TOML document, falling back to defaults
    /// for any field it doesn't specify.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Resolve `scheduler_count == 0` ("auto") against the host's logical
    /// CPU count.
    pub fn resolved_scheduler_count(&self) -> usize {
        if self.scheduler_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.scheduler_count
        }
    }
}

/// Isolation levels for process fault boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Single actor isolation
    Process,
    /// Actor pool isolation
    Pool,
    /// System-wide isolation
    System,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Process
    }
}

/// Resource ceiling applied to a single NIF call (C10): a wall-clock
/// reduction estimate, a memory cap for any scratch allocation the call
/// makes, and the isolation level of the stack it runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultBoundary {
    /// Memory range allocated to this fault domain
    pub memory_range: Range<u64>,
    /// Maximum instructions before forced yield
    pub instruction_limit: u64,
    /// Maximum messages in mailbox
    pub message_quota: u32,
    /// Isolation level for this boundary
    pub isolation_level: IsolationLevel,
}

impl Default for FaultBoundary {
    fn default() -> Self {
        FaultBoundary {
            memory_range: 0..10_485_760, // 10MB default
            instruction_limit: 1_000_000,
            message_quota: 1000,
            isolation_level: IsolationLevel::Process,
        }
    }
}

/// Execution bounds for preventing infinite loops and resource exhaustion
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecutionBounds {
    /// Maximum instructions before termination
    pub instruction_limit: u64,
    /// Maximum memory usage in bytes
    pub memory_limit: u64,
    /// Maximum messages that can be sent
    pub message_limit: u64,
}

impl Default for ExecutionBounds {
    fn default() -> Self {
        ExecutionBounds {
            instruction_limit: 1_000_000,
            memory_limit: 10 * 1024 * 1024, // 10MB
            message_limit: 1000,
        }
    }
}

/// Memory layout for a process's term arena: heap, stack, mailbox, and
/// global (module-literal) regions, laid out as disjoint ranges within a
/// single address space so a pointer's range membership identifies which
/// region owns it — used by the GC to classify roots during a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLayout {
    /// Process heap range
    pub process_heap: Range<u32>,
    /// Mailbox memory range
    pub mailbox: Range<u32>,
    /// Stack memory range
    pub stack: Range<u32>,
    /// Global variables range
    pub globals: Range<u32>,
}

impl MemoryLayout {
    /// Create a new memory layout with specified heap and stack sizes
    pub fn new(heap_size: u32, stack_size: u32) -> Self {
        let heap_start = 0;
        let heap_end = heap_size;
        let stack_start = heap_end;
        let stack_end = stack_start + stack_size;
        let mailbox_start = stack_end;
        let mailbox_end = mailbox_start + 64 * 1024; // 64KB for mailbox
        let globals_start = mailbox_end;
        let globals_end = globals_start + 4 * 1024; // 4KB for globals

        MemoryLayout {
            process_heap: heap_start..heap_end,
            stack: stack_start..stack_end,
            mailbox: mailbox_start..mailbox_end,
            globals: globals_start..globals_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_uniqueness() {
        let a = Pid::new();
        let b = Pid::new();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_pid_roundtrip() {
        let pid = Pid::from_raw(42);
        assert_eq!(pid.to_string(), "#42");
        assert_eq!(Pid::from_string("#42").unwrap(), pid);
        assert_eq!(Pid::from_string("42").unwrap(), pid);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Max < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn test_process_state_alive() {
        assert!(ProcessState::Running.is_alive());
        assert!(!ProcessState::Terminated.is_alive());
    }

    #[test]
    fn test_config_defaults_and_toml() {
        let cfg = ReamConfig::default();
        assert!(!cfg.distribution_enabled);
        let toml_str = "max_processes = 42\n";
        let parsed = ReamConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(parsed.max_processes, 42);
        assert_eq!(parsed.scheduler_quantum, cfg.scheduler_quantum);
    }
}
