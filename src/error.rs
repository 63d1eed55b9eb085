//! Error types for REAM
//!
//! Layered the way the runtime's subsystems are layered: one `thiserror`
//! enum per subsystem, composed into `ReamError` via `#[from]`. Nothing here
//! is raised to user (in-language) code directly — language-level exceptions
//! travel as `Term`s through `exit`/`throw`, not as Rust errors; these types
//! are for the Rust-level control/API surface described in spec §6/§7.

use thiserror::Error;
use crate::types::Pid;

/// Top-level error type for the runtime control surface (C11).
#[derive(Error, Debug)]
pub enum ReamError {
    /// Scheduler/process errors
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Bytecode loading/verification errors
    #[error("bytecode error: {0}")]
    Bytecode(#[from] BytecodeError),

    /// Garbage collector errors
    #[error("gc error: {0}")]
    Gc(#[from] GcError),

    /// Module loader errors
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),

    /// NIF sandbox errors
    #[error("nif error: {0}")]
    Nif(#[from] NifError),

    /// I/O errors from config loading, crash dumps, NIF library files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A scheduler/runtime invariant was violated and could not be
    /// recovered; per spec §7 this is the only class that aborts the
    /// process instead of returning to the caller.
    #[error("fatal runtime error: {0}")]
    Fatal(String),

    /// Feature not implemented yet
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Catch-all for glue code; prefer a typed variant where one exists.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type for the runtime control surface
pub type ReamResult<T> = Result<T, ReamError>;

/// Process/scheduler/messaging errors (C2, C3, C8, C9)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Process not found in the process table
    #[error("process {0} not found")]
    ProcessNotFound(Pid),

    /// Process already registered under this pid (should never happen —
    /// pids are never reused)
    #[error("process {0} already exists")]
    ProcessExists(Pid),

    /// `max_processes` (spec §6 config) reached
    #[error("maximum number of processes ({0}) reached")]
    MaxProcesses(usize),

    /// Mailbox overflow under a configured bound (spec leaves mailboxes
    /// unbounded by default; this fires only when a caller opts into a
    /// queue-length limit)
    #[error("mailbox full for process {0}")]
    MailboxFull(Pid),

    /// A message, exit reason, or BIF argument had the wrong shape
    #[error("invalid message or argument: {0}")]
    InvalidMessage(String),

    /// `badarg` — BIF/instruction called with an argument of the wrong type
    #[error("badarg: {0}")]
    BadArg(String),

    /// `badarith` — arithmetic on non-numeric or ill-typed operands
    #[error("badarith: {0}")]
    BadArith(String),

    /// `system_limit` — a hard resource ceiling (atom table, process count,
    /// heap size) was exceeded
    #[error("system_limit: {0}")]
    SystemLimit(String),

    /// BIF not supported by this runtime build
    #[error("not_supported: {0}")]
    NotSupported(String),

    /// Scheduler-internal error (queue corruption, steal failure propagated
    /// past retry budget)
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Supervision-tree error (restart intensity exceeded, child spec
    /// rejected)
    #[error("supervision error: {0}")]
    Supervision(String),

    /// A `try`-wrapped language-level exception surfaced to Rust code asking
    /// for the process's exit reason
    #[error("process exited: {0:?}")]
    ProcessExited(ExitReason),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Why a process terminated — shared between the signal subsystem (C9) and
/// the supervisor restart logic.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Returned normally, or called `exit(normal)`
    Normal,
    /// `exit(kill)` — uncatchable even by a trapping process
    Killed,
    /// Runtime is shutting down (spec §4.11)
    Shutdown,
    /// Uncaught language-level exception or `exit(Reason)`
    Reason(String),
    /// A NIF call faulted (panic or OS-level fault) during this process's
    /// execution (spec §4.10/§7)
    NativeFault { kind: String, detail: String },
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => write!(f, "normal"),
            ExitReason::Killed => write!(f, "killed"),
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::Reason(r) => write!(f, "{r}"),
            ExitReason::NativeFault { kind, detail } => {
                write!(f, "{{native_fault, {kind}, {detail}}}")
            }
        }
    }
}

/// Bytecode execution/verification errors (C5, C6)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BytecodeError {
    /// Instruction decode failure (should be caught by the verifier before
    /// this point is ever reached at runtime)
    #[error("invalid instruction: {0}")]
    InvalidInstruction(String),

    /// Operand (constant/function/register index) out of bounds
    #[error("invalid operand: {0}")]
    InvalidOperand(String),

    /// Stack under/overflow
    #[error("stack error: {0}")]
    StackError(String),

    /// Register index exceeds the frame's declared size
    #[error("register {0} out of bounds (frame has {1})")]
    RegisterOutOfBounds(u32, u32),

    /// Jump target is not an instruction boundary
    #[error("invalid branch target: {0}")]
    InvalidBranchTarget(u32),

    /// Effect grade declared on an instruction doesn't match its semantics
    #[error("effect grade mismatch: expected {expected:?}, got {actual:?}")]
    EffectMismatch { expected: crate::types::EffectGrade, actual: crate::types::EffectGrade },

    /// Verification failed for a reason not covered above
    #[error("verification failed: {0}")]
    Verification(String),

    /// Reduction budget exhausted mid-instruction (should not occur; yields
    /// happen only at safepoints) — kept as a defensive invariant check
    #[error("instruction limit exceeded ({0} executed)")]
    InstructionLimitExceeded(u64),

    /// A NIF sandbox permission check failed (spec §4.10)
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A NIF sandbox resource ceiling (memory, file/socket/timer handles)
    /// was exceeded
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// A NIF sandbox wall-clock execution ceiling was exceeded
    #[error("execution time limit exceeded: {0:?}")]
    ExecutionTimeExceeded(std::time::Duration),

    /// A NIF sandbox call-stack depth ceiling was exceeded
    #[error("stack overflow at depth {0}")]
    StackOverflow(usize),
}

pub type BytecodeResult<T> = Result<T, BytecodeError>;

/// Generational copying GC errors (C7)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcError {
    /// Heap exhausted even after a major collection
    #[error("out of memory: heap exhausted after full GC ({0} bytes requested)")]
    OutOfMemory(usize),

    /// A root or pointer referenced an address outside any known heap,
    /// literal area, or off-heap binary — an internal invariant violation
    #[error("dangling pointer detected during GC: {0}")]
    DanglingPointer(String),
}

pub type GcResult<T> = Result<T, GcError>;

/// Module image parsing/loading errors (C4, C5)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoaderError {
    /// Magic number didn't match
    #[error("not a valid module image: bad magic")]
    BadMagic,

    /// Unsupported format version
    #[error("unsupported module image version: {0}")]
    UnsupportedVersion(u32),

    /// A required chunk (AtU8/ImpT/ExpT/LitT/Code) was missing
    #[error("missing required chunk: {0}")]
    MissingChunk(&'static str),

    /// A chunk's declared length runs past the end of the image
    #[error("chunk {0} length overflows image")]
    ChunkOverflow(&'static str),

    /// Code references an atom/literal/function index outside its table
    #[error("index out of bounds in chunk {chunk}: {index}")]
    IndexOutOfBounds { chunk: &'static str, index: u32 },

    /// `purge` was requested on a module slot that wasn't a current/old pair
    /// in the state the caller assumed
    #[error("module {0} has no old version to purge")]
    NothingToPurge(String),

    /// `purge` rejected because a process still references the old version
    #[error("module {0} is busy: still referenced")]
    Busy(String),

    /// Loading a new version when an old version already exists and hasn't
    /// been purged
    #[error("module {0} already has an unpurged old version")]
    OldVersionExists(String),

    /// A chunk's payload didn't deserialize into the structure its tag
    /// promises (corrupt or version-skewed encoding)
    #[error("malformed chunk {0}: {1}")]
    Malformed(&'static str, String),
}

pub type LoaderResult<T> = Result<T, LoaderError>;

/// NIF sandbox errors (C10)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NifError {
    /// Library failed to load (missing file, dlopen failure)
    #[error("failed to load native extension: {0}")]
    LoadFailed(String),

    /// Library doesn't export the required marker symbol, or the marker
    /// returned the wrong sentinel
    #[error("native extension failed verification: {0}")]
    VerificationFailed(String),

    /// Library's metadata export didn't parse into a valid
    /// `{module, version, functions}` record
    #[error("invalid native extension metadata: {0}")]
    InvalidMetadata(String),

    /// The call panicked; caught at the panic boundary
    #[error("native extension panicked: {0}")]
    Panic(String),

    /// The call raised an OS-level fault (SIGSEGV/SIGBUS/SIGILL/SIGFPE)
    /// caught at the signal boundary
    #[error("native extension faulted: {kind}")]
    Fault { kind: String },

    /// The NIF returned a recoverable, caller-visible error (bad argument)
    /// without faulting
    #[error("native extension error: {0}")]
    CallError(String),
}

pub type NifResult<T> = Result<T, NifError>;
