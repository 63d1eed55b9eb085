//! # REAM: Rust Erlang Abstract Machine
//!
//! A reduction-counted, work-stealing bytecode VM runtime for a concurrent,
//! soft-real-time functional language modeled on BEAM: a process model and
//! scheduler (C8), the bytecode execution engine (C6), a process-local
//! generational copying GC (C7), message-passing with links and monitors
//! (C9), module hot-reload (C4/C5), and a safe NIF sandbox (C10).

#![warn(clippy::all)]

pub mod bytecode;
pub mod error;
pub mod nif;
pub mod runtime;
pub mod types;

pub use error::{ReamError, ReamResult};
pub use runtime::ReamRuntime;
pub use types::{EffectGrade, ExecutionBounds, MemoryLayout, Pid, Priority, ProcessState, ReamConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a new REAM runtime with default configuration. The pool is not
/// started yet — call `.start()` before spawning anything.
pub fn new_runtime() -> ReamResult<ReamRuntime> {
    ReamRuntime::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ream_initialization() {
        let runtime = new_runtime().unwrap();
        assert_eq!(runtime.process_count(), 0);
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
