//! Native extension sandbox (C10) — dynamic loading of `cdylib` native
//! function libraries and the per-call isolation boundary that keeps a
//! misbehaving NIF from bringing down the scheduler that called it.
//!
//! Grounded on the teacher's `tlisp/rust_crate_integration.rs::FfiLoader`
//! for the shape of "own a `HashMap<String, libloading::Library>`, resolve
//! symbols through it" — that file never actually loaded anything (its
//! `load_library`/`get_symbol` bodies were commented-out placeholders); this
//! module carries out the real `libloading::Library::new` / `get::<T>` calls
//! it only sketched, and adds the three safety layers spec §4.10 asks for
//! that the teacher never attempted: metadata verification via a marker
//! symbol, a panic boundary, and an OS-signal boundary for native faults.
//! Resource ceilings reuse `bytecode::security::SecurityManager` rather than
//! inventing a second accounting scheme.
//!
//! A NIF never sees a process's `Term`s or `Heap` directly — only the flat,
//! owned [`NifValue`] values `marshal_in`/`marshal_out` convert to and from.
//! That conversion boundary *is* "the environment handle is the NIF's only
//! surface onto the calling process's heap" from spec §4.10: there is no
//! handle at all, because the native side never receives a pointer into
//! process memory in the first place.

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use libloading::{Library, Symbol};

use crate::bytecode::security::{ResourceLimits, SecurityManager, SecurityPolicy};
use crate::error::{NifError, NifResult};

/// Marker symbol every native extension must export; `ream_nif_init`
/// returning anything other than a pointer tagged with this version fails
/// verification before a single exported function is ever resolved.
const NIF_ABI_VERSION: u32 = 1;
const INIT_SYMBOL: &[u8] = b"ream_nif_init\0";

/// Ceiling on the dedicated stack given to a NIF call. Large enough for
/// reasonable native recursion, small enough that a runaway native loop hits
/// its guard page instead of growing unbounded.
const NIF_STACK_SIZE: usize = 2 * 1024 * 1024;

/// A value crossing the native boundary in either direction. Deliberately
/// flatter than `runtime::term::Term`: a NIF receives a snapshot, not a
/// reference into the caller's heap, so there is nothing for it to corrupt
/// by holding the value past the call or mutating it out of turn.
#[derive(Debug, Clone, PartialEq)]
pub enum NifValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Atom(String),
    Binary(Vec<u8>),
    Nil,
}

/// C ABI calling convention a native extension's exported functions use.
/// `argv` points at `argc` consecutive [`NifTermFfi`] values owned by the
/// caller for the duration of the call; the return value is owned by the
/// callee and consumed by `unmarshal` immediately after the call returns.
pub type NifEntrypoint = unsafe extern "C" fn(argc: u32, argv: *const NifTermFfi) -> NifTermFfi;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NifTermTag {
    Int = 0,
    Float = 1,
    Bool = 2,
    Atom = 3,
    Binary = 4,
    Nil = 5,
    /// The callee sets this tag (and fills `bytes_ptr`/`bytes_len` with a
    /// UTF-8 message) to signal a recoverable error rather than a fault.
    Error = 6,
}

/// Flat, `#[repr(C)]` representation of a [`NifValue`] for the FFI boundary.
/// `bytes_ptr`/`bytes_len` back `Atom`, `Binary`, and `Error`; the buffer
/// they point at is caller-owned for argument terms, callee-owned (and
/// leaked via `Box::into_raw`, freed by `free_returned_bytes`) for the
/// return value.
#[repr(C)]
pub struct NifTermFfi {
    pub tag: NifTermTag,
    pub int_val: i64,
    pub float_val: f64,
    pub bool_val: bool,
    pub bytes_ptr: *mut u8,
    pub bytes_len: usize,
}

impl NifTermFfi {
    fn nil() -> Self {
        NifTermFfi { tag: NifTermTag::Nil, int_val: 0, float_val: 0.0, bool_val: false, bytes_ptr: std::ptr::null_mut(), bytes_len: 0 }
    }
}

// SAFETY: a `NifTermFfi` is sent to the dedicated call thread and nowhere
// else; the bytes it points at either live on the caller's stack for the
// duration of the call (arguments) or are freed exactly once after the
// call returns (the result), so there is never a second live alias.
unsafe impl Send for NifTermFfi {}

fn marshal_out(v: &NifValue, owned: &mut Vec<Box<[u8]>>) -> NifTermFfi {
    match v {
        NifValue::Int(i) => NifTermFfi { tag: NifTermTag::Int, int_val: *i, ..NifTermFfi::nil() },
        NifValue::Float(f) => NifTermFfi { tag: NifTermTag::Float, float_val: *f, ..NifTermFfi::nil() },
        NifValue::Bool(b) => NifTermFfi { tag: NifTermTag::Bool, bool_val: *b, ..NifTermFfi::nil() },
        NifValue::Nil => NifTermFfi::nil(),
        NifValue::Atom(s) => bytes_term(NifTermTag::Atom, s.as_bytes(), owned),
        NifValue::Binary(b) => bytes_term(NifTermTag::Binary, b, owned),
    }
}

fn bytes_term(tag: NifTermTag, bytes: &[u8], owned: &mut Vec<Box<[u8]>>) -> NifTermFfi {
    let boxed: Box<[u8]> = bytes.to_vec().into_boxed_slice();
    let ptr = boxed.as_ptr() as *mut u8;
    let len = boxed.len();
    owned.push(boxed);
    NifTermFfi { tag, bytes_ptr: ptr, bytes_len: len, ..NifTermFfi::nil() }
}

/// SAFETY: `term` must have been produced by a native extension that honors
/// the calling convention documented on [`NifEntrypoint`] — its
/// `bytes_ptr`/`bytes_len` (when the tag calls for them) must describe a
/// region the callee will not touch again after returning.
unsafe fn unmarshal(term: &NifTermFfi) -> NifResult<NifValue> {
    match term.tag {
        NifTermTag::Int => Ok(NifValue::Int(term.int_val)),
        NifTermTag::Float => Ok(NifValue::Float(term.float_val)),
        NifTermTag::Bool => Ok(NifValue::Bool(term.bool_val)),
        NifTermTag::Nil => Ok(NifValue::Nil),
        NifTermTag::Atom => Ok(NifValue::Atom(copy_bytes_as_string(term)?)),
        NifTermTag::Binary => Ok(NifValue::Binary(copy_bytes(term))),
        NifTermTag::Error => Err(NifError::CallError(copy_bytes_as_string(term)?)),
    }
}

unsafe fn copy_bytes(term: &NifTermFfi) -> Vec<u8> {
    if term.bytes_ptr.is_null() || term.bytes_len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(term.bytes_ptr, term.bytes_len).to_vec()
}

unsafe fn copy_bytes_as_string(term: &NifTermFfi) -> NifResult<String> {
    String::from_utf8(copy_bytes(term)).map_err(|e| NifError::CallError(format!("non-utf8 atom/error text: {e}")))
}

/// One function a loaded library exports, as declared by its own
/// `ream_nif_init` metadata (not discovered via symbol scanning — a library
/// can export C symbols under any name as long as its entry table points at
/// them).
#[derive(Debug, Clone)]
pub struct NifExport {
    pub name: String,
    pub arity: u8,
}

struct LoadedNif {
    #[allow(dead_code)] // kept alive only for its `Drop`; unmapping the
    // library is what actually matters, nothing reads this field again.
    library: Library,
    module: String,
    version: String,
    functions: HashMap<(String, u8), NifEntrypoint>,
    exports: Vec<NifExport>,
}

/// Owns every loaded native extension and provides the single sandboxed
/// entry point (`call`) the bytecode engine's `CallNif` dispatch arm uses.
/// One registry per runtime instance, shared behind the scheduler the way
/// `bytecode::registry::ModuleRegistry` is.
pub struct NifRegistry {
    loaded: Mutex<HashMap<String, LoadedNif>>,
    limits: ResourceLimits,
    call_count: AtomicU64,
}

impl NifRegistry {
    pub fn new() -> Self {
        NifRegistry::with_limits(ResourceLimits::default())
    }

    /// Construct a registry enforcing a specific [`ResourceLimits`] preset —
    /// typically `bytecode::security::create_sandbox_manager`'s limits for a
    /// hardened deployment, or a looser preset for trusted first-party NIFs.
    pub fn with_limits(limits: ResourceLimits) -> Self {
        NifRegistry { loaded: Mutex::new(HashMap::new()), limits, call_count: AtomicU64::new(0) }
    }

    /// Load a native extension from a shared library path, verify its ABI
    /// marker, and register the functions it declares. Returns the module
    /// name the library registered itself under (its exports then shadow
    /// any same-`{name, arity}` module function the bytecode `ModuleRegistry`
    /// holds, per spec §4.10).
    pub fn load(&self, path: impl AsRef<Path>) -> NifResult<String> {
        let path = path.as_ref();
        // SAFETY: loading an arbitrary shared library is inherently unsafe —
        // its static initializers run immediately. The verification step
        // below bounds the blast radius of a *misbehaving* library but
        // cannot protect against a malicious one; callers are expected to
        // load only extensions from a trusted source (spec §4.10 assumes
        // NIFs are buggy, not adversarial).
        let library = unsafe { Library::new(path) }.map_err(|e| NifError::LoadFailed(format!("{}: {e}", path.display())))?;

        // SAFETY: `init` is looked up by the fixed marker name and is called
        // with no arguments before any other symbol is touched, matching
        // the contract every extension must implement.
        let init: Symbol<unsafe extern "C" fn() -> *const NifModuleFfi> =
            unsafe { library.get(INIT_SYMBOL) }.map_err(|e| NifError::VerificationFailed(format!("missing {INIT_SYMBOL:?}: {e}")))?;

        // SAFETY: the marker contract guarantees the returned pointer is
        // either null or points at a `NifModuleFfi` whose nested C strings
        // and export table remain valid for the duration of this call.
        let descriptor = unsafe { init() };
        if descriptor.is_null() {
            return Err(NifError::VerificationFailed("ream_nif_init returned a null descriptor".into()));
        }
        let descriptor = unsafe { &*descriptor };
        if descriptor.abi_version != NIF_ABI_VERSION {
            return Err(NifError::VerificationFailed(format!(
                "ABI version mismatch: extension declares {}, runtime expects {NIF_ABI_VERSION}",
                descriptor.abi_version
            )));
        }

        let module = unsafe { cstr_to_string(descriptor.module_name) }?;
        let version = unsafe { cstr_to_string(descriptor.version) }?;

        let raw_exports: &[NifExportFfi] = if descriptor.export_count == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(descriptor.exports, descriptor.export_count as usize) }
        };

        let mut functions = HashMap::with_capacity(raw_exports.len());
        let mut exports = Vec::with_capacity(raw_exports.len());
        for export in raw_exports {
            let name = unsafe { cstr_to_string(export.name) }?;
            functions.insert((name.clone(), export.arity), export.entry);
            exports.push(NifExport { name, arity: export.arity });
        }

        let mut loaded = self.loaded.lock().unwrap();
        loaded.insert(module.clone(), LoadedNif { library, module: module.clone(), version, functions, exports });
        Ok(module)
    }

    pub fn unload(&self, module: &str) -> NifResult<()> {
        self.loaded
            .lock()
            .unwrap()
            .remove(module)
            .map(|_| ())
            .ok_or_else(|| NifError::LoadFailed(format!("module {module} not loaded")))
    }

    pub fn is_loaded(&self, module: &str) -> bool {
        self.loaded.lock().unwrap().contains_key(module)
    }

    pub fn exports(&self, module: &str) -> Vec<NifExport> {
        self.loaded.lock().unwrap().get(module).map(|m| m.exports.clone()).unwrap_or_default()
    }

    pub fn version(&self, module: &str) -> Option<String> {
        self.loaded.lock().unwrap().get(module).map(|m| m.version.clone())
    }

    /// Call `module:function/arity` with `args`, enforcing the resource
    /// ceiling and running the native code behind the panic + signal
    /// boundary. Never panics or aborts the calling process regardless of
    /// what the native function does.
    pub fn call(&self, module: &str, function: &str, arity: u8, args: Vec<NifValue>) -> NifResult<NifValue> {
        let entry = {
            let loaded = self.loaded.lock().unwrap();
            let lib = loaded.get(module).ok_or_else(|| NifError::LoadFailed(format!("module {module} not loaded")))?;
            *lib.functions.get(&(function.to_string(), arity)).ok_or_else(|| {
                NifError::CallError(format!("{module}:{function}/{arity} not exported"))
            })?
        };

        self.call_count.fetch_add(1, Ordering::Relaxed);
        sandbox::run_guarded(entry, args, self.limits.max_execution_time)
    }
}

impl Default for NifRegistry {
    fn default() -> Self {
        NifRegistry::new()
    }
}

/// C layout of one entry in a library's export table, as written by
/// `ream_nif_init`.
#[repr(C)]
pub struct NifExportFfi {
    pub name: *const c_char,
    pub arity: u8,
    pub entry: NifEntrypoint,
}

/// C layout of the descriptor `ream_nif_init` returns.
#[repr(C)]
pub struct NifModuleFfi {
    pub abi_version: u32,
    pub module_name: *const c_char,
    pub version: *const c_char,
    pub exports: *const NifExportFfi,
    pub export_count: u32,
}

unsafe fn cstr_to_string(ptr: *const c_char) -> NifResult<String> {
    if ptr.is_null() {
        return Err(NifError::InvalidMetadata("null string in module descriptor".into()));
    }
    CStr::from_ptr(ptr).to_str().map(str::to_owned).map_err(|e| NifError::InvalidMetadata(format!("non-utf8 metadata string: {e}")))
}

/// Resource-ceiling check, kept separate from the call path proper so a
/// caller sizing a per-call [`crate::types::FaultBoundary`] can reuse it
/// before ever touching a [`NifRegistry`].
pub fn sandboxed_security_manager() -> SecurityManager {
    crate::bytecode::security::create_sandbox_manager()
}

pub fn default_policy() -> SecurityPolicy {
    SecurityPolicy::default()
}

/// Panic and OS-fault containment. Split into its own module because the
/// unsafe signal-handling code has nothing to do with library loading or
/// term marshaling and benefits from being auditable on its own.
mod sandbox {
    use super::*;

    /// Run `entry(args)` on a dedicated, bounded-stack OS thread and return
    /// whichever of three outcomes happens first: a normal return, a Rust
    /// panic (caught at `catch_unwind`), or a wall-clock timeout (the call
    /// is abandoned — the thread, if truly stuck, is leaked rather than
    /// killed, since Rust has no safe "kill this thread" primitive; a stuck
    /// native call is a resource leak, not a crash, and is reported as
    /// such). The OS-signal boundary (`signal_guard`) further narrows a
    /// same-thread SIGSEGV/SIGBUS/SIGILL/SIGFPE into a returned
    /// `NifError::Fault` instead of terminating the process, on unix.
    pub fn run_guarded(entry: NifEntrypoint, args: Vec<NifValue>, timeout: Duration) -> NifResult<NifValue> {
        let mut owned_buffers = Vec::with_capacity(args.len());
        let ffi_args: Vec<NifTermFfi> = args.iter().map(|a| marshal_out(a, &mut owned_buffers)).collect();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let builder = std::thread::Builder::new().name("ream-nif-call".into()).stack_size(NIF_STACK_SIZE);
        let handle = builder.spawn(move || {
            let _keep_alive = owned_buffers;
            let result = call_on_this_thread(entry, &ffi_args);
            let _ = tx.send(result);
        });

        let handle = match handle {
            Ok(h) => h,
            Err(e) => return Err(NifError::CallError(format!("failed to spawn sandbox thread: {e}"))),
        };

        let started = Instant::now();
        match rx.recv_timeout(timeout) {
            Ok(result) => {
                // A well-behaved call joins promptly; a detached thread
                // whose closure already sent its result is cheap to reap.
                let _ = handle.join();
                result
            }
            Err(_) => {
                let elapsed = started.elapsed();
                Err(NifError::Fault { kind: format!("execution_timeout after {elapsed:?}") })
            }
        }
    }

    #[cfg(unix)]
    fn call_on_this_thread(entry: NifEntrypoint, ffi_args: &[NifTermFfi]) -> NifResult<NifValue> {
        match signal_guard::guard(|| unsafe { entry(ffi_args.len() as u32, ffi_args.as_ptr()) }) {
            Ok(Ok(term)) => unsafe { unmarshal(&term) },
            Ok(Err(payload)) => Err(NifError::Panic(panic_message(payload))),
            Err(signal_guard::FaultSignal(name)) => Err(NifError::Fault { kind: name.to_string() }),
        }
    }

    #[cfg(not(unix))]
    fn call_on_this_thread(entry: NifEntrypoint, ffi_args: &[NifTermFfi]) -> NifResult<NifValue> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe { entry(ffi_args.len() as u32, ffi_args.as_ptr()) })) {
            Ok(term) => unsafe { unmarshal(&term) },
            Err(payload) => Err(NifError::Panic(panic_message(payload))),
        }
    }

    fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
        if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "native extension panicked with a non-string payload".to_string()
        }
    }

    /// Catches SIGSEGV/SIGBUS/SIGILL/SIGFPE raised while `f` runs on the
    /// *current* thread and turns them into a returned value instead of the
    /// default action (process termination). Built on `sigsetjmp`/
    /// `siglongjmp` rather than `nix`'s signal API alone, because recovering
    /// control flow out of a signal handler — as opposed to merely
    /// observing that a signal arrived — requires a non-local jump; `nix`
    /// wraps `sigaction` but, correctly, does not attempt to wrap this.
    #[cfg(unix)]
    pub(super) mod signal_guard {
        use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
        use std::cell::Cell;
        use std::os::raw::c_int;

        /// Deliberately oversized relative to any real `sigjmp_buf` layout
        /// (glibc's is well under 200 bytes on every architecture we
        /// target); we never inspect its contents, only pass it to
        /// `sigsetjmp`/`siglongjmp`, so over-allocating costs nothing but a
        /// few bytes of thread-local stack.
        #[repr(C, align(16))]
        struct SigJmpBuf([u8; 256]);

        extern "C" {
            fn sigsetjmp(env: *mut SigJmpBuf, savemask: c_int) -> c_int;
            fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
        }

        thread_local! {
            static JMP_BUF: Cell<*mut SigJmpBuf> = Cell::new(std::ptr::null_mut());
            static FAULTED: Cell<Option<&'static str>> = Cell::new(None);
        }

        pub struct FaultSignal(pub &'static str);

        const GUARDED_SIGNALS: [Signal; 4] = [Signal::SIGSEGV, Signal::SIGBUS, Signal::SIGILL, Signal::SIGFPE];

        fn signal_name(sig: Signal) -> &'static str {
            match sig {
                Signal::SIGSEGV => "SIGSEGV",
                Signal::SIGBUS => "SIGBUS",
                Signal::SIGILL => "SIGILL",
                Signal::SIGFPE => "SIGFPE",
                _ => "SIGUNKNOWN",
            }
        }

        extern "C" fn handler(raw_sig: c_int) {
            let sig = Signal::try_from(raw_sig).unwrap_or(Signal::SIGSEGV);
            FAULTED.with(|f| f.set(Some(signal_name(sig))));
            let buf = JMP_BUF.with(Cell::get);
            if !buf.is_null() {
                // SAFETY: non-null only while `guard` below holds a live
                // stack frame at the matching `sigsetjmp` call site.
                unsafe { siglongjmp(buf, 1) }
            }
            // No guard installed (signal arrived outside any sandboxed
            // call): fall back to the default action so the process still
            // crashes loudly rather than spinning silently.
            let _ = signal::sigaction(sig, &default_action());
            let _ = signal::raise(sig);
        }

        fn default_action() -> SigAction {
            unsafe { SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()) }
        }

        fn install() -> Vec<(Signal, SigAction)> {
            let action = unsafe { SigAction::new(SigHandler::Handler(handler), SaFlags::SA_NODEFER, SigSet::empty()) };
            GUARDED_SIGNALS
                .iter()
                .filter_map(|&sig| unsafe { signal::sigaction(sig, &action) }.ok().map(|prev| (sig, prev)))
                .collect()
        }

        fn restore(previous: Vec<(Signal, SigAction)>) {
            for (sig, action) in previous {
                let _ = unsafe { signal::sigaction(sig, &action) };
            }
        }

        /// Run `f`, catching both a Rust panic and a guarded OS signal
        /// raised while it executes on this thread.
        pub fn guard<T>(f: impl FnOnce() -> T) -> Result<Result<T, Box<dyn std::any::Any + Send>>, FaultSignal> {
            let previous = install();
            let mut buf = Box::new(SigJmpBuf([0u8; 256]));
            let jumped = unsafe { sigsetjmp(&mut *buf, 1) };

            let outcome = if jumped == 0 {
                JMP_BUF.with(|j| j.set(&mut *buf));
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
                JMP_BUF.with(|j| j.set(std::ptr::null_mut()));
                Ok(result)
            } else {
                let kind = FAULTED.with(|fl| fl.take()).unwrap_or("SIGUNKNOWN");
                Err(FaultSignal(kind))
            };

            restore(previous);
            outcome
        }
    }
}
