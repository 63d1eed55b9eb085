//! Dirty scheduler watchdog (C10's counterpart to C8's cooperative
//! scheduling): BEAM migrates long-running/blocking NIF calls off the
//! normal reduction-counted schedulers onto a small "dirty" pool so they
//! can't stall every other process sharing that core. This runtime's NIF
//! sandbox (`nif::sandbox::run_guarded`) already enforces a per-call wall
//! clock timeout on its own dedicated thread; this module is the
//! system-wide observer over that pool — it tracks which processes are
//! currently off in dirty-call land and for how long, and logs when one
//! runs long enough to be worth a human looking at.
//!
//! Grounded on the teacher's `PreemptionTimer` for the polling-thread
//! shape (a background thread waking at a fixed interval to check elapsed
//! time against a threshold), entirely repointed: the teacher used this
//! machinery to forcibly preempt a *normal* process on a wall-clock timer,
//! which would defeat the reduction-counted cooperative model spec'd for
//! the main scheduler pool (see `runtime::executor`/`runtime::process`).
//! Preemption of ordinary bytecode stays cooperative; this watchdog only
//! ever observes and logs, it never kills or preempts a dirty call itself
//! — that's `nif::sandbox`'s job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::Pid;

/// How often the watchdog thread re-checks in-flight dirty calls.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A dirty call running longer than this is logged as long-running.
/// This is informational only — it does not abort anything.
const DEFAULT_WARN_THRESHOLD: Duration = Duration::from_secs(1);

struct DirtyCall {
    pid: Pid,
    label: String,
    started_at: Instant,
    warned: bool,
}

/// Tracks in-flight NIF/dirty-BIF calls across the whole runtime and warns
/// (via `log::warn!`) about ones that have been running suspiciously long.
pub struct DirtyWatchdog {
    warn_threshold: Duration,
    calls: Arc<Mutex<HashMap<u64, DirtyCall>>>,
    next_token: AtomicU64,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle returned by `DirtyWatchdog::enter`; dropping it (or calling
/// `finish` explicitly) unregisters the call.
pub struct DirtyCallGuard<'a> {
    watchdog: &'a DirtyWatchdog,
    token: u64,
}

impl<'a> Drop for DirtyCallGuard<'a> {
    fn drop(&mut self) {
        self.watchdog.calls.lock().remove(&self.token);
    }
}

impl DirtyWatchdog {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_WARN_THRESHOLD)
    }

    pub fn with_threshold(warn_threshold: Duration) -> Self {
        DirtyWatchdog {
            warn_threshold,
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Start the background polling thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let calls = Arc::clone(&self.calls);
        let running = Arc::clone(&self.running);
        let threshold = self.warn_threshold;

        let handle = thread::Builder::new()
            .name("ream-dirty-watchdog".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    thread::sleep(POLL_INTERVAL);
                    let mut calls = calls.lock();
                    for call in calls.values_mut() {
                        if !call.warned && call.started_at.elapsed() >= threshold {
                            call.warned = true;
                            log::warn!(
                                "dirty call '{}' on process {} has been running for {:?}",
                                call.label,
                                call.pid,
                                call.started_at.elapsed()
                            );
                        }
                    }
                }
            })
            .expect("failed to spawn dirty watchdog thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Register a dirty call about to begin. The returned guard must be
    /// held for the call's duration; dropping it unregisters the call.
    pub fn enter(&self, pid: Pid, label: impl Into<String>) -> DirtyCallGuard<'_> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().insert(
            token,
            DirtyCall { pid, label: label.into(), started_at: Instant::now(), warned: false },
        );
        DirtyCallGuard { watchdog: self, token }
    }

    /// Number of dirty calls currently in flight.
    pub fn active_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Longest-running in-flight call, if any.
    pub fn longest_running(&self) -> Option<Duration> {
        self.calls.lock().values().map(|c| c.started_at.elapsed()).max()
    }
}

impl Default for DirtyWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DirtyWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_a_call_increments_active_count() {
        let watchdog = DirtyWatchdog::new();
        assert_eq!(watchdog.active_count(), 0);
        let guard = watchdog.enter(Pid::new(), "crypto:hash/1");
        assert_eq!(watchdog.active_count(), 1);
        drop(guard);
        assert_eq!(watchdog.active_count(), 0);
    }

    #[test]
    fn longest_running_tracks_elapsed_time() {
        let watchdog = DirtyWatchdog::new();
        let _guard = watchdog.enter(Pid::new(), "slow_nif");
        thread::sleep(Duration::from_millis(5));
        assert!(watchdog.longest_running().unwrap() >= Duration::from_millis(5));
    }

    #[test]
    fn watchdog_thread_starts_and_stops_cleanly() {
        let watchdog = DirtyWatchdog::with_threshold(Duration::from_millis(5));
        watchdog.start();
        let _guard = watchdog.enter(Pid::new(), "long_running");
        thread::sleep(Duration::from_millis(20));
        watchdog.stop();
    }
}
