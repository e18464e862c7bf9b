//! Run/pause/shutdown state.
//!
//! Three flags coordinate orderly termination across every worker thread:
//!
//! - `running`: cleared exactly once; every long-lived loop checks it at its
//!   head and exits when false.
//! - `shutdown_signaled`: set when teardown has been initiated, so the signal
//!   handler can distinguish "shutting down" from "hung".
//! - `paused`: sticky while the operator sits at a prompt; a signal arriving
//!   in that state force-exits because clean teardown cannot be guaranteed.
//!
//! The flags must be initialized (i.e. the global instance created) before
//! any worker thread is spawned. Workers treat them as read-only except for
//! `paused`, which the pause prompt also sets.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

pub struct Lifecycle {
    running: AtomicBool,
    shutdown_signaled: AtomicBool,
    paused: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            shutdown_signaled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// The process-wide instance the signal handler operates on.
    pub fn global() -> Arc<Lifecycle> {
        static GLOBAL: OnceLock<Arc<Lifecycle>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Lifecycle::new())))
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ends every worker loop. One-way: there is no "resume" — a fresh run
    /// constructs a fresh platform.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn shutdown_signaled(&self) -> bool {
        self.shutdown_signaled.load(Ordering::SeqCst)
    }

    /// Marks that teardown has been initiated (workers are being joined).
    pub fn mark_shutdown_signaled(&self) {
        self.shutdown_signaled.store(true, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Blocks until the operator acknowledges, leaving `paused` set for the
    /// duration so the signal handler knows a prompt is pending.
    ///
    /// An interrupted read (EINTR) returns early and leaves shutdown to the
    /// main loop.
    pub fn pause_for_operator(&self) {
        self.set_paused(true);
        tracing::warn!("execution paused; press Enter to continue");
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        self.set_paused(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lifecycle_is_running_and_unsignaled() {
        let lc = Lifecycle::new();
        assert!(lc.running());
        assert!(!lc.shutdown_signaled());
        assert!(!lc.paused());
    }

    #[test]
    fn request_shutdown_is_one_way() {
        let lc = Lifecycle::new();
        lc.request_shutdown();
        assert!(!lc.running());
        lc.mark_shutdown_signaled();
        assert!(lc.shutdown_signaled());
    }
}
