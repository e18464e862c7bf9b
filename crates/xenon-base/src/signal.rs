//! OS termination-signal handling (Ctrl+C / SIGINT / SIGTERM / SIGHUP, and
//! the console-control events on Windows).
//!
//! Policy:
//!
//! 1. If the operator is sitting at a pause prompt, force-exit immediately —
//!    worker state is indeterminate and clean teardown is not safe.
//! 2. On the first signal, announce a clean shutdown, clear `running`, and
//!    arm a 15-second watchdog for the workers to drain.
//! 3. On a second signal, or when the watchdog fires while teardown has
//!    already been initiated but not completed, force-exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::lifecycle::Lifecycle;

/// How long workers get to observe `running == false` before the process is
/// considered hung.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

const FORCED_EXIT_CODE: i32 = -1;

/// Installs the process-wide termination handler.
///
/// After the grace period the watchdog either force-exits (teardown was
/// initiated elsewhere and hung) or invokes `on_clean_shutdown`, which is
/// expected to call [`Lifecycle::mark_shutdown_signaled`], join the workers,
/// and let the process fall out of its main loop.
///
/// Must be called at most once per process; `ctrlc` rejects a second handler.
pub fn install(
    lifecycle: Arc<Lifecycle>,
    on_clean_shutdown: impl Fn() + Send + Sync + 'static,
) -> Result<(), ctrlc::Error> {
    let hup_flag = Arc::new(AtomicBool::new(false));
    let hook: Arc<dyn Fn() + Send + Sync> = Arc::new(on_clean_shutdown);

    ctrlc::set_handler(move || {
        if lifecycle.paused() {
            // The operator is waiting at a prompt; state is indeterminate.
            std::process::exit(FORCED_EXIT_CODE);
        }

        if hup_flag.swap(true, Ordering::SeqCst) {
            tracing::error!("unable to clean shutdown, forcing exit");
            std::process::exit(FORCED_EXIT_CODE);
        }

        tracing::info!("attempting clean shutdown");
        lifecycle.request_shutdown();

        let lifecycle = Arc::clone(&lifecycle);
        let hook = Arc::clone(&hook);
        thread::spawn(move || {
            thread::sleep(SHUTDOWN_GRACE);
            if lifecycle.shutdown_signaled() {
                // Teardown started but the process is still alive after the
                // full grace period: something hung.
                tracing::error!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "workers did not exit within the shutdown grace period"
                );
                std::process::exit(FORCED_EXIT_CODE);
            }
            hook();
        });
    })
}
