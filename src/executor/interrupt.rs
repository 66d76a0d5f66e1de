//! Operator interrupts while a child is running.
//!
//! Ctrl-C is caught by a process-wide handler. While a child is being waited
//! on, the handler only sets a flag; the wait loop polls both the child and
//! the flag, forwards the signal to the child, reaps it, and exits without
//! running any of the harness's own finalization. Outside a wait there is no
//! child to hand the signal to, so the handler exits right away.

use std::io;
use std::process::{Child, ExitStatus};
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

/// Exit status used when the operator interrupts a run.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
/// Number of `wait_for_child` calls in progress.
static WAITING: AtomicUsize = AtomicUsize::new(0);
static INSTALL: Once = Once::new();

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// A wait loop will forward the signal.
    Deferred,
    /// Nothing is waiting; the harness should stop now.
    Exit,
}

/// Install the Ctrl-C handler once per process.
pub fn install_handler() {
    INSTALL.call_once(|| {
        let handler = || {
            if on_interrupt() == Disposition::Exit {
                warn!("interrupted by operator");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        };
        if let Err(e) = ctrlc::set_handler(handler) {
            warn!(error = %e, "failed to install interrupt handler");
        }
    });
}

fn on_interrupt() -> Disposition {
    if WAITING.load(Ordering::SeqCst) == 0 {
        return Disposition::Exit;
    }
    INTERRUPTED.store(true, Ordering::SeqCst);
    Disposition::Deferred
}

/// Consume a pending interrupt, if any.
fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Marks a wait as active for as long as it lives.
struct WaitScope;

impl WaitScope {
    fn enter() -> Self {
        if WAITING.fetch_add(1, Ordering::SeqCst) == 0 && take_interrupt() {
            debug!("discarding interrupt left over from an earlier wait");
        }
        Self
    }
}

impl Drop for WaitScope {
    fn drop(&mut self) {
        WAITING.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for `child` to exit. An operator interrupt terminates the process.
pub fn wait_for_child(child: &mut Child) -> io::Result<ExitStatus> {
    install_handler();
    let _scope = WaitScope::enter();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if take_interrupt() {
            forward_interrupt(child);
            let status = child.wait();
            warn!(?status, "interrupted by operator");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn forward_interrupt(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    debug!(pid, "forwarding SIGINT to child");
    // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "failed to signal child");
    }
}
