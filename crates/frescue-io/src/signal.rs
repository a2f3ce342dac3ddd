//! Interrupt flag fed by a signal handler.
//!
//! The handler does the minimum an async-signal-safe context allows: if
//! the flag is still zero, store the signal number. Saving the map,
//! closing descriptors and re-raising so the exit status is
//! `128 + signum` all happen on the main thread at the next loop head.
//!
//! The flag itself is an explicit value threaded through the drivers, so
//! tests cancel a run by calling [`InterruptFlag::set`] directly, with no
//! process-global state involved.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use frescue_error::{RescueError, Result};

/// Flag storing the number of the first received signal.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    cell: Arc<AtomicI32>,
}

/// The flag the process-wide handler writes into.
static INSTALLED: OnceLock<Arc<AtomicI32>> = OnceLock::new();

extern "C" fn on_signal(signum: libc::c_int) {
    if let Some(cell) = INSTALLED.get() {
        // Only the first signal is recorded.
        let _ = cell.compare_exchange(0, signum, Ordering::SeqCst, Ordering::SeqCst);
    }
}

impl InterruptFlag {
    pub fn new() -> InterruptFlag {
        InterruptFlag::default()
    }

    /// The signal number, if one has been received.
    pub fn signum(&self) -> Option<i32> {
        match self.cell.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn is_set(&self) -> bool {
        self.signum().is_some()
    }

    /// Record a signal number, keeping an earlier one if already set.
    pub fn set(&self, signum: i32) {
        let _ = self
            .cell
            .compare_exchange(0, signum, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.cell.store(0, Ordering::SeqCst);
    }

    /// The error a driver surfaces when it observes the flag.
    pub fn as_error(&self) -> Option<RescueError> {
        self.signum().map(|signum| RescueError::Interrupted { signum })
    }

    /// Route SIGHUP, SIGINT and SIGTERM into this flag and ignore
    /// SIGUSR1/SIGUSR2. Only one flag per process can be installed.
    pub fn install(&self) -> Result<()> {
        INSTALLED
            .set(Arc::clone(&self.cell))
            .map_err(|_| RescueError::internal("signal handlers installed twice"))?;
        let handler = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::SA_RESTART, SigSet::empty());
        for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
            unsafe { sigaction(sig, &handler) }.map_err(|e| RescueError::Io(e.into()))?;
        }
        for sig in [Signal::SIGUSR1, Signal::SIGUSR2] {
            unsafe { sigaction(sig, &ignore) }.map_err(|e| RescueError::Io(e.into()))?;
        }
        Ok(())
    }
}

/// Restore the default disposition for `signum` and re-raise it, so the
/// process exit status reflects the interruption. Returns `128 + signum`
/// as a fallback in case the raise does not terminate the process.
pub fn reraise(signum: i32) -> i32 {
    if let Ok(sig) = Signal::try_from(signum) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(sig, &default);
        }
        let _ = nix::sys::signal::raise(sig);
    }
    128 + signum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_signal_wins() {
        let flag = InterruptFlag::new();
        assert_eq!(flag.signum(), None);
        flag.set(2);
        flag.set(15);
        assert_eq!(flag.signum(), Some(2));
        flag.clear();
        assert_eq!(flag.signum(), None);
        flag.set(15);
        assert_eq!(flag.signum(), Some(15));
    }

    #[test]
    fn clones_share_state() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        other.set(1);
        assert!(flag.is_set());
    }

    #[test]
    fn error_carries_signum() {
        let flag = InterruptFlag::new();
        assert!(flag.as_error().is_none());
        flag.set(2);
        match flag.as_error() {
            Some(RescueError::Interrupted { signum }) => assert_eq!(signum, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
