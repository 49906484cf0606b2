//! Signal handling for stopping the workload early.
//!
//! SIGTERM, SIGINT and SIGHUP all request a stop. The handler only touches
//! atomics; workers poll [`ShutdownFlag::requested`] between ticks and the
//! daemon still prints its report.

use nix::sys::signal::Signal;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static SIGNALLED: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_signal(signo: c_int) {
    SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
    LAST_SIGNAL.store(signo, Ordering::Relaxed);
    SIGNALLED.store(true, Ordering::Release);
}

/// Stop request shared by the main thread and the workers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    watch_signals: bool,
}

impl ShutdownFlag {
    /// Flag that only [`ShutdownFlag::request`] can set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handlers and return a flag that also trips on them.
    ///
    /// # Errors
    ///
    /// Any `sigaction` failure.
    pub fn install() -> nix::Result<Self> {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
            // SAFETY: `on_signal` only performs atomic stores.
            unsafe { sigaction(signal, &action) }?;
        }
        debug!("Signal handlers registered");
        Ok(Self {
            requested: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        })
    }

    /// Whether a stop was requested.
    #[inline]
    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
            || (self.watch_signals && SIGNALLED.load(Ordering::Acquire))
    }

    /// Request a stop from inside the process.
    pub fn request(&self) {
        info!("Stop requested");
        self.requested.store(true, Ordering::Release);
    }

    /// Signals received so far.
    pub fn signal_count(&self) -> u32 {
        SIGNAL_COUNT.load(Ordering::Relaxed)
    }

    /// The most recent signal, if any arrived.
    pub fn last_signal(&self) -> Option<Signal> {
        match LAST_SIGNAL.load(Ordering::Relaxed) {
            0 => None,
            signo => Signal::try_from(signo).ok(),
        }
    }
}
