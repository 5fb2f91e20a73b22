//! Signal handling thread (`spec.md` §4.7), grounded directly on
//! `vinit/src/bin/simplevisor.rs`'s `Signals::forever()` loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

/// Flags flipped by the signal thread and polled by the dispatch loop.
/// `signal_hook`'s handler thread runs ordinary Rust code (not inside an
/// actual signal handler), so plain atomics are sufficient here.
#[derive(Clone, Default)]
pub struct SignalFlags {
    pub shutdown_requested: Arc<AtomicBool>,
    pub child_may_have_exited: Arc<AtomicBool>,
}

impl SignalFlags {
    pub fn new() -> Self {
        SignalFlags::default()
    }

    pub fn take_shutdown_requested(&self) -> bool {
        self.shutdown_requested.swap(false, Ordering::SeqCst)
    }

    pub fn take_child_may_have_exited(&self) -> bool {
        self.child_may_have_exited.swap(false, Ordering::SeqCst)
    }
}

/// Spawns the signal-handling thread. Returns a [`signal_hook::iterator::Handle`]
/// the caller can use to stop iteration during shutdown.
pub fn spawn(flags: SignalFlags) -> Result<(std::thread::JoinHandle<()>, signal_hook::iterator::Handle), std::io::Error> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGCHLD])?;
    let handle = signals.handle();
    let join = std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGTERM | SIGINT | SIGQUIT => {
                        flags.shutdown_requested.store(true, Ordering::SeqCst);
                    }
                    SIGCHLD => {
                        flags.child_may_have_exited.store(true, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
        })?;
    Ok((join, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_reset_after_being_taken() {
        let flags = SignalFlags::new();
        flags.shutdown_requested.store(true, Ordering::SeqCst);
        assert!(flags.take_shutdown_requested());
        assert!(!flags.take_shutdown_requested());
    }
}
