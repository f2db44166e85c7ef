//! Cooperative stop requests for controller loops.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// A stop flag that sleeping controllers wake up on immediately.
///
/// Clones share the flag, so one signal handler can stop every controller
/// of a process.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps for `timeout` unless a stop arrives first. Returns whether a
    /// stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }

    /// Trips this signal on the first SIGINT or SIGTERM the process receives.
    pub fn stop_on_termination(&self) -> io::Result<JoinHandle<()>> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let stop = self.clone();

        thread::Builder::new()
            .name("stop-signal".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!("Received signal {}, stopping controllers", signal);
                    stop.stop();
                }
            })
    }
}
