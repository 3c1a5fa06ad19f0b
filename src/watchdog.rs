use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Which side of a watchdog race resolved first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome<T> {
    /// The guarded work finished within budget
    Completed(T),
    /// The budget elapsed first; the work future has been dropped
    TimedOut,
}

/// Async watchdog racing a unit of work against a wall-clock budget
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    budget: Duration,
}

impl Watchdog {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Drive `work` until it completes or the budget elapses, whichever comes first.
    ///
    /// The caller owns the follow-up for the losing side (e.g. force-killing a
    /// still-running container).
    pub async fn race<F>(&self, work: F) -> RaceOutcome<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            output = work => RaceOutcome::Completed(output),
            _ = tokio::time::sleep(self.budget) => {
                debug!("Watchdog budget of {:?} elapsed", self.budget);
                RaceOutcome::TimedOut
            }
        }
    }
}

/// Thread watchdog that fires a callback once its budget elapses unless disarmed.
///
/// Used where the guarded work blocks the current thread (an interpreter call),
/// so an async timer on the same thread could never run.
pub struct ArmedWatchdog {
    cancel: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl ArmedWatchdog {
    /// Start the watchdog thread
    pub fn arm<F>(budget: Duration, on_fire: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let thread_fired = fired.clone();

        let handle = thread::Builder::new()
            .name("sandbox-watchdog".to_string())
            .spawn(move || {
                // A dropped sender counts as a cancellation
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(budget) {
                    thread_fired.store(true, Ordering::SeqCst);
                    on_fire();
                }
            })?;

        Ok(Self {
            cancel: Some(cancel_tx),
            handle: Some(handle),
            fired,
        })
    }

    /// Stop the watchdog and wait for its thread; returns whether it fired
    pub fn disarm(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for ArmedWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
