//! Pause gate owned by every macro.
//!
//! A `PauseEvent` holds a single "runnable" flag. The macro body parks on
//! [`PauseEvent::wait`] at its checkpoints while the flag is lowered. Control
//! requests (`pause`, `resume`, `resume_for_abort`) arrive from other tasks.
//!
//! `resume_for_abort` unparks the macro without running the resume callback
//! and arms a watchdog: the parked task waits a short grace window for the
//! abort to arrive and, if it does not, raises [`MacroError::ForcedAbort`]
//! itself.

use crate::error::{MacroError, MacroResult};
use crate::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback run when the macro parks or resumes.
pub type PauseCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_pause: Option<PauseCallback>,
    on_resume: Option<PauseCallback>,
}

/// Single-flag gate with pause/resume/abort-while-paused semantics.
pub struct PauseEvent {
    runnable: Signal,
    callbacks: Mutex<Callbacks>,
    force_abort: AtomicBool,
    grace: Duration,
}

impl std::fmt::Debug for PauseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseEvent")
            .field("paused", &self.is_paused())
            .field("watchdog_armed", &self.force_abort.load(Ordering::SeqCst))
            .field("grace", &self.grace)
            .finish()
    }
}

impl PauseEvent {
    /// Create a runnable gate whose watchdog waits `grace` before aborting.
    pub fn new(grace: Duration) -> Self {
        Self {
            runnable: Signal::raised(),
            callbacks: Mutex::new(Callbacks::default()),
            force_abort: AtomicBool::new(false),
            grace,
        }
    }

    /// Lower the flag. `callback` runs when the macro actually parks.
    pub fn pause(&self, callback: Option<PauseCallback>) {
        if let Ok(mut cbs) = self.callbacks.lock() {
            cbs.on_pause = callback;
        }
        self.runnable.clear();
    }

    /// Raise the flag if paused. `callback` runs once the macro unparks.
    ///
    /// Returns `false` when the gate was not paused.
    pub fn resume(&self, callback: Option<PauseCallback>) -> bool {
        if !self.is_paused() {
            return false;
        }
        if let Ok(mut cbs) = self.callbacks.lock() {
            cbs.on_resume = callback;
        }
        self.runnable.set();
        true
    }

    /// Unpark for an abort: arm the watchdog and skip the resume callback.
    ///
    /// Returns `false` when the gate was not paused.
    pub fn resume_for_abort(&self) -> bool {
        if !self.is_paused() {
            return false;
        }
        self.force_abort.store(true, Ordering::SeqCst);
        self.runnable.set();
        true
    }

    /// True while the flag is lowered.
    pub fn is_paused(&self) -> bool {
        !self.runnable.is_set()
    }

    /// Block while paused.
    ///
    /// Returns `Ok(true)` when the gate was (or became) runnable and
    /// `Ok(false)` when `timeout` elapsed while still paused. `abort` is the
    /// owning macro's abort signal: it unblocks the wait and, during the
    /// watchdog grace window, counts as the external cancellation.
    pub async fn wait(&self, timeout: Option<Duration>, abort: &Signal) -> MacroResult<bool> {
        if self.runnable.is_set() && !self.force_abort.load(Ordering::SeqCst) {
            return Ok(true);
        }

        if !self.runnable.is_set() {
            if let Some(cb) = self.callback(|cbs| cbs.on_pause.clone()) {
                cb();
            }
        }

        let resumed = tokio::select! {
            biased;
            _ = abort.wait() => return Err(MacroError::Abort),
            resumed = self.wait_runnable(timeout) => resumed,
        };
        if !resumed {
            return Ok(false);
        }

        if self.force_abort.swap(false, Ordering::SeqCst) {
            debug!(grace_ms = self.grace.as_millis() as u64, "pause watchdog armed");
            let external = abort.wait_timeout(self.grace).await;
            if external {
                return Err(MacroError::Abort);
            }
            warn!("abort did not arrive within the watchdog grace window, aborting");
            return Err(MacroError::ForcedAbort);
        }

        if let Some(cb) = self.callback(|cbs| cbs.on_resume.take()) {
            cb();
        }
        Ok(true)
    }

    async fn wait_runnable(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(t) => self.runnable.wait_timeout(t).await,
            None => {
                self.runnable.wait().await;
                true
            }
        }
    }

    fn callback<F>(&self, pick: F) -> Option<PauseCallback>
    where
        F: FnOnce(&mut Callbacks) -> Option<PauseCallback>,
    {
        self.callbacks.lock().ok().and_then(|mut cbs| pick(&mut cbs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, PauseCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = count.clone();
        let cb: PauseCallback = Arc::new(move || {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, cb)
    }

    #[tokio::test]
    async fn test_wait_does_not_block_when_runnable() {
        let event = PauseEvent::new(Duration::from_millis(50));
        let abort = Signal::new();
        assert!(event.wait(None, &abort).await.unwrap());
        assert!(!event.resume(None));
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume_and_runs_one_resume_callback() {
        let event = Arc::new(PauseEvent::new(Duration::from_millis(50)));
        let abort = Signal::new();
        let (paused, on_pause) = counter();
        let (resumed, on_resume) = counter();

        event.pause(Some(on_pause));
        assert!(event.is_paused());

        let waiter = {
            let event = event.clone();
            let abort = abort.clone();
            tokio::spawn(async move { event.wait(None, &abort).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        assert_eq!(paused.load(Ordering::SeqCst), 1);

        assert!(event.resume(Some(on_resume)));
        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(resumed.load(Ordering::SeqCst), 1);

        // a second wait does not replay the resume callback
        assert!(event.wait(None, &abort).await.unwrap());
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_while_paused() {
        let event = PauseEvent::new(Duration::from_millis(50));
        let abort = Signal::new();
        event.pause(None);
        let resumed = event
            .wait(Some(Duration::from_millis(20)), &abort)
            .await
            .unwrap();
        assert!(!resumed);
        assert!(event.is_paused());
    }

    #[tokio::test]
    async fn test_resume_for_abort_raises_forced_abort_without_resume_callback() {
        let event = Arc::new(PauseEvent::new(Duration::from_millis(40)));
        let abort = Signal::new();
        let (resumed, on_resume) = counter();
        event.pause(None);
        // a resume callback recorded earlier must not run on the abort path
        if let Ok(mut cbs) = event.callbacks.lock() {
            cbs.on_resume = Some(on_resume);
        }

        let waiter = {
            let event = event.clone();
            let abort = abort.clone();
            tokio::spawn(async move { event.wait(None, &abort).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(event.resume_for_abort());

        let started = std::time::Instant::now();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MacroError::ForcedAbort)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_external_abort_during_grace_wins() {
        let event = Arc::new(PauseEvent::new(Duration::from_millis(500)));
        let abort = Signal::new();
        event.pause(None);

        let waiter = {
            let event = event.clone();
            let abort = abort.clone();
            tokio::spawn(async move { event.wait(None, &abort).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.resume_for_abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.set();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(MacroError::Abort)));
    }

    #[tokio::test]
    async fn test_abort_signal_unblocks_parked_wait() {
        let event = Arc::new(PauseEvent::new(Duration::from_millis(500)));
        let abort = Signal::new();
        event.pause(None);
        let waiter = {
            let event = event.clone();
            let abort = abort.clone();
            tokio::spawn(async move { event.wait(None, &abort).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.set();
        assert!(matches!(waiter.await.unwrap(), Err(MacroError::Abort)));
    }
}
