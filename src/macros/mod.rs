//! The macro unit.
//!
//! A macro is a [`MacroBody`] plus the runtime state the executor keeps for it
//! in a [`MacroHandle`]: identity, status, pause gate, hooks and cancellation
//! flags. The body talks to the outside world only through a
//! [`MacroContext`], whose every call is a cancellation boundary.
//!
//! ## Running
//!
//! `MacroBody::run` returns an explicit [`MacroRun`]:
//! - `Finished(result)` for one-shot macros;
//! - `InProgress(sequence)` for macros that report progress step by step.
//!   The executor drives the sequence through [`MacroExecution`], which
//!   yields one status per step, parks on the pause gate between steps and
//!   calls [`ProgressSequence::finish`] exactly once on every exit path.
//!
//! ## Cancellation
//!
//! - Stop is cooperative: it is raised at the next context call or checkpoint.
//! - Abort is raised at the next blocking point: every blocking context call
//!   races the macro's abort signal.
//! - Each of them is raised at most once per macro; cleanup code running
//!   after it does not see it again.

pub mod builtin;
pub mod catalog;
pub mod context;
pub mod status;

pub use catalog::{MacroCatalog, MacroDefinition};
pub use context::MacroContext;
pub use status::{MacroInfo, MacroState, MacroStatus, StatusEvent, StatusKind};

use crate::error::{MacroError, MacroResult};
use crate::error_recovery::{retry_until, RetryPolicy};
use crate::hooks::{HookRef, HookRegistry};
use crate::pause::PauseEvent;
use crate::signal::Signal;
use crate::value::ParamValue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// User-defined procedure.
#[async_trait]
pub trait MacroBody: Send {
    /// Hook hints this macro exposes
    fn hints_allowed(&self) -> &'static [&'static str] {
        &[]
    }

    /// Validate and store parameters; may resolve devices and environment.
    async fn prepare(
        &mut self,
        _ctx: &MacroContext,
        _params: Vec<ParamValue>,
    ) -> MacroResult<Option<ParamValue>> {
        Ok(None)
    }

    /// Execute the macro.
    async fn run(&mut self, ctx: &MacroContext) -> MacroResult<MacroRun>;

    /// Called once after a stop was raised in this macro.
    async fn on_stop(&mut self, _ctx: &MacroContext) -> MacroResult<()> {
        Ok(())
    }

    /// Called once after an abort was raised in this macro.
    async fn on_abort(&mut self, _ctx: &MacroContext) -> MacroResult<()> {
        Ok(())
    }
}

/// Outcome of [`MacroBody::run`].
pub enum MacroRun {
    /// Done, with an optional result
    Finished(Option<ParamValue>),
    /// Progress sequence still to be driven
    InProgress(Box<dyn ProgressSequence>),
}

impl std::fmt::Debug for MacroRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MacroRun::Finished(r) => f.debug_tuple("Finished").field(r).finish(),
            MacroRun::InProgress(_) => f.write_str("InProgress(..)"),
        }
    }
}

/// Lazy sequence of progress steps.
#[async_trait]
pub trait ProgressSequence: Send {
    /// Progress range reported in status events
    fn range(&self) -> (f64, f64);

    /// Perform the next step. `Ok(None)` when there is nothing left.
    async fn advance(&mut self, ctx: &MacroContext) -> MacroResult<Option<f64>>;

    /// Tear down. Called exactly once with the state the run ended in.
    async fn finish(
        &mut self,
        ctx: &MacroContext,
        state: MacroState,
    ) -> MacroResult<Option<ParamValue>>;
}

/// Executor-side state of one macro instance.
pub struct MacroHandle {
    /// Identity and invocation line
    pub info: MacroInfo,
    /// Nesting depth; 0 for the top-level macro
    pub depth: usize,
    /// Stack index of the parent macro
    pub parent: Option<usize>,
    status: Mutex<MacroStatus>,
    pub(crate) pause: PauseEvent,
    hooks: Mutex<HookRegistry>,
    stop_requested: AtomicBool,
    stop_raised: AtomicBool,
    abort_raised: AtomicBool,
    pub(crate) aborted: Signal,
    pub(crate) finished: Signal,
}

impl std::fmt::Debug for MacroHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroHandle")
            .field("name", &self.info.name)
            .field("id", &self.info.id)
            .field("depth", &self.depth)
            .field("status", &self.status())
            .finish()
    }
}

impl MacroHandle {
    pub(crate) fn new(
        info: MacroInfo,
        depth: usize,
        parent: Option<usize>,
        hints: &[&str],
        pause_grace: Duration,
    ) -> Self {
        Self {
            info,
            depth,
            parent,
            status: Mutex::new(MacroStatus::default()),
            pause: PauseEvent::new(pause_grace),
            hooks: Mutex::new(HookRegistry::new(hints)),
            stop_requested: AtomicBool::new(false),
            stop_raised: AtomicBool::new(false),
            abort_raised: AtomicBool::new(false),
            aborted: Signal::new(),
            finished: Signal::new(),
        }
    }

    /// Snapshot of the status record
    pub fn status(&self) -> MacroStatus {
        self.status.lock().map(|s| *s).unwrap_or_default()
    }

    /// Current lifecycle state
    pub fn state(&self) -> MacroState {
        self.status().state
    }

    pub(crate) fn set_state(&self, state: MacroState) {
        if let Ok(mut s) = self.status.lock() {
            s.state = state;
        }
    }

    pub(crate) fn set_range(&self, range: (f64, f64)) {
        if let Ok(mut s) = self.status.lock() {
            s.range = range;
        }
    }

    pub(crate) fn set_step(&self, step: f64) {
        if let Ok(mut s) = self.status.lock() {
            s.step = step;
        }
    }

    /// Status event of the given kind built from the current status
    pub fn status_event(&self, kind: StatusKind) -> StatusEvent {
        StatusEvent::new(&self.info, &self.status(), kind)
    }

    /// Copy of the hook registry
    pub fn hooks(&self) -> HookRegistry {
        self.hooks.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Register a hook on this macro
    pub fn append_hook(&self, hook: HookRef, hints: &[&str]) {
        if let Ok(mut h) = self.hooks.lock() {
            h.append_hook(hook, hints);
        }
    }

    /// Replace all hooks of this macro
    pub fn set_hooks(&self, hooks: Vec<(HookRef, Vec<String>)>) -> MacroResult<()> {
        self.hooks
            .lock()
            .map_err(|_| MacroError::InvalidHook("hook registry poisoned".into()))?
            .set_hooks(hooks)
    }

    /// Ask the macro to stop at its next boundary, unparking it if paused.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.pause.resume(None);
    }

    /// True once a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// True once an abort was injected
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_set()
    }

    /// True once an abort has been raised in this macro
    pub(crate) fn abort_raised(&self) -> bool {
        self.abort_raised.load(Ordering::SeqCst)
    }

    /// Raise a pending abort or stop, each at most once.
    pub(crate) fn check_cancel(&self) -> MacroResult<()> {
        if self.aborted.is_set() && !self.abort_raised.swap(true, Ordering::SeqCst) {
            return Err(MacroError::Abort);
        }
        if self.is_stop_requested()
            && !self.abort_raised()
            && !self.stop_raised.swap(true, Ordering::SeqCst)
        {
            return Err(MacroError::Stop);
        }
        Ok(())
    }

    /// Record that `err` is unwinding through this macro.
    pub(crate) fn note_error(&self, err: &MacroError) {
        if err.is_abort() {
            self.abort_raised.store(true, Ordering::SeqCst);
        } else if err.is_stop() {
            self.stop_raised.store(true, Ordering::SeqCst);
        }
    }

    /// Inject the abort signal until the macro finishes.
    ///
    /// A parked macro is first unparked with the pause watchdog armed.
    /// Returns whether the macro finished within the retry budget.
    pub async fn abort(&self, policy: &RetryPolicy) -> bool {
        if self.pause.resume_for_abort() {
            debug!(macro_name = %self.info.name, "unparked for abort");
        }
        let finished = retry_until(policy, |attempt| {
            let aborted = self.aborted.clone();
            let finished = self.finished.clone();
            let backoff = policy.backoff_delay;
            async move {
                if attempt > 0 {
                    debug!(attempt, "re-injecting abort");
                }
                aborted.set();
                finished.wait_timeout(backoff).await
            }
        })
        .await;
        if !finished {
            warn!(
                macro_name = %self.info.name,
                attempts = policy.max_attempts,
                "macro did not finish after abort"
            );
        }
        finished
    }
}

/// A macro ready to run: handle, body and preparation result.
pub struct PreparedMacro {
    pub(crate) handle: Arc<MacroHandle>,
    pub(crate) body: Box<dyn MacroBody>,
    /// Value returned by [`MacroBody::prepare`]
    pub prepare_result: Option<ParamValue>,
}

impl std::fmt::Debug for PreparedMacro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedMacro")
            .field("info", &self.handle.info)
            .field("prepare_result", &self.prepare_result)
            .finish_non_exhaustive()
    }
}

impl PreparedMacro {
    /// Identity of the prepared macro
    pub fn info(&self) -> &MacroInfo {
        &self.handle.info
    }

    /// Shared handle
    pub fn handle(&self) -> &Arc<MacroHandle> {
        &self.handle
    }

    /// Register a hook before the macro runs
    pub fn append_hook(&self, hook: HookRef, hints: &[&str]) {
        self.handle.append_hook(hook, hints);
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Start,
    Run,
    Stepping { first: bool },
    Finish,
    Done,
}

/// Drives a macro body and yields its status events.
pub(crate) struct MacroExecution {
    ctx: MacroContext,
    body: Box<dyn MacroBody>,
    phase: Phase,
    sequence: Option<Box<dyn ProgressSequence>>,
    result: Option<ParamValue>,
}

impl MacroExecution {
    pub(crate) fn new(ctx: MacroContext, body: Box<dyn MacroBody>) -> Self {
        Self {
            ctx,
            body,
            phase: Phase::Start,
            sequence: None,
            result: None,
        }
    }

    pub(crate) fn body_mut(&mut self) -> &mut Box<dyn MacroBody> {
        &mut self.body
    }

    pub(crate) fn take_result(&mut self) -> Option<ParamValue> {
        self.result.take()
    }

    /// Next status event, `Ok(None)` once the finish status was yielded.
    pub(crate) async fn next_status(&mut self) -> MacroResult<Option<StatusEvent>> {
        match self.step().await {
            Ok(ev) => Ok(ev),
            Err(err) => {
                self.ctx.handle().note_error(&err);
                self.phase = Phase::Done;
                if let Some(mut seq) = self.sequence.take() {
                    let state = MacroState::for_error(&err);
                    if let Err(cleanup_err) = seq.finish(&self.ctx, state).await {
                        if cleanup_err.is_release() {
                            return Err(cleanup_err);
                        }
                        warn!(
                            macro_name = %self.ctx.handle().info.name,
                            error = %cleanup_err,
                            "teardown failed while unwinding"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn step(&mut self) -> MacroResult<Option<StatusEvent>> {
        let handle = self.ctx.handle().clone();
        loop {
            match self.phase {
                Phase::Start => {
                    handle.set_state(MacroState::Running);
                    self.phase = Phase::Run;
                    return Ok(Some(handle.status_event(StatusKind::Start)));
                }
                Phase::Run => match self.body.run(&self.ctx).await? {
                    MacroRun::Finished(result) => {
                        self.result = result;
                        self.phase = Phase::Finish;
                    }
                    MacroRun::InProgress(seq) => {
                        handle.set_range(seq.range());
                        self.sequence = Some(seq);
                        self.phase = Phase::Stepping { first: true };
                    }
                },
                Phase::Stepping { first } => {
                    if !first {
                        self.ctx.checkpoint().await?;
                    }
                    let Some(seq) = self.sequence.as_mut() else {
                        self.phase = Phase::Finish;
                        continue;
                    };
                    match seq.advance(&self.ctx).await? {
                        Some(step) => {
                            handle.set_step(step);
                            self.phase = Phase::Stepping { first: false };
                            return Ok(Some(handle.status_event(StatusKind::Step)));
                        }
                        None => {
                            if let Some(mut seq) = self.sequence.take() {
                                self.result = seq.finish(&self.ctx, MacroState::Finished).await?;
                            }
                            self.phase = Phase::Finish;
                        }
                    }
                }
                Phase::Finish => {
                    handle.set_state(MacroState::Finished);
                    handle.set_step(handle.status().range.1);
                    self.phase = Phase::Done;
                    return Ok(Some(handle.status_event(StatusKind::Finish)));
                }
                Phase::Done => return Ok(None),
            }
        }
    }
}
