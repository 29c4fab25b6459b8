//! Per-session macro executor.
//!
//! The executor runs one top-level macro at a time. Nested macros are pushed
//! on a stack whose top is the only macro allowed to act. Devices looked up by
//! a macro are reserved for it until it is popped.
//!
//! ## Control protocol
//!
//! - `stop()`: flags every macro on the stack for a cooperative stop and
//!   schedules a *stop pass* that stops every reserved device, best effort,
//!   in reservation order.
//! - `abort()`: releases an in-flight stop pass, then schedules an *abort
//!   pass* that waits for the stop pass, injects the abort into the running
//!   macro and aborts every device the stop pass did not reach.
//! - `pause()` / `resume()`: act on the running macro's pause gate and
//!   broadcast pause/resume status once the macro actually parks/unparks.
//! - `release()`: escape hatch that unblocks a stuck abort pass or on-abort
//!   handler. Never part of a normal cancellation.

pub mod reservations;

pub use reservations::ReservationBook;

use crate::config::Settings;
use crate::error::{MacroError, MacroResult};
use crate::error_recovery::RetryPolicy;
use crate::hardware::{Device, DevicePool};
use crate::macros::{
    MacroCatalog, MacroContext, MacroExecution, MacroHandle, MacroInfo, MacroState,
    PreparedMacro, StatusKind,
};
use crate::pause::PauseCallback;
use crate::session::Session;
use crate::signal::Signal;
use crate::value::ParamValue;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Stack = Arc<Mutex<Vec<Arc<MacroHandle>>>>;

/// Non-owning reference to a macro: its index in the executor stack.
#[derive(Clone)]
struct StackSlot {
    stack: Stack,
    index: usize,
    id: Uuid,
}

impl StackSlot {
    fn get(&self) -> Option<Arc<MacroHandle>> {
        let stack = self.stack.lock().ok()?;
        stack
            .get(self.index)
            .filter(|h| h.info.id == self.id)
            .cloned()
    }
}

#[derive(Default)]
struct ControlFlags {
    stopped: AtomicBool,
    aborted: AtomicBool,
    paused: AtomicBool,
    released: AtomicBool,
}

/// State shared between the executor, its control passes and the contexts of
/// running macros.
pub struct ExecutorShared {
    session: Arc<dyn Session>,
    pool: Arc<DevicePool>,
    catalog: Arc<MacroCatalog>,
    settings: Settings,
    stack: Stack,
    reservations: Mutex<ReservationBook>,
    flags: ControlFlags,
    stop_done: Signal,
    abort_done: Signal,
    stop_release: Signal,
    abort_release: Signal,
    on_abort_release: Signal,
    stop_pass_active: AtomicBool,
    abort_pass_active: AtomicBool,
    on_abort_active: AtomicBool,
    stopped_devices: Mutex<HashSet<String>>,
    passes: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorShared {
    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub(crate) fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.flags.aborted.load(Ordering::SeqCst)
    }

    fn stack_snapshot(&self) -> Vec<Arc<MacroHandle>> {
        self.stack.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn top(&self) -> Option<Arc<MacroHandle>> {
        self.stack.lock().ok().and_then(|s| s.last().cloned())
    }

    fn stack_depth(&self) -> usize {
        self.stack.lock().map(|s| s.len()).unwrap_or_default()
    }

    fn slot(&self, handle: &MacroHandle) -> StackSlot {
        StackSlot {
            stack: self.stack.clone(),
            index: handle.depth,
            id: handle.info.id,
        }
    }

    /// Parent of `handle`, resolved through the stack
    pub(crate) fn parent_of(&self, handle: &MacroHandle) -> Option<Arc<MacroHandle>> {
        let index = handle.parent?;
        self.stack.lock().ok().and_then(|s| s.get(index).cloned())
    }

    pub(crate) fn reserve_obj(&self, device: Arc<dyn Device>, macro_id: Uuid, priority: bool) {
        debug!(device = device.name(), %macro_id, priority, "reserve");
        if let Ok(mut book) = self.reservations.lock() {
            book.reserve(device, macro_id, priority);
        }
    }

    pub(crate) fn return_obj(&self, device_name: &str, macro_id: Uuid) {
        if let Ok(mut book) = self.reservations.lock() {
            book.release(device_name, macro_id);
        }
    }

    pub(crate) fn return_objs(&self, macro_id: Uuid) {
        if let Ok(mut book) = self.reservations.lock() {
            let released = book.release_all(macro_id);
            if !released.is_empty() {
                debug!(%macro_id, devices = ?released, "returned reservations");
            }
        }
    }

    fn reserved_devices(&self) -> Vec<Arc<dyn Device>> {
        self.reservations
            .lock()
            .map(|book| book.devices())
            .unwrap_or_default()
    }

    fn reset(&self) {
        for flag in [
            &self.flags.stopped,
            &self.flags.aborted,
            &self.flags.paused,
            &self.flags.released,
        ] {
            flag.store(false, Ordering::SeqCst);
        }
        for signal in [
            &self.stop_done,
            &self.abort_done,
            &self.stop_release,
            &self.abort_release,
            &self.on_abort_release,
        ] {
            signal.clear();
        }
        if let Ok(mut stopped) = self.stopped_devices.lock() {
            stopped.clear();
        }
        if let Ok(mut passes) = self.passes.lock() {
            passes.retain(|p| !p.is_finished());
        }
    }

    /// Resolve, check and prepare a macro.
    pub(crate) async fn prepare_macro(
        self: &Arc<Self>,
        name: &str,
        params: Vec<ParamValue>,
        parent: Option<&Arc<MacroHandle>>,
    ) -> MacroResult<PreparedMacro> {
        let definition = self.catalog.get(name)?;
        let missing: Vec<String> = definition
            .env
            .iter()
            .filter(|var| self.session.get_env_scoped(var, name).is_err())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(MacroError::MissingEnvironment {
                macro_name: name.to_string(),
                missing,
            });
        }
        let mut body = definition.instantiate();

        let (depth, parent_index) = match parent {
            Some(p) => (p.depth + 1, Some(p.depth)),
            None => (0, None),
        };
        let handle = Arc::new(MacroHandle::new(
            MacroInfo::new(name, params.clone()),
            depth,
            parent_index,
            body.hints_allowed(),
            self.settings.executor.pause_watchdog_grace(),
        ));
        debug!(macro_line = %handle.info.line, depth, "preparing macro");

        let ctx = MacroContext::new(handle.clone(), self.clone());
        match body.prepare(&ctx, params).await {
            Ok(prepare_result) => Ok(PreparedMacro {
                handle,
                body,
                prepare_result,
            }),
            Err(err) => {
                self.return_objs(handle.info.id);
                Err(err)
            }
        }
    }

    /// Push, drive to completion, pop.
    pub(crate) fn run_prepared(
        self: Arc<Self>,
        prepared: PreparedMacro,
    ) -> BoxFuture<'static, MacroResult<Option<ParamValue>>> {
        Box::pin(async move {
            let PreparedMacro { handle, body, .. } = prepared;
            let ctx = MacroContext::new(handle.clone(), self.clone());
            if let Ok(mut stack) = self.stack.lock() {
                stack.push(handle.clone());
            }
            if self.flags.stopped.load(Ordering::SeqCst) {
                handle.request_stop();
            }
            info!(macro_line = %handle.info.line, depth = handle.depth, "macro started");

            let mut exec = MacroExecution::new(ctx.clone(), body);
            let outcome: MacroResult<()> = async {
                while let Some(event) = exec.next_status().await? {
                    self.session.send_status(event);
                }
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => {
                    let result = exec.take_result();
                    self.complete(&handle);
                    info!(macro_name = %handle.info.name, "macro finished");
                    if handle.depth == 0 {
                        self.session.send_result(handle.info.id, result.as_ref());
                    }
                    Ok(result)
                }
                Err(err) => {
                    handle.note_error(&err);
                    let handler = self.run_cancel_handler(&mut exec, &ctx, &err).await;
                    handle.set_state(MacroState::for_error(&err));
                    let event = handle
                        .status_event(StatusKind::for_error(&err))
                        .with_error(&err);
                    self.session.send_status(event);
                    if err.is_cancellation() {
                        info!(macro_name = %handle.info.name, outcome = err.kind(), "macro interrupted");
                    } else {
                        error!(macro_name = %handle.info.name, error = %err, "macro failed");
                    }
                    self.complete(&handle);
                    handler?;
                    Err(err)
                }
            }
        })
    }

    async fn run_cancel_handler(
        &self,
        exec: &mut MacroExecution,
        ctx: &MacroContext,
        err: &MacroError,
    ) -> MacroResult<()> {
        let outcome = if err.is_stop() {
            exec.body_mut().on_stop(ctx).await
        } else if err.is_abort() {
            self.on_abort_active.store(true, Ordering::SeqCst);
            let outcome = tokio::select! {
                biased;
                _ = self.on_abort_release.wait() => Err(MacroError::Release),
                outcome = exec.body_mut().on_abort(ctx) => outcome,
            };
            self.on_abort_active.store(false, Ordering::SeqCst);
            outcome
        } else {
            return Ok(());
        };
        match outcome {
            Err(e) if e.is_release() => Err(e),
            Err(e) => {
                warn!(macro_name = %ctx.name(), error = %e, "cancellation handler failed");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn complete(&self, handle: &Arc<MacroHandle>) {
        if let Ok(mut stack) = self.stack.lock() {
            if let Some(i) = stack.iter().rposition(|h| h.info.id == handle.info.id) {
                stack.remove(i);
            }
        }
        self.return_objs(handle.info.id);
        if handle.depth == 0 {
            // nothing outlives the top-level macro
            if let Ok(mut book) = self.reservations.lock() {
                if !book.is_empty() {
                    warn!(devices = book.devices().len(), "dropping reservations of finished macros");
                    book.clear();
                }
            }
        }
        handle.finished.set();
    }

    fn spawn_pass<F>(&self, pass: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let task = rt.spawn(pass);
                if let Ok(mut passes) = self.passes.lock() {
                    passes.push(task);
                }
            }
            Err(_) => warn!("no async runtime, control pass not scheduled"),
        }
    }

    async fn stop_pass(self: Arc<Self>, devices: Vec<Arc<dyn Device>>) {
        for device in devices {
            let name = device.name().to_string();
            tokio::select! {
                biased;
                _ = self.stop_release.wait() => {
                    warn!("stop pass released before completion");
                    break;
                }
                result = device.stop() => match result {
                    Ok(()) => {
                        debug!(device = %name, "stopped");
                        if let Ok(mut stopped) = self.stopped_devices.lock() {
                            stopped.insert(name);
                        }
                    }
                    Err(e) => warn!(device = %name, error = %e, "failed to stop device"),
                },
            }
        }
        self.stop_pass_active.store(false, Ordering::SeqCst);
        self.stop_done.set();
    }

    async fn abort_pass(self: Arc<Self>, devices: Vec<Arc<dyn Device>>) {
        if self.stop_pass_active.load(Ordering::SeqCst) {
            let timeout = self.settings.executor.stop_timeout();
            tokio::select! {
                biased;
                _ = self.abort_release.wait() => return self.end_abort_pass(true),
                done = self.stop_done.wait_timeout(timeout) => {
                    if !done {
                        warn!(timeout_ms = timeout.as_millis() as u64, "stop pass did not finish, escalating");
                    }
                }
            }
        }

        if let Some(top) = self.top() {
            let policy = RetryPolicy::for_abort(&self.settings.executor);
            tokio::select! {
                biased;
                _ = self.abort_release.wait() => return self.end_abort_pass(true),
                _ = top.abort(&policy) => {}
            }
        }

        let stopped = self
            .stopped_devices
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        for device in devices {
            if stopped.contains(device.name()) {
                continue;
            }
            let name = device.name().to_string();
            tokio::select! {
                biased;
                _ = self.abort_release.wait() => return self.end_abort_pass(true),
                result = device.abort() => {
                    if let Err(e) = result {
                        warn!(device = %name, error = %e, "failed to abort device");
                    }
                }
            }
        }
        self.end_abort_pass(false);
    }

    fn end_abort_pass(&self, released: bool) {
        if released {
            warn!("abort pass released before completion");
        }
        self.abort_pass_active.store(false, Ordering::SeqCst);
        self.abort_done.set();
    }
}

/// Runs macros for one control session.
///
/// Cloning yields another handle to the same executor, so control requests
/// can be issued from hooks or other tasks while a macro runs.
#[derive(Clone)]
pub struct MacroExecutor {
    shared: Arc<ExecutorShared>,
}

impl MacroExecutor {
    /// Create an idle executor for `session` over the devices of `pool`.
    pub fn new(
        session: Arc<dyn Session>,
        pool: Arc<DevicePool>,
        catalog: Arc<MacroCatalog>,
        settings: Settings,
    ) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                session,
                pool,
                catalog,
                settings,
                stack: Arc::new(Mutex::new(Vec::new())),
                reservations: Mutex::new(ReservationBook::new()),
                flags: ControlFlags::default(),
                stop_done: Signal::new(),
                abort_done: Signal::new(),
                stop_release: Signal::new(),
                abort_release: Signal::new(),
                on_abort_release: Signal::new(),
                stop_pass_active: AtomicBool::new(false),
                abort_pass_active: AtomicBool::new(false),
                on_abort_active: AtomicBool::new(false),
                stopped_devices: Mutex::new(HashSet::new()),
                passes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Session this executor reports to
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.shared.session
    }

    /// Macro catalog
    pub fn catalog(&self) -> &MacroCatalog {
        &self.shared.catalog
    }

    fn ensure_idle(&self) -> MacroResult<()> {
        match self.shared.top() {
            Some(running) => Err(MacroError::Busy(running.info.line.clone())),
            None => Ok(()),
        }
    }

    /// Prepare a top-level macro. Resets the control flags of the session.
    pub async fn prepare(&self, name: &str, params: Vec<ParamValue>) -> MacroResult<PreparedMacro> {
        self.ensure_idle()?;
        self.shared.reset();
        self.shared.prepare_macro(name, params, None).await
    }

    /// Run a macro returned by [`MacroExecutor::prepare`].
    pub async fn run_prepared(&self, prepared: PreparedMacro) -> MacroResult<Option<ParamValue>> {
        self.ensure_idle()?;
        self.shared.clone().run_prepared(prepared).await
    }

    /// Prepare and run a top-level macro.
    pub async fn run(&self, name: &str, params: Vec<ParamValue>) -> MacroResult<Option<ParamValue>> {
        let prepared = self.prepare(name, params).await?;
        self.run_prepared(prepared).await
    }

    /// Cooperative stop of the running macro and its devices.
    pub fn stop(&self) {
        info!(depth = self.shared.stack_depth(), "stop requested");
        self.shared.flags.stopped.store(true, Ordering::SeqCst);
        // request_stop force-resumes a parked macro
        self.shared.flags.paused.store(false, Ordering::SeqCst);
        for handle in self.shared.stack_snapshot() {
            handle.request_stop();
        }
        let devices = self.shared.reserved_devices();
        self.shared.stop_done.clear();
        self.shared.stop_release.clear();
        self.shared.stop_pass_active.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.shared.spawn_pass(shared.stop_pass(devices));
    }

    /// Asynchronous abort of the running macro and its devices.
    ///
    /// A paused macro is unparked at once with its pause watchdog armed; the
    /// abort itself is injected by a pass that first waits for an in-flight
    /// stop pass.
    pub fn abort(&self) {
        info!(depth = self.shared.stack_depth(), "abort requested");
        self.shared.flags.aborted.store(true, Ordering::SeqCst);
        self.shared.flags.paused.store(false, Ordering::SeqCst);
        // a parked macro aborts itself if the pass never reaches it
        if let Some(top) = self.shared.top() {
            if top.pause.resume_for_abort() {
                debug!(macro_name = %top.info.name, "unparked for abort");
            }
        }
        if self.shared.stop_pass_active.load(Ordering::SeqCst) {
            self.shared.stop_release.set();
        }
        let devices = self.shared.reserved_devices();
        self.shared.abort_done.clear();
        self.shared.abort_release.clear();
        self.shared.abort_pass_active.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        self.shared.spawn_pass(shared.abort_pass(devices));
    }

    /// Pause the running macro at its next checkpoint.
    ///
    /// Returns `false` when nothing is running.
    pub fn pause(&self) -> bool {
        let Some(top) = self.shared.top() else {
            return false;
        };
        info!(macro_name = %top.info.name, "pause requested");
        self.shared.flags.paused.store(true, Ordering::SeqCst);
        let callback = self.status_callback(&top, MacroState::Paused, StatusKind::Pause);
        top.pause.pause(Some(callback));
        true
    }

    /// Resume a paused macro.
    ///
    /// Returns `false` when the running macro is not paused.
    pub fn resume(&self) -> bool {
        let Some(top) = self.shared.top() else {
            return false;
        };
        let callback = self.status_callback(&top, MacroState::Running, StatusKind::Resume);
        let resumed = top.pause.resume(Some(callback));
        if resumed {
            info!(macro_name = %top.info.name, "resume requested");
            self.shared.flags.paused.store(false, Ordering::SeqCst);
        }
        resumed
    }

    fn status_callback(
        &self,
        handle: &MacroHandle,
        state: MacroState,
        kind: StatusKind,
    ) -> PauseCallback {
        let slot = self.shared.slot(handle);
        let session = self.shared.session.clone();
        Arc::new(move || {
            if let Some(h) = slot.get() {
                h.set_state(state);
                session.send_status(h.status_event(kind));
            }
        })
    }

    /// Unblock a stuck on-abort handler, or else a stuck abort pass.
    ///
    /// The abort pass waits for the aborted macro to finish, so it stays
    /// active while the handler runs. Releasing the handler lets the pass go
    /// on to abort the devices; a second call releases the pass itself.
    pub fn release(&self) {
        self.shared.flags.released.store(true, Ordering::SeqCst);
        if self.shared.on_abort_active.load(Ordering::SeqCst)
            && !self.shared.on_abort_release.is_set()
        {
            info!("releasing on-abort handler");
            self.shared.on_abort_release.set();
        } else if self.shared.abort_pass_active.load(Ordering::SeqCst) {
            info!("releasing abort pass");
            self.shared.abort_release.set();
        } else {
            warn!("release requested but nothing is blocked");
        }
    }

    /// Wait for every scheduled stop/abort pass to complete.
    pub async fn wait_passes(&self) {
        let passes: Vec<JoinHandle<()>> = self
            .shared
            .passes
            .lock()
            .map(|mut p| p.drain(..).collect())
            .unwrap_or_default();
        for pass in passes {
            if let Err(e) = pass.await {
                warn!(error = %e, "control pass panicked");
            }
        }
    }

    /// Reserve `device_name` for the macro `macro_id`.
    pub fn reserve_obj(&self, device_name: &str, macro_id: Uuid, priority: bool) -> MacroResult<()> {
        let device = self.shared.pool.device(device_name)?;
        self.shared.reserve_obj(device, macro_id, priority);
        Ok(())
    }

    /// Release one reservation.
    pub fn return_obj(&self, device_name: &str, macro_id: Uuid) {
        self.shared.return_obj(device_name, macro_id);
    }

    /// Release every reservation of `macro_id`.
    pub fn return_objs(&self, macro_id: Uuid) {
        self.shared.return_objs(macro_id);
    }

    /// Devices reserved by `macro_id`
    pub fn reserved_by(&self, macro_id: Uuid) -> Vec<String> {
        self.shared
            .reservations
            .lock()
            .map(|book| book.devices_of(macro_id))
            .unwrap_or_default()
    }

    /// Macros holding a reservation on `device_name`, first holder first
    pub fn holders(&self, device_name: &str) -> Vec<Uuid> {
        self.shared
            .reservations
            .lock()
            .map(|book| book.holders(device_name))
            .unwrap_or_default()
    }

    /// Identity of the running (top-of-stack) macro
    pub fn running_macro(&self) -> Option<MacroInfo> {
        self.shared.top().map(|h| h.info.clone())
    }

    /// Identity of the parent of the running macro
    pub fn running_parent(&self) -> Option<MacroInfo> {
        let top = self.shared.top()?;
        self.shared.parent_of(&top).map(|h| h.info.clone())
    }

    /// Number of macros on the stack
    pub fn stack_depth(&self) -> usize {
        self.shared.stack_depth()
    }

    /// True between `pause()` and `resume()`
    pub fn is_paused(&self) -> bool {
        self.shared.flags.paused.load(Ordering::SeqCst)
    }

    /// True once `stop()` was called in the current run
    pub fn is_stopped(&self) -> bool {
        self.shared.flags.stopped.load(Ordering::SeqCst)
    }

    /// True once `abort()` was called in the current run
    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// True once `release()` was called in the current run
    pub fn is_released(&self) -> bool {
        self.shared.flags.released.load(Ordering::SeqCst)
    }
}
