//! API surface handed to running macros.

use super::{MacroHandle, MacroInfo, PreparedMacro, StatusKind};
use crate::config::Settings;
use crate::error::{MacroError, MacroResult};
use crate::executor::ExecutorShared;
use crate::hardware::{Acquirable, Moveable};
use crate::hooks::HookRef;
use crate::session::{OutputLevel, Session};
use crate::value::ParamValue;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Environment variable naming the default acquisition target.
pub const ACTIVE_MNTGRP: &str = "ActiveMntGrp";

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Handle a macro body uses to reach devices, environment, output and
/// child macros.
///
/// Every call is a cancellation boundary: a pending stop or abort is raised
/// before the call starts and again after it returns. Calls that block race
/// the macro's abort signal.
#[derive(Clone)]
pub struct MacroContext {
    handle: Arc<MacroHandle>,
    shared: Arc<ExecutorShared>,
}

impl std::fmt::Debug for MacroContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroContext")
            .field("macro", &self.handle.info.name)
            .field("depth", &self.handle.depth)
            .finish()
    }
}

impl MacroContext {
    pub(crate) fn new(handle: Arc<MacroHandle>, shared: Arc<ExecutorShared>) -> Self {
        Self { handle, shared }
    }

    /// Runtime handle of the calling macro
    pub fn handle(&self) -> &Arc<MacroHandle> {
        &self.handle
    }

    /// Identity of the calling macro
    pub fn macro_info(&self) -> &MacroInfo {
        &self.handle.info
    }

    /// Name of the calling macro
    pub fn name(&self) -> &str {
        &self.handle.info.name
    }

    /// Server settings
    pub fn settings(&self) -> &Settings {
        self.shared.settings()
    }

    /// Session the macro runs in
    pub fn session(&self) -> &Arc<dyn Session> {
        self.shared.session()
    }

    /// True once a stop was requested for this macro
    pub fn is_stop_requested(&self) -> bool {
        self.handle.is_stop_requested()
    }

    fn check(&self) -> MacroResult<()> {
        if self.shared.is_aborted() && !self.handle.is_aborted() {
            self.handle.aborted.set();
        }
        self.handle.check_cancel()
    }

    /// Run `fut` between two cancellation checks, racing the abort signal.
    pub async fn guarded<T, F>(&self, fut: F) -> MacroResult<T>
    where
        F: Future<Output = MacroResult<T>>,
    {
        self.check()?;
        let out = self.interruptible(fut).await?;
        self.check()?;
        Ok(out)
    }

    /// Run `fut`, giving up on it when the macro is aborted.
    ///
    /// Once an abort has been raised the future runs to completion: cleanup
    /// after an abort is not interrupted again.
    pub async fn interruptible<T, F>(&self, fut: F) -> MacroResult<T>
    where
        F: Future<Output = MacroResult<T>>,
    {
        if self.handle.abort_raised() {
            return fut.await;
        }
        tokio::select! {
            biased;
            _ = self.handle.aborted.wait() => {
                self.handle.note_error(&MacroError::Abort);
                Err(MacroError::Abort)
            }
            out = fut => out,
        }
    }

    /// Interruptible device call
    pub async fn device_call<T, F>(&self, fut: F) -> MacroResult<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.interruptible(async { fut.await.map_err(MacroError::from) })
            .await
    }

    fn sync_guarded<T>(&self, f: impl FnOnce() -> T) -> MacroResult<T> {
        self.check()?;
        let out = f();
        self.check()?;
        Ok(out)
    }

    /// Cooperative pause point: raises pending cancellations and parks while
    /// the macro is paused.
    pub async fn checkpoint(&self) -> MacroResult<()> {
        self.check()?;
        if !self.handle.abort_raised() {
            if let Err(err) = self.handle.pause.wait(None, &self.handle.aborted).await {
                self.handle.note_error(&err);
                return Err(err);
            }
        }
        self.check()
    }

    fn emit(&self, level: OutputLevel, message: &str) {
        let name = self.name();
        match level {
            OutputLevel::Debug => debug!(macro_name = %name, "{}", message),
            OutputLevel::Info | OutputLevel::Output => info!(macro_name = %name, "{}", message),
            OutputLevel::Warning => warn!(macro_name = %name, "{}", message),
            OutputLevel::Error => error!(macro_name = %name, "{}", message),
        }
        self.session().send_output(level, name, message);
    }

    /// User-facing output line
    pub fn output(&self, message: impl AsRef<str>) -> MacroResult<()> {
        self.sync_guarded(|| self.emit(OutputLevel::Output, message.as_ref()))
    }

    pub fn info(&self, message: impl AsRef<str>) -> MacroResult<()> {
        self.sync_guarded(|| self.emit(OutputLevel::Info, message.as_ref()))
    }

    pub fn warning(&self, message: impl AsRef<str>) -> MacroResult<()> {
        self.sync_guarded(|| self.emit(OutputLevel::Warning, message.as_ref()))
    }

    pub fn debug(&self, message: impl AsRef<str>) -> MacroResult<()> {
        self.sync_guarded(|| self.emit(OutputLevel::Debug, message.as_ref()))
    }

    pub fn error(&self, message: impl AsRef<str>) -> MacroResult<()> {
        self.sync_guarded(|| self.emit(OutputLevel::Error, message.as_ref()))
    }

    /// Environment variable as seen by this macro (`macro.name` first).
    pub fn get_env(&self, name: &str) -> MacroResult<Value> {
        self.sync_guarded(|| self.session().get_env_scoped(name, self.name()))?
    }

    /// Environment variable, or `None` when undefined
    pub fn get_env_opt(&self, name: &str) -> MacroResult<Option<Value>> {
        match self.get_env(name) {
            Ok(v) => Ok(Some(v)),
            Err(MacroError::UnknownEnvironment(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_env(&self, name: &str, value: Value) -> MacroResult<()> {
        self.sync_guarded(|| self.session().set_env(name, value))
    }

    /// Look up a motion axis and reserve it for this macro.
    pub fn get_moveable(&self, name: &str) -> MacroResult<Arc<dyn Moveable>> {
        self.check()?;
        let moveable = self.shared.pool().moveable(name)?;
        self.shared
            .reserve_obj(self.shared.pool().device(name)?, self.handle.info.id, false);
        self.check()?;
        Ok(moveable)
    }

    /// Look up an acquisition target and reserve it for this macro.
    pub fn get_acquirable(&self, name: &str) -> MacroResult<Arc<dyn Acquirable>> {
        self.check()?;
        let acquirable = self.shared.pool().acquirable(name)?;
        self.shared
            .reserve_obj(self.shared.pool().device(name)?, self.handle.info.id, false);
        self.check()?;
        Ok(acquirable)
    }

    /// Acquisition target named by the `ActiveMntGrp` environment variable.
    pub fn get_active_acquirable(&self) -> MacroResult<Arc<dyn Acquirable>> {
        let value = self.get_env(ACTIVE_MNTGRP)?;
        let name = value.as_str().ok_or_else(|| {
            MacroError::InvalidParameter(format!("{} must be a device name, got {}", ACTIVE_MNTGRP, value))
        })?;
        self.get_acquirable(name)
    }

    /// Prepare a child macro without running it.
    pub async fn prepare_macro(
        &self,
        name: &str,
        params: Vec<ParamValue>,
    ) -> MacroResult<PreparedMacro> {
        self.check()?;
        let prepared = self
            .shared
            .prepare_macro(name, params, Some(&self.handle))
            .await?;
        self.check()?;
        Ok(prepared)
    }

    /// Run a child macro prepared with [`MacroContext::prepare_macro`].
    pub fn run_prepared(
        &self,
        prepared: PreparedMacro,
    ) -> BoxFuture<'_, MacroResult<Option<ParamValue>>> {
        Box::pin(async move {
            self.check()?;
            // the child races its own abort signal; racing ours would drop it
            // before its teardown ran
            let result = self.shared.clone().run_prepared(prepared).await?;
            self.check()?;
            Ok(result)
        })
    }

    /// Prepare and run a child macro.
    pub fn run_macro<'a>(
        &'a self,
        name: &'a str,
        params: Vec<ParamValue>,
    ) -> BoxFuture<'a, MacroResult<Option<ParamValue>>> {
        Box::pin(async move {
            let prepared = self.prepare_macro(name, params).await?;
            self.run_prepared(prepared).await
        })
    }

    /// Sleep `duration`; a stop is observed every 50ms, an abort at once.
    ///
    /// A duration past the clock's range sleeps until cancelled.
    pub async fn sleep(&self, duration: Duration) -> MacroResult<()> {
        let deadline = Instant::now().checked_add(duration);
        loop {
            self.check()?;
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => SLEEP_SLICE,
            };
            if remaining.is_zero() {
                return Ok(());
            }
            self.interruptible(async {
                tokio::time::sleep(remaining.min(SLEEP_SLICE)).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Hooks registered on this macro under `hint`
    pub fn hooks(&self, hint: &str) -> Vec<HookRef> {
        self.handle.hooks().hooks(Some(hint))
    }

    /// Run every hook registered under `hint`, in registration order.
    pub async fn run_hooks(&self, hint: &str) -> MacroResult<()> {
        let hooks = self.hooks(hint);
        self.run_hook_list(&hooks).await
    }

    /// Run the given hooks in order.
    pub async fn run_hook_list(&self, hooks: &[HookRef]) -> MacroResult<()> {
        for hook in hooks {
            debug!(macro_name = %self.name(), hook = hook.name(), "running hook");
            self.guarded(hook.run(self)).await?;
        }
        Ok(())
    }

    /// Report progress of a one-shot macro.
    pub fn report_progress(&self, step: f64) -> MacroResult<()> {
        self.sync_guarded(|| {
            self.handle.set_step(step);
            self.session()
                .send_status(self.handle.status_event(StatusKind::Step));
        })
    }
}
