//! Hook registry.
//!
//! A hook is a callable attached to one or more named extension points
//! ("hints") of a macro. The registry keeps the hooks in one ordered list of
//! `(hook, hints)` pairs and derives a hint index from it. The index is rebuilt
//! from the list on every write and is never patched incrementally.
//!
//! Filing rules:
//! - a hook with no hints is filed under [`NO_HINT`] only;
//! - each hint the macro allows files the hook under that hint, and the hook
//!   is filed once under [`ALL_HOOKS`];
//! - hints the macro does not allow are ignored.

use crate::error::{MacroError, MacroResult};
use crate::macros::MacroContext;
use crate::value::ParamValue;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Bucket holding every hook filed under at least one allowed hint.
pub const ALL_HOOKS: &str = "_ALL_";

/// Bucket holding hooks registered without hints.
pub const NO_HINT: &str = "_NOHINTS_";

/// Callable run at a macro extension point.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Display name, used in logs
    fn name(&self) -> &str;

    /// Run the hook on behalf of the macro owning `ctx`.
    async fn run(&self, ctx: &MacroContext) -> MacroResult<()>;
}

/// Shared hook handle.
pub type HookRef = Arc<dyn Hook>;

type SyncHookFn = dyn Fn(&MacroContext) -> MacroResult<()> + Send + Sync;
type AsyncHookFn = dyn Fn(MacroContext) -> BoxFuture<'static, MacroResult<()>> + Send + Sync;

/// Hook backed by a synchronous closure.
pub struct FnHook {
    name: String,
    f: Box<SyncHookFn>,
}

impl FnHook {
    /// Hook named `name` calling `f` with the hooked macro's context
    pub fn new<F>(name: &str, f: F) -> HookRef
    where
        F: Fn(&MacroContext) -> MacroResult<()> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            f: Box::new(f),
        })
    }
}

#[async_trait]
impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &MacroContext) -> MacroResult<()> {
        (self.f)(ctx)
    }
}

/// Hook backed by an async closure receiving its own context handle.
pub struct AsyncFnHook {
    name: String,
    f: Box<AsyncHookFn>,
}

impl AsyncFnHook {
    /// Hook named `name` awaiting the future `f` returns
    pub fn new<F>(name: &str, f: F) -> HookRef
    where
        F: Fn(MacroContext) -> BoxFuture<'static, MacroResult<()>> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            f: Box::new(f),
        })
    }
}

#[async_trait]
impl Hook for AsyncFnHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &MacroContext) -> MacroResult<()> {
        (self.f)(ctx.clone()).await
    }
}

/// Hook that runs another macro as a child of the hooked one.
pub struct MacroHook {
    name: String,
    macro_name: String,
    params: Vec<ParamValue>,
}

impl MacroHook {
    /// Hook running `macro_name` with `params`; named `macro:<macro_name>`
    pub fn new(macro_name: &str, params: Vec<ParamValue>) -> HookRef {
        Arc::new(Self {
            name: format!("macro:{}", macro_name),
            macro_name: macro_name.to_string(),
            params,
        })
    }
}

#[async_trait]
impl Hook for MacroHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &MacroContext) -> MacroResult<()> {
        ctx.run_macro(&self.macro_name, self.params.clone())
            .await
            .map(|_| ())
    }
}

/// Ordered hook list plus its derived hint index.
#[derive(Clone, Default)]
pub struct HookRegistry {
    allowed: Vec<String>,
    entries: Vec<(HookRef, Vec<String>)>,
    by_hint: HashMap<String, Vec<HookRef>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks: Vec<(&str, &Vec<String>)> = self
            .entries
            .iter()
            .map(|(h, hints)| (h.name(), hints))
            .collect();
        f.debug_struct("HookRegistry")
            .field("allowed", &self.allowed)
            .field("hooks", &hooks)
            .finish()
    }
}

impl HookRegistry {
    /// Registry accepting the given hints
    pub fn new(allowed: &[&str]) -> Self {
        Self {
            allowed: allowed.iter().map(|h| h.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Hints this registry files hooks under
    pub fn allowed_hints(&self) -> &[String] {
        &self.allowed
    }

    /// Append a hook at the end of the ordered list.
    pub fn append_hook(&mut self, hook: HookRef, hints: &[&str]) {
        self.entries
            .push((hook, hints.iter().map(|h| h.to_string()).collect()));
        self.rebuild_index();
    }

    /// Replace the whole list.
    ///
    /// Rejects empty hint strings and the reserved bucket names; on error the
    /// registry is left unchanged.
    pub fn set_hooks(&mut self, hooks: Vec<(HookRef, Vec<String>)>) -> MacroResult<()> {
        for (hook, hints) in &hooks {
            for hint in hints {
                if hint.is_empty() || hint == ALL_HOOKS || hint == NO_HINT {
                    return Err(MacroError::InvalidHook(format!(
                        "hook '{}' has invalid hint '{}'",
                        hook.name(),
                        hint
                    )));
                }
            }
        }
        self.entries = hooks;
        self.rebuild_index();
        Ok(())
    }

    /// The ordered `(hook, hints)` list
    pub fn entries(&self) -> &[(HookRef, Vec<String>)] {
        &self.entries
    }

    /// Hooks filed under `hint`, or every hook in list order for `None`.
    pub fn hooks(&self, hint: Option<&str>) -> Vec<HookRef> {
        match hint {
            None => self.entries.iter().map(|(h, _)| h.clone()).collect(),
            Some(hint) => self.by_hint.get(hint).cloned().unwrap_or_default(),
        }
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recompute the hint index from the ordered list.
    pub fn rebuild_index(&mut self) {
        let mut by_hint: HashMap<String, Vec<HookRef>> = HashMap::new();
        for (hook, hints) in &self.entries {
            if hints.is_empty() {
                by_hint
                    .entry(NO_HINT.to_string())
                    .or_default()
                    .push(hook.clone());
                continue;
            }
            let mut filed = false;
            for hint in hints {
                if !self.allowed.iter().any(|a| a == hint) {
                    debug!(hook = hook.name(), hint = %hint, "hint not allowed, ignored");
                    continue;
                }
                by_hint.entry(hint.clone()).or_default().push(hook.clone());
                filed = true;
            }
            if filed {
                by_hint
                    .entry(ALL_HOOKS.to_string())
                    .or_default()
                    .push(hook.clone());
            }
        }
        self.by_hint = by_hint;
    }
}
