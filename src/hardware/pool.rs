//! Name-based registry of devices available to macros.

use super::{Acquirable, Device, Moveable};
use crate::error::{MacroError, MacroResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct PoolInner {
    devices: HashMap<String, Arc<dyn Device>>,
    moveables: HashMap<String, Arc<dyn Moveable>>,
    acquirables: HashMap<String, Arc<dyn Acquirable>>,
}

/// Registry of motors and acquisition targets, keyed by device name.
#[derive(Default)]
pub struct DevicePool {
    inner: RwLock<PoolInner>,
}

impl DevicePool {
    /// Creates an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a motion axis under its own name.
    pub fn register_moveable<M: Moveable + 'static>(&self, moveable: Arc<M>) {
        let name = moveable.name().to_string();
        if let Ok(mut inner) = self.inner.write() {
            inner.devices.insert(name.clone(), moveable.clone());
            inner.moveables.insert(name, moveable);
        }
    }

    /// Registers an acquisition target under its own name.
    pub fn register_acquirable<A: Acquirable + 'static>(&self, acquirable: Arc<A>) {
        let name = acquirable.name().to_string();
        if let Ok(mut inner) = self.inner.write() {
            inner.devices.insert(name.clone(), acquirable.clone());
            inner.acquirables.insert(name, acquirable);
        }
    }

    /// Looks up any device.
    pub fn device(&self, name: &str) -> MacroResult<Arc<dyn Device>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.devices.get(name).cloned())
            .ok_or_else(|| MacroError::UnknownDevice(name.to_string()))
    }

    /// Looks up a motion axis.
    pub fn moveable(&self, name: &str) -> MacroResult<Arc<dyn Moveable>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.moveables.get(name).cloned())
            .ok_or_else(|| MacroError::UnknownDevice(name.to_string()))
    }

    /// Looks up an acquisition target.
    pub fn acquirable(&self, name: &str) -> MacroResult<Arc<dyn Acquirable>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.acquirables.get(name).cloned())
            .ok_or_else(|| MacroError::UnknownDevice(name.to_string()))
    }

    /// Sorted names of all registered devices.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .map(|inner| inner.devices.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCounter, MockMotor};

    #[test]
    fn test_lookup_by_kind() {
        let pool = DevicePool::new();
        pool.register_moveable(Arc::new(MockMotor::new("mot01")));
        pool.register_acquirable(Arc::new(MockCounter::new("mntgrp01", &["ct01"])));

        assert!(pool.moveable("mot01").is_ok());
        assert!(pool.acquirable("mntgrp01").is_ok());
        assert!(pool.device("mot01").is_ok());
        assert!(matches!(
            pool.moveable("mntgrp01"),
            Err(MacroError::UnknownDevice(_))
        ));
        assert_eq!(pool.names(), vec!["mntgrp01".to_string(), "mot01".to_string()]);
    }
}
