//! Device reservations held by running macros.

use crate::hardware::Device;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Two symmetric maps: device to reserving macros, macro to reserved devices.
#[derive(Default)]
pub struct ReservationBook {
    by_device: HashMap<String, Vec<Uuid>>,
    by_macro: Vec<(Uuid, Vec<Arc<dyn Device>>)>,
}

impl std::fmt::Debug for ReservationBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationBook")
            .field("by_device", &self.by_device)
            .field("macros", &self.by_macro.len())
            .finish()
    }
}

impl ReservationBook {
    /// Empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `device` for `macro_id`. Idempotent.
    ///
    /// A `priority` reservation puts the macro's entry first, so its devices
    /// are stopped before those of earlier reservations.
    pub fn reserve(&mut self, device: Arc<dyn Device>, macro_id: Uuid, priority: bool) {
        let holders = self.by_device.entry(device.name().to_string()).or_default();
        if !holders.contains(&macro_id) {
            holders.push(macro_id);
        }

        let slot = match self.by_macro.iter().position(|(id, _)| *id == macro_id) {
            Some(i) if priority && i != 0 => {
                let entry = self.by_macro.remove(i);
                self.by_macro.insert(0, entry);
                0
            }
            Some(i) => i,
            None if priority => {
                self.by_macro.insert(0, (macro_id, Vec::new()));
                0
            }
            None => {
                self.by_macro.push((macro_id, Vec::new()));
                self.by_macro.len() - 1
            }
        };
        let devices = &mut self.by_macro[slot].1;
        if !devices.iter().any(|d| d.name() == device.name()) {
            devices.push(device);
        }
    }

    /// Release one device held by `macro_id`. Idempotent.
    pub fn release(&mut self, device_name: &str, macro_id: Uuid) {
        if let Some(holders) = self.by_device.get_mut(device_name) {
            holders.retain(|id| *id != macro_id);
            if holders.is_empty() {
                self.by_device.remove(device_name);
            }
        }
        if let Some(i) = self.by_macro.iter().position(|(id, _)| *id == macro_id) {
            self.by_macro[i].1.retain(|d| d.name() != device_name);
            if self.by_macro[i].1.is_empty() {
                self.by_macro.remove(i);
            }
        }
    }

    /// Release everything held by `macro_id`. Returns the released names.
    pub fn release_all(&mut self, macro_id: Uuid) -> Vec<String> {
        let Some(i) = self.by_macro.iter().position(|(id, _)| *id == macro_id) else {
            return Vec::new();
        };
        let (_, devices) = self.by_macro.remove(i);
        let names: Vec<String> = devices.iter().map(|d| d.name().to_string()).collect();
        for name in &names {
            if let Some(holders) = self.by_device.get_mut(name) {
                holders.retain(|id| *id != macro_id);
                if holders.is_empty() {
                    self.by_device.remove(name);
                }
            }
        }
        names
    }

    /// Every reserved device once, in reservation order
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for (_, devices) in &self.by_macro {
            for d in devices {
                if !seen.contains(&d.name()) {
                    seen.push(d.name());
                    out.push(d.clone());
                }
            }
        }
        out
    }

    /// Names of the devices reserved by `macro_id`
    pub fn devices_of(&self, macro_id: Uuid) -> Vec<String> {
        self.by_macro
            .iter()
            .find(|(id, _)| *id == macro_id)
            .map(|(_, devices)| devices.iter().map(|d| d.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Macros holding `device_name`
    pub fn holders(&self, device_name: &str) -> Vec<Uuid> {
        self.by_device.get(device_name).cloned().unwrap_or_default()
    }

    /// True when no device is reserved
    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty() && self.by_macro.is_empty()
    }

    /// Drop every reservation.
    pub fn clear(&mut self) {
        self.by_device.clear();
        self.by_macro.clear();
    }
}
