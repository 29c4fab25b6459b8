//! Synchronization description of hardware-timed acquisition bursts.

use serde::{Deserialize, Serialize};

/// Domain in which a synchronization value is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchDomain {
    Time,
    Position,
}

/// A value given in the time domain and, optionally, the position domain.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SynchValue {
    /// Seconds
    pub time: f64,
    /// Position of the master axis, when triggering on position
    pub position: Option<f64>,
}

impl SynchValue {
    /// Time-only value
    pub fn time(time: f64) -> Self {
        Self { time, position: None }
    }

    /// Value in both domains
    pub fn both(time: f64, position: f64) -> Self {
        Self {
            time,
            position: Some(position),
        }
    }

    /// Value in `domain`, if defined
    pub fn get(&self, domain: SynchDomain) -> Option<f64> {
        match domain {
            SynchDomain::Time => Some(self.time),
            SynchDomain::Position => self.position,
        }
    }
}

/// One group of equidistant triggers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynchGroup {
    /// Wait before the first trigger of the group
    pub delay: SynchValue,
    /// Start of the first active window
    pub initial: SynchValue,
    /// Length of each active (integration) window
    pub active: SynchValue,
    /// Distance between consecutive trigger starts
    pub total: SynchValue,
    /// Number of triggers
    pub repeats: usize,
}

/// Ordered trigger groups describing one burst.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SynchDescription {
    pub groups: Vec<SynchGroup>,
}

impl SynchDescription {
    /// Empty description: acquisitions are software-timed.
    pub fn software() -> Self {
        Self::default()
    }

    /// Single group of `repeats` time-domain triggers.
    pub fn time_burst(delay: f64, active: f64, total: f64, repeats: usize) -> Self {
        Self {
            groups: vec![SynchGroup {
                delay: SynchValue::time(delay),
                initial: SynchValue::time(0.0),
                active: SynchValue::time(active),
                total: SynchValue::time(total),
                repeats,
            }],
        }
    }

    /// True when no hardware trigger is described.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.repeats == 0)
    }

    /// Total number of triggers over all groups.
    pub fn total_repeats(&self) -> usize {
        self.groups.iter().map(|g| g.repeats).sum()
    }

    /// Duration of the burst in seconds, delays included.
    pub fn duration(&self) -> f64 {
        self.groups
            .iter()
            .map(|g| g.delay.time + g.total.time * g.repeats as f64)
            .sum()
    }
}
