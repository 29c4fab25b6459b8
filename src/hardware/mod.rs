//! Device collaborator interfaces.
//!
//! The macro server never talks to hardware directly. Motors and acquisition
//! targets live behind these traits; the transport layer (serial, VISA, a
//! remote pool) is an implementation detail of the driver.
//!
//! ## Motion
//! - Moves are two-phase: [`Moveable::begin_move`] returns a handle
//!   immediately and [`Moveable::wait_ready`] blocks until the axis settles.
//! - Acceleration and deceleration are expressed as *times* (seconds to reach
//!   or leave the configured velocity), matching how controllers expose them.
//!
//! ## Acquisition
//! - Software-timed counts: `start_count(integ_time)` + `wait_count`.
//! - Hardware-timed bursts: `set_synch_description` then `start_count`; the
//!   driver pushes [`BufferEvent`]s to its subscribers as samples arrive.

use crate::scan::synch::SynchDescription;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod mock;
pub mod pool;

pub use pool::DevicePool;

/// Channel name to value, ordered for stable record layout.
pub type ValueMap = BTreeMap<String, f64>;

/// Device state as reported after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Idle and ready
    On,
    /// Motion or acquisition in progress
    Moving,
    /// Limit switch or soft limit reached
    Alarm,
    /// Hardware error
    Fault,
}

impl DeviceState {
    /// Worst of two states, used to aggregate a group of axes.
    pub fn worst(self, other: DeviceState) -> DeviceState {
        fn rank(s: DeviceState) -> u8 {
            match s {
                DeviceState::On => 0,
                DeviceState::Moving => 1,
                DeviceState::Alarm => 2,
                DeviceState::Fault => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

/// Handle of a motion started with [`Moveable::begin_move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MoveHandle(pub u64);

/// Handle of an acquisition started with [`Acquirable::start_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountHandle(pub u64);

/// Handle of a buffer subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Final state and position of a motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionOutcome {
    /// State after the axis settled
    pub state: DeviceState,
    /// Position after the axis settled
    pub position: f64,
}

/// Newly available samples of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBuffer {
    /// Channel name
    pub channel: String,
    /// Point indices of the samples
    pub indices: Vec<usize>,
    /// Sample values, parallel to `indices`
    pub values: Vec<f64>,
}

/// Newly available references (e.g. image file names) of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRefBuffer {
    /// Channel name
    pub channel: String,
    /// Point indices of the references
    pub indices: Vec<usize>,
    /// References, parallel to `indices`
    pub refs: Vec<String>,
}

/// Push notification delivered to buffer subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// Value samples
    Values(ValueBuffer),
    /// Value references
    Refs(ValueRefBuffer),
}

/// Sender half handed to an acquisition driver when subscribing.
pub type BufferSender = mpsc::UnboundedSender<BufferEvent>;

/// Anything that can be reserved by a macro and told to stop or abort.
#[async_trait]
pub trait Device: Send + Sync {
    /// Unique device name
    fn name(&self) -> &str;

    /// Controlled stop (decelerate, finish current acquisition)
    async fn stop(&self) -> Result<()>;

    /// Immediate abort
    async fn abort(&self) -> Result<()>;
}

/// Single motion axis.
#[async_trait]
pub trait Moveable: Device {
    /// Start moving to `target`; returns before the motion completes.
    async fn begin_move(&self, target: f64) -> Result<MoveHandle>;

    /// Wait until the motion identified by `handle` has settled.
    async fn wait_ready(&self, handle: MoveHandle, timeout: Option<Duration>) -> Result<MotionOutcome>;

    /// Read the current position. `force` bypasses any driver cache.
    async fn read_position(&self, force: bool) -> Result<f64>;

    /// Configured velocity in units/second
    async fn velocity(&self) -> Result<f64>;

    /// Set velocity in units/second
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Acceleration time in seconds
    async fn acceleration(&self) -> Result<f64>;

    /// Set acceleration time in seconds
    async fn set_acceleration(&self, acceleration: f64) -> Result<()>;

    /// Deceleration time in seconds
    async fn deceleration(&self) -> Result<f64>;

    /// Set deceleration time in seconds
    async fn set_deceleration(&self, deceleration: f64) -> Result<()>;

    /// Velocity at which the ramp starts
    async fn base_rate(&self) -> Result<f64> {
        Ok(0.0)
    }

    /// Soft limits (min, max)
    fn limits(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }
}

/// Acquisition target (a measurement group of one or more channels).
#[async_trait]
pub trait Acquirable: Device {
    /// Channel names, in record order
    fn channels(&self) -> Vec<String>;

    /// Pre-configure `repetitions` acquisitions of `integ_time` for raw counts.
    async fn prepare(&self, integ_time: f64, repetitions: usize) -> Result<()>;

    /// Start one acquisition. With a non-empty synchronization description
    /// the acquisition is hardware-timed and `integ_time` is ignored.
    async fn start_count(&self, integ_time: f64) -> Result<CountHandle>;

    /// Wait for the acquisition and return the last value of every channel.
    async fn wait_count(&self, handle: CountHandle, timeout: Option<Duration>) -> Result<ValueMap>;

    /// Acquire once with the configuration given to `prepare`.
    async fn count_raw(&self) -> Result<ValueMap>;

    /// Install the synchronization description for the next acquisition.
    async fn set_synch_description(&self, description: SynchDescription) -> Result<()>;

    /// Subscribe to value buffer pushes.
    async fn subscribe_value_buffer(&self, sender: BufferSender) -> Result<SubscriptionId>;

    /// Cancel a value buffer subscription.
    async fn unsubscribe_value_buffer(&self, id: SubscriptionId) -> Result<()>;

    /// Subscribe to value reference buffer pushes.
    async fn subscribe_value_ref_buffer(&self, sender: BufferSender) -> Result<SubscriptionId>;

    /// Cancel a value reference buffer subscription.
    async fn unsubscribe_value_ref_buffer(&self, id: SubscriptionId) -> Result<()>;

    /// Minimum dead time between two hardware-timed acquisitions, in seconds
    async fn latency_time(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_state() {
        assert_eq!(DeviceState::On.worst(DeviceState::Alarm), DeviceState::Alarm);
        assert_eq!(DeviceState::Fault.worst(DeviceState::Moving), DeviceState::Fault);
        assert_eq!(DeviceState::On.worst(DeviceState::On), DeviceState::On);
    }
}
