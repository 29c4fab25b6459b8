//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotor` - Simulated axis with velocity, ramps, limits and stop/abort
//! - `MockCounter` - Simulated measurement group with software counts and
//!   hardware-timed bursts pushed to buffer subscribers
//!
//! # Performance Characteristics
//!
//! - MockMotor: 1000 units/sec, 10ms ramps, 5ms position update tick
//! - MockCounter: software counts last exactly the integration time

use super::{
    Acquirable, BufferEvent, BufferSender, CountHandle, Device, DeviceState, MotionOutcome,
    MoveHandle, Moveable, SubscriptionId, ValueBuffer, ValueMap, ValueRefBuffer,
};
use crate::scan::secs;
use crate::scan::synch::SynchDescription;
use crate::signal::Signal;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const TICK: Duration = Duration::from_millis(5);

fn lock_err<T>(_: T) -> anyhow::Error {
    anyhow!("mock device state poisoned")
}

// =============================================================================
// MockMotor - Simulated Motion Axis
// =============================================================================

#[derive(Debug)]
struct MotorState {
    position: f64,
    velocity: f64,
    acceleration: f64,
    deceleration: f64,
    active_move: u64,
    last_state: DeviceState,
    fail_next_move: bool,
}

/// Mock motion axis with realistic timing
///
/// A move of distance `d` lasts `|d| / velocity + acceleration` seconds. The
/// position is updated every 5ms so it can be sampled mid-move.
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::new("mot01");
/// let handle = motor.begin_move(10.0).await?;
/// let outcome = motor.wait_ready(handle, None).await?;
/// assert_eq!(outcome.position, 10.0);
/// ```
pub struct MockMotor {
    name: String,
    state: Arc<Mutex<MotorState>>,
    limits: (f64, f64),
    next_move: AtomicU64,
    halted: Arc<AtomicU64>,
    done: Arc<watch::Sender<u64>>,
    velocity_log: Mutex<Vec<f64>>,
    stop_count: AtomicUsize,
    abort_count: AtomicUsize,
    stall_stop: AtomicBool,
}

impl MockMotor {
    /// Create a mock axis at position 0.0
    pub fn new(name: &str) -> Self {
        Self::with_velocity(name, 1000.0)
    }

    /// Create a mock axis with a custom velocity
    pub fn with_velocity(name: &str, velocity: f64) -> Self {
        let (done, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MotorState {
                position: 0.0,
                velocity,
                acceleration: 0.01,
                deceleration: 0.01,
                active_move: 0,
                last_state: DeviceState::On,
                fail_next_move: false,
            })),
            limits: (f64::NEG_INFINITY, f64::INFINITY),
            next_move: AtomicU64::new(1),
            halted: Arc::new(AtomicU64::new(0)),
            done: Arc::new(done),
            velocity_log: Mutex::new(Vec::new()),
            stop_count: AtomicUsize::new(0),
            abort_count: AtomicUsize::new(0),
            stall_stop: AtomicBool::new(false),
        }
    }

    /// Make every later `stop()` hang without halting the axis
    pub fn stall_stop(&self) {
        self.stall_stop.store(true, Ordering::SeqCst);
    }

    /// Restrict the travel range. Moves beyond it end in `Alarm` at the limit.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = (min, max);
        self
    }

    /// Place the axis without moving it
    pub fn set_position(&self, position: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.position = position;
        }
    }

    /// Make the next move stop halfway in `Alarm`
    pub fn fail_next_move(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_move = true;
        }
    }

    /// Every velocity written with `set_velocity`, in order
    pub fn velocity_log(&self) -> Vec<f64> {
        self.velocity_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of `stop()` calls received
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Number of `abort()` calls received
    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    fn halt_active(&self) {
        if let Ok(state) = self.state.lock() {
            self.halted.fetch_max(state.active_move, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Device for MockMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        if self.stall_stop.load(Ordering::SeqCst) {
            debug!(motor = %self.name, "stop stalled");
            futures::future::pending::<()>().await;
        }
        debug!(motor = %self.name, "stop");
        self.halt_active();
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        debug!(motor = %self.name, "abort");
        self.halt_active();
        Ok(())
    }
}

#[async_trait]
impl Moveable for MockMotor {
    async fn begin_move(&self, target: f64) -> Result<MoveHandle> {
        let id = self.next_move.fetch_add(1, Ordering::SeqCst);
        let (start, velocity, accel, fail) = {
            let mut state = self.state.lock().map_err(lock_err)?;
            // a new move supersedes the one in flight
            self.halted.fetch_max(state.active_move, Ordering::SeqCst);
            state.active_move = id;
            state.last_state = DeviceState::Moving;
            let fail = std::mem::take(&mut state.fail_next_move);
            (state.position, state.velocity, state.acceleration, fail)
        };
        if velocity <= 0.0 {
            bail!("{}: velocity must be positive, got {}", self.name, velocity);
        }

        let clipped = target.clamp(self.limits.0, self.limits.1);
        let mut end_state = if clipped != target {
            DeviceState::Alarm
        } else {
            DeviceState::On
        };
        let mut goal = clipped;
        if fail {
            goal = start + (clipped - start) / 2.0;
            end_state = DeviceState::Alarm;
        }

        let distance = goal - start;
        let duration = distance.abs() / velocity + if distance == 0.0 { 0.0 } else { accel };
        debug!(
            motor = %self.name,
            from = start,
            to = goal,
            duration_ms = (duration * 1000.0) as u64,
            "moving"
        );

        let state = self.state.clone();
        let halted = self.halted.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            let began = Instant::now();
            let mut final_state = end_state;
            loop {
                let frac = if duration > 0.0 {
                    (began.elapsed().as_secs_f64() / duration).min(1.0)
                } else {
                    1.0
                };
                if let Ok(mut s) = state.lock() {
                    if s.active_move == id {
                        s.position = if frac >= 1.0 {
                            goal
                        } else {
                            start + distance * frac
                        };
                    }
                }
                if frac >= 1.0 {
                    break;
                }
                if halted.load(Ordering::SeqCst) >= id {
                    final_state = DeviceState::On;
                    break;
                }
                sleep(TICK).await;
            }
            if let Ok(mut s) = state.lock() {
                if s.active_move == id {
                    s.last_state = final_state;
                }
            }
            done.send_modify(|last| *last = (*last).max(id));
        });
        Ok(MoveHandle(id))
    }

    async fn wait_ready(&self, handle: MoveHandle, timeout: Option<Duration>) -> Result<MotionOutcome> {
        let mut rx = self.done.subscribe();
        let settled = async {
            loop {
                if *rx.borrow_and_update() >= handle.0 {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(anyhow!("{}: motion task vanished", self.name));
                }
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, settled)
                .await
                .map_err(|_| anyhow!("{}: motion did not finish within {:?}", self.name, t))??,
            None => settled.await?,
        }
        let state = self.state.lock().map_err(lock_err)?;
        let outcome_state = if state.active_move == handle.0 {
            state.last_state
        } else {
            DeviceState::On
        };
        Ok(MotionOutcome {
            state: outcome_state,
            position: state.position,
        })
    }

    async fn read_position(&self, _force: bool) -> Result<f64> {
        Ok(self.state.lock().map_err(lock_err)?.position)
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(self.state.lock().map_err(lock_err)?.velocity)
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if velocity <= 0.0 {
            bail!("{}: velocity must be positive, got {}", self.name, velocity);
        }
        self.state.lock().map_err(lock_err)?.velocity = velocity;
        if let Ok(mut log) = self.velocity_log.lock() {
            log.push(velocity);
        }
        Ok(())
    }

    async fn acceleration(&self) -> Result<f64> {
        Ok(self.state.lock().map_err(lock_err)?.acceleration)
    }

    async fn set_acceleration(&self, acceleration: f64) -> Result<()> {
        self.state.lock().map_err(lock_err)?.acceleration = acceleration.max(0.0);
        Ok(())
    }

    async fn deceleration(&self) -> Result<f64> {
        Ok(self.state.lock().map_err(lock_err)?.deceleration)
    }

    async fn set_deceleration(&self, deceleration: f64) -> Result<()> {
        self.state.lock().map_err(lock_err)?.deceleration = deceleration.max(0.0);
        Ok(())
    }

    fn limits(&self) -> (f64, f64) {
        self.limits
    }
}

// =============================================================================
// MockCounter - Simulated Measurement Group
// =============================================================================

#[derive(Default)]
struct CounterState {
    synch: SynchDescription,
    prepared_integ: f64,
    samples: usize,
    value_subscribers: HashMap<u64, BufferSender>,
    ref_subscribers: HashMap<u64, BufferSender>,
    dropped: BTreeSet<usize>,
    pending: HashMap<u64, JoinHandle<Result<ValueMap>>>,
}

/// Mock measurement group
///
/// Channel `i` (0-based) reads `(n + 1) * (i + 1)` for sample `n`, where `n`
/// counts software acquisitions or indexes points within a hardware burst.
///
/// # Example
///
/// ```rust,ignore
/// let mg = MockCounter::new("mntgrp01", &["ct01", "ct02"]);
/// let handle = mg.start_count(0.1).await?; // Takes ~100ms
/// let values = mg.wait_count(handle, None).await?;
/// assert_eq!(values["ct02"], 2.0);
/// ```
pub struct MockCounter {
    name: String,
    channels: Vec<String>,
    ref_channel: Option<String>,
    latency: f64,
    state: Arc<Mutex<CounterState>>,
    next_id: AtomicU64,
    halt: Signal,
    acquisitions: Arc<Mutex<Vec<Instant>>>,
    stop_count: AtomicUsize,
    abort_count: AtomicUsize,
}

impl MockCounter {
    /// Create a mock measurement group with the given channels
    pub fn new(name: &str, channels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            ref_channel: None,
            latency: 0.001,
            state: Arc::new(Mutex::new(CounterState::default())),
            next_id: AtomicU64::new(1),
            halt: Signal::new(),
            acquisitions: Arc::new(Mutex::new(Vec::new())),
            stop_count: AtomicUsize::new(0),
            abort_count: AtomicUsize::new(0),
        }
    }

    /// Dead time reported by `latency_time`
    pub fn with_latency(mut self, latency: f64) -> Self {
        self.latency = latency;
        self
    }

    /// Publish a value reference (a fake image file name) per burst point
    pub fn with_ref_channel(mut self, channel: &str) -> Self {
        self.ref_channel = Some(channel.to_string());
        self
    }

    /// Hardware bursts will not report these point indices
    pub fn drop_points(&self, indices: &[usize]) {
        if let Ok(mut state) = self.state.lock() {
            state.dropped.extend(indices.iter().copied());
        }
    }

    /// Start instants of every acquisition, in order
    pub fn acquisition_log(&self) -> Vec<Instant> {
        self.acquisitions
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Number of `stop()` calls received
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Number of `abort()` calls received
    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    /// Number of active value and value-ref subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.value_subscribers.len() + s.ref_subscribers.len())
            .unwrap_or_default()
    }

    fn values_for(&self, sample: usize) -> ValueMap {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (ch.clone(), ((sample + 1) * (i + 1)) as f64))
            .collect()
    }

    fn record_start(&self) {
        if let Ok(mut log) = self.acquisitions.lock() {
            log.push(Instant::now());
        }
    }

    fn spawn_burst(&self, synch: SynchDescription) -> Result<JoinHandle<Result<ValueMap>>> {
        let (values_subs, ref_subs, dropped) = {
            let state = self.state.lock().map_err(lock_err)?;
            (
                state.value_subscribers.values().cloned().collect::<Vec<_>>(),
                state.ref_subscribers.values().cloned().collect::<Vec<_>>(),
                state.dropped.clone(),
            )
        };
        let channels = self.channels.clone();
        let ref_channel = self.ref_channel.clone();
        let halt = self.halt.clone();
        let name = self.name.clone();

        Ok(tokio::spawn(async move {
            let mut last = ValueMap::new();
            let mut index = 0usize;
            for group in &synch.groups {
                if halt.wait_timeout(secs(group.delay.time)).await {
                    debug!(counter = %name, "burst interrupted");
                    return Ok(last);
                }
                for _ in 0..group.repeats {
                    if halt.wait_timeout(secs(group.active.time)).await {
                        debug!(counter = %name, "burst interrupted");
                        return Ok(last);
                    }
                    if !dropped.contains(&index) {
                        for (i, ch) in channels.iter().enumerate() {
                            let value = ((index + 1) * (i + 1)) as f64;
                            last.insert(ch.clone(), value);
                            let event = BufferEvent::Values(ValueBuffer {
                                channel: ch.clone(),
                                indices: vec![index],
                                values: vec![value],
                            });
                            for sub in &values_subs {
                                let _ = sub.send(event.clone());
                            }
                        }
                        if let Some(ref_ch) = &ref_channel {
                            let event = BufferEvent::Refs(ValueRefBuffer {
                                channel: ref_ch.clone(),
                                indices: vec![index],
                                refs: vec![format!("{}_{:04}.h5", name, index)],
                            });
                            for sub in &ref_subs {
                                let _ = sub.send(event.clone());
                            }
                        }
                    }
                    index += 1;
                    let dead = (group.total.time - group.active.time).max(0.0);
                    if halt.wait_timeout(secs(dead)).await {
                        return Ok(last);
                    }
                }
            }
            Ok(last)
        }))
    }
}

#[async_trait]
impl Device for MockCounter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.halt.set();
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.halt.set();
        Ok(())
    }
}

#[async_trait]
impl Acquirable for MockCounter {
    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    async fn prepare(&self, integ_time: f64, _repetitions: usize) -> Result<()> {
        self.state.lock().map_err(lock_err)?.prepared_integ = integ_time;
        Ok(())
    }

    async fn start_count(&self, integ_time: f64) -> Result<CountHandle> {
        if integ_time < 0.0 {
            bail!("{}: negative integration time {}", self.name, integ_time);
        }
        self.halt.clear();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let synch = self.state.lock().map_err(lock_err)?.synch.clone();
        self.record_start();

        let task = if synch.is_empty() {
            let sample = {
                let mut state = self.state.lock().map_err(lock_err)?;
                state.samples += 1;
                state.samples - 1
            };
            let values = self.values_for(sample);
            let halt = self.halt.clone();
            tokio::spawn(async move {
                halt.wait_timeout(secs(integ_time)).await;
                Ok::<_, anyhow::Error>(values)
            })
        } else {
            self.spawn_burst(synch)?
        };
        self.state.lock().map_err(lock_err)?.pending.insert(id, task);
        Ok(CountHandle(id))
    }

    async fn wait_count(&self, handle: CountHandle, timeout: Option<Duration>) -> Result<ValueMap> {
        let task = self
            .state
            .lock()
            .map_err(lock_err)?
            .pending
            .remove(&handle.0)
            .ok_or_else(|| anyhow!("{}: unknown acquisition {:?}", self.name, handle))?;
        let joined = match timeout {
            Some(t) => tokio::time::timeout(t, task)
                .await
                .map_err(|_| anyhow!("{}: acquisition did not finish within {:?}", self.name, t))?,
            None => task.await,
        };
        joined.map_err(|e| anyhow!("{}: acquisition task failed: {}", self.name, e))?
    }

    async fn count_raw(&self) -> Result<ValueMap> {
        let integ = self.state.lock().map_err(lock_err)?.prepared_integ;
        let handle = self.start_count(integ).await?;
        self.wait_count(handle, None).await
    }

    async fn set_synch_description(&self, description: SynchDescription) -> Result<()> {
        self.state.lock().map_err(lock_err)?.synch = description;
        Ok(())
    }

    async fn subscribe_value_buffer(&self, sender: BufferSender) -> Result<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .map_err(lock_err)?
            .value_subscribers
            .insert(id, sender);
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe_value_buffer(&self, id: SubscriptionId) -> Result<()> {
        if self
            .state
            .lock()
            .map_err(lock_err)?
            .value_subscribers
            .remove(&id.0)
            .is_none()
        {
            warn!(counter = %self.name, ?id, "unsubscribe of unknown value buffer subscription");
        }
        Ok(())
    }

    async fn subscribe_value_ref_buffer(&self, sender: BufferSender) -> Result<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .map_err(lock_err)?
            .ref_subscribers
            .insert(id, sender);
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe_value_ref_buffer(&self, id: SubscriptionId) -> Result<()> {
        self.state
            .lock()
            .map_err(lock_err)?
            .ref_subscribers
            .remove(&id.0);
        Ok(())
    }

    async fn latency_time(&self) -> Result<f64> {
        Ok(self.latency)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mock_motor_absolute_move() {
        let motor = MockMotor::new("mot01");
        assert_eq!(motor.read_position(false).await.unwrap(), 0.0);

        let handle = motor.begin_move(10.0).await.unwrap();
        let outcome = motor.wait_ready(handle, None).await.unwrap();
        assert_eq!(outcome.state, DeviceState::On);
        assert_eq!(outcome.position, 10.0);

        let handle = motor.begin_move(-5.0).await.unwrap();
        let outcome = motor.wait_ready(handle, None).await.unwrap();
        assert_eq!(outcome.position, -5.0);
    }

    #[tokio::test]
    async fn test_mock_motor_position_moves_gradually() {
        let motor = MockMotor::with_velocity("mot01", 100.0);
        let handle = motor.begin_move(10.0).await.unwrap();
        sleep(Duration::from_millis(40)).await;
        let mid = motor.read_position(true).await.unwrap();
        assert!(mid > 0.0 && mid < 10.0, "mid-move position {}", mid);
        motor.wait_ready(handle, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_motor_stop_halts_motion() {
        let motor = MockMotor::with_velocity("mot01", 10.0);
        let handle = motor.begin_move(100.0).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        motor.stop().await.unwrap();
        let outcome = motor.wait_ready(handle, Some(Duration::from_secs(1))).await.unwrap();
        assert!(outcome.position < 100.0);
        assert_eq!(motor.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_motor_limits_and_faults() {
        let motor = MockMotor::new("mot01").with_limits(-1.0, 1.0);
        let handle = motor.begin_move(5.0).await.unwrap();
        let outcome = motor.wait_ready(handle, None).await.unwrap();
        assert_eq!(outcome.state, DeviceState::Alarm);
        assert_eq!(outcome.position, 1.0);

        let motor = MockMotor::new("mot02");
        motor.fail_next_move();
        let handle = motor.begin_move(10.0).await.unwrap();
        let outcome = motor.wait_ready(handle, None).await.unwrap();
        assert_eq!(outcome.state, DeviceState::Alarm);
        assert_eq!(outcome.position, 5.0);
    }

    #[tokio::test]
    async fn test_mock_motor_velocity_log() {
        let motor = MockMotor::new("mot01");
        motor.set_velocity(5.0).await.unwrap();
        motor.set_velocity(50.0).await.unwrap();
        assert!(motor.set_velocity(0.0).await.is_err());
        assert_eq!(motor.velocity_log(), vec![5.0, 50.0]);
    }

    #[tokio::test]
    async fn test_mock_counter_software_count() {
        let mg = MockCounter::new("mntgrp01", &["ct01", "ct02"]);
        let started = Instant::now();
        let handle = mg.start_count(0.05).await.unwrap();
        let values = mg.wait_count(handle, None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(values["ct01"], 1.0);
        assert_eq!(values["ct02"], 2.0);

        let values = {
            mg.prepare(0.0, 1).await.unwrap();
            mg.count_raw().await.unwrap()
        };
        assert_eq!(values["ct01"], 2.0);
        assert_eq!(mg.acquisition_log().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_counter_hardware_burst_pushes_buffers() {
        let mg = MockCounter::new("mntgrp01", &["ct01"]).with_ref_channel("img01");
        mg.drop_points(&[2]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let values_id = mg.subscribe_value_buffer(tx.clone()).await.unwrap();
        let refs_id = mg.subscribe_value_ref_buffer(tx).await.unwrap();
        assert_eq!(mg.subscriber_count(), 2);

        mg.set_synch_description(SynchDescription::time_burst(0.0, 0.005, 0.01, 4))
            .await
            .unwrap();
        let handle = mg.start_count(0.0).await.unwrap();
        mg.wait_count(handle, Some(Duration::from_secs(1))).await.unwrap();

        let mut value_indices = Vec::new();
        let mut refs = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                BufferEvent::Values(buf) => value_indices.extend(buf.indices),
                BufferEvent::Refs(_) => refs += 1,
            }
        }
        assert_eq!(value_indices, vec![0, 1, 3]);
        assert_eq!(refs, 3);

        mg.unsubscribe_value_buffer(values_id).await.unwrap();
        mg.unsubscribe_value_ref_buffer(refs_id).await.unwrap();
        assert_eq!(mg.subscriber_count(), 0);
    }
}
