//! Software-timed continuous scan.
//!
//! Two cooperating drivers run over every leg:
//! - the motion driver moves every axis to its window start at its normal
//!   velocity, arms the coordinated cruise velocities, starts the move to the
//!   window end and then publishes the [`CruiseWindow`];
//! - the acquisition driver waits for the window, sleeps until it opens and
//!   acquires back to back until the remaining cruise time cannot fit
//!   another acquisition.
//!
//! Pre-move hooks run before each leg and post-move hooks once its cruise is
//! over. The axes overshoot the leg end by their deceleration distance; see
//! [`super::waypoint`] for how the overshoot is taken back.

use super::core::{Estimate, ScanCore, ScanLoop, POST_MOVE, PRE_MOVE};
use super::motion::{coordinate, MotionPath};
use super::record::Record;
use super::secs;
use super::synch::SynchDescription;
use super::waypoint::{self, Waypoint};
use crate::error::{MacroError, MacroResult};
use crate::hardware::{DeviceState, Moveable};
use crate::macros::{MacroContext, MacroState};
use crate::signal::Signal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Constant-velocity part of a leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CruiseWindow {
    pub start: Instant,
    pub end: Instant,
}

/// Software-timed continuous scan through a list of legs.
pub struct ContinuousScan {
    waypoints: Vec<Waypoint>,
    integ_time: f64,
    slow_down: f64,
    velocities: Vec<f64>,
    paths: Vec<MotionPath>,
    next: usize,
    /// Leg whose end the axes were last sent past
    overshot: Option<usize>,
}

impl ContinuousScan {
    /// `velocities` feed the duration estimate only, one per axis.
    pub fn new(waypoints: Vec<Waypoint>, integ_time: f64, slow_down: f64, velocities: Vec<f64>) -> Self {
        Self {
            waypoints,
            integ_time,
            slow_down,
            velocities,
            paths: Vec::new(),
            next: 0,
            overshot: None,
        }
    }

    fn cruise_estimate(&self) -> f64 {
        self.waypoints
            .iter()
            .map(|wp| {
                let mut paths: Vec<MotionPath> = wp
                    .starts
                    .iter()
                    .zip(&wp.finals)
                    .zip(&self.velocities)
                    .map(|((s, f), v)| MotionPath::new("", *s, *f, *v, 0.0, 0.0))
                    .collect();
                coordinate(&mut paths, self.slow_down)
            })
            .sum()
    }

    /// Build and coordinate the motion paths of a leg.
    async fn plan(&mut self, ctx: &MacroContext, core: &ScanCore, waypoint: &Waypoint) -> MacroResult<f64> {
        let mut paths = waypoint::leg_paths(ctx, core, waypoint).await?;
        let cruise = coordinate(&mut paths, self.slow_down);
        if !cruise.is_finite() || cruise <= 0.0 {
            return Err(MacroError::ScanSetup(
                "continuous scan needs at least one moving axis with a positive velocity".into(),
            ));
        }
        waypoint::check_limits(core.motion.motors(), &paths)?;
        self.paths = paths;
        Ok(cruise)
    }
}

pub(crate) async fn drive_motion(
    ctx: &MacroContext,
    motors: &[Arc<dyn Moveable>],
    paths: &[MotionPath],
    cruise: f64,
    cruise_tx: watch::Sender<Option<CruiseWindow>>,
    finished: &Signal,
    timeout: Duration,
) -> MacroResult<f64> {
    let began = Instant::now();
    let result = async {
        let mut handles = Vec::with_capacity(motors.len());
        for (motor, path) in motors.iter().zip(paths).filter(|(_, p)| !p.is_still()) {
            handles.push((motor, ctx.device_call(motor.begin_move(path.post_end())).await?));
        }
        let accel = paths.iter().map(|p| p.accel_time).fold(0.0, f64::max);
        let start = Instant::now() + secs(accel);
        let window = CruiseWindow {
            start,
            end: start + secs(cruise),
        };
        // receivers may be gone when acquisition already failed
        let _ = cruise_tx.send(Some(window));
        debug!(cruise_s = cruise, "cruise window published");

        let mut state = DeviceState::On;
        for (motor, handle) in handles {
            let outcome = ctx.device_call(motor.wait_ready(handle, Some(timeout))).await?;
            state = state.worst(outcome.state);
        }
        if state != DeviceState::On {
            return Err(MacroError::Scan(format!(
                "continuous motion ended in state {:?}",
                state
            )));
        }
        Ok(())
    }
    .await;
    finished.set();
    result.map(|_| began.elapsed().as_secs_f64())
}

async fn drive_acquisition(
    ctx: &MacroContext,
    core: &mut ScanCore,
    integ_time: f64,
    latency: f64,
    mut cruise_rx: watch::Receiver<Option<CruiseWindow>>,
    finished: &Signal,
) -> MacroResult<usize> {
    let window = ctx
        .interruptible(async {
            loop {
                let current = *cruise_rx.borrow_and_update();
                if current.is_some() {
                    return Ok(current);
                }
                if cruise_rx.changed().await.is_err() {
                    return Ok(None);
                }
            }
        })
        .await?;
    let Some(window) = window else {
        return Ok(0);
    };
    ctx.sleep(window.start.saturating_duration_since(Instant::now()))
        .await?;

    let slot = secs(integ_time + latency);
    let mut acquired = 0;
    let mut point_nb = core.data.len();
    while !finished.is_set() && Instant::now() + slot <= window.end {
        let dt = core.elapsed();
        let positions = core.motion.read_positions(ctx, true).await?;
        let values = core.acquire(ctx, integ_time, false).await?;
        let mut record = Record::new(point_nb, dt);
        record.positions = core.motion.names().into_iter().zip(positions).collect();
        record.values = values;
        record.extras = core.read_extras(ctx).await?;
        core.add_record(record).await?;
        point_nb += 1;
        acquired += 1;
    }
    Ok(acquired)
}

#[async_trait]
impl ScanLoop for ContinuousScan {
    fn range(&self) -> (f64, f64) {
        (0.0, self.waypoints.len() as f64)
    }

    fn estimate(&self, _core: &ScanCore) -> Estimate {
        let cruise = self.cruise_estimate();
        Estimate {
            motion_time: cruise,
            acq_time: cruise,
        }
    }

    async fn scan_step(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>> {
        let Some(waypoint) = self.waypoints.get(self.next).cloned() else {
            return Ok(None);
        };
        let leg = self.next;
        self.next += 1;

        let acq = core.acq.clone();
        if leg == 0 {
            ctx.device_call(acq.set_synch_description(SynchDescription::software()))
                .await?;
        } else {
            ctx.guarded(core.apply_original_motion()).await?;
        }
        let latency = ctx.device_call(acq.latency_time()).await?;
        ctx.run_hooks(PRE_MOVE).await?;
        let cruise = self.plan(ctx, core, &waypoint).await?;
        let motors = core.motion.motors().to_vec();

        waypoint::approach(ctx, core, &self.paths).await?;
        if self.paths.iter().any(|p| !p.is_still()) {
            self.overshot = Some(leg);
        }
        waypoint::arm(ctx, &motors, &self.paths).await?;
        ctx.checkpoint().await?;

        let (cruise_tx, cruise_rx) = watch::channel(None);
        let finished = Signal::new();
        let timeout = ctx.settings().scan.motion_timeout() + secs(cruise);
        let motion = drive_motion(ctx, &motors, &self.paths, cruise, cruise_tx, &finished, timeout);
        let acquisition = drive_acquisition(ctx, core, self.integ_time, latency, cruise_rx, &finished);
        let (motion_time, acquired) = tokio::try_join!(motion, acquisition)?;
        core.add_motion_time(motion_time);
        info!(leg, points = acquired, cruise_s = cruise, "continuous leg done");
        ctx.run_hooks(POST_MOVE).await?;
        Ok(Some(self.next as f64))
    }

    async fn cleanup(
        &mut self,
        _ctx: &MacroContext,
        core: &mut ScanCore,
        state: MacroState,
    ) -> MacroResult<()> {
        let Some(leg) = self.overshot.take() else {
            return Ok(());
        };
        if !matches!(state, MacroState::Finished | MacroState::Stopped) {
            return Ok(());
        }
        match self.waypoints.get(leg) {
            Some(waypoint) => waypoint::correct_overshoot(core, &waypoint.finals).await,
            None => Ok(()),
        }
    }
}
