//! Waypoints of continuous scans.
//!
//! A continuous scan is a list of legs. For every leg the axes move to the
//! window start at their own velocity, cruise through the leg at coordinated
//! velocities and overshoot the leg end by their deceleration distance. The
//! move to the next leg's window start absorbs that overshoot; after the last
//! leg the scan corrects it explicitly.

use super::core::ScanCore;
use super::motion::MotionPath;
use super::step::linear_steps;
use crate::error::{MacroError, MacroResult};
use crate::hardware::{DeviceState, Moveable};
use crate::macros::MacroContext;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Target configuration of one leg: the axes cruise from `starts` to
/// `finals`, one entry per scanned axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub starts: Vec<f64>,
    pub finals: Vec<f64>,
}

impl Waypoint {
    pub fn new(starts: Vec<f64>, finals: Vec<f64>) -> Self {
        Self { starts, finals }
    }
}

/// Legs of a mesh over two axes.
///
/// The first axis sweeps `fast` once for each of the `intervals + 1`
/// positions the second axis steps through over `slow`.
pub fn mesh(fast: (f64, f64), slow: (f64, f64), intervals: usize) -> Vec<Waypoint> {
    linear_steps(&[slow.0], &[slow.1], intervals)
        .into_iter()
        .map(|row| Waypoint::new(vec![fast.0, row[0]], vec![fast.1, row[0]]))
        .collect()
}

/// Motion paths of one leg, starting from the velocities saved before the
/// scan changed them.
pub(crate) async fn leg_paths(
    ctx: &MacroContext,
    core: &ScanCore,
    waypoint: &Waypoint,
) -> MacroResult<Vec<MotionPath>> {
    let motors = core.motion.motors();
    if waypoint.starts.len() != motors.len() || waypoint.finals.len() != motors.len() {
        return Err(MacroError::ScanSetup(format!(
            "waypoint has {} starts and {} finals for {} motors",
            waypoint.starts.len(),
            waypoint.finals.len(),
            motors.len()
        )));
    }
    let mut paths = Vec::with_capacity(motors.len());
    for ((motor, start), final_pos) in motors.iter().zip(&waypoint.starts).zip(&waypoint.finals) {
        let max_velocity = match core.original_velocity(motor.name()) {
            Some(v) => v,
            None => ctx.device_call(motor.velocity()).await?,
        };
        let accel = ctx.device_call(motor.acceleration()).await?;
        let decel = ctx.device_call(motor.deceleration()).await?;
        paths.push(MotionPath::new(motor.name(), *start, *final_pos, max_velocity, accel, decel));
    }
    Ok(paths)
}

/// Fail when a ramp of `paths` leaves the limits of its axis.
pub(crate) fn check_limits(motors: &[Arc<dyn Moveable>], paths: &[MotionPath]) -> MacroResult<()> {
    for (motor, path) in motors.iter().zip(paths) {
        let (low, high) = motor.limits();
        for pos in [path.pre_start(), path.post_end()] {
            if pos < low || pos > high {
                return Err(MacroError::ScanSetup(format!(
                    "{}: ramp position {} is outside limits [{}, {}]",
                    motor.name(),
                    pos,
                    low,
                    high
                )));
            }
        }
    }
    Ok(())
}

/// Move every axis to its window start. Adds the move to the motion time.
pub(crate) async fn approach(ctx: &MacroContext, core: &mut ScanCore, paths: &[MotionPath]) -> MacroResult<()> {
    let began = Instant::now();
    let pre_start: Vec<f64> = paths.iter().map(MotionPath::pre_start).collect();
    let (state, _) = core.motion.move_to(ctx, &pre_start).await?;
    if state != DeviceState::On {
        return Err(MacroError::Scan(format!(
            "move to window start ended in state {:?}",
            state
        )));
    }
    core.add_motion_time(began.elapsed().as_secs_f64());
    Ok(())
}

/// Configure the coordinated cruise on every moving axis.
///
/// Returns `true` when at least one axis was reconfigured.
pub(crate) async fn arm(ctx: &MacroContext, motors: &[Arc<dyn Moveable>], paths: &[MotionPath]) -> MacroResult<bool> {
    let mut armed = false;
    for (motor, path) in motors.iter().zip(paths).filter(|(_, p)| !p.is_still()) {
        armed = true;
        debug!(
            motor = %path.motor,
            cruise_velocity = path.cruise_velocity,
            pre_start = path.pre_start(),
            post_end = path.post_end(),
            "arming cruise"
        );
        ctx.device_call(motor.set_velocity(path.cruise_velocity)).await?;
        ctx.device_call(motor.set_acceleration(path.accel_time)).await?;
        ctx.device_call(motor.set_deceleration(path.decel_time)).await?;
    }
    Ok(armed)
}

/// Put the saved motion parameters back and move onto `targets`.
///
/// Cancellation is not observed: the move always completes.
pub(crate) async fn correct_overshoot(core: &ScanCore, targets: &[f64]) -> MacroResult<()> {
    info!(?targets, "correcting overshoot");
    core.apply_original_motion().await?;
    let timeout = core.settings.motion_timeout();
    let (state, _) = core.motion.move_uninterruptible(targets, timeout).await?;
    if state != DeviceState::On {
        warn!(?state, "overshoot correction ended in a bad state");
    }
    Ok(())
}
