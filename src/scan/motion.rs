//! Multi-axis motion helpers shared by the scan family.

use crate::error::{MacroError, MacroResult};
use crate::hardware::{Device, DeviceState, Moveable};
use crate::macros::MacroContext;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Axes moved together.
#[derive(Clone)]
pub struct MotionGroup {
    motors: Vec<Arc<dyn Moveable>>,
}

impl MotionGroup {
    /// Group moving `motors` in the given order
    pub fn new(motors: Vec<Arc<dyn Moveable>>) -> Self {
        Self { motors }
    }

    /// Axes of the group
    pub fn motors(&self) -> &[Arc<dyn Moveable>] {
        &self.motors
    }

    /// Axis names, in group order
    pub fn names(&self) -> Vec<String> {
        self.motors.iter().map(|m| m.name().to_string()).collect()
    }

    /// Number of axes
    pub fn len(&self) -> usize {
        self.motors.len()
    }

    /// True for a group with no axes
    pub fn is_empty(&self) -> bool {
        self.motors.is_empty()
    }

    /// Move every axis to its target and wait until all settled.
    ///
    /// Returns the worst final state and the final positions.
    pub async fn move_to(
        &self,
        ctx: &MacroContext,
        targets: &[f64],
    ) -> MacroResult<(DeviceState, Vec<f64>)> {
        if targets.len() != self.motors.len() {
            return Err(MacroError::InvalidParameter(format!(
                "{} targets for {} motors",
                targets.len(),
                self.motors.len()
            )));
        }
        let timeout = ctx.settings().scan.motion_timeout();
        ctx.guarded(ctx.device_call(move_and_wait(&self.motors, targets, Some(timeout))))
            .await
    }

    /// Current positions
    pub async fn read_positions(&self, ctx: &MacroContext, force: bool) -> MacroResult<Vec<f64>> {
        ctx.device_call(async {
            let mut positions = Vec::with_capacity(self.motors.len());
            for m in &self.motors {
                positions.push(m.read_position(force).await?);
            }
            Ok(positions)
        })
        .await
    }

    /// Move without observing cancellation. Only for teardown moves that
    /// must not be left half-done.
    pub async fn move_uninterruptible(
        &self,
        targets: &[f64],
        timeout: Duration,
    ) -> Result<(DeviceState, Vec<f64>)> {
        move_and_wait(&self.motors, targets, Some(timeout)).await
    }
}

async fn move_and_wait(
    motors: &[Arc<dyn Moveable>],
    targets: &[f64],
    timeout: Option<Duration>,
) -> Result<(DeviceState, Vec<f64>)> {
    let mut handles = Vec::with_capacity(motors.len());
    for (motor, target) in motors.iter().zip(targets) {
        handles.push(motor.begin_move(*target).await?);
    }
    let mut state = DeviceState::On;
    let mut positions = Vec::with_capacity(motors.len());
    for (motor, handle) in motors.iter().zip(handles) {
        let outcome = motor.wait_ready(handle, timeout).await?;
        state = state.worst(outcome.state);
        positions.push(outcome.position);
    }
    Ok((state, positions))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MotionParams {
    velocity: f64,
    acceleration: f64,
    deceleration: f64,
}

/// Saved velocity and ramps of a set of axes.
pub struct MotionBackup {
    saved: Vec<(Arc<dyn Moveable>, MotionParams)>,
    restored: bool,
}

impl MotionBackup {
    /// Read and keep the current motion parameters of `motors`.
    pub async fn backup(motors: &[Arc<dyn Moveable>]) -> Result<Self> {
        let mut saved = Vec::with_capacity(motors.len());
        for motor in motors {
            let params = MotionParams {
                velocity: motor.velocity().await?,
                acceleration: motor.acceleration().await?,
                deceleration: motor.deceleration().await?,
            };
            debug!(motor = motor.name(), ?params, "saved motion parameters");
            saved.push((motor.clone(), params));
        }
        info!(motors = saved.len(), "backed up motion parameters");
        Ok(Self {
            saved,
            restored: false,
        })
    }

    /// Saved velocity of `motor`
    pub fn velocity_of(&self, motor: &str) -> Option<f64> {
        self.saved
            .iter()
            .find(|(m, _)| m.name() == motor)
            .map(|(_, p)| p.velocity)
    }

    /// Write the saved parameters back. Runs once; later calls do nothing.
    pub async fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        let mut first_err = None;
        for (motor, params) in &self.saved {
            let result = async {
                motor.set_velocity(params.velocity).await?;
                motor.set_acceleration(params.acceleration).await?;
                motor.set_deceleration(params.deceleration).await
            }
            .await;
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        info!(motors = self.saved.len(), "restored motion parameters");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Put the saved parameters back without consuming the restore.
    pub async fn apply(&self) -> Result<()> {
        for (motor, params) in &self.saved {
            motor.set_velocity(params.velocity).await?;
            motor.set_acceleration(params.acceleration).await?;
            motor.set_deceleration(params.deceleration).await?;
        }
        Ok(())
    }
}

/// Trajectory of one axis over one continuous-scan leg.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionPath {
    pub motor: String,
    pub initial: f64,
    pub final_pos: f64,
    /// Velocity configured on the axis before the scan
    pub max_velocity: f64,
    pub cruise_velocity: f64,
    /// Seconds to reach cruise velocity
    pub accel_time: f64,
    /// Seconds to stop from cruise velocity
    pub decel_time: f64,
}

impl MotionPath {
    pub fn new(motor: &str, initial: f64, final_pos: f64, max_velocity: f64, accel_time: f64, decel_time: f64) -> Self {
        Self {
            motor: motor.to_string(),
            initial,
            final_pos,
            max_velocity,
            cruise_velocity: max_velocity,
            accel_time,
            decel_time,
        }
    }

    pub fn displacement(&self) -> f64 {
        self.final_pos - self.initial
    }

    /// True when the axis does not move on this leg
    pub fn is_still(&self) -> bool {
        self.displacement() == 0.0
    }

    fn sign(&self) -> f64 {
        if self.displacement() < 0.0 {
            -1.0
        } else {
            1.0
        }
    }

    /// Time at max velocity to cover the displacement
    pub fn min_duration(&self) -> f64 {
        if self.max_velocity <= 0.0 {
            return f64::INFINITY;
        }
        self.displacement().abs() / self.max_velocity
    }

    /// Distance covered while accelerating from rest to cruise velocity
    pub fn accel_displacement(&self) -> f64 {
        0.5 * self.cruise_velocity * self.accel_time
    }

    /// Distance covered while decelerating from cruise velocity to rest
    pub fn decel_displacement(&self) -> f64 {
        0.5 * self.cruise_velocity * self.decel_time
    }

    /// Where the axis must start so it cruises from `initial`
    pub fn pre_start(&self) -> f64 {
        self.initial - self.sign() * self.accel_displacement()
    }

    /// Where the axis stops after cruising past `final_pos`
    pub fn post_end(&self) -> f64 {
        self.final_pos + self.sign() * self.decel_displacement()
    }
}

/// Share one cruise window between `paths`.
///
/// The slowest axis sets the cruise duration, stretched by `slow_down`
/// (in `(0, 1]`). Every axis gets the velocity that covers its own
/// displacement in that duration and the longest ramps of the group, so all
/// axes leave and reach their window edges together. Returns the cruise
/// duration in seconds.
pub fn coordinate(paths: &mut [MotionPath], slow_down: f64) -> f64 {
    let slow_down = if slow_down > 0.0 { slow_down.min(1.0) } else { 1.0 };
    let duration = paths
        .iter()
        .filter(|p| !p.is_still())
        .map(MotionPath::min_duration)
        .fold(0.0, f64::max)
        / slow_down;
    let accel = paths.iter().map(|p| p.accel_time).fold(0.0, f64::max);
    let decel = paths.iter().map(|p| p.decel_time).fold(0.0, f64::max);
    for path in paths.iter_mut() {
        path.accel_time = accel;
        path.decel_time = decel;
        path.cruise_velocity = if duration > 0.0 {
            path.displacement().abs() / duration
        } else {
            0.0
        };
    }
    duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotor;
    use tracing_test::traced_test;

    #[test]
    fn test_coordinated_velocities_are_proportional_to_displacement() {
        let mut paths = vec![
            MotionPath::new("a", 0.0, 10.0, 100.0, 0.1, 0.1),
            MotionPath::new("b", 0.0, 100.0, 100.0, 0.2, 0.05),
        ];
        let duration = coordinate(&mut paths, 1.0);
        assert!((duration - 1.0).abs() < 1e-12);
        assert!((paths[0].cruise_velocity - 10.0).abs() < 1e-12);
        assert!((paths[1].cruise_velocity - 100.0).abs() < 1e-12);
        assert!((paths[1].cruise_velocity / paths[0].cruise_velocity - 10.0).abs() < 1e-9);
        assert_eq!(paths[0].accel_time, 0.2);
        assert_eq!(paths[1].decel_time, 0.1);
    }

    #[test]
    fn test_slow_down_stretches_cruise() {
        let mut paths = vec![MotionPath::new("a", 0.0, 10.0, 10.0, 0.0, 0.0)];
        assert!((coordinate(&mut paths, 0.5) - 2.0).abs() < 1e-12);
        assert!((paths[0].cruise_velocity - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_ramp_margins() {
        let mut path = MotionPath::new("a", 10.0, 0.0, 20.0, 0.5, 0.25);
        path.cruise_velocity = 20.0;
        assert!((path.pre_start() - 15.0).abs() < 1e-12);
        assert!((path.post_end() + 2.5).abs() < 1e-12);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_backup_restores_once() {
        let motor = Arc::new(MockMotor::new("mot01"));
        let motors: Vec<Arc<dyn Moveable>> = vec![motor.clone()];
        let mut backup = MotionBackup::backup(&motors).await.unwrap();
        motor.set_velocity(3.0).await.unwrap();

        backup.restore().await.unwrap();
        backup.restore().await.unwrap();
        assert_eq!(motor.velocity().await.unwrap(), 1000.0);
        assert_eq!(motor.velocity_log(), vec![3.0, 1000.0]);
        assert!(logs_contain("backed up motion parameters"));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|l| l.contains("restored motion parameters"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one restore, saw {}", n)),
            }
        });
    }
}
