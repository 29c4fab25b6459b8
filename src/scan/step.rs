//! Step scans: move, settle, acquire, record, one point at a time.

use super::core::{
    Estimate, ScanCore, ScanLoop, POST_ACQ, POST_MOVE, POST_STEP, PRE_ACQ, PRE_MOVE,
};
use super::record::Record;
use crate::error::{MacroError, MacroResult};
use crate::hardware::DeviceState;
use crate::hooks::HookRef;
use crate::macros::{MacroContext, MacroState};
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Hooks run around every step, fetched once when the scan starts.
#[derive(Default, Clone)]
pub struct StepHooks {
    /// Before the axes start moving to the point
    pub pre_move: Vec<HookRef>,
    /// Once the axes settled
    pub post_move: Vec<HookRef>,
    /// Before the acquisition
    pub pre_acq: Vec<HookRef>,
    /// After the acquisition, before the record is written
    pub post_acq: Vec<HookRef>,
    /// After the record is written
    pub post_step: Vec<HookRef>,
}

impl StepHooks {
    /// Hooks registered on the macro behind `ctx`
    pub fn from_context(ctx: &MacroContext) -> Self {
        Self {
            pre_move: ctx.hooks(PRE_MOVE),
            post_move: ctx.hooks(POST_MOVE),
            pre_acq: ctx.hooks(PRE_ACQ),
            post_acq: ctx.hooks(POST_ACQ),
            post_step: ctx.hooks(POST_STEP),
        }
    }
}

/// Evenly spaced points from `starts` to `finals`, `intervals + 1` of them.
/// The last point is exactly `finals`.
pub fn linear_steps(starts: &[f64], finals: &[f64], intervals: usize) -> Vec<Vec<f64>> {
    (0..=intervals)
        .map(|i| {
            if i == intervals {
                return finals.to_vec();
            }
            starts
                .iter()
                .zip(finals)
                .map(|(s, f)| s + (f - s) * i as f64 / intervals as f64)
                .collect()
        })
        .collect()
}

/// Step scan over precomputed points.
///
/// With `relative` set the points are offsets from the positions read when
/// the scan starts, and the axes go back there when the scan ends.
pub struct StepScan {
    points: Vec<Vec<f64>>,
    integ_time: f64,
    velocities: Vec<f64>,
    relative: bool,
    origin: Option<Vec<f64>>,
    hooks: Option<StepHooks>,
    next: usize,
}

impl StepScan {
    /// Absolute scan over `points`, counting `integ_time` seconds at each.
    ///
    /// `velocities` feed the duration estimate only, one per axis.
    pub fn new(points: Vec<Vec<f64>>, integ_time: f64, velocities: Vec<f64>) -> Self {
        Self {
            points,
            integ_time,
            velocities,
            relative: false,
            origin: None,
            hooks: None,
            next: 0,
        }
    }

    /// Treat the points as offsets and return to the origin at the end.
    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    /// Points still to be visited
    pub fn remaining(&self) -> usize {
        self.points.len().saturating_sub(self.next)
    }

    /// Slowest axis per leg, summed over legs
    fn motion_estimate(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| {
                pair[0]
                    .iter()
                    .zip(&pair[1])
                    .zip(&self.velocities)
                    .map(|((a, b), v)| if *v > 0.0 { (b - a).abs() / v } else { 0.0 })
                    .fold(0.0, f64::max)
            })
            .sum()
    }

    async fn first_step(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<()> {
        self.hooks = Some(StepHooks::from_context(ctx));
        if self.relative {
            let origin = core.motion.read_positions(ctx, true).await?;
            for point in &mut self.points {
                for (p, o) in point.iter_mut().zip(&origin) {
                    *p += o;
                }
            }
            debug!(?origin, "relative scan origin");
            self.origin = Some(origin);
        }
        if core.settings.deterministic {
            let acq = core.acq.clone();
            ctx.device_call(acq.prepare(self.integ_time, self.points.len()))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ScanLoop for StepScan {
    fn range(&self) -> (f64, f64) {
        (0.0, self.points.len() as f64)
    }

    fn estimate(&self, _core: &ScanCore) -> Estimate {
        Estimate {
            motion_time: self.motion_estimate(),
            acq_time: self.integ_time * self.points.len() as f64,
        }
    }

    async fn scan_step(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>> {
        if self.hooks.is_none() {
            self.first_step(ctx, core).await?;
        }
        let Some(target) = self.points.get(self.next).cloned() else {
            return Ok(None);
        };
        let hooks = self.hooks.clone().unwrap_or_default();
        let point_nb = self.next;

        ctx.run_hook_list(&hooks.pre_move).await?;
        let began = Instant::now();
        let (state, positions) = core.motion.move_to(ctx, &target).await?;
        core.add_motion_time(began.elapsed().as_secs_f64());
        if state != DeviceState::On {
            return Err(MacroError::Scan(format!(
                "motion to point {} ended in state {:?}",
                point_nb, state
            )));
        }
        ctx.run_hook_list(&hooks.post_move).await?;
        ctx.checkpoint().await?;

        ctx.run_hook_list(&hooks.pre_acq).await?;
        let dt = core.elapsed();
        let raw = core.settings.deterministic;
        let values = core.acquire(ctx, self.integ_time, raw).await?;
        ctx.run_hook_list(&hooks.post_acq).await?;

        let mut record = Record::new(point_nb, dt);
        record.positions = core.motion.names().into_iter().zip(positions).collect();
        record.values = values;
        record.extras = core.read_extras(ctx).await?;
        core.add_record(record).await?;
        self.next += 1;

        ctx.run_hook_list(&hooks.post_step).await?;
        Ok(Some((point_nb + 1) as f64))
    }

    async fn cleanup(
        &mut self,
        ctx: &MacroContext,
        core: &mut ScanCore,
        state: MacroState,
    ) -> MacroResult<()> {
        let Some(origin) = self.origin.take() else {
            return Ok(());
        };
        info!(?origin, %state, "returning to scan origin");
        let timeout = ctx.settings().scan.motion_timeout();
        let (final_state, _) = core.motion.move_uninterruptible(&origin, timeout).await?;
        if final_state != DeviceState::On {
            warn!(state = ?final_state, "return to scan origin ended in a bad state");
        }
        Ok(())
    }
}
