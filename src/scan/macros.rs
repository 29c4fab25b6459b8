//! Scan macros registered in the catalog.
//!
//! | name       | parameters                                              |
//! |------------|---------------------------------------------------------|
//! | `ascan`    | motor start final nb_interv integ_time                  |
//! | `a2scan`   | m1 s1 f1 m2 s2 f2 nb_interv integ_time                  |
//! | `dscan`    | motor rel_start rel_final nb_interv integ_time          |
//! | `ascanc`   | (motor start final)+ integ_time [slow_down]             |
//! | `ascanct`  | (motor start final)+ nb_interv integ_time [latency]     |
//! | `meshc`    | m1 s1 f1 m2 s2 f2 m2_nb_interv integ_time [slow_down]   |
//! | `meshct`   | m1 s1 f1 m2 s2 f2 m2_nb_interv nb_interv integ_time [latency] |
//! | `timescan` | nb_points integ_time [latency] [software\|hardware]     |
//!
//! The mesh scans sweep `m1` continuously once per position of `m2`, which
//! steps over `m2_nb_interv + 1` positions.

use super::continuous::ContinuousScan;
use super::core::{ScanCore, ScanSequence, CONTINUOUS_HINTS, STEP_HINTS, TIMED_HINTS};
use super::hardware::HardwareScan;
use super::step::{linear_steps, StepScan};
use super::time::{TimeScan, TimingMode};
use super::waypoint::{self, Waypoint};
use crate::error::{MacroError, MacroResult};
use crate::macros::context::ACTIVE_MNTGRP;
use crate::macros::{MacroBody, MacroCatalog, MacroContext, MacroRun, ProgressSequence};
use crate::value::{self, ParamCursor, ParamValue};
use async_trait::async_trait;
use std::time::Duration;

pub(crate) fn register(catalog: &mut MacroCatalog) {
    let scans = [
        (ScanKind::Ascan, "Absolute step scan of one motor"),
        (ScanKind::A2scan, "Absolute step scan of two motors"),
        (ScanKind::Dscan, "Relative step scan of one motor; returns to the start position"),
        (ScanKind::Ascanc, "Software-timed continuous scan"),
        (ScanKind::Ascanct, "Hardware-timed continuous scan"),
        (ScanKind::Meshc, "Software-timed continuous mesh of two motors"),
        (ScanKind::Meshct, "Hardware-timed continuous mesh of two motors"),
        (ScanKind::Timescan, "Repeated acquisitions without motion"),
    ];
    for (kind, description) in scans {
        catalog.register(kind.name(), description, &[ACTIVE_MNTGRP], move || {
            Box::new(ScanMacro::new(kind))
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Ascan,
    A2scan,
    Dscan,
    Ascanc,
    Ascanct,
    Meshc,
    Meshct,
    Timescan,
}

impl ScanKind {
    fn name(self) -> &'static str {
        match self {
            ScanKind::Ascan => "ascan",
            ScanKind::A2scan => "a2scan",
            ScanKind::Dscan => "dscan",
            ScanKind::Ascanc => "ascanc",
            ScanKind::Ascanct => "ascanct",
            ScanKind::Meshc => "meshc",
            ScanKind::Meshct => "meshct",
            ScanKind::Timescan => "timescan",
        }
    }
}

struct ScanMacro {
    kind: ScanKind,
    sequence: Option<Box<dyn ProgressSequence>>,
}

impl ScanMacro {
    fn new(kind: ScanKind) -> Self {
        Self { kind, sequence: None }
    }
}

/// Motor names, starts and finals of `count` leading triplets.
fn triplets(cur: &mut ParamCursor<'_>, count: usize) -> MacroResult<(Vec<String>, Vec<f64>, Vec<f64>)> {
    let mut motors = Vec::with_capacity(count);
    let mut starts = Vec::with_capacity(count);
    let mut finals = Vec::with_capacity(count);
    for _ in 0..count {
        motors.push(cur.string("motor")?);
        starts.push(cur.f64("start")?);
        finals.push(cur.f64("final")?);
    }
    Ok((motors, starts, finals))
}

/// Number of leading triplets when `fixed` trailing parameters follow,
/// optionally one more.
fn triplet_count(name: &str, len: usize, fixed: usize) -> MacroResult<(usize, bool)> {
    if len >= fixed + 3 && (len - fixed) % 3 == 0 {
        Ok(((len - fixed) / 3, false))
    } else if len >= fixed + 4 && (len - fixed - 1) % 3 == 0 {
        Ok(((len - fixed - 1) / 3, true))
    } else {
        Err(MacroError::InvalidParameter(format!(
            "{}: expected (motor start final) triplets followed by {} or {} parameters, got {} parameters",
            name,
            fixed,
            fixed + 1,
            len
        )))
    }
}

/// Scanned motors and legs of a continuous scan whose leading parameters
/// are followed by `fixed` parameters and one optional one. Also tells
/// whether the optional parameter is present.
///
/// A plain scan is one leg over (motor start final) triplets; a mesh is two
/// triplets and the row count of the second motor.
fn continuous_legs(
    name: &str,
    cur: &mut ParamCursor<'_>,
    len: usize,
    fixed: usize,
    mesh: bool,
) -> MacroResult<(Vec<String>, Vec<Waypoint>, bool)> {
    if !mesh {
        let (count, optional) = triplet_count(name, len, fixed)?;
        let (motors, starts, finals) = triplets(cur, count)?;
        return Ok((motors, vec![Waypoint::new(starts, finals)], optional));
    }
    let optional = match len.checked_sub(7 + fixed) {
        Some(0) => false,
        Some(1) => true,
        _ => {
            return Err(MacroError::InvalidParameter(format!(
                "{}: expected m1 s1 f1 m2 s2 f2 m2_nb_interv followed by {} or {} parameters, got {} parameters",
                name,
                fixed,
                fixed + 1,
                len
            )))
        }
    };
    let (motors, starts, finals) = triplets(cur, 2)?;
    if motors[0] == motors[1] {
        return Err(MacroError::InvalidParameter(format!(
            "{}: the two mesh motors must differ, got {} twice",
            name, motors[0]
        )));
    }
    let rows = nonzero(name, "m2_nb_interv", cur.usize("m2_nb_interv")?)?;
    let legs = waypoint::mesh((starts[0], finals[0]), (starts[1], finals[1]), rows);
    Ok((motors, legs, optional))
}

fn positive_integ(name: &str, integ_time: f64) -> MacroResult<f64> {
    value::seconds(name, "integ_time", integ_time).map(|_| integ_time)
}

fn nonzero(name: &str, what: &str, n: usize) -> MacroResult<usize> {
    if n == 0 {
        return Err(MacroError::InvalidParameter(format!("{}: {} must be positive", name, what)));
    }
    Ok(n)
}

async fn velocities(ctx: &MacroContext, core: &ScanCore) -> MacroResult<Vec<f64>> {
    let mut out = Vec::with_capacity(core.motion.len());
    for motor in core.motion.motors() {
        out.push(ctx.device_call(motor.velocity()).await?);
    }
    Ok(out)
}

async fn build_step(
    ctx: &MacroContext,
    name: &str,
    params: &[ParamValue],
    n_motors: usize,
    relative: bool,
) -> MacroResult<Box<dyn ProgressSequence>> {
    let mut cur = ParamCursor::new(name, params);
    let (motors, starts, finals) = triplets(&mut cur, n_motors)?;
    let intervals = nonzero(name, "nb_interv", cur.usize("nb_interv")?)?;
    let integ_time = positive_integ(name, cur.f64("integ_time")?)?;
    cur.finish()?;

    let core = ScanCore::new(ctx, &motors)?;
    let velocities = velocities(ctx, &core).await?;
    let mut scan = StepScan::new(linear_steps(&starts, &finals, intervals), integ_time, velocities);
    if relative {
        scan = scan.relative();
    }
    Ok(Box::new(ScanSequence::new(core, scan)))
}

async fn build_ascanc(
    ctx: &MacroContext,
    name: &str,
    params: &[ParamValue],
    mesh: bool,
) -> MacroResult<Box<dyn ProgressSequence>> {
    let mut cur = ParamCursor::new(name, params);
    let (motors, legs, has_slow_down) = continuous_legs(name, &mut cur, params.len(), 1, mesh)?;
    let integ_time = positive_integ(name, cur.f64("integ_time")?)?;
    let slow_down = if has_slow_down {
        cur.f64("slow_down")?
    } else {
        ctx.settings().scan.slow_down
    };
    cur.finish()?;
    if !(slow_down > 0.0 && slow_down <= 1.0) {
        return Err(MacroError::InvalidParameter(format!(
            "{}: slow_down must be in (0, 1], got {}",
            name, slow_down
        )));
    }

    let core = ScanCore::new(ctx, &motors)?;
    let velocities = velocities(ctx, &core).await?;
    let scan = ContinuousScan::new(legs, integ_time, slow_down, velocities);
    Ok(Box::new(ScanSequence::new(core, scan)))
}

async fn build_ascanct(
    ctx: &MacroContext,
    name: &str,
    params: &[ParamValue],
    mesh: bool,
) -> MacroResult<Box<dyn ProgressSequence>> {
    let mut cur = ParamCursor::new(name, params);
    let (motors, legs, has_latency) = continuous_legs(name, &mut cur, params.len(), 2, mesh)?;
    let intervals = nonzero(name, "nb_interv", cur.usize("nb_interv")?)?;
    let integ_time = positive_integ(name, cur.f64("integ_time")?)?;
    let requested_latency = if has_latency {
        cur.seconds("latency_time")?.as_secs_f64()
    } else {
        0.0
    };
    cur.finish()?;

    let core = ScanCore::new(ctx, &motors)?;
    let acq = core.acq.clone();
    let latency = ctx
        .device_call(acq.latency_time())
        .await?
        .max(requested_latency);
    let total = integ_time + latency;
    if !(total.is_finite() && total > 0.0) {
        return Err(MacroError::InvalidParameter(format!(
            "{}: integration plus latency time must be positive and finite, got {}",
            name, total
        )));
    }
    let scan = HardwareScan::new(legs, intervals, integ_time, latency);
    Ok(Box::new(ScanSequence::new(core, scan)))
}

fn build_timescan(ctx: &MacroContext, params: &[ParamValue]) -> MacroResult<Box<dyn ProgressSequence>> {
    let name = "timescan";
    let mut cur = ParamCursor::new(name, params);
    let npts = nonzero(name, "nb_points", cur.usize("nb_points")?)?;
    let integ_time = positive_integ(name, cur.f64("integ_time")?)?;
    let latency = match params.get(2).and_then(ParamValue::as_f64) {
        Some(_) => cur.seconds("latency_time")?,
        None => Duration::ZERO,
    };
    let mode = match cur.opt_string("mode")? {
        Some(mode) => mode.parse()?,
        None => TimingMode::default(),
    };
    cur.finish()?;

    let core = ScanCore::new(ctx, &[])?;
    let scan = TimeScan::new(npts, integ_time, latency, mode);
    Ok(Box::new(ScanSequence::new(core, scan)))
}

#[async_trait]
impl MacroBody for ScanMacro {
    fn hints_allowed(&self) -> &'static [&'static str] {
        match self.kind {
            ScanKind::Ascan | ScanKind::A2scan | ScanKind::Dscan => STEP_HINTS,
            ScanKind::Ascanc | ScanKind::Ascanct | ScanKind::Meshc | ScanKind::Meshct => {
                CONTINUOUS_HINTS
            }
            ScanKind::Timescan => TIMED_HINTS,
        }
    }

    async fn prepare(
        &mut self,
        ctx: &MacroContext,
        params: Vec<ParamValue>,
    ) -> MacroResult<Option<ParamValue>> {
        let sequence = match self.kind {
            ScanKind::Ascan => build_step(ctx, "ascan", &params, 1, false).await?,
            ScanKind::A2scan => build_step(ctx, "a2scan", &params, 2, false).await?,
            ScanKind::Dscan => build_step(ctx, "dscan", &params, 1, true).await?,
            ScanKind::Ascanc => build_ascanc(ctx, "ascanc", &params, false).await?,
            ScanKind::Ascanct => build_ascanct(ctx, "ascanct", &params, false).await?,
            ScanKind::Meshc => build_ascanc(ctx, "meshc", &params, true).await?,
            ScanKind::Meshct => build_ascanct(ctx, "meshct", &params, true).await?,
            ScanKind::Timescan => build_timescan(ctx, &params)?,
        };
        self.sequence = Some(sequence);
        Ok(None)
    }

    async fn run(&mut self, _ctx: &MacroContext) -> MacroResult<MacroRun> {
        let sequence = self.sequence.take().ok_or_else(|| {
            MacroError::InvalidParameter(format!("{}: not prepared", self.kind.name()))
        })?;
        Ok(MacroRun::InProgress(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triplet_count_disambiguates_optional_tail() {
        assert_eq!(triplet_count("ascanc", 4, 1).unwrap(), (1, false));
        assert_eq!(triplet_count("ascanc", 5, 1).unwrap(), (1, true));
        assert_eq!(triplet_count("ascanc", 7, 1).unwrap(), (2, false));
        assert_eq!(triplet_count("ascanct", 5, 2).unwrap(), (1, false));
        assert_eq!(triplet_count("ascanct", 6, 2).unwrap(), (1, true));
        assert!(triplet_count("ascanc", 3, 1).is_err());
        assert!(triplet_count("ascanct", 4, 2).is_err());
    }

    #[test]
    fn test_scan_hints() {
        assert!(ScanMacro::new(ScanKind::Ascan).hints_allowed().contains(&"post-step"));
        assert!(ScanMacro::new(ScanKind::Ascanct).hints_allowed().contains(&"pre-cleanup"));
        assert!(ScanMacro::new(ScanKind::Meshc).hints_allowed().contains(&"pre-move"));
        assert!(!ScanMacro::new(ScanKind::Timescan).hints_allowed().contains(&"pre-move"));
    }
}
