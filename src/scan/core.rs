//! Bookkeeping shared by every scan: target resolution, data pipeline,
//! start/end bracketing, motion parameter backup and run history.

use super::history::{self, ScanHistoryEntry, SCAN_HISTORY};
use super::motion::{MotionBackup, MotionGroup};
use super::record::{JsonLinesRecorder, Record, ScanData, ScanFooter, ScanHeader, SessionRecorder};
use crate::config::ScanSettings;
use crate::error::{MacroError, MacroResult};
use crate::hardware::{Acquirable, Moveable, ValueMap};
use crate::macros::{MacroContext, MacroState, ProgressSequence};
use crate::value::ParamValue;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Serial number of the last scan.
pub const SCAN_ID: &str = "ScanID";
/// Path of the JSON lines scan file; no file is written when undefined.
pub const SCAN_FILE: &str = "ScanFile";
/// User recorded in the run history.
pub const SCAN_USER: &str = "ScanUser";
/// Motor names whose positions are appended to every record.
pub const EXTRA_COLUMNS: &str = "ExtraColumns";

pub const PRE_SCAN: &str = "pre-scan";
pub const POST_SCAN: &str = "post-scan";
pub const PRE_MOVE: &str = "pre-move";
pub const POST_MOVE: &str = "post-move";
pub const PRE_ACQ: &str = "pre-acq";
pub const POST_ACQ: &str = "post-acq";
pub const POST_STEP: &str = "post-step";
pub const PRE_CLEANUP: &str = "pre-cleanup";
pub const POST_CLEANUP: &str = "post-cleanup";

/// Hints exposed by step scans.
pub const STEP_HINTS: &[&str] = &[
    PRE_SCAN, PRE_MOVE, POST_MOVE, PRE_ACQ, POST_ACQ, POST_STEP, POST_SCAN,
];
/// Hints exposed by continuous scans; move hooks run once per leg.
pub const CONTINUOUS_HINTS: &[&str] = &[
    PRE_SCAN, PRE_MOVE, POST_MOVE, PRE_CLEANUP, POST_CLEANUP, POST_SCAN,
];
/// Hints exposed by time scans.
pub const TIMED_HINTS: &[&str] = &[PRE_SCAN, PRE_CLEANUP, POST_CLEANUP, POST_SCAN];

/// Non-binding duration estimate, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Estimate {
    pub motion_time: f64,
    pub acq_time: f64,
}

impl Estimate {
    pub fn total(&self) -> f64 {
        self.motion_time + self.acq_time
    }
}

/// Per-point reader appended to records.
#[async_trait]
pub trait ExtraColumn: Send + Sync {
    fn label(&self) -> &str;

    async fn read(&self, ctx: &MacroContext) -> MacroResult<Value>;
}

/// Position of a motor that is not scanned.
pub struct PositionColumn {
    motor: Arc<dyn Moveable>,
}

impl PositionColumn {
    pub fn new(motor: Arc<dyn Moveable>) -> Self {
        Self { motor }
    }
}

#[async_trait]
impl ExtraColumn for PositionColumn {
    fn label(&self) -> &str {
        self.motor.name()
    }

    async fn read(&self, ctx: &MacroContext) -> MacroResult<Value> {
        let pos = ctx.device_call(self.motor.read_position(false)).await?;
        Ok(json!(pos))
    }
}

/// State every scan carries from start to end.
pub struct ScanCore {
    pub title: String,
    pub motion: MotionGroup,
    pub acq: Arc<dyn Acquirable>,
    pub channels: Vec<String>,
    pub data: ScanData,
    pub settings: ScanSettings,
    extra_columns: Vec<Arc<dyn ExtraColumn>>,
    serial: i64,
    backup: Option<MotionBackup>,
    estimate: Estimate,
    started_at: Option<DateTime<Local>>,
    t0: Option<Instant>,
    motion_time: f64,
    acq_time: f64,
    started: bool,
    ended: bool,
}

impl ScanCore {
    /// Resolve and reserve the scanned motors and the active acquisition
    /// target, and build the data pipeline.
    pub fn new(ctx: &MacroContext, motor_names: &[String]) -> MacroResult<Self> {
        let motors = motor_names
            .iter()
            .map(|name| {
                ctx.get_moveable(name).map_err(|e| match e {
                    MacroError::UnknownDevice(dev) => {
                        MacroError::ScanSetup(format!("motor '{}' does not exist", dev))
                    }
                    other => other,
                })
            })
            .collect::<MacroResult<Vec<_>>>()?;
        let acq = ctx.get_active_acquirable().map_err(|e| match e {
            MacroError::UnknownEnvironment(var) => {
                MacroError::ScanSetup(format!("no acquisition target: {} is not defined", var))
            }
            MacroError::UnknownDevice(dev) => {
                MacroError::ScanSetup(format!("acquisition target '{}' does not exist", dev))
            }
            other => other,
        })?;
        let channels = acq.channels();
        if channels.is_empty() {
            return Err(MacroError::ScanSetup(format!(
                "acquisition target '{}' has no channels",
                acq.name()
            )));
        }

        let mut extra_columns: Vec<Arc<dyn ExtraColumn>> = Vec::new();
        if let Some(Value::Array(names)) = ctx.get_env_opt(EXTRA_COLUMNS)? {
            for name in names.iter().filter_map(Value::as_str) {
                extra_columns.push(Arc::new(PositionColumn::new(ctx.get_moveable(name)?)));
            }
        }

        let mut data = ScanData::new();
        data.add_recorder(Box::new(SessionRecorder::new(ctx.session().clone())));
        if let Some(path) = ctx.get_env_opt(SCAN_FILE)? {
            match path.as_str() {
                Some(path) => data.add_recorder(Box::new(JsonLinesRecorder::new(path))),
                None => warn!("{} is not a path, no scan file written", SCAN_FILE),
            }
        }

        Ok(Self {
            title: ctx.macro_info().line.clone(),
            motion: MotionGroup::new(motors),
            acq,
            channels,
            data,
            settings: ctx.settings().scan.clone(),
            extra_columns,
            serial: 0,
            backup: None,
            estimate: Estimate::default(),
            started_at: None,
            t0: None,
            motion_time: 0.0,
            acq_time: 0.0,
            started: false,
            ended: false,
        })
    }

    pub fn serial(&self) -> i64 {
        self.serial
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Seconds since the scan started
    pub fn elapsed(&self) -> f64 {
        self.t0.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    }

    /// Instant the scan clock started
    pub fn t0(&self) -> Instant {
        self.t0.unwrap_or_else(Instant::now)
    }

    /// Saved velocity of `motor`, before the scan changed it
    pub fn original_velocity(&self, motor: &str) -> Option<f64> {
        self.backup.as_ref().and_then(|b| b.velocity_of(motor))
    }

    /// Put the saved motion parameters back; the final restore stays pending.
    pub async fn apply_original_motion(&self) -> MacroResult<()> {
        match &self.backup {
            Some(backup) => Ok(backup.apply().await?),
            None => Ok(()),
        }
    }

    pub fn add_motion_time(&mut self, seconds: f64) {
        self.motion_time += seconds;
    }

    pub fn add_acq_time(&mut self, seconds: f64) {
        self.acq_time += seconds;
    }

    /// Serial, backup, estimate, recorders, pre-scan hooks.
    pub async fn start(&mut self, ctx: &MacroContext, estimate: Estimate) -> MacroResult<()> {
        self.started = true;
        self.serial = ctx
            .get_env_opt(SCAN_ID)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            + 1;
        ctx.set_env(SCAN_ID, json!(self.serial))?;

        if !self.motion.is_empty() {
            self.backup = Some(
                ctx.device_call(MotionBackup::backup(self.motion.motors()))
                    .await?,
            );
        }

        self.estimate = estimate;
        info!(
            serial = self.serial,
            title = %self.title,
            estimated_s = estimate.total(),
            "scan starting"
        );
        ctx.output(format!(
            "Scan #{} started, estimated duration {:.2}s",
            self.serial,
            estimate.total()
        ))?;

        let started_at = Local::now();
        self.started_at = Some(started_at);
        let header = ScanHeader {
            serial: self.serial,
            title: self.title.clone(),
            motors: self.motion.names(),
            channels: self.channels.clone(),
            started: started_at,
            estimated_time: estimate.total(),
        };
        self.data.start(&header).await?;
        ctx.run_hooks(PRE_SCAN).await?;
        self.t0 = Some(Instant::now());
        Ok(())
    }

    /// Acquire once on the target and account the time.
    pub async fn acquire(&mut self, ctx: &MacroContext, integ_time: f64, raw: bool) -> MacroResult<ValueMap> {
        let acq = self.acq.clone();
        let began = Instant::now();
        let values = ctx
            .guarded(async {
                if raw {
                    ctx.device_call(acq.count_raw()).await
                } else {
                    let handle = ctx.device_call(acq.start_count(integ_time)).await?;
                    ctx.device_call(acq.wait_count(handle, None)).await
                }
            })
            .await?;
        self.acq_time += began.elapsed().as_secs_f64();
        Ok(values)
    }

    /// Read every extra column.
    pub async fn read_extras(&self, ctx: &MacroContext) -> MacroResult<BTreeMap<String, Value>> {
        let mut extras = BTreeMap::new();
        for column in &self.extra_columns {
            extras.insert(column.label().to_string(), column.read(ctx).await?);
        }
        Ok(extras)
    }

    /// Append a record to the store and every recorder.
    pub async fn add_record(&mut self, record: Record) -> MacroResult<()> {
        self.data.add_record(record).await
    }

    /// Post-scan hooks (normal end only), restore, history, recorders.
    /// Runs once; later calls do nothing.
    pub async fn end(&mut self, ctx: &MacroContext, state: MacroState) -> MacroResult<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        let hooks = if state == MacroState::Finished && self.started {
            ctx.run_hooks(POST_SCAN).await
        } else {
            Ok(())
        };

        let restore = match self.backup.as_mut() {
            Some(backup) => backup.restore().await.map_err(MacroError::from),
            None => Ok(()),
        };

        if self.started {
            let ended = Local::now();
            if let Err(e) = self.record_history(ctx, state, ended) {
                warn!(error = %e, "failed to update scan history");
            }
            self.data
                .end(&ScanFooter {
                    serial: self.serial,
                    ended,
                    status: state.to_string(),
                    points: self.data.len(),
                })
                .await;
            info!(
                serial = self.serial,
                points = self.data.len(),
                status = %state,
                elapsed_s = self.elapsed(),
                "scan ended"
            );
        }

        hooks?;
        restore
    }

    fn record_history(&self, ctx: &MacroContext, state: MacroState, ended: DateTime<Local>) -> MacroResult<()> {
        let elapsed = self.elapsed();
        let user = ctx
            .get_env_opt(SCAN_USER)?
            .and_then(|v| v.as_str().map(str::to_string))
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string());
        let entry = ScanHistoryEntry {
            serial: self.serial,
            title: self.title.clone(),
            user,
            start_time: self.started_at.unwrap_or(ended),
            end_time: ended,
            estimated_time: self.estimate.total(),
            deadtime: (elapsed - self.acq_time).max(0.0),
            motion_time: self.motion_time,
            acq_time: self.acq_time,
            channels: self.channels.clone(),
            end_status: state.to_string(),
        };
        let mut entries = history::from_env(ctx.get_env_opt(SCAN_HISTORY)?);
        history::push_capped(&mut entries, entry, self.settings.history_size);
        ctx.set_env(SCAN_HISTORY, history::to_env(&entries))
    }
}

/// Extension point of the scan family.
#[async_trait]
pub trait ScanLoop: Send {
    /// Progress range
    fn range(&self) -> (f64, f64);

    /// Expected duration, logged before the run
    fn estimate(&self, core: &ScanCore) -> Estimate;

    /// Run the next unit of work; `Ok(None)` when done.
    async fn scan_step(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>>;

    /// Scan-specific teardown, run once before [`ScanCore::end`].
    async fn cleanup(
        &mut self,
        _ctx: &MacroContext,
        _core: &mut ScanCore,
        _state: MacroState,
    ) -> MacroResult<()> {
        Ok(())
    }
}

/// A scan driven as a macro progress sequence.
pub struct ScanSequence<L> {
    core: ScanCore,
    scan_loop: L,
}

impl<L: ScanLoop> ScanSequence<L> {
    pub fn new(core: ScanCore, scan_loop: L) -> Self {
        Self { core, scan_loop }
    }
}

#[async_trait]
impl<L: ScanLoop + 'static> ProgressSequence for ScanSequence<L> {
    fn range(&self) -> (f64, f64) {
        self.scan_loop.range()
    }

    async fn advance(&mut self, ctx: &MacroContext) -> MacroResult<Option<f64>> {
        if !self.core.is_started() {
            let estimate = self.scan_loop.estimate(&self.core);
            self.core.start(ctx, estimate).await?;
        }
        self.scan_loop.scan_step(ctx, &mut self.core).await
    }

    async fn finish(
        &mut self,
        ctx: &MacroContext,
        state: MacroState,
    ) -> MacroResult<Option<ParamValue>> {
        let cleanup = self.scan_loop.cleanup(ctx, &mut self.core, state).await;
        let end = self.core.end(ctx, state).await;
        cleanup?;
        end?;
        Ok(Some(ParamValue::from(self.core.data.len())))
    }
}
