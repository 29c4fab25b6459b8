//! Time scan: repeated acquisitions without motion.

use super::core::{Estimate, ScanCore, ScanLoop};
use super::hardware::{burst_cleanup, collect, BufferCollector, Subscriptions, TriggerPlan};
use super::record::Record;
use super::synch::SynchDescription;
use crate::error::{MacroError, MacroResult};
use crate::macros::{MacroContext, MacroState};
use crate::signal::Signal;
use async_trait::async_trait;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Who times the acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingMode {
    /// One software count per point
    #[default]
    Software,
    /// One hardware burst for all points
    Hardware,
}

impl FromStr for TimingMode {
    type Err = MacroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" | "sw" => Ok(TimingMode::Software),
            "hardware" | "hw" => Ok(TimingMode::Hardware),
            other => Err(MacroError::InvalidParameter(format!(
                "timescan: unknown timing mode '{}'",
                other
            ))),
        }
    }
}

/// `npts` acquisitions of `integ_time` seconds, `latency` apart.
pub struct TimeScan {
    npts: usize,
    integ_time: f64,
    latency: Duration,
    mode: TimingMode,
    next: usize,
    subs: Subscriptions,
    cleaned: bool,
}

impl TimeScan {
    /// Time scan timed in `mode`
    pub fn new(npts: usize, integ_time: f64, latency: Duration, mode: TimingMode) -> Self {
        Self {
            npts,
            integ_time,
            latency,
            mode,
            next: 0,
            subs: Subscriptions::default(),
            cleaned: false,
        }
    }

    /// Integration of every point plus the latency between them
    fn acq_estimate(&self) -> f64 {
        let n = self.npts as f64;
        self.integ_time * n + self.latency.as_secs_f64() * (n - 1.0).max(0.0)
    }

    async fn software_point(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>> {
        if self.next >= self.npts {
            return Ok(None);
        }
        if self.next > 0 && !self.latency.is_zero() {
            ctx.sleep(self.latency).await?;
        }
        let dt = core.elapsed();
        let values = core.acquire(ctx, self.integ_time, false).await?;
        let mut record = Record::new(self.next, dt);
        record.values = values;
        record.extras = core.read_extras(ctx).await?;
        core.add_record(record).await?;
        self.next += 1;
        Ok(Some(self.next as f64))
    }

    async fn hardware_burst(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>> {
        if self.next >= self.npts {
            return Ok(None);
        }
        self.next = self.npts;

        let total = self.integ_time + self.latency.as_secs_f64();
        let acq = core.acq.clone();
        ctx.device_call(acq.set_synch_description(SynchDescription::time_burst(
            0.0,
            self.integ_time,
            total,
            self.npts,
        )))
        .await?;
        let (subs, mut rx) = Subscriptions::subscribe(ctx, core).await?;
        self.subs = subs;

        let count = ctx.device_call(acq.start_count(self.integ_time)).await?;
        let mut collector = BufferCollector::new(
            TriggerPlan::timed(0.0, total, self.npts),
            core.channels.clone(),
            core.data.len(),
            core.elapsed(),
        );
        let finished = Signal::new();
        let countdown = core.settings.countdown_timeout();
        let burst = async {
            let result = ctx.device_call(acq.wait_count(count, None)).await;
            finished.set();
            result
        };
        let collection = collect(ctx, core, &mut collector, &mut rx, &finished, countdown);
        tokio::try_join!(burst, collection)?;
        info!(
            points = self.npts,
            synthetic = collector.synthetic_count(),
            "time burst done"
        );
        Ok(Some(self.npts as f64))
    }
}

#[async_trait]
impl ScanLoop for TimeScan {
    fn range(&self) -> (f64, f64) {
        (0.0, self.npts as f64)
    }

    fn estimate(&self, _core: &ScanCore) -> Estimate {
        Estimate {
            motion_time: 0.0,
            acq_time: self.acq_estimate(),
        }
    }

    async fn scan_step(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>> {
        match self.mode {
            TimingMode::Software => self.software_point(ctx, core).await,
            TimingMode::Hardware => self.hardware_burst(ctx, core).await,
        }
    }

    async fn cleanup(
        &mut self,
        ctx: &MacroContext,
        core: &mut ScanCore,
        _state: MacroState,
    ) -> MacroResult<()> {
        if std::mem::replace(&mut self.cleaned, true) {
            return Ok(());
        }
        burst_cleanup(ctx, core, &mut self.subs).await
    }
}
