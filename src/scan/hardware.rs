//! Hardware-timed continuous scan.
//!
//! For every leg the acquisition target free-runs `npts` triggers described
//! by a [`SynchDescription`] while the axes cruise through the leg. Values
//! arrive asynchronously as buffer pushes; a [`BufferCollector`] turns them
//! into records in point order. Points the hardware never reported are
//! back-filled from the trigger plan and flagged as synthetic.
//!
//! The buffer subscriptions are taken before the first burst and held until
//! cleanup.

use super::continuous::{drive_motion, CruiseWindow};
use super::core::{Estimate, ScanCore, ScanLoop, POST_CLEANUP, POST_MOVE, PRE_CLEANUP, PRE_MOVE};
use super::motion::{coordinate, MotionPath};
use super::record::Record;
use super::secs;
use super::synch::SynchDescription;
use super::waypoint::{self, Waypoint};
use crate::error::{MacroError, MacroResult};
use crate::hardware::{BufferEvent, SubscriptionId};
use crate::macros::{MacroContext, MacroState};
use crate::signal::Signal;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Where and when every trigger of a burst is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPlan {
    pub motors: Vec<String>,
    pub starts: Vec<f64>,
    pub finals: Vec<f64>,
    /// Seconds between the count start and the first trigger
    pub delay: f64,
    /// Seconds between two triggers
    pub total: f64,
    pub npts: usize,
}

impl TriggerPlan {
    /// Plan without motion
    pub fn timed(delay: f64, total: f64, npts: usize) -> Self {
        Self {
            motors: Vec::new(),
            starts: Vec::new(),
            finals: Vec::new(),
            delay,
            total,
            npts,
        }
    }

    /// Theoretical axis positions at trigger `k`
    pub fn positions(&self, k: usize) -> BTreeMap<String, f64> {
        let frac = if self.npts == 0 {
            0.0
        } else {
            k as f64 / self.npts as f64
        };
        self.motors
            .iter()
            .zip(self.starts.iter().zip(&self.finals))
            .map(|(m, (s, f))| (m.clone(), s + (f - s) * frac))
            .collect()
    }

    /// Seconds after the count start at which trigger `k` fires
    pub fn offset(&self, k: usize) -> f64 {
        self.delay + self.total * k as f64
    }
}

/// Reorders buffer pushes into complete records.
pub struct BufferCollector {
    plan: TriggerPlan,
    channels: Vec<String>,
    first_point: usize,
    origin: f64,
    next: usize,
    values: BTreeMap<usize, BTreeMap<String, f64>>,
    refs: BTreeMap<usize, BTreeMap<String, String>>,
    synthetic: usize,
}

impl BufferCollector {
    /// `first_point` numbers the first record, `origin` is the scan clock
    /// reading when the count started.
    pub fn new(plan: TriggerPlan, channels: Vec<String>, first_point: usize, origin: f64) -> Self {
        Self {
            plan,
            channels,
            first_point,
            origin,
            next: 0,
            values: BTreeMap::new(),
            refs: BTreeMap::new(),
            synthetic: 0,
        }
    }

    pub fn push(&mut self, event: BufferEvent) {
        match event {
            BufferEvent::Values(buffer) => {
                for (idx, value) in buffer.indices.into_iter().zip(buffer.values) {
                    if idx < self.next || idx >= self.plan.npts {
                        warn!(index = idx, channel = %buffer.channel, "value outside the pending points");
                        continue;
                    }
                    self.values
                        .entry(idx)
                        .or_default()
                        .insert(buffer.channel.clone(), value);
                }
            }
            BufferEvent::Refs(buffer) => {
                for (idx, reference) in buffer.indices.into_iter().zip(buffer.refs) {
                    if idx < self.next || idx >= self.plan.npts {
                        warn!(index = idx, channel = %buffer.channel, "reference outside the pending points");
                        continue;
                    }
                    self.refs
                        .entry(idx)
                        .or_default()
                        .insert(buffer.channel.clone(), reference);
                }
            }
        }
    }

    fn is_complete(&self, idx: usize) -> bool {
        self.values
            .get(&idx)
            .map(|v| self.channels.iter().all(|ch| v.contains_key(ch)))
            .unwrap_or(false)
    }

    fn build(&mut self, idx: usize) -> Record {
        let mut record = Record::new(self.first_point + idx, self.origin + self.plan.offset(idx));
        record.positions = self.plan.positions(idx);
        let mut values = self.values.remove(&idx).unwrap_or_default();
        for channel in &self.channels {
            if !values.contains_key(channel) {
                values.insert(channel.clone(), f64::NAN);
                record.synthetic = true;
            }
        }
        record.values = values;
        record.refs = self.refs.remove(&idx).unwrap_or_default();
        if record.synthetic {
            self.synthetic += 1;
        }
        record
    }

    /// Records for the leading complete points, in order.
    pub fn ready(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        while self.next < self.plan.npts && self.is_complete(self.next) {
            let idx = self.next;
            out.push(self.build(idx));
            self.next += 1;
        }
        out
    }

    /// Records for every point still pending, back-filling the missing ones.
    pub fn finish(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        while self.next < self.plan.npts {
            let idx = self.next;
            out.push(self.build(idx));
            self.next += 1;
        }
        if self.synthetic > 0 {
            warn!(points = self.synthetic, "back-filled points the hardware did not report");
        }
        out
    }

    pub fn is_done(&self) -> bool {
        self.next >= self.plan.npts
    }

    /// Number of back-filled points so far
    pub fn synthetic_count(&self) -> usize {
        self.synthetic
    }
}

enum Next {
    Event(BufferEvent),
    SourceDone,
    Quiet,
}

/// Drain buffer pushes into records until every point was seen, or until
/// `finished` is set and nothing arrived within `countdown`.
pub(crate) async fn collect(
    ctx: &MacroContext,
    core: &mut ScanCore,
    collector: &mut BufferCollector,
    rx: &mut mpsc::UnboundedReceiver<BufferEvent>,
    finished: &Signal,
    countdown: Duration,
) -> MacroResult<()> {
    while !collector.is_done() {
        let next = ctx
            .guarded(async {
                if finished.is_set() {
                    return Ok(match tokio::time::timeout(countdown, rx.recv()).await {
                        Ok(Some(event)) => Next::Event(event),
                        Ok(None) | Err(_) => Next::Quiet,
                    });
                }
                Ok(tokio::select! {
                    event = rx.recv() => event.map_or(Next::Quiet, Next::Event),
                    _ = finished.wait() => Next::SourceDone,
                })
            })
            .await?;
        match next {
            Next::Event(event) => {
                collector.push(event);
                while let Ok(event) = rx.try_recv() {
                    collector.push(event);
                }
            }
            Next::SourceDone => continue,
            Next::Quiet => {
                debug!("countdown expired");
                break;
            }
        }
        for record in collector.ready() {
            core.add_record(record).await?;
        }
    }
    for record in collector.finish() {
        core.add_record(record).await?;
    }
    Ok(())
}

/// Buffer subscriptions held by a running burst.
#[derive(Default)]
pub(crate) struct Subscriptions {
    values: Option<SubscriptionId>,
    refs: Option<SubscriptionId>,
}

impl Subscriptions {
    pub(crate) async fn subscribe(
        ctx: &MacroContext,
        core: &ScanCore,
    ) -> MacroResult<(Self, mpsc::UnboundedReceiver<BufferEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let acq = core.acq.clone();
        let values = ctx.device_call(acq.subscribe_value_buffer(tx.clone())).await?;
        let mut subs = Self {
            values: Some(values),
            refs: None,
        };
        match ctx.device_call(acq.subscribe_value_ref_buffer(tx)).await {
            Ok(refs) => subs.refs = Some(refs),
            Err(e) => {
                subs.release(core).await;
                return Err(e);
            }
        }
        Ok((subs, rx))
    }

    /// Unsubscribe everything and reset the target to software timing.
    /// Failures are logged.
    pub(crate) async fn release(&mut self, core: &ScanCore) {
        let acq = &core.acq;
        if let Some(id) = self.values.take() {
            if let Err(e) = acq.unsubscribe_value_buffer(id).await {
                warn!(error = %e, "failed to unsubscribe value buffer");
            }
        }
        if let Some(id) = self.refs.take() {
            if let Err(e) = acq.unsubscribe_value_ref_buffer(id).await {
                warn!(error = %e, "failed to unsubscribe value-ref buffer");
            }
        }
        if let Err(e) = acq.set_synch_description(SynchDescription::software()).await {
            warn!(error = %e, "failed to reset synchronization");
        }
    }
}

/// Run pre-cleanup hooks, release the subscriptions and run post-cleanup
/// hooks. Every step runs even when an earlier one failed; the first error
/// is returned.
pub(crate) async fn burst_cleanup(ctx: &MacroContext, core: &ScanCore, subs: &mut Subscriptions) -> MacroResult<()> {
    let pre = ctx.run_hooks(PRE_CLEANUP).await;
    subs.release(core).await;
    let post = ctx.run_hooks(POST_CLEANUP).await;
    pre.and(post)
}

/// Hardware-timed continuous scan through a list of legs, `npts` triggers
/// per leg.
pub struct HardwareScan {
    waypoints: Vec<Waypoint>,
    npts: usize,
    integ_time: f64,
    /// Seconds between two triggers, latency included
    total: f64,
    subs: Subscriptions,
    rx: Option<mpsc::UnboundedReceiver<BufferEvent>>,
    next: usize,
    /// Leg whose end the axes were last sent past
    overshot: Option<usize>,
    cleaned: bool,
}

impl HardwareScan {
    /// One trigger every `integ_time + latency` seconds, `npts` per leg.
    pub fn new(waypoints: Vec<Waypoint>, npts: usize, integ_time: f64, latency: f64) -> Self {
        Self {
            waypoints,
            npts,
            integ_time,
            total: integ_time + latency,
            subs: Subscriptions::default(),
            rx: None,
            next: 0,
            overshot: None,
            cleaned: false,
        }
    }

    /// Cruise duration of one leg
    pub fn cruise(&self) -> f64 {
        self.total * self.npts as f64
    }

    async fn plan(&self, ctx: &MacroContext, core: &ScanCore, waypoint: &Waypoint) -> MacroResult<Vec<MotionPath>> {
        let cruise = self.cruise();
        let mut paths = waypoint::leg_paths(ctx, core, waypoint).await?;
        let fastest = coordinate(&mut paths, 1.0);
        if fastest > cruise {
            let (motor, velocity) = paths
                .iter()
                .map(|p| (p.motor.clone(), p.displacement().abs() / cruise))
                .fold((String::new(), 0.0), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
            return Err(MacroError::ScanSetup(format!(
                "{} would need velocity {} to cover its range in {}s",
                motor, velocity, cruise
            )));
        }
        for path in &mut paths {
            path.cruise_velocity = path.displacement().abs() / cruise;
        }
        waypoint::check_limits(core.motion.motors(), &paths)?;
        Ok(paths)
    }

    /// Buffer pushes of every burst, subscribing on first use.
    async fn receiver(&mut self, ctx: &MacroContext, core: &ScanCore) -> MacroResult<mpsc::UnboundedReceiver<BufferEvent>> {
        if let Some(mut rx) = self.rx.take() {
            let mut stale = 0;
            while rx.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(events = stale, "dropped pushes left over from the previous burst");
            }
            return Ok(rx);
        }
        let (subs, rx) = Subscriptions::subscribe(ctx, core).await?;
        self.subs = subs;
        Ok(rx)
    }
}

#[async_trait]
impl ScanLoop for HardwareScan {
    fn range(&self) -> (f64, f64) {
        (0.0, self.waypoints.len() as f64)
    }

    fn estimate(&self, _core: &ScanCore) -> Estimate {
        let legs = self.waypoints.len() as f64;
        Estimate {
            motion_time: self.cruise() * legs,
            acq_time: self.integ_time * self.npts as f64 * legs,
        }
    }

    async fn scan_step(&mut self, ctx: &MacroContext, core: &mut ScanCore) -> MacroResult<Option<f64>> {
        let Some(waypoint) = self.waypoints.get(self.next).cloned() else {
            return Ok(None);
        };
        let leg = self.next;
        self.next += 1;

        if leg > 0 {
            ctx.guarded(core.apply_original_motion()).await?;
        }
        ctx.run_hooks(PRE_MOVE).await?;
        let paths = self.plan(ctx, core, &waypoint).await?;
        let cruise = self.cruise();
        let motors = core.motion.motors().to_vec();
        waypoint::approach(ctx, core, &paths).await?;

        let accel = paths.iter().map(|p| p.accel_time).fold(0.0, f64::max);
        let synch = SynchDescription::time_burst(accel, self.integ_time, self.total, self.npts);
        let acq = core.acq.clone();
        ctx.device_call(acq.set_synch_description(synch)).await?;
        let mut rx = self.receiver(ctx, core).await?;

        if paths.iter().any(|p| !p.is_still()) {
            self.overshot = Some(leg);
        }
        waypoint::arm(ctx, &motors, &paths).await?;
        ctx.checkpoint().await?;

        let plan = TriggerPlan {
            motors: core.motion.names(),
            starts: waypoint.starts.clone(),
            finals: waypoint.finals.clone(),
            delay: accel,
            total: self.total,
            npts: self.npts,
        };
        let count = ctx.device_call(acq.start_count(self.integ_time)).await?;
        let mut collector = BufferCollector::new(plan, core.channels.clone(), core.data.len(), core.elapsed());

        let (cruise_tx, _cruise_rx) = watch::channel::<Option<CruiseWindow>>(None);
        let finished = Signal::new();
        let timeout = core.settings.motion_timeout() + secs(cruise);
        let countdown = core.settings.countdown_timeout();
        let motion = drive_motion(ctx, &motors, &paths, cruise, cruise_tx, &finished, timeout);
        let collection = collect(ctx, core, &mut collector, &mut rx, &finished, countdown);
        let joined = tokio::try_join!(motion, collection);
        self.rx = Some(rx);
        let (motion_time, ()) = joined?;
        core.add_motion_time(motion_time);

        match ctx.device_call(acq.wait_count(count, Some(countdown))).await {
            Ok(_) => {}
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => warn!(error = %e, "burst did not complete"),
        }
        info!(
            leg,
            points = self.npts,
            synthetic = collector.synthetic_count(),
            "hardware leg done"
        );
        ctx.run_hooks(POST_MOVE).await?;
        Ok(Some(self.next as f64))
    }

    async fn cleanup(
        &mut self,
        ctx: &MacroContext,
        core: &mut ScanCore,
        state: MacroState,
    ) -> MacroResult<()> {
        if std::mem::replace(&mut self.cleaned, true) {
            return Ok(());
        }
        self.rx = None;
        let burst = burst_cleanup(ctx, core, &mut self.subs).await;

        let overshot = self.overshot.take().and_then(|leg| self.waypoints.get(leg));
        let correction = match overshot {
            Some(waypoint) if matches!(state, MacroState::Finished | MacroState::Stopped) => {
                waypoint::correct_overshoot(core, &waypoint.finals).await
            }
            _ => Ok(()),
        };
        burst.and(correction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ValueBuffer, ValueRefBuffer};

    fn values(channel: &str, idx: usize, value: f64) -> BufferEvent {
        BufferEvent::Values(ValueBuffer {
            channel: channel.into(),
            indices: vec![idx],
            values: vec![value],
        })
    }

    fn plan(npts: usize) -> TriggerPlan {
        TriggerPlan {
            motors: vec!["mot01".into()],
            starts: vec![0.0],
            finals: vec![10.0],
            delay: 0.5,
            total: 0.1,
            npts,
        }
    }

    #[test]
    fn test_collector_emits_in_order() {
        let mut collector = BufferCollector::new(plan(3), vec!["ct01".into(), "ct02".into()], 0, 1.0);
        collector.push(values("ct01", 1, 2.0));
        collector.push(values("ct02", 1, 4.0));
        assert!(collector.ready().is_empty());

        collector.push(values("ct01", 0, 1.0));
        assert!(collector.ready().is_empty());
        collector.push(values("ct02", 0, 2.0));
        let ready = collector.ready();
        assert_eq!(ready.iter().map(|r| r.point_nb).collect::<Vec<_>>(), vec![0, 1]);
        assert!((ready[1].dt - 1.6).abs() < 1e-12);
        assert!((ready[1].positions["mot01"] - 10.0 / 3.0).abs() < 1e-12);
        assert!(!collector.is_done());
    }

    #[test]
    fn test_collector_backfills_missing_points() {
        let mut collector = BufferCollector::new(plan(3), vec!["ct01".into()], 5, 0.0);
        collector.push(values("ct01", 0, 1.0));
        collector.push(values("ct01", 2, 3.0));
        collector.push(BufferEvent::Refs(ValueRefBuffer {
            channel: "img".into(),
            indices: vec![2],
            refs: vec!["img_0002.h5".into()],
        }));
        assert_eq!(collector.ready().len(), 1);

        let rest = collector.finish();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].point_nb, 6);
        assert!(rest[0].synthetic);
        assert!(rest[0].values["ct01"].is_nan());
        assert!(!rest[1].synthetic);
        assert_eq!(rest[1].refs["img"], "img_0002.h5");
        assert_eq!(collector.synthetic_count(), 1);
        assert!(collector.is_done());
    }

    #[test]
    fn test_late_values_are_ignored() {
        let mut collector = BufferCollector::new(plan(1), vec!["ct01".into()], 0, 0.0);
        collector.push(values("ct01", 0, 1.0));
        assert_eq!(collector.ready().len(), 1);
        collector.push(values("ct01", 0, 9.0));
        collector.push(values("ct01", 7, 9.0));
        assert!(collector.finish().is_empty());
    }
}
