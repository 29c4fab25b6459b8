//! Builtin one-shot macros: `mv`, `ct`, `wait`.

use super::context::ACTIVE_MNTGRP;
use super::{MacroBody, MacroCatalog, MacroContext, MacroRun};
use crate::error::{MacroError, MacroResult};
use crate::hardware::{Acquirable, Device, DeviceState};
use crate::scan::motion::MotionGroup;
use crate::value::{self, ParamCursor, ParamValue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn register(catalog: &mut MacroCatalog) {
    catalog.register(
        "mv",
        "Move motors to absolute positions: mv <motor> <pos> [<motor> <pos> ...]",
        &[],
        || Box::new(Mv::default()),
    );
    catalog.register(
        "ct",
        "Count on the active measurement group: ct [integ_time]",
        &[ACTIVE_MNTGRP],
        || Box::new(Ct::default()),
    );
    catalog.register(
        "wait",
        "Sleep for the given number of seconds: wait <seconds>",
        &[],
        || Box::new(Wait::default()),
    );
}

#[derive(Default)]
struct Mv {
    group: Option<MotionGroup>,
    targets: Vec<f64>,
}

#[async_trait]
impl MacroBody for Mv {
    async fn prepare(
        &mut self,
        ctx: &MacroContext,
        params: Vec<ParamValue>,
    ) -> MacroResult<Option<ParamValue>> {
        if params.is_empty() || params.len() % 2 != 0 {
            return Err(MacroError::InvalidParameter(
                "mv: expected <motor> <pos> pairs".into(),
            ));
        }
        let mut cur = ParamCursor::new("mv", &params);
        let mut motors = Vec::new();
        while cur.remaining() > 0 {
            motors.push(ctx.get_moveable(&cur.string("motor")?)?);
            self.targets.push(cur.f64("position")?);
        }
        self.group = Some(MotionGroup::new(motors));
        Ok(None)
    }

    async fn run(&mut self, ctx: &MacroContext) -> MacroResult<MacroRun> {
        let group = self
            .group
            .as_ref()
            .ok_or_else(|| MacroError::InvalidParameter("mv: not prepared".into()))?;
        let (state, positions) = group.move_to(ctx, &self.targets).await?;
        for (name, pos) in group.names().iter().zip(&positions) {
            ctx.output(format!("{} = {}", name, pos))?;
        }
        if state != DeviceState::On {
            ctx.warning(format!("motion ended in state {:?}", state))?;
        }
        Ok(MacroRun::Finished(Some(ParamValue::FloatArray(positions))))
    }
}

#[derive(Default)]
struct Ct {
    integ_time: f64,
    acq: Option<Arc<dyn Acquirable>>,
}

#[async_trait]
impl MacroBody for Ct {
    async fn prepare(
        &mut self,
        ctx: &MacroContext,
        params: Vec<ParamValue>,
    ) -> MacroResult<Option<ParamValue>> {
        let mut cur = ParamCursor::new("ct", &params);
        self.integ_time = cur.opt_f64("integ_time")?.unwrap_or(1.0);
        cur.finish()?;
        value::seconds("ct", "integ_time", self.integ_time)?;
        self.acq = Some(ctx.get_active_acquirable()?);
        Ok(None)
    }

    async fn run(&mut self, ctx: &MacroContext) -> MacroResult<MacroRun> {
        let acq = self
            .acq
            .clone()
            .ok_or_else(|| MacroError::InvalidParameter("ct: not prepared".into()))?;
        let integ = self.integ_time;
        let values = ctx
            .guarded(async {
                let handle = ctx.device_call(acq.start_count(integ)).await?;
                ctx.device_call(acq.wait_count(handle, None)).await
            })
            .await?;
        for (channel, value) in &values {
            ctx.output(format!("{:>12} = {}", channel, value))?;
        }
        Ok(MacroRun::Finished(Some(ParamValue::FloatArray(
            values.values().copied().collect(),
        ))))
    }

    async fn on_stop(&mut self, _ctx: &MacroContext) -> MacroResult<()> {
        if let Some(acq) = &self.acq {
            acq.stop().await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Wait {
    duration: Duration,
}

#[async_trait]
impl MacroBody for Wait {
    async fn prepare(
        &mut self,
        _ctx: &MacroContext,
        params: Vec<ParamValue>,
    ) -> MacroResult<Option<ParamValue>> {
        let mut cur = ParamCursor::new("wait", &params);
        self.duration = cur.seconds("seconds")?;
        cur.finish()?;
        Ok(None)
    }

    async fn run(&mut self, ctx: &MacroContext) -> MacroResult<MacroRun> {
        ctx.sleep(self.duration).await?;
        Ok(MacroRun::Finished(None))
    }
}
