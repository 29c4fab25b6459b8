//! Shared test bench: an in-memory session, two mock motors and a counter.

#![allow(dead_code)]

use daq_macroserver::config::Settings;
use daq_macroserver::hardware::mock::{MockCounter, MockMotor};
use daq_macroserver::hardware::DevicePool;
use daq_macroserver::macros::context::ACTIVE_MNTGRP;
use daq_macroserver::macros::MacroCatalog;
use daq_macroserver::session::InMemorySession;
use daq_macroserver::{MacroExecutor, StatusKind};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct Bench {
    pub session: Arc<InMemorySession>,
    pub executor: MacroExecutor,
    pub mot01: Arc<MockMotor>,
    pub mot02: Arc<MockMotor>,
    pub counter: Arc<MockCounter>,
}

impl Bench {
    /// Bench with default settings and `ActiveMntGrp` pointing at the counter
    pub fn new() -> Self {
        Self::with(Settings::default(), &[])
    }

    /// Bench with custom settings and extra environment variables
    pub fn with(settings: Settings, env: &[(&str, Value)]) -> Self {
        let mut session = InMemorySession::new("door01").with_env(ACTIVE_MNTGRP, json!("mntgrp01"));
        for (name, value) in env {
            session = session.with_env(name, value.clone());
        }
        Self::build(Arc::new(session), settings)
    }

    /// Bench whose catalog also holds the macros added by `register`
    pub fn with_macros(settings: Settings, register: impl FnOnce(&mut MacroCatalog)) -> Self {
        let session = InMemorySession::new("door01").with_env(ACTIVE_MNTGRP, json!("mntgrp01"));
        let mut catalog = MacroCatalog::with_builtins();
        register(&mut catalog);
        Self::assemble(Arc::new(session), settings, catalog)
    }

    /// Bench around an existing session
    pub fn build(session: Arc<InMemorySession>, settings: Settings) -> Self {
        Self::assemble(session, settings, MacroCatalog::with_builtins())
    }

    fn assemble(session: Arc<InMemorySession>, settings: Settings, catalog: MacroCatalog) -> Self {
        let mot01 = Arc::new(MockMotor::with_velocity("mot01", 100.0));
        let mot02 = Arc::new(MockMotor::with_velocity("mot02", 100.0));
        let counter = Arc::new(MockCounter::new("mntgrp01", &["ct01", "ct02"]).with_ref_channel("img01"));

        let pool = Arc::new(DevicePool::new());
        pool.register_moveable(mot01.clone());
        pool.register_moveable(mot02.clone());
        pool.register_acquirable(counter.clone());

        let executor = MacroExecutor::new(
            session.clone(),
            pool,
            Arc::new(catalog),
            settings,
        );
        Self {
            session,
            executor,
            mot01,
            mot02,
            counter,
        }
    }

    /// Kinds of every status event, in emission order
    pub fn status_kinds(&self) -> Vec<StatusKind> {
        self.session.statuses().iter().map(|s| s.kind).collect()
    }

    /// Kind of the last status event
    pub fn last_status(&self) -> Option<StatusKind> {
        self.session.statuses().last().map(|s| s.kind)
    }
}
