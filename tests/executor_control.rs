//! Executor lifecycle, hooks and control requests.

mod common;

use common::Bench;
use daq_macroserver::config::Settings;
use daq_macroserver::hooks::{AsyncFnHook, FnHook, MacroHook};
use daq_macroserver::macros::{MacroBody, MacroRun};
use daq_macroserver::params;
use daq_macroserver::scan::{ScanHistoryEntry, SCAN_HISTORY};
use daq_macroserver::session::InMemorySession;
use daq_macroserver::{MacroContext, MacroError, MacroResult, ParamValue, Session, StatusKind};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_test::traced_test;

#[tokio::test]
async fn test_scan_requires_active_measurement_group() {
    let bench = Bench::build(Arc::new(InMemorySession::new("door01")), Settings::default());

    let err = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 1.0, 1, 0.1])
        .await
        .unwrap_err();

    match err {
        MacroError::MissingEnvironment { macro_name, missing } => {
            assert_eq!(macro_name, "ascan");
            assert_eq!(missing, vec!["ActiveMntGrp".to_string()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(bench.session.statuses().is_empty());
}

#[tokio::test]
async fn test_scoped_environment_satisfies_requirement() {
    let session = InMemorySession::new("door01").with_env("ascan.ActiveMntGrp", json!("mntgrp01"));
    let bench = Bench::build(Arc::new(session), Settings::default());

    bench
        .executor
        .run("ascan", params!["mot01", 0.0, 1.0, 1, 0.0])
        .await
        .unwrap();
    assert_eq!(bench.session.records().len(), 2);
}

#[tokio::test]
async fn test_unknown_macro_and_bad_parameters() {
    let bench = Bench::new();

    let err = bench.executor.run("nscan", params![1]).await.unwrap_err();
    assert!(matches!(err, MacroError::UnknownMacro(name) if name == "nscan"));

    let err = bench
        .executor
        .run("ascan", params!["mot01", 0.0, 1.0, 0, 0.1])
        .await
        .unwrap_err();
    assert!(matches!(err, MacroError::InvalidParameter(_)));

    let err = bench
        .executor
        .run("ascan", params!["mot99", 0.0, 1.0, 2, 0.1])
        .await
        .unwrap_err();
    assert!(matches!(err, MacroError::ScanSetup(_)), "{:?}", err);

    let err = bench
        .executor
        .run("ascanc", params!["mot01", 0.0, 1.0, 0.1, 1.5])
        .await
        .unwrap_err();
    assert!(matches!(err, MacroError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_hooks_run_in_registration_order() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 2.0, 2, 0.0])
        .await
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let log = log.clone();
        prepared.append_hook(
            FnHook::new(name, move |_ctx| {
                log.lock().unwrap().push(name);
                Ok(())
            }),
            &["pre-move"],
        );
    }
    let ignored = Arc::new(AtomicUsize::new(0));
    for hints in [&[][..], &["pre-cleanup"][..]] {
        let ignored = ignored.clone();
        prepared.append_hook(
            FnHook::new("ignored", move |_ctx| {
                ignored.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            hints,
        );
    }

    bench.executor.run_prepared(prepared).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["first", "second", "first", "second", "first", "second"]
    );
    assert_eq!(ignored.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_hook_fails_the_scan() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 2.0, 2, 0.0])
        .await
        .unwrap();
    prepared.append_hook(
        AsyncFnHook::new("broken", |_ctx| {
            async { Err(MacroError::Scan("hook failed".into())) }.boxed()
        }),
        &["post-acq"],
    );

    let err = bench.executor.run_prepared(prepared).await.unwrap_err();

    assert!(matches!(err, MacroError::Scan(_)));
    assert!(bench.session.records().is_empty());
    let last = bench.session.statuses().pop().unwrap();
    assert_eq!(last.kind, StatusKind::Exception);
    assert_eq!(last.exc_type.as_deref(), Some("ScanException"));
}

#[tokio::test]
async fn test_macro_hook_runs_child_macro() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 1.0, 1, 0.0])
        .await
        .unwrap();
    prepared.append_hook(MacroHook::new("mv", params!["mot02", 3.0]), &["pre-scan"]);

    bench.executor.run_prepared(prepared).await.unwrap();

    use daq_macroserver::hardware::Moveable;
    assert!((bench.mot02.read_position(true).await.unwrap() - 3.0).abs() < 1e-9);
    let names: Vec<String> = bench.session.statuses().into_iter().map(|s| s.name).collect();
    assert!(names.iter().any(|n| n == "mv"));
    assert_eq!(names.last().map(String::as_str), Some("ascan"));
}

#[tokio::test]
async fn test_history_is_capped() {
    let mut settings = Settings::default();
    settings.scan.history_size = 3;
    let bench = Bench::with(settings, &[]);

    for _ in 0..4 {
        bench.executor.run("timescan", params![1, 0.0]).await.unwrap();
    }

    let history: Vec<ScanHistoryEntry> =
        serde_json::from_value(bench.session.get_env(SCAN_HISTORY).unwrap()).unwrap();
    let serials: Vec<i64> = history.iter().map(|e| e.serial).collect();
    assert_eq!(serials, vec![2, 3, 4]);
    assert!(history.iter().all(|e| e.end_status == "Finished"));
    assert_eq!(bench.session.get_env("ScanID").unwrap(), json!(4));
}

#[tokio::test]
#[traced_test]
async fn test_motion_parameters_restored_once() {
    let bench = Bench::new();

    bench
        .executor
        .run("ascanc", params!["mot01", 0.0, 1.0, 0.05])
        .await
        .unwrap();

    assert!(logs_contain("backed up motion parameters"));
    logs_assert(|lines: &[&str]| {
        match lines
            .iter()
            .filter(|line| line.contains("restored motion parameters"))
            .count()
        {
            1 => Ok(()),
            n => Err(format!("restored {} times", n)),
        }
    });
    assert_eq!(bench.mot01.velocity_log().last(), Some(&100.0));
}

#[tokio::test]
async fn test_executor_rejects_second_top_level_macro() {
    let bench = Bench::new();
    let executor = bench.executor.clone();
    let running = tokio::spawn(async move { executor.run("wait", params![5.0]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = bench.executor.run("ct", params![0.1]).await.unwrap_err();
    assert!(matches!(err, MacroError::Busy(_)));
    assert_eq!(bench.executor.running_macro().unwrap().name, "wait");

    bench.executor.stop();
    let result = running.await.unwrap();
    assert!(matches!(result, Err(MacroError::Stop)));
    bench.executor.wait_passes().await;
    assert!(bench.executor.is_stopped());
    assert_eq!(bench.executor.stack_depth(), 0);
}

#[tokio::test]
async fn test_builtins_report_results() {
    let bench = Bench::new();

    let moved = bench.executor.run("mv", params!["mot01", 2.5]).await.unwrap();
    assert_eq!(moved, Some(ParamValue::FloatArray(vec![2.5])));

    let counted = bench.executor.run("ct", params![0.01]).await.unwrap();
    assert_eq!(counted, Some(ParamValue::FloatArray(vec![1.0, 2.0])));

    assert!(!bench.executor.pause());
    assert!(!bench.executor.resume());
}

#[tokio::test]
async fn test_abort_during_wait() {
    let bench = Bench::new();
    let executor = bench.executor.clone();
    let running = tokio::spawn(async move { executor.run("wait", params![10.0]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    bench.executor.abort();
    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("abort unblocks the macro")
        .unwrap();
    bench.executor.wait_passes().await;

    assert!(matches!(result, Err(MacroError::Abort)));
    assert_eq!(bench.last_status(), Some(StatusKind::Abort));
}

#[tokio::test]
async fn test_non_finite_durations_are_rejected() {
    let bench = Bench::new();

    for seconds in [f64::NAN, f64::INFINITY, -1.0] {
        let err = bench.executor.run("wait", params![seconds]).await.unwrap_err();
        assert!(matches!(err, MacroError::InvalidParameter(_)), "{:?}", err);
    }
    let err = bench.executor.run("ct", params![f64::NAN]).await.unwrap_err();
    assert!(matches!(err, MacroError::InvalidParameter(_)), "{:?}", err);
    let err = bench
        .executor
        .run("timescan", params![3, 0.01, f64::INFINITY])
        .await
        .unwrap_err();
    assert!(matches!(err, MacroError::InvalidParameter(_)), "{:?}", err);
    let err = bench
        .executor
        .run("ascanct", params!["mot01", 0.0, 1.0, 4, 0.01, f64::NAN])
        .await
        .unwrap_err();
    assert!(matches!(err, MacroError::InvalidParameter(_)), "{:?}", err);

    // nothing was left on the stack
    assert_eq!(bench.executor.stack_depth(), 0);
    bench.executor.run("wait", params![0.0]).await.unwrap();
}

/// Sleeps until cancelled; its abort handler never returns on its own.
struct StuckOnAbort;

#[async_trait]
impl MacroBody for StuckOnAbort {
    async fn run(&mut self, ctx: &MacroContext) -> MacroResult<MacroRun> {
        ctx.sleep(Duration::from_secs(3600)).await?;
        Ok(MacroRun::Finished(None))
    }

    async fn on_abort(&mut self, _ctx: &MacroContext) -> MacroResult<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_release_unblocks_stuck_abort_handler() {
    let bench = Bench::with_macros(Settings::default(), |catalog| {
        catalog.register("stuck_on_abort", "Hangs in its abort handler", &[], || {
            Box::new(StuckOnAbort)
        });
    });
    let executor = bench.executor.clone();
    let running = tokio::spawn(async move { executor.run("stuck_on_abort", Vec::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    bench.executor.abort();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bench.executor.stack_depth(), 1, "abort handler is still running");

    bench.executor.release();
    let result = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("release unblocks the abort handler")
        .unwrap();
    bench.executor.wait_passes().await;

    assert!(matches!(result, Err(MacroError::Release)), "{:?}", result);
    assert!(bench.executor.is_released());
    assert_eq!(bench.executor.stack_depth(), 0);
    assert_eq!(bench.last_status(), Some(StatusKind::Abort));
}

#[tokio::test]
#[traced_test]
async fn test_stop_reaches_reserved_devices_in_order() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 10.0, 10, 0.0])
        .await
        .unwrap();
    let executor = bench.executor.clone();
    let steps = AtomicUsize::new(0);
    prepared.append_hook(
        FnHook::new("stop-at-3", move |_ctx| {
            if steps.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                executor.stop();
            }
            Ok(())
        }),
        &["post-step"],
    );

    let err = bench.executor.run_prepared(prepared).await.unwrap_err();
    bench.executor.wait_passes().await;

    assert!(matches!(err, MacroError::Stop));
    assert_eq!(bench.mot01.stop_count(), 1);
    assert_eq!(bench.counter.stop_count(), 1);
    assert_eq!(bench.mot01.abort_count(), 0);
    assert_eq!(bench.counter.abort_count(), 0);
    // motors are reserved before the acquisition target
    logs_assert(|lines: &[&str]| {
        let stopped: Vec<&str> = lines
            .iter()
            .filter(|line| line.contains("stopped device="))
            .copied()
            .collect();
        match stopped.as_slice() {
            [first, second] if first.contains("mot01") && second.contains("mntgrp01") => Ok(()),
            other => Err(format!("unexpected stop order: {:?}", other)),
        }
    });
}

#[tokio::test]
async fn test_abort_reaches_reserved_devices() {
    let bench = Bench::new();
    let executor = bench.executor.clone();
    let running = tokio::spawn(async move { executor.run("mv", params!["mot01", 1000.0]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bench.executor.holders("mot01").len(), 1);

    bench.executor.abort();
    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("abort interrupts the move")
        .unwrap();
    bench.executor.wait_passes().await;

    assert!(matches!(result, Err(MacroError::Abort)), "{:?}", result);
    assert_eq!(bench.mot01.abort_count(), 1);
    assert_eq!(bench.mot01.stop_count(), 0);
    assert_eq!(bench.mot02.abort_count(), 0);
    assert!(bench.executor.holders("mot01").is_empty());
}

#[tokio::test]
async fn test_abort_escalates_past_stuck_stop() {
    let bench = Bench::new();
    bench.mot01.stall_stop();
    let executor = bench.executor.clone();
    let running = tokio::spawn(async move { executor.run("mv", params!["mot01", 1000.0]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the move blocks in the device, so the stop is not observed
    bench.executor.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bench.executor.stack_depth(), 1);
    assert_eq!(bench.mot01.stop_count(), 1);

    bench.executor.abort();
    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("abort does not wait for the stuck stop")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), bench.executor.wait_passes())
        .await
        .expect("abort releases the stop pass");

    assert!(matches!(result, Err(MacroError::Abort)), "{:?}", result);
    assert!(bench.executor.is_stopped());
    assert!(bench.executor.is_aborted());
    // never stopped, so the abort pass aborts it
    assert_eq!(bench.mot01.abort_count(), 1);
}

#[tokio::test]
async fn test_reservations_are_returned_on_pop() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 1.0, 1, 0.0])
        .await
        .unwrap();
    let scan_id = prepared.info().id;
    let executor = bench.executor.clone();
    let seen: Arc<Mutex<Vec<(Vec<String>, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    prepared.append_hook(MacroHook::new("mv", params!["mot02", 1.0]), &["post-step"]);
    prepared.append_hook(
        FnHook::new("check-holders", move |ctx| {
            assert_eq!(executor.holders("mot01"), vec![ctx.macro_info().id]);
            log.lock()
                .unwrap()
                .push((executor.reserved_by(ctx.macro_info().id), executor.holders("mot02").len()));
            Ok(())
        }),
        &["post-step"],
    );

    bench.executor.run_prepared(prepared).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for (reserved, mot02_holders) in seen.iter() {
        assert_eq!(reserved, &vec!["mot01".to_string(), "mntgrp01".to_string()]);
        // the child macro returned mot02 when it finished
        assert_eq!(*mot02_holders, 0);
    }
    assert!(bench.executor.reserved_by(scan_id).is_empty());
    assert!(bench.executor.holders("mot01").is_empty());
    assert!(bench.executor.holders("mntgrp01").is_empty());
}

#[tokio::test]
async fn test_released_abort_pass_leaves_paused_macro_to_its_watchdog() {
    let mut settings = Settings::default();
    settings.executor.pause_watchdog_grace_ms = 100;
    let bench = Bench::with(settings, &[]);
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 10.0, 10, 0.0])
        .await
        .unwrap();
    let executor = bench.executor.clone();
    let steps = AtomicUsize::new(0);
    prepared.append_hook(
        FnHook::new("pause-at-2", move |_ctx| {
            if steps.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                assert!(executor.pause());
                let executor = executor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    executor.abort();
                    executor.release();
                });
            }
            Ok(())
        }),
        &["post-step"],
    );

    let err = tokio::time::timeout(Duration::from_secs(2), bench.executor.run_prepared(prepared))
        .await
        .expect("watchdog ends the paused macro")
        .unwrap_err();
    bench.executor.wait_passes().await;

    assert!(matches!(err, MacroError::ForcedAbort), "{:?}", err);
    assert!(err.is_abort());
    assert_eq!(bench.session.records().len(), 2);
    assert_eq!(bench.last_status(), Some(StatusKind::Abort));
    assert!(!bench.executor.is_paused());
}

#[tokio::test]
async fn test_stop_clears_pause() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 10.0, 10, 0.0])
        .await
        .unwrap();
    let executor = bench.executor.clone();
    let steps = AtomicUsize::new(0);
    prepared.append_hook(
        FnHook::new("pause-then-stop", move |_ctx| {
            if steps.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                assert!(executor.pause());
                let executor = executor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    assert!(executor.is_paused());
                    executor.stop();
                });
            }
            Ok(())
        }),
        &["post-step"],
    );

    let err = bench.executor.run_prepared(prepared).await.unwrap_err();
    bench.executor.wait_passes().await;

    assert!(matches!(err, MacroError::Stop), "{:?}", err);
    assert!(bench.executor.is_stopped());
    assert!(!bench.executor.is_paused());
    assert_eq!(bench.session.records().len(), 2);
}
