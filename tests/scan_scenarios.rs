//! End-to-end scan runs against the mock device pool.

mod common;

use common::Bench;
use daq_macroserver::hooks::FnHook;
use daq_macroserver::params;
use daq_macroserver::scan::SCAN_HISTORY;
use daq_macroserver::{MacroError, ParamValue, Session, StatusKind};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_ascan_visits_every_point() {
    let bench = Bench::new();

    let result = bench
        .executor
        .run("ascan", params!["mot01", 0.0, 100.0, 10, 0.1])
        .await
        .unwrap();
    assert_eq!(result, Some(ParamValue::Int(11)));

    let records = bench.session.records();
    assert_eq!(records.len(), 11);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.point_nb, i);
        assert!((record.positions["mot01"] - 10.0 * i as f64).abs() < 1e-9);
        assert_eq!(record.values["ct01"], (i + 1) as f64);
        assert_eq!(record.values["ct02"], (2 * (i + 1)) as f64);
        assert!(!record.synthetic);
    }
    assert!(records.windows(2).all(|w| w[1].dt >= w[0].dt));

    let kinds = bench.status_kinds();
    assert_eq!(kinds.first(), Some(&StatusKind::Start));
    assert_eq!(kinds.last(), Some(&StatusKind::Finish));
    assert_eq!(bench.executor.stack_depth(), 0);
}

#[tokio::test]
async fn test_a2scan_moves_both_motors() {
    let bench = Bench::new();

    bench
        .executor
        .run("a2scan", params!["mot01", 0.0, 4.0, "mot02", 10.0, 2.0, 4, 0.0])
        .await
        .unwrap();

    let records = bench.session.records();
    assert_eq!(records.len(), 5);
    assert!((records[4].positions["mot01"] - 4.0).abs() < 1e-9);
    assert!((records[4].positions["mot02"] - 2.0).abs() < 1e-9);
    assert!((records[2].positions["mot02"] - 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_stop_from_post_step_hook() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 100.0, 10, 0.1])
        .await
        .unwrap();
    let executor = bench.executor.clone();
    let steps = Arc::new(AtomicUsize::new(0));
    let seen = steps.clone();
    prepared.append_hook(
        FnHook::new("stop-at-4", move |_ctx| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                executor.stop();
            }
            Ok(())
        }),
        &["post-step"],
    );

    let err = bench.executor.run_prepared(prepared).await.unwrap_err();
    bench.executor.wait_passes().await;

    assert!(matches!(err, MacroError::Stop));
    assert_eq!(bench.session.records().len(), 4);
    assert_eq!(steps.load(Ordering::SeqCst), 4);
    assert_eq!(bench.last_status(), Some(StatusKind::Stop));

    let history = bench.session.get_env(SCAN_HISTORY).unwrap();
    assert_eq!(history[0]["end_status"], json!("Stopped"));
    // motion parameters are back in place
    assert_eq!(bench.mot01.velocity_log().last(), Some(&100.0));
}

#[tokio::test]
async fn test_ascanc_coordinates_velocities() {
    let bench = Bench::new();

    let result = bench
        .executor
        .run("ascanc", params!["mot01", 0.0, 10.0, "mot02", 0.0, 100.0, 0.1])
        .await
        .unwrap();

    let slow = bench.mot01.velocity_log();
    let fast = bench.mot02.velocity_log();
    assert!((fast[0] / slow[0] - 10.0).abs() < 1e-9);
    assert!((slow[0] - 10.0).abs() < 1e-9);
    assert!((fast[0] - 100.0).abs() < 1e-9);
    // original velocities restored
    assert_eq!(slow.last(), Some(&100.0));
    assert_eq!(fast.last(), Some(&100.0));

    let records = bench.session.records();
    assert!(!records.is_empty());
    assert_eq!(result, Some(ParamValue::from(records.len())));
    for record in &records {
        let a = record.positions["mot01"];
        let b = record.positions["mot02"];
        assert!((b - 10.0 * a).abs() < 2.0, "axes out of step: {} vs {}", a, b);
    }

    // overshoot corrected back onto the final positions
    use daq_macroserver::hardware::Moveable;
    let end01 = bench.mot01.read_position(true).await.unwrap();
    let end02 = bench.mot02.read_position(true).await.unwrap();
    assert!((end01 - 10.0).abs() < 1e-9);
    assert!((end02 - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_pause_and_resume_mid_scan() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 100.0, 10, 0.1])
        .await
        .unwrap();
    let executor = bench.executor.clone();
    let resumed_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let resumed = resumed_at.clone();
    let steps = AtomicUsize::new(0);
    prepared.append_hook(
        FnHook::new("pause-at-4", move |_ctx| {
            if steps.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                assert!(executor.pause());
                let executor = executor.clone();
                let resumed = resumed.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    *resumed.lock().unwrap() = Some(Instant::now());
                    assert!(executor.resume());
                });
            }
            Ok(())
        }),
        &["post-step"],
    );

    bench.executor.run_prepared(prepared).await.unwrap();

    let resumed = resumed_at.lock().unwrap().expect("scan was resumed");
    let acquisitions = bench.counter.acquisition_log();
    assert_eq!(acquisitions.len(), 11);
    assert!(acquisitions[3] < resumed);
    assert!(acquisitions[4] >= resumed);

    let records = bench.session.records();
    assert_eq!(records.len(), 11);
    let unique: HashSet<usize> = records.iter().map(|r| r.point_nb).collect();
    assert_eq!(unique.len(), 11);

    let kinds = bench.status_kinds();
    let pause = kinds.iter().position(|k| *k == StatusKind::Pause).unwrap();
    let resume = kinds.iter().position(|k| *k == StatusKind::Resume).unwrap();
    assert!(pause < resume);
    assert_eq!(kinds.last(), Some(&StatusKind::Finish));
}

#[tokio::test]
async fn test_abort_while_paused() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("ascan", params!["mot01", 0.0, 10.0, 10, 0.0])
        .await
        .unwrap();
    let executor = bench.executor.clone();
    let steps = AtomicUsize::new(0);
    prepared.append_hook(
        FnHook::new("pause-then-abort", move |_ctx| {
            if steps.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                executor.pause();
                let executor = executor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    executor.abort();
                });
            }
            Ok(())
        }),
        &["post-step"],
    );

    let err = bench.executor.run_prepared(prepared).await.unwrap_err();
    bench.executor.wait_passes().await;

    assert!(err.is_abort());
    assert_eq!(bench.session.records().len(), 2);
    assert_eq!(bench.last_status(), Some(StatusKind::Abort));
    assert_eq!(bench.executor.stack_depth(), 0);
}

#[tokio::test]
async fn test_dscan_returns_to_start() {
    let bench = Bench::new();
    bench.mot01.set_position(5.0);

    bench
        .executor
        .run("dscan", params!["mot01", -1.0, 1.0, 4, 0.0])
        .await
        .unwrap();

    let records = bench.session.records();
    assert_eq!(records.len(), 5);
    assert!((records[0].positions["mot01"] - 4.0).abs() < 1e-9);
    assert!((records[4].positions["mot01"] - 6.0).abs() < 1e-9);

    use daq_macroserver::hardware::Moveable;
    assert!((bench.mot01.read_position(true).await.unwrap() - 5.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_ascanct_back_fills_missing_points() {
    let bench = Bench::new();
    bench.counter.drop_points(&[2]);
    let prepared = bench
        .executor
        .prepare("ascanct", params!["mot01", 0.0, 10.0, 10, 0.04])
        .await
        .unwrap();
    let cleanups = Arc::new(AtomicUsize::new(0));
    let seen = cleanups.clone();
    prepared.append_hook(
        FnHook::new("cleanup-counter", move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        &["pre-cleanup", "post-cleanup"],
    );

    let result = bench.executor.run_prepared(prepared).await.unwrap();
    assert_eq!(result, Some(ParamValue::Int(10)));

    let records = bench.session.records();
    assert_eq!(records.len(), 10);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.point_nb, i);
    }
    assert!(records[2].synthetic);
    assert!(records[2].values["ct01"].is_nan());
    assert!((records[2].positions["mot01"] - 2.0).abs() < 1e-9);
    assert!(!records[3].synthetic);
    assert_eq!(records[3].values["ct01"], 4.0);
    assert_eq!(records[3].refs["img01"], "mntgrp01_0003.h5");

    assert_eq!(bench.counter.subscriber_count(), 0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ascanct_rejects_unreachable_velocity() {
    let bench = Bench::new();

    let err = bench
        .executor
        .run("ascanct", params!["mot01", 0.0, 1000.0, 10, 0.01])
        .await
        .unwrap_err();

    assert!(matches!(err, MacroError::ScanSetup(_)), "{:?}", err);
    assert!(bench.session.records().is_empty());
}

#[tokio::test]
async fn test_timescan_hardware_burst() {
    let bench = Bench::new();

    bench
        .executor
        .run("timescan", params![5, 0.02, "hardware"])
        .await
        .unwrap();

    let records = bench.session.records();
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.positions.is_empty()));
    assert_eq!(records[4].values["ct02"], 10.0);
    assert_eq!(bench.counter.subscriber_count(), 0);
}

#[tokio::test]
async fn test_timescan_writes_scan_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scans").join("timescan.jsonl");
    let bench = Bench::with(
        Default::default(),
        &[("ScanFile", json!(path.to_string_lossy()))],
    );

    bench
        .executor
        .run("timescan", params![3, 0.01, 0.01])
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0]["type"], json!("header"));
    assert_eq!(lines[3]["point_nb"], json!(2));
    assert_eq!(lines[4]["type"], json!("footer"));
    assert_eq!(lines[4]["points"], json!(3));
}

#[tokio::test]
async fn test_extra_columns_are_recorded() {
    let bench = Bench::with(Default::default(), &[("ExtraColumns", json!(["mot02"]))]);
    bench.mot02.set_position(7.5);

    bench
        .executor
        .run("ascan", params!["mot01", 0.0, 1.0, 1, 0.0])
        .await
        .unwrap();

    let records = bench.session.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].extras["mot02"], json!(7.5));
}

#[tokio::test]
async fn test_meshc_sweeps_once_per_row() {
    let bench = Bench::new();
    let prepared = bench
        .executor
        .prepare("meshc", params!["mot01", 0.0, 25.0, "mot02", 0.0, 2.0, 2, 0.05, 0.5])
        .await
        .unwrap();
    let moves = Arc::new(Mutex::new(Vec::new()));
    for hint in ["pre-move", "post-move"] {
        let log = moves.clone();
        prepared.append_hook(
            FnHook::new(hint, move |_ctx| {
                log.lock().unwrap().push(hint);
                Ok(())
            }),
            &[hint],
        );
    }

    let result = bench.executor.run_prepared(prepared).await.unwrap();

    assert_eq!(
        *moves.lock().unwrap(),
        ["pre-move", "post-move"].repeat(3),
        "move hooks run around every leg"
    );
    let records = bench.session.records();
    assert_eq!(result, Some(ParamValue::from(records.len())));
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.point_nb, i);
    }
    let mut rows: Vec<f64> = records.iter().map(|r| r.positions["mot02"]).collect();
    assert!(rows.windows(2).all(|w| w[0] <= w[1]), "rows out of order: {:?}", rows);
    rows.dedup();
    assert_eq!(rows, vec![0.0, 1.0, 2.0]);

    // one cruise per leg at half speed, original velocity restored
    let slow = bench.mot01.velocity_log();
    assert_eq!(slow.iter().filter(|v| (**v - 50.0).abs() < 1e-9).count(), 3);
    assert_eq!(slow.last(), Some(&100.0));

    use daq_macroserver::hardware::Moveable;
    assert!((bench.mot01.read_position(true).await.unwrap() - 25.0).abs() < 1e-9);
    assert!((bench.mot02.read_position(true).await.unwrap() - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_meshct_numbers_points_across_legs() {
    let bench = Bench::new();
    bench.counter.drop_points(&[2]);
    let prepared = bench
        .executor
        .prepare("meshct", params!["mot01", 0.0, 10.0, "mot02", 0.0, 1.0, 1, 10, 0.04])
        .await
        .unwrap();
    let hooks = Arc::new(Mutex::new(Vec::new()));
    for hint in ["pre-move", "post-move", "pre-cleanup", "post-cleanup"] {
        let log = hooks.clone();
        prepared.append_hook(
            FnHook::new(hint, move |_ctx| {
                log.lock().unwrap().push(hint);
                Ok(())
            }),
            &[hint],
        );
    }

    let result = bench.executor.run_prepared(prepared).await.unwrap();
    assert_eq!(result, Some(ParamValue::Int(20)));

    let records = bench.session.records();
    assert_eq!(records.len(), 20);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.point_nb, i);
        let row = if i < 10 { 0.0 } else { 1.0 };
        assert_eq!(record.positions["mot02"], row);
    }
    // the dropped trigger is missing from both bursts
    for i in [2, 12] {
        assert!(records[i].synthetic);
        assert!((records[i].positions["mot01"] - 2.0).abs() < 1e-9);
    }
    assert_eq!(records[13].values["ct01"], 4.0);
    assert_eq!(records[13].refs["img01"], "mntgrp01_0003.h5");

    assert_eq!(
        *hooks.lock().unwrap(),
        ["pre-move", "post-move", "pre-move", "post-move", "pre-cleanup", "post-cleanup"]
    );
    assert_eq!(bench.counter.subscriber_count(), 0);

    use daq_macroserver::hardware::Moveable;
    assert!((bench.mot01.read_position(true).await.unwrap() - 10.0).abs() < 1e-9);
    assert!((bench.mot02.read_position(true).await.unwrap() - 1.0).abs() < 1e-9);
}
