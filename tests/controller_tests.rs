mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use edge_scan_rs::bypass::{BypassSweep, FragmentSpan};
use edge_scan_rs::error::{ControlError, SetupError, SourceError, TransportError};
use edge_scan_rs::types::{AddressFamily, ProbeStatus, ScanStatus, SourceSelector, Thresholds};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_a_stop_after_one() {
    let transport = Arc::new(
        ScriptedTransport::new(Plan::default())
            .with("10.0.0.1", Plan::latency(150))
            .with("10.0.0.2", Plan::failing(TransportError::Timeout))
            .with("10.0.0.3", Plan::latency(900)),
    );
    let reg = registry(transport);
    let mut req = manual_request("10.0.0.1\n10.0.0.2\n10.0.0.3");
    req.thresholds.max_latency_ms = 500;
    req.stop_after = 1;
    req.concurrency = 2;

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.found_good, 1);
    assert_eq!(s.results.len(), 1);
    assert_eq!(s.results[0].address, "10.0.0.1");
    assert!(s.results[0].link.as_deref().unwrap().contains("@10.0.0.1:443?"));
}

#[tokio::test]
async fn scenario_b_empty_source_completes_immediately() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let reg = registry(transport.clone());

    let id = reg.start(manual_request("")).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);
    let s = ctl.snapshot().await;
    assert_eq!((s.completed, s.total, s.found_good), (0, 0, 0));

    // Everything filtered out by family counts as empty too.
    let mut req = manual_request("10.0.0.1,10.0.0.2");
    req.family = AddressFamily::V6;
    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);
    assert_eq!(ctl.snapshot().await.total, 0);
    assert_eq!(transport.round_trips.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_c_zero_minima_skip_throughput() {
    let slow_pipe = Plan { download_mbps: 0.0, upload: Ok(0.0), ..Plan::default() };
    let transport = Arc::new(ScriptedTransport::new(slow_pipe));
    let reg = registry(transport.clone());

    let id = reg.start(manual_request(&hosts(12))).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.found_good, 12);
    assert_eq!(s.counters.low_download, 0);
    assert_eq!(s.counters.low_upload, 0);
    assert_eq!(transport.downloads.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(transport.uploads.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(s.results.iter().all(|r| r.download_mbps.is_none() && r.upload_mbps.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_never_exceeds_concurrency_and_nothing_is_dropped() {
    let transport = Arc::new(
        ScriptedTransport::new(Plan::slow(15))
            .with("10.0.0.5", Plan::failing(TransportError::Unreachable("refused".into())))
            .with("10.0.0.9", Plan::latency(5_000)),
    );
    let reg = registry(transport.clone());
    let mut req = manual_request(&hosts(40));
    req.concurrency = 4;

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert!(transport.max_in_flight() <= 4, "max in flight {}", transport.max_in_flight());
    assert_eq!(s.total, 40);
    assert_eq!(s.completed, 40);
    assert_eq!(s.found_good + s.counters.total(), s.completed);
    assert_eq!(s.counters.unreachable, 1);
    assert_eq!(s.counters.high_latency, 1);
    assert_eq!(s.in_flight, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_after_overshoot_is_bounded_by_in_flight_work() {
    let transport = Arc::new(ScriptedTransport::new(Plan::slow(20)));
    let reg = registry(transport);
    let (n, k) = (3u64, 4usize);
    let mut req = manual_request(&hosts(60));
    req.stop_after = n as usize;
    req.concurrency = k;

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert!(s.found_good >= n);
    assert!(s.completed <= n + k as u64 - 1, "completed {}", s.completed);
    assert_eq!(s.results.len() as u64, s.found_good);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_queries_do_not_change_state() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let reg = registry(transport);
    let id = reg.start(manual_request(&hosts(5))).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    finish(&ctl).await;

    let a = reg.status(&id.to_string()).await.unwrap();
    let b = reg.status(&id.to_string()).await.unwrap();
    let c = ctl.snapshot().await;
    assert_eq!(a, b);
    assert_eq!(b, c);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_holds_progress_and_resume_finishes_everything() {
    let transport = Arc::new(ScriptedTransport::new(Plan::slow(20)));
    let reg = registry(transport);
    let mut req = manual_request(&hosts(30));
    req.concurrency = 2;

    let id = reg.start(req).await.unwrap();
    let key = id.to_string();
    let ctl = reg.get(&key).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    reg.pause(&key).await.unwrap();
    reg.pause(&key).await.unwrap();
    assert_eq!(ctl.status().await, ScanStatus::Paused);

    // In-flight probes finish, then nothing new starts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let held = ctl.snapshot().await;
    assert_eq!(held.in_flight, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let still = ctl.snapshot().await;
    assert_eq!(held.completed, still.completed);
    assert_eq!(still.status, ScanStatus::Paused);
    assert!(still.completed < 30);

    reg.resume(&key).await.unwrap();
    assert!(matches!(reg.resume(&key).await, Err(ControlError::NotPaused { .. }) | Ok(())));
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.completed, 30);
    assert_eq!(s.found_good, 30);
    let mut addrs: Vec<&str> = s.results.iter().map(|r| r.address.as_str()).collect();
    addrs.sort();
    addrs.dedup();
    assert_eq!(addrs.len(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_terminal_and_freezes_counters() {
    let transport = Arc::new(ScriptedTransport::new(Plan::slow(50)));
    let reg = registry(transport);
    let mut req = manual_request(&hosts(80));
    req.concurrency = 4;

    let id = reg.start(req).await.unwrap();
    let key = id.to_string();
    let ctl = reg.get(&key).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    reg.stop(&key).await.unwrap();
    let first = ctl.snapshot().await;
    assert_eq!(first.status, ScanStatus::Stopped);
    assert_eq!(finish(&ctl).await, ScanStatus::Stopped);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let later = ctl.snapshot().await;
    assert_eq!(later.status, ScanStatus::Stopped);
    assert_eq!(later.completed, first.completed);
    assert_eq!(later.found_good, first.found_good);
    assert!(later.completed < 80);

    assert!(matches!(reg.pause(&key).await, Err(ControlError::AlreadyTerminal { status: ScanStatus::Stopped, .. })));
    assert!(matches!(reg.resume(&key).await, Err(ControlError::NotPaused { .. })));
    assert!(reg.stop(&key).await.is_ok());
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let reg = registry(Arc::new(ScriptedTransport::new(Plan::default())));
    assert!(matches!(reg.status("not-a-scan").await, Err(ControlError::NotFound(_))));
    let random = uuid::Uuid::new_v4().to_string();
    assert!(matches!(reg.pause(&random).await, Err(ControlError::NotFound(_))));
    assert!(matches!(reg.resume(&random).await, Err(ControlError::NotFound(_))));
    assert!(matches!(reg.stop(&random).await, Err(ControlError::NotFound(_))));
}

#[tokio::test]
async fn setup_errors_create_no_scan() {
    let reg = registry(Arc::new(ScriptedTransport::new(Plan::default())));

    let mut req = manual_request("10.0.0.1");
    req.base_config = "vmess://eyJhZGQiOiIxLjEuMS4xIn0=".into();
    assert!(matches!(reg.start(req).await, Err(SetupError::BaseConfig(_))));

    let mut req = manual_request("10.0.0.1");
    req.concurrency = 0;
    assert!(matches!(reg.start(req).await, Err(SetupError::InvalidRequest(_))));

    assert!(reg.is_empty().await);
}

#[tokio::test]
async fn failed_fetch_puts_scan_in_error_state() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let fetcher = MockFetcher::default().with(
        "https://lists.example.com/down.txt",
        Err(SourceError::Fetch { url: "https://lists.example.com/down.txt".into(), reason: "HTTP 503".into() }),
    );
    let reg = registry_with(transport, fetcher);
    let req = edge_scan_rs::types::ScanRequest {
        thresholds: Thresholds { min_download_mbps: 0.0, min_upload_mbps: 0.0, ..Thresholds::default() },
        ..edge_scan_rs::types::ScanRequest::new(
            BASE,
            SourceSelector::ExternalUrl { url: "https://lists.example.com/down.txt".into() },
        )
    };

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Error);
    let s = ctl.snapshot().await;
    assert!(s.error.unwrap().contains("HTTP 503"));
    assert_eq!(s.completed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetched_list_is_scanned() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let url = "https://lists.example.com/clean.json";
    let fetcher = MockFetcher::default().with(url, Ok(r#"{"addresses": ["104.16.1.1", "104.16.1.2"]}"#.into()));
    let reg = registry_with(transport, fetcher);
    let mut req = manual_request("");
    req.source = SourceSelector::ExternalUrl { url: url.into() };

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);
    assert_eq!(ctl.snapshot().await.found_good, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fragment_sweep_tests_every_variant() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let reg = registry(transport.clone());
    let mut req = manual_request("10.0.0.1,10.0.0.2");
    req.ports = vec![443, 2053];
    req.bypass = Some(BypassSweep::Fragment {
        lengths: vec![FragmentSpan::new(10, 20), FragmentSpan::new(50, 100)],
        intervals: vec![FragmentSpan::new(1, 5)],
    });

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.total, 8);
    assert_eq!(s.completed, 8);
    assert!(s.results.iter().all(|r| r.variant.is_some()));
    assert!(s.results.iter().all(|r| r.link.as_deref().unwrap().contains("fragment=tlshello,")));
    assert!(transport.dials.lock().unwrap().iter().all(|d| d.variant.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_probe_becomes_error_outcome() {
    let panicky = Plan { panic: true, ..Plan::default() };
    let transport = Arc::new(ScriptedTransport::new(Plan::default()).with("10.0.0.2", panicky));
    let reg = registry(transport);

    let id = reg.start(manual_request("10.0.0.1,10.0.0.2,10.0.0.3")).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.completed, 3);
    assert_eq!(s.counters.error, 1);
    assert_eq!(s.found_good, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_channels_follow_the_scan() {
    let transport = Arc::new(ScriptedTransport::new(Plan::slow(10)));
    let reg = registry(transport);
    let id = reg.start(manual_request(&hosts(4))).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    let mut results = ctl.subscribe_results();
    let mut status = ctl.subscribe_status();

    let first = tokio::time::timeout(Duration::from_secs(5), results.recv()).await.unwrap().unwrap();
    assert_eq!(first.status, ProbeStatus::Ok);
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_terminal()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*status.borrow(), ScanStatus::Completed);
}

#[tokio::test]
async fn finished_scans_are_swept_after_retention() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let deps = edge_scan_rs::controller::ScanDeps { transport, fetcher: Arc::new(MockFetcher::default()) };
    let settings = edge_scan_rs::settings::EngineSettings { retention_secs: 0, ..test_settings() };
    let reg = edge_scan_rs::registry::ScanRegistry::new(deps, settings);

    let id = reg.start(manual_request("10.0.0.1")).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    finish(&ctl).await;
    assert_eq!(reg.sweep().await, 1);
    assert!(matches!(reg.status(&id.to_string()).await, Err(ControlError::NotFound(_))));
}

#[tokio::test]
async fn supervisor_panic_ends_in_error_state() {
    let transport = Arc::new(ScriptedTransport::new(Plan::default()));
    let deps = edge_scan_rs::controller::ScanDeps { transport: transport.clone(), fetcher: Arc::new(PanickingFetcher) };
    let reg = edge_scan_rs::registry::ScanRegistry::new(deps, test_settings());
    let mut req = manual_request("");
    req.source = SourceSelector::ExternalUrl { url: "https://lists.example.com/ips.txt".into() };

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Error);

    let s = ctl.snapshot().await;
    assert!(s.error.as_deref().unwrap().contains("list fetcher blew up"));
    assert!(s.logs.iter().any(|l| l.contains("setup failed")));
    assert_eq!(transport.round_trips.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversized_requests_are_rejected_up_front() {
    let reg = registry(Arc::new(ScriptedTransport::new(Plan::default())));

    let mut req = manual_request("");
    req.source = SourceSelector::OfficialRanges {
        provider: edge_scan_rs::types::CdnProvider::Cloudflare,
        sample_size: usize::MAX,
        seed: None,
    };
    req.ports = vec![443, 2053];
    assert!(matches!(reg.start(req).await, Err(SetupError::InvalidRequest(_))));

    let mut req = manual_request("10.0.0.1");
    req.concurrency = usize::MAX;
    assert!(matches!(reg.start(req).await, Err(SetupError::InvalidRequest(_))));
    assert!(reg.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_count_is_capped_by_pool_size() {
    let transport = Arc::new(ScriptedTransport::new(Plan::slow(30)));
    let reg = registry(transport.clone());
    let mut req = manual_request("10.0.0.1,10.0.0.2,10.0.0.3");
    req.concurrency = edge_scan_rs::types::MAX_CONCURRENCY;

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);
    assert_eq!(ctl.snapshot().await.completed, 3);
    assert!(transport.max_in_flight() <= 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn throughput_measurements_run_one_at_a_time() {
    let plan = Plan { transfer_delay: Duration::from_millis(20), ..Plan::default() };
    let transport = Arc::new(ScriptedTransport::new(plan));
    let reg = registry(transport.clone());
    let mut req = manual_request(&hosts(8));
    req.concurrency = 4;
    req.thresholds.min_download_mbps = 1.0;
    req.thresholds.min_upload_mbps = 1.0;

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.found_good, 8);
    assert_eq!(transport.downloads.load(std::sync::atomic::Ordering::SeqCst), 8);
    assert_eq!(transport.max_transfers_in_flight.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn endpoints_outside_target_country_are_demoted() {
    let transport = Arc::new(
        ScriptedTransport::new(Plan::default()).with("10.0.0.2", Plan { location: "NL", ..Plan::default() }),
    );
    let reg = registry(transport);
    let mut req = manual_request("10.0.0.1,10.0.0.2,10.0.0.3");
    req.target_country = Some("nl".into());

    let id = reg.start(req).await.unwrap();
    let ctl = reg.get(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);

    let s = ctl.snapshot().await;
    assert_eq!(s.completed, 3);
    assert_eq!(s.found_good, 1);
    assert_eq!(s.counters.wrong_geo, 2);
    assert_eq!(s.results[0].address, "10.0.0.2");
    assert!(s.logs.iter().any(|l| l.contains("wrong_geo")));
}

#[tokio::test]
async fn pause_before_dispatch_starts_no_probe() {
    let transport = Arc::new(ScriptedTransport::new(Plan::slow(10)));
    let reg = registry(transport.clone());
    let mut req = manual_request(&hosts(10));
    req.concurrency = 4;

    let id = reg.start(req).await.unwrap();
    reg.pause(&id.to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let ctl = reg.get(&id.to_string()).await.unwrap();
    let s = ctl.snapshot().await;
    assert_eq!(s.status, ScanStatus::Paused);
    assert_eq!(s.completed, 0);
    assert_eq!(s.in_flight, 0);
    assert_eq!(transport.round_trips.load(std::sync::atomic::Ordering::SeqCst), 0);

    reg.resume(&id.to_string()).await.unwrap();
    assert_eq!(finish(&ctl).await, ScanStatus::Completed);
    assert_eq!(ctl.snapshot().await.completed, 10);
}
