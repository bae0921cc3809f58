//! Scan controller: owns one scan's state and its worker pool.
//!
//! A supervisor task builds the candidate pool, then runs exactly `concurrency` workers
//! that pull candidates from it. Workers check the pause signal and the dispatch-halt
//! token between candidates only, so a started probe always runs to completion. All
//! state mutation goes through the one `state` mutex.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::BaseConfig;
use crate::error::{ControlError, SetupError};
use crate::probe::Prober;
use crate::settings::EngineSettings;
use crate::source::{expand, source_for, CandidatePool, ListFetcher};
use crate::transport::Transport;
use crate::types::{
    OutcomeCounters, ProbeResult, ProbeStatus, ScanId, ScanRequest, ScanSnapshot, ScanStatus,
};

const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators shared by every scan of a registry.
#[derive(Clone)]
pub struct ScanDeps {
    pub transport: Arc<dyn Transport>,
    pub fetcher: Arc<dyn ListFetcher>,
}

struct ScanState {
    status: ScanStatus,
    completed: u64,
    total: u64,
    found_good: u64,
    counters: OutcomeCounters,
    logs: VecDeque<String>,
    log_capacity: usize,
    results: Vec<ProbeResult>,
    error: Option<String>,
    finished_at: Option<Instant>,
}

impl ScanState {
    fn new(log_capacity: usize) -> Self {
        Self {
            status: ScanStatus::Starting,
            completed: 0,
            total: 0,
            found_good: 0,
            counters: OutcomeCounters::default(),
            logs: VecDeque::with_capacity(log_capacity.min(1024)),
            log_capacity: log_capacity.max(1),
            results: Vec::new(),
            error: None,
            finished_at: None,
        }
    }

    fn log(&mut self, msg: impl AsRef<str>) {
        if self.logs.len() >= self.log_capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(format!("[{}] {}", clock(), msg.as_ref()));
    }
}

fn clock() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| String::from("--:--:--"))
}

struct Shared {
    id: ScanId,
    request: ScanRequest,
    settings: Arc<EngineSettings>,
    state: Mutex<ScanState>,
    /// Cancelled by StopScan.
    stop: CancellationToken,
    /// Stops dispatching new candidates; child of `stop`.
    halt: CancellationToken,
    paused: watch::Sender<bool>,
    in_flight: AtomicUsize,
    status_tx: watch::Sender<ScanStatus>,
    results_tx: broadcast::Sender<ProbeResult>,
}

impl Shared {
    fn set_status(&self, st: &mut ScanState, status: ScanStatus) {
        st.status = status;
        if status.is_terminal() && st.finished_at.is_none() {
            st.finished_at = Some(Instant::now());
        }
        self.status_tx.send_replace(status);
    }

    async fn fail(&self, err: SetupError) {
        let mut st = self.state.lock().await;
        if st.status.is_terminal() {
            return;
        }
        warn!(scan_id = %self.id, error = %err, "scan setup failed");
        st.log(format!("setup failed: {err}"));
        st.error = Some(err.to_string());
        self.set_status(&mut st, ScanStatus::Error);
        self.halt.cancel();
    }

    /// Records one probe outcome. Results arriving after the scan is terminal are dropped.
    async fn admit(&self, result: ProbeResult) {
        let mut st = self.state.lock().await;
        if st.status.is_terminal() {
            return;
        }
        st.completed += 1;
        st.counters.record(result.status);
        st.log(describe(&result));
        if !result.is_ok() {
            return;
        }
        st.found_good += 1;
        st.results.push(result.clone());
        let _ = self.results_tx.send(result);
        if st.found_good >= self.request.stop_after as u64 && !self.halt.is_cancelled() {
            let found = st.found_good;
            st.log(format!("found {found} good endpoints, finishing in-flight probes"));
            info!(scan_id = %self.id, found_good = found, "stop-after target reached");
            self.halt.cancel();
        }
    }

    /// Waits while paused. Returns false once dispatch is halted.
    async fn wait_resumed(&self) -> bool {
        let mut rx = self.paused.subscribe();
        tokio::select! {
            r = rx.wait_for(|p| !*p) => r.is_ok() && !self.halt.is_cancelled(),
            _ = self.halt.cancelled() => false,
        }
    }
}

fn describe(r: &ProbeResult) -> String {
    match r.status {
        ProbeStatus::Ok => {
            let mut line = format!(
                "{} ok {} ms, jitter {} ms",
                r.candidate,
                r.latency_ms.unwrap_or(0),
                r.jitter_ms.unwrap_or(0)
            );
            if let Some(dl) = r.download_mbps {
                line.push_str(&format!(", down {dl:.1} Mbps"));
            }
            if let Some(ul) = r.upload_mbps {
                line.push_str(&format!(", up {ul:.1} Mbps"));
            }
            if let Some(colo) = &r.datacenter {
                line.push_str(&format!(" [{colo}]"));
            }
            line
        }
        status => match &r.detail {
            Some(d) => format!("{} {status}: {d}", r.candidate),
            None => format!("{} {status}", r.candidate),
        },
    }
}

/// Decrements the in-flight count when dropped, including on task abort.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to one running or finished scan. Cheap to clone.
#[derive(Clone)]
pub struct ScanController {
    shared: Arc<Shared>,
}

impl ScanController {
    /// Spawns the scan's supervisor on the current runtime and returns its handle.
    pub fn launch(
        id: ScanId,
        request: ScanRequest,
        base: BaseConfig,
        deps: ScanDeps,
        settings: Arc<EngineSettings>,
    ) -> Self {
        let stop = CancellationToken::new();
        let halt = stop.child_token();
        let (status_tx, _) = watch::channel(ScanStatus::Starting);
        let (results_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        let (paused, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            state: Mutex::new(ScanState::new(settings.log_capacity)),
            request,
            settings,
            stop,
            halt,
            paused,
            in_flight: AtomicUsize::new(0),
            status_tx,
            results_tx,
        });
        tokio::spawn(guard_supervisor(shared.clone(), Arc::new(base), deps));
        Self { shared }
    }

    pub fn id(&self) -> ScanId {
        self.shared.id
    }

    pub fn request(&self) -> &ScanRequest {
        &self.shared.request
    }

    pub async fn snapshot(&self) -> ScanSnapshot {
        let st = self.shared.state.lock().await;
        let tail = self.shared.settings.log_tail;
        let skip = st.logs.len().saturating_sub(tail);
        ScanSnapshot {
            scan_id: self.shared.id,
            status: st.status,
            completed: st.completed,
            total: st.total,
            found_good: st.found_good,
            in_flight: self.shared.in_flight.load(Ordering::SeqCst) as u64,
            counters: st.counters,
            logs: st.logs.iter().skip(skip).cloned().collect(),
            results: st.results.clone(),
            error: st.error.clone(),
        }
    }

    pub async fn status(&self) -> ScanStatus {
        self.shared.state.lock().await.status
    }

    /// Accepted results so far, in admission order.
    pub async fn results(&self) -> Vec<ProbeResult> {
        self.shared.state.lock().await.results.clone()
    }

    pub async fn finished_at(&self) -> Option<Instant> {
        self.shared.state.lock().await.finished_at
    }

    /// Idempotent while paused; fails once the scan is terminal.
    pub async fn pause(&self) -> Result<(), ControlError> {
        let mut st = self.shared.state.lock().await;
        match st.status {
            s if s.is_terminal() => Err(ControlError::AlreadyTerminal { id: self.shared.id, status: s }),
            ScanStatus::Paused => Ok(()),
            _ => {
                self.shared.paused.send_replace(true);
                self.shared.set_status(&mut st, ScanStatus::Paused);
                st.log("paused");
                info!(scan_id = %self.shared.id, "scan paused");
                Ok(())
            }
        }
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        let mut st = self.shared.state.lock().await;
        if st.status != ScanStatus::Paused {
            return Err(ControlError::NotPaused { id: self.shared.id, status: st.status });
        }
        self.shared.set_status(&mut st, ScanStatus::Running);
        self.shared.paused.send_replace(false);
        st.log("resumed");
        info!(scan_id = %self.shared.id, "scan resumed");
        Ok(())
    }

    /// Marks the scan stopped and halts dispatch. A no-op on a terminal scan.
    pub async fn stop(&self) -> Result<(), ControlError> {
        let mut st = self.shared.state.lock().await;
        if st.status.is_terminal() {
            return Ok(());
        }
        self.shared.set_status(&mut st, ScanStatus::Stopped);
        let (completed, total) = (st.completed, st.total);
        st.log(format!("stopped after {completed} of {total} candidates"));
        info!(scan_id = %self.shared.id, completed, "scan stopped");
        self.shared.stop.cancel();
        Ok(())
    }

    /// Resolves once the scan reaches a terminal status.
    pub async fn wait_terminal(&self) -> ScanStatus {
        let mut rx = self.shared.status_tx.subscribe();
        if let Ok(s) = rx.wait_for(|s| s.is_terminal()).await {
            return *s;
        }
        let status = *rx.borrow();
        status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ScanStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Accepted results as they are admitted.
    pub fn subscribe_results(&self) -> broadcast::Receiver<ProbeResult> {
        self.shared.results_tx.subscribe()
    }
}

/// Runs the supervisor and turns a panic into the `error` state.
async fn guard_supervisor(shared: Arc<Shared>, base: Arc<BaseConfig>, deps: ScanDeps) {
    let outcome = AssertUnwindSafe(supervise(shared.clone(), base, deps)).catch_unwind().await;
    if let Err(panic) = outcome {
        let msg = panic_message(&*panic);
        warn!(scan_id = %shared.id, "supervisor panicked: {msg}");
        shared.fail(SetupError::Crashed(msg)).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[instrument(skip_all, fields(scan_id = %shared.id))]
async fn supervise(shared: Arc<Shared>, base: Arc<BaseConfig>, deps: ScanDeps) {
    let request = &shared.request;
    let settings = shared.settings.clone();
    let source = source_for(&request.source, deps.fetcher.clone(), settings.cidr_expansion_limit);

    let hosts = tokio::select! {
        r = source.hosts(request.family) => r,
        _ = shared.stop.cancelled() => return,
    };
    let hosts = match hosts {
        Ok(h) => h,
        Err(e) => return shared.fail(e.into()).await,
    };
    let skipped = hosts.skipped();
    let variants = request.bypass.as_ref().map(|b| b.variants()).unwrap_or_default();
    let pool = expand(hosts, &request.ports, &variants);

    {
        let mut st = shared.state.lock().await;
        if st.status.is_terminal() {
            return;
        }
        st.total = pool.total();
        st.log(format!("{} candidates from {}", pool.total(), request.source.name()));
        if skipped > 0 {
            st.log(format!("skipped {skipped} unparseable entries"));
        }
        if pool.total() == 0 {
            st.log("nothing to scan");
            shared.set_status(&mut st, ScanStatus::Completed);
            info!("scan completed with no candidates");
            return;
        }
        if st.status == ScanStatus::Starting {
            shared.set_status(&mut st, ScanStatus::Running);
        }
    }
    info!(total = pool.total(), concurrency = request.concurrency, "scan running");

    let prober = Arc::new(
        Prober::new(deps.transport.clone(), base, request.thresholds, request.strict_tls, &settings)
            .with_target_country(request.target_country.clone()),
    );

    let workers = usize::try_from(pool.total()).unwrap_or(usize::MAX).min(request.concurrency);
    let pool = Arc::new(std::sync::Mutex::new(pool));
    let mut set = JoinSet::new();
    for _ in 0..workers {
        set.spawn(worker(shared.clone(), pool.clone(), prober.clone()));
    }

    tokio::select! {
        _ = drain(&mut set) => {}
        _ = shared.stop.cancelled() => {
            let grace = tokio::time::sleep(settings.stop_grace());
            tokio::pin!(grace);
            tokio::select! {
                _ = drain(&mut set) => {}
                _ = &mut grace => {
                    warn!(in_flight = shared.in_flight.load(Ordering::SeqCst), "abandoning in-flight probes");
                    set.abort_all();
                    drain(&mut set).await;
                }
            }
        }
    }

    let mut st = shared.state.lock().await;
    if st.status.is_terminal() {
        return;
    }
    st.total = lock_pool(&pool).total();
    let (completed, total, found_good) = (st.completed, st.total, st.found_good);
    st.log(format!("completed {completed} of {total}, {found_good} good"));
    info!(completed, found_good, "scan completed");
    shared.set_status(&mut st, ScanStatus::Completed);
}

async fn drain(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!("worker task panicked: {e}");
            }
        }
    }
}

fn lock_pool(pool: &std::sync::Mutex<CandidatePool>) -> std::sync::MutexGuard<'_, CandidatePool> {
    pool.lock().unwrap_or_else(|e| e.into_inner())
}

async fn worker(shared: Arc<Shared>, pool: Arc<std::sync::Mutex<CandidatePool>>, prober: Arc<Prober>) {
    loop {
        if !shared.wait_resumed().await {
            break;
        }
        let (next, total) = {
            let mut pool = lock_pool(&pool);
            let next = pool.next();
            (next, pool.total())
        };
        let Some(candidate) = next else {
            let mut st = shared.state.lock().await;
            if !st.status.is_terminal() {
                st.total = total;
            }
            break;
        };

        // A pause that landed while the candidate was being taken holds it until resume.
        let paused = *shared.paused.borrow();
        if paused && !shared.wait_resumed().await {
            break;
        }

        let guard = InFlight::enter(&shared.in_flight);
        let result = match AssertUnwindSafe(prober.test(&candidate)).catch_unwind().await {
            Ok(r) => r,
            Err(panic) => {
                let msg = panic_message(&*panic);
                debug!(candidate = ?candidate, "probe panicked: {msg}");
                prober.failed(&candidate, ProbeStatus::Error, format!("probe panicked: {msg}"))
            }
        };
        shared.admit(result).await;
        drop(guard);
    }
}
