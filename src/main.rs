use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use edge_scan_rs::bypass::{BypassSweep, FragmentSpan};
use edge_scan_rs::config::BaseConfig;
use edge_scan_rs::export::{self, ExportFormat};
use edge_scan_rs::ports;
use edge_scan_rs::registry::ScanRegistry;
use edge_scan_rs::relax::RelaxationPolicy;
use edge_scan_rs::server;
use edge_scan_rs::settings::EngineSettings;
use edge_scan_rs::types::{
    AddressFamily, CdnProvider, ProbeResult, ScanRequest, ScanSnapshot, ScanStatus, SourceSelector, Thresholds,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Random sample of the provider's published ranges.
    Official,
    /// Addresses, CIDRs or links given with --targets.
    Manual,
    /// List fetched from --url.
    Url,
    /// Previously good endpoints given with --targets, tested in order.
    History,
}

/// edge-scan-rs: concurrent CDN edge endpoint scanner.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "edge-scan-rs",
    version,
    about = "Concurrent CDN edge endpoint scanner with bypass-variant discovery and an HTTP control API.",
    long_about = None
)]
struct Cli {
    /// vless:// or trojan:// link used as the connection template.
    #[arg(long, env = "EDGE_SCAN_CONFIG")]
    config: Option<String>,

    #[arg(long, value_enum, default_value_t = SourceKind::Official)]
    source: SourceKind,

    #[arg(long, value_enum, default_value_t = CdnProvider::Cloudflare)]
    provider: CdnProvider,

    /// Addresses sampled from official ranges.
    #[arg(long = "sample-size", default_value_t = 1000)]
    sample_size: usize,

    /// Seed for reproducible sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// Inline list (comma separated) or path to a file of addresses, CIDRs or links.
    #[arg(long)]
    targets: Option<String>,

    /// URL of a plain, base64 or JSON address list.
    #[arg(long)]
    url: Option<String>,

    /// Ports to test: inline list ("443,2053-2096"), a ports file, or "cdn" for every
    /// edge port matching the config's security.
    #[arg(long)]
    ports: Option<String>,

    #[arg(long, default_value_t = 8, env = "EDGE_SCAN_CONCURRENCY")]
    concurrency: usize,

    /// Stop after this many good endpoints.
    #[arg(long = "stop-after", default_value_t = 10)]
    stop_after: usize,

    #[arg(long = "max-latency-ms", default_value_t = Thresholds::default().max_latency_ms)]
    max_latency_ms: u64,

    #[arg(long = "max-jitter-ms", default_value_t = Thresholds::default().max_jitter_ms)]
    max_jitter_ms: u64,

    /// 0 skips the download test.
    #[arg(long = "min-download", default_value_t = Thresholds::default().min_download_mbps)]
    min_download_mbps: f64,

    /// 0 skips the upload test.
    #[arg(long = "min-upload", default_value_t = Thresholds::default().min_upload_mbps)]
    min_upload_mbps: f64,

    #[arg(long, value_enum, default_value_t = AddressFamily::Any)]
    family: AddressFamily,

    /// Only accept endpoints whose edge reports this two-letter country code.
    #[arg(long)]
    country: Option<String>,

    /// Require a valid certificate from a known CDN or public CA.
    #[arg(long = "strict-tls", default_value_t = false)]
    strict_tls: bool,

    /// Fragment sweep: ClientHello chunk lengths, e.g. "10-20,50-100".
    #[arg(long = "fragment-lengths", value_delimiter = ',')]
    fragment_lengths: Vec<FragmentSpan>,

    /// Fragment sweep: pause between chunks in ms, e.g. "1-5,10".
    #[arg(long = "fragment-intervals", value_delimiter = ',', default_value = "1-5")]
    fragment_intervals: Vec<FragmentSpan>,

    /// SNI sweep: server names to try.
    #[arg(long, value_delimiter = ',')]
    sni: Vec<String>,

    /// DNS-tunnel sweep: nameservers to try.
    #[arg(long, value_delimiter = ',')]
    dns: Vec<String>,

    /// Domain resolved through each --dns nameserver (defaults to the config's host).
    #[arg(long = "dns-domain")]
    dns_domain: Option<String>,

    /// Retries with relaxed thresholds when nothing passes (official and url sources).
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Write the final status snapshot as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print accepted endpoints in this format.
    #[arg(long, value_enum)]
    export: Option<ExportFormat>,

    /// Run the HTTP control API.
    #[arg(long = "serve-api", default_value_t = false)]
    serve_api: bool,

    #[arg(long, default_value = "127.0.0.1:8080", env = "EDGE_SCAN_BIND")]
    bind: String,

    /// TOML file with engine settings.
    #[arg(long = "engine-config", env = "EDGE_SCAN_ENGINE_CONFIG")]
    engine_config: Option<PathBuf>,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match cli.engine_config.as_deref() {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::default(),
    };
    let registry = Arc::new(ScanRegistry::with_network(settings).context("failed to build HTTP client")?);

    if cli.serve_api {
        registry.spawn_reaper(Duration::from_secs(60));
        let bind = cli.bind.clone();
        let api_registry = registry.clone();
        let api = tokio::spawn(async move { server::spawn_server(&bind, api_registry).await });
        if cli.config.is_none() {
            println!("Press Ctrl+C to stop the server...");
            tokio::select! {
                res = api => res.context("API server task failed")??,
                _ = tokio::signal::ctrl_c() => {}
            }
            registry.shutdown().await;
            return Ok(());
        }
    }

    let Some(config) = cli.config.clone() else {
        bail!("--config is required unless --serve-api is given");
    };
    let base: BaseConfig = config.parse().context("invalid --config link")?;
    let request = build_request(&cli, config, &base)?;
    print_configuration(&cli, &request, &base);

    let policy = RelaxationPolicy { max_attempts: cli.retries, ..RelaxationPolicy::default() };
    let mut attempt = 0;
    let mut current = request.clone();
    let snapshot = loop {
        let snapshot = run_scan(&registry, current.clone()).await?;
        if !policy.should_retry(&request.source, &snapshot, attempt + 1) {
            break snapshot;
        }
        attempt += 1;
        let Some(relaxed) = policy.relax(&request.thresholds, attempt) else {
            break snapshot;
        };
        println!(
            "\nNo endpoint passed. Retry {attempt}/{}: max latency {} ms, max jitter {} ms, no throughput minimum",
            policy.max_attempts, relaxed.max_latency_ms, relaxed.max_jitter_ms
        );
        current.thresholds = relaxed;
    };

    if snapshot.status == ScanStatus::Error {
        bail!("scan failed: {}", snapshot.error.as_deref().unwrap_or("unknown error"));
    }

    print_results_table(&snapshot);
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_results_json(path, &snapshot) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    if let Some(format) = cli.export {
        println!("\n{}", export::render(format, &snapshot.results, &base));
    }

    if cli.serve_api {
        println!("Press Ctrl+C to stop the server...");
        let _ = tokio::signal::ctrl_c().await;
        registry.shutdown().await;
    }
    Ok(())
}

fn build_request(cli: &Cli, config: String, base: &BaseConfig) -> Result<ScanRequest> {
    let source = match cli.source {
        SourceKind::Official => SourceSelector::OfficialRanges {
            provider: cli.provider,
            sample_size: cli.sample_size,
            seed: cli.seed,
        },
        SourceKind::Manual => SourceSelector::ManualList { entries: read_targets(cli)? },
        SourceKind::Url => SourceSelector::ExternalUrl {
            url: cli.url.clone().context("--url is required with --source url")?,
        },
        SourceKind::History => SourceSelector::SeedHistory {
            candidates: read_targets(cli)?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        },
    };

    let mut request = ScanRequest::new(config, source);
    request.concurrency = cli.concurrency;
    request.stop_after = cli.stop_after;
    request.family = cli.family;
    request.strict_tls = cli.strict_tls;
    request.target_country = cli.country.clone();
    request.thresholds = Thresholds {
        max_latency_ms: cli.max_latency_ms,
        max_jitter_ms: cli.max_jitter_ms,
        min_download_mbps: cli.min_download_mbps,
        min_upload_mbps: cli.min_upload_mbps,
    };
    if let Some(list) = cli.ports.as_deref() {
        request.ports = if list.eq_ignore_ascii_case("cdn") {
            ports::default_ports(base.uses_tls())
        } else if Path::new(list).is_file() {
            ports::load_ports_from_path(list)?
        } else {
            ports::parse_ports_str(list).context("invalid --ports")?
        };
    }

    let sweeps = [!cli.fragment_lengths.is_empty(), !cli.sni.is_empty(), !cli.dns.is_empty()];
    if sweeps.iter().filter(|s| **s).count() > 1 {
        bail!("--fragment-lengths, --sni and --dns are mutually exclusive");
    }
    request.bypass = if !cli.fragment_lengths.is_empty() {
        Some(BypassSweep::Fragment {
            lengths: cli.fragment_lengths.clone(),
            intervals: cli.fragment_intervals.clone(),
        })
    } else if !cli.sni.is_empty() {
        Some(BypassSweep::Sni { server_names: cli.sni.clone() })
    } else if !cli.dns.is_empty() {
        Some(BypassSweep::DnsTunnel { nameservers: cli.dns.clone(), domain: cli.dns_domain.clone() })
    } else {
        None
    };
    Ok(request)
}

/// `--targets` is either a file path or an inline comma separated list.
fn read_targets(cli: &Cli) -> Result<String> {
    let Some(t) = cli.targets.as_deref() else {
        bail!("--targets is required with --source {:?}", cli.source);
    };
    if Path::new(t).is_file() {
        return std::fs::read_to_string(t).with_context(|| format!("failed to read targets file: {t}"));
    }
    Ok(t.split(',').map(str::trim).collect::<Vec<_>>().join("\n"))
}

async fn run_scan(registry: &ScanRegistry, request: ScanRequest) -> Result<ScanSnapshot> {
    let id = registry.start(request).await?;
    let controller = registry.get(&id.to_string()).await?;
    info!(scan_id = %id, "scan started");

    // Ctrl-C stops the scan.
    let on_ctrl_c = controller.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = on_ctrl_c.stop().await;
        }
    });

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let snapshot = loop {
        tick.tick().await;
        let s = controller.snapshot().await;
        eprintln!(
            "[{}] {}/{} tested, {} good, {} in flight",
            s.status, s.completed, s.total, s.found_good, s.in_flight
        );
        if s.status.is_terminal() {
            break s;
        }
    };
    ctrl_c.abort();
    if snapshot.status == ScanStatus::Stopped {
        warn!(scan_id = %id, "scan stopped before completion");
    }
    Ok(snapshot)
}

fn print_configuration(cli: &Cli, request: &ScanRequest, base: &BaseConfig) {
    println!("edge-scan-rs configuration:");
    println!("  config       : {}://{}:{} ({})", base.protocol, base.host, base.port, base.network());
    println!("  source       : {}", request.source.name());
    println!(
        "  ports        : {}",
        if request.ports.is_empty() {
            base.port.to_string()
        } else {
            request.ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
        }
    );
    println!("  concurrency  : {}", request.concurrency);
    println!("  stop_after   : {}", request.stop_after);
    println!(
        "  thresholds   : latency <= {} ms, jitter <= {} ms, down >= {} Mbps, up >= {} Mbps",
        request.thresholds.max_latency_ms,
        request.thresholds.max_jitter_ms,
        request.thresholds.min_download_mbps,
        request.thresholds.min_upload_mbps
    );
    println!("  family       : {:?}", request.family);
    if let Some(cc) = &request.target_country {
        println!("  country      : {cc}");
    }
    if let Some(sweep) = &request.bypass {
        println!("  bypass       : {} variants", sweep.variants().len());
    }
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
}

fn print_results_table(snapshot: &ScanSnapshot) {
    let results: &[ProbeResult] = &snapshot.results;
    let mut cand_w = "endpoint".len();
    for r in results {
        cand_w = cand_w.max(r.candidate.len().min(60));
    }
    let num_w = 8usize;
    let colo_w = 4usize;

    println!(
        "\nGood endpoints: {} (tested: {} of {})",
        snapshot.found_good, snapshot.completed, snapshot.total
    );
    let c = &snapshot.counters;
    println!(
        "Rejected: timeout {}, unreachable {}, latency {}, jitter {}, download {}, upload {}, compromised {}, wrong geo {}, error {}",
        c.timeout,
        c.unreachable,
        c.high_latency,
        c.high_jitter,
        c.low_download,
        c.low_upload,
        c.compromised,
        c.wrong_geo,
        c.error
    );
    if results.is_empty() {
        return;
    }
    println!(
        "{:<cand_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:<colo_w$}",
        "endpoint", "ping_ms", "jitter", "down", "up", "colo",
    );
    println!(
        "{:-<cand_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<num_w$}  {:-<colo_w$}",
        "", "", "", "", "", "",
    );
    let opt_u = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
    let opt_f = |v: Option<f64>| v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".into());
    for r in results {
        let label: String = r.candidate.chars().take(60).collect();
        println!(
            "{:<cand_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:>num_w$}  {:<colo_w$}",
            label,
            opt_u(r.latency_ms),
            opt_u(r.jitter_ms),
            opt_f(r.download_mbps),
            opt_f(r.upload_mbps),
            r.datacenter.as_deref().unwrap_or("-"),
        );
    }
}

fn write_results_json(path: &Path, snapshot: &ScanSnapshot) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, snapshot)?;
    Ok(())
}
