mod config;
mod connectivity;
mod models;
mod protection;
mod proxy;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::settings::{valid_probe_timeout, LoggingConfig, Settings, MAX_PROBE_TIMEOUT_SECS};
use crate::connectivity::diagnostics::{Diagnostics, LocalServiceTarget};
use crate::connectivity::gate::ConnectivityGate;
use crate::connectivity::prober::{NetworkProber, Prober};
use crate::protection::abuse_detector::AbuseDetector;
use crate::proxy::access_log::AccessLogger;
use crate::proxy::http_handler::HttpHandler;
use crate::proxy::readiness::{self_check, wait_ready, Readiness};
use crate::proxy::server::NcsiServer;

const DEFAULT_CONFIG_PATH: &str = "config/ncsi-resolver.toml";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "ncsi-resolver", version, about = "Answers Windows NCSI probes based on real upstream reachability")]
struct Cli {
    /// Configuration file. Built-in defaults apply when the default path is absent.
    #[arg(long, env = "NCSI_RESOLVER_CONFIG")]
    config: Option<String>,

    /// Log this crate at debug level.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the NCSI HTTP service (default).
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Answer 200 without checking upstream connectivity.
        #[arg(long)]
        no_verify: bool,
    },

    /// Probe every configured target and the local service, then print a report.
    Diagnose {
        /// Per-probe timeout in seconds.
        #[arg(long)]
        timeout: Option<f64>,

        #[arg(long, default_value = "127.0.0.1")]
        local_host: String,

        /// Defaults to the configured server port.
        #[arg(long)]
        local_port: Option<u16>,

        /// Skip the local service check.
        #[arg(long)]
        skip_local: bool,

        #[arg(long)]
        verbose: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Initialise the `tracing` subscriber: console, a daily rolling file and a
/// separate security log fed only by the `security` target. Console output
/// goes to stderr when stdout carries a report.
fn init_tracing(logging: &LoggingConfig, debug: bool, console_stderr: bool) -> anyhow::Result<Vec<WorkerGuard>> {
    std::fs::create_dir_all(&logging.dir)
        .with_context(|| format!("Failed to create log directory {}", logging.dir))?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&logging.dir, "ncsi-resolver.log"));
    let (security_writer, security_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&logging.dir, "security.log"));

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    let security_layer = fmt::layer()
        .with_writer(security_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(Targets::new().with_target("security", Level::WARN));

    let console = if console_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let console_layer = fmt::layer().with_writer(console).with_target(true);

    let default_filter = if debug {
        "info,ncsi_resolver=debug,security=warn".to_string()
    } else {
        format!("{level},ncsi_resolver={level},security=warn", level = logging.level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .with(security_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(vec![file_guard, security_guard])
}

/// Periodically drop idle detector entries and log detector statistics.
async fn maintenance_loop(detector: Arc<AbuseDetector>, handler: Arc<HttpHandler>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        interval.tick().await;
        let evicted = detector.evict_idle();
        let stats = detector.stats();
        info!(
            active_ips = stats.active_ips,
            tracked_requests = stats.total_connections,
            suspicious_ips = stats.suspicious_ips.len(),
            evicted,
            requests_served = handler.request_count(),
            "Detector statistics"
        );
        for client in &stats.suspicious_ips {
            info!(
                client_ip = %client.ip,
                connection_count = client.connection_count,
                unique_paths = client.unique_paths,
                rate_limited = client.rate_limited,
                scanning = client.scanning,
                "Suspicious client"
            );
        }
        for entry in detector.recent(5) {
            debug!(
                client_ip = %entry.ip,
                method = %entry.method,
                path = %entry.path,
                response_code = entry.response_code,
                at = %entry.timestamp,
                "Recent connection"
            );
        }
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl-C"),
        res = terminate => res,
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let settings = Arc::new(settings);

    // ---------------------------------------------------------------
    // 1. Connectivity gate
    // ---------------------------------------------------------------
    let gate = if settings.server.verify_connectivity {
        let prober: Arc<dyn Prober> = Arc::new(NetworkProber::new()?);
        Some(Arc::new(ConnectivityGate::new(prober, &settings.connectivity)))
    } else {
        None
    };

    // ---------------------------------------------------------------
    // 2. Abuse detector
    // ---------------------------------------------------------------
    let detector = if settings.security.enabled {
        Some(Arc::new(
            AbuseDetector::from_config(&settings.security).context("Failed to set up abuse detector")?,
        ))
    } else {
        info!("Abuse detection disabled");
        None
    };

    // ---------------------------------------------------------------
    // 3. Request handler
    // ---------------------------------------------------------------
    let access_log = if settings.logging.access_log.is_empty() {
        None
    } else {
        match AccessLogger::new(&settings.logging.access_log) {
            Ok(logger) => {
                info!("Access log enabled: {}", settings.logging.access_log);
                Some(Arc::new(logger))
            }
            Err(e) => {
                error!("Failed to open access log {}: {}", settings.logging.access_log, e);
                None
            }
        }
    };

    let handler = Arc::new(HttpHandler::new(
        gate.clone(),
        detector.clone(),
        &settings.content,
        access_log,
    ));

    // ---------------------------------------------------------------
    // 4. Listener
    // ---------------------------------------------------------------
    let readiness = Arc::new(Readiness::new(settings.server.ready_file.as_ref().map(PathBuf::from)));
    let server = Arc::new(NcsiServer::new(
        settings.server.clone(),
        Arc::clone(&handler),
        Arc::clone(&readiness),
    ));
    let listener = server.bind().await?;

    let server_handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(listener).await }
    });

    // Requests arriving during the warm-up wait for its result.
    let warmup_handle = gate.clone().map(|gate| {
        let check_interval_secs = settings.connectivity.check_interval_secs;
        tokio::spawn(async move {
            let connected = gate.is_connected(true).await;
            info!(
                connected,
                via = ?gate.snapshot().via,
                check_interval_secs,
                "Initial connectivity check finished"
            );
        })
    });

    let ready_rx = readiness.subscribe();
    let self_check_handle = tokio::spawn(async move {
        if let Some(addr) = wait_ready(ready_rx).await {
            self_check(addr, Duration::from_secs(2)).await;
        }
    });

    let maintenance_handle = detector
        .clone()
        .map(|d| tokio::spawn(maintenance_loop(d, Arc::clone(&handler))));

    info!("NCSI resolver is running. Press Ctrl+C to shut down.");

    // ---------------------------------------------------------------
    // 5. Wait for shutdown signal
    // ---------------------------------------------------------------
    shutdown_signal().await?;
    info!("Shutting down NCSI resolver...");

    server_handle.abort();
    self_check_handle.abort();
    if let Some(handle) = warmup_handle {
        handle.abort();
    }
    if let Some(handle) = maintenance_handle {
        handle.abort();
    }

    if let Some(ref detector) = detector {
        if !handler.drain_observations(SHUTDOWN_DRAIN_TIMEOUT).await {
            warn!("Detector observations still running at shutdown, flushing what was recorded");
        }
        if let Err(e) = detector.flush() {
            warn!(error = %e, "Failed to persist connection log on shutdown");
        }
    }
    readiness.mark_stopped();

    info!(requests_served = handler.request_count(), "NCSI resolver shut down gracefully");
    Ok(())
}

async fn diagnose(
    settings: Settings,
    timeout: Option<f64>,
    local: Option<LocalServiceTarget>,
    verbose: bool,
    json: bool,
) -> anyhow::Result<bool> {
    let timeout = match timeout {
        Some(secs) if valid_probe_timeout(secs) => Duration::from_secs_f64(secs),
        Some(secs) => anyhow::bail!(
            "--timeout must be greater than 0 and at most {} seconds, got {}",
            MAX_PROBE_TIMEOUT_SECS,
            secs
        ),
        None => settings.connectivity.timeout(),
    };

    let prober: Arc<dyn Prober> = Arc::new(NetworkProber::new()?);
    let diagnostics = Diagnostics::new(prober, timeout)?;
    let report = diagnostics
        .run(&settings.connectivity.targets(), local.as_ref())
        .await;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize diagnostics report")?
        );
    } else {
        println!("{}", report.format(verbose));
    }
    Ok(report.summary.internet_connectivity)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS operations
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        anyhow::bail!("Failed to install rustls CryptoProvider");
    }

    let cli = Cli::parse();

    // ---------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------
    let explicit = cli.config.is_some();
    let config_path = cli.config.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config_found = Path::new(&config_path).exists();
    let mut settings = Settings::load_or_default(&config_path, explicit)?;

    let command = cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
        no_verify: false,
    });

    if let Command::Serve { ref host, port, no_verify } = command {
        if let Some(host) = host {
            settings.server.host = host.clone();
        }
        if let Some(port) = port {
            settings.server.port = port;
        }
        if no_verify {
            settings.server.verify_connectivity = false;
        }
    }
    settings.validate().context("Invalid configuration")?;

    // ---------------------------------------------------------------
    // Logging
    // ---------------------------------------------------------------
    let is_diagnose = matches!(command, Command::Diagnose { .. });
    let log_guards = init_tracing(&settings.logging, cli.debug, is_diagnose)?;

    if config_found {
        info!("Config loaded from {}", config_path);
    } else {
        warn!("No config file at {}, using built-in defaults", config_path);
    }

    match command {
        Command::Serve { .. } => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                bind = %settings.server.bind_addr(),
                verify_connectivity = settings.server.verify_connectivity,
                "Starting NCSI resolver"
            );
            serve(settings).await
        }
        Command::Diagnose {
            timeout,
            local_host,
            local_port,
            skip_local,
            verbose,
            json,
        } => {
            let local = (!skip_local).then(|| LocalServiceTarget {
                host: local_host,
                port: local_port.unwrap_or(settings.server.port),
                ncsi_text: settings.content.ncsi_text.clone(),
            });
            let connected = diagnose(settings, timeout, local, verbose, json).await?;
            if !connected {
                drop(log_guards);
                std::process::exit(2);
            }
            Ok(())
        }
    }
}
