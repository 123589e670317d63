//! Daemon assembly and lifecycle.
//!
//! Opens storage and policy from the resolved [`Settings`], wires the
//! decision pipeline to the proxy listener and runs until SIGINT/SIGTERM.
//! SIGHUP reloads policy documents in place.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::{AuditEventType, NewAuditEntry};
use crate::config::{IntentProviderKind, IntentSettings, Settings, TelemetrySettings, TelemetrySinkKind};
use crate::intent::{DEFAULT_LOCAL_ENDPOINT, IntentProvider, IntentService, LocalModelAnalyzer};
use crate::interceptor::{RequestInterceptor, Services};
use crate::policy::{LoadReport, PolicyEngine};
use crate::proxy::{CertificateAuthority, CertificateCache, ProxyServer};
use crate::ratelimit::RateLimiter;
use crate::scanner::SecretScanner;
use crate::storage::Database;
use crate::telemetry::{NullSink, SyslogSink, TelemetryReporter};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Open the database and policy directory and build the pipeline's
/// components. Intent analysis and telemetry stay disabled; the daemon
/// switches them on.
pub fn open_services(settings: &Settings) -> Result<(Services, LoadReport)> {
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", settings.data_dir))?;
    let db = Arc::new(
        Database::open_in_dir(&settings.data_dir).context("Failed to open database")?,
    );

    let policy = Arc::new(PolicyEngine::new(&settings.policy_dir));
    let report = policy
        .load_policies()
        .with_context(|| format!("Failed to load policies from {:?}", settings.policy_dir))?;

    let mut services =
        Services::new(db, policy.clone()).context("Failed to compile secret signatures")?;
    services.limiter = Arc::new(RateLimiter::with_slot_timeout(
        policy.clone(),
        settings.slot_timeout,
    ));
    services.scanner = Arc::new(
        SecretScanner::new(policy)
            .context("Failed to compile secret signatures")?
            .with_max_scan_bytes(settings.max_scan_bytes),
    );
    Ok((services, report))
}

/// Build the configured intent provider. A provider that cannot be set up
/// is logged and left disabled.
pub fn intent_service(settings: &IntentSettings) -> IntentService {
    let provider = match settings.provider {
        IntentProviderKind::Disabled => IntentProvider::Disabled,
        IntentProviderKind::LocalModel => {
            let endpoint = settings.endpoint.as_deref().unwrap_or(DEFAULT_LOCAL_ENDPOINT);
            let model = settings.model.clone().unwrap_or_default();
            match LocalModelAnalyzer::new(endpoint, model) {
                Ok(analyzer) => IntentProvider::LocalModel(Arc::new(analyzer)),
                Err(e) => {
                    warn!(error = %e, "Local intent model unavailable; intent analysis disabled");
                    IntentProvider::Disabled
                }
            }
        }
        IntentProviderKind::RemoteApi => {
            warn!("No remote intent backend is available in this build; intent analysis disabled");
            IntentProvider::Disabled
        }
    };
    IntentService::new(provider, settings.threshold, settings.timeout)
}

/// Build the telemetry reporter. A syslog sink that cannot connect leaves
/// telemetry disabled.
pub fn telemetry_reporter(settings: &TelemetrySettings) -> TelemetryReporter {
    if !settings.enabled {
        return TelemetryReporter::disabled();
    }
    match settings.sink {
        TelemetrySinkKind::None => TelemetryReporter::new(Arc::new(NullSink), settings.batch_size),
        TelemetrySinkKind::Syslog => match SyslogSink::new() {
            Ok(sink) => TelemetryReporter::new(Arc::new(sink), settings.batch_size),
            Err(e) => {
                warn!(target: "rashomon::ops", error = %e, "Telemetry disabled");
                TelemetryReporter::disabled()
            }
        },
    }
}

/// Run the proxy daemon until interrupted.
pub fn run_daemon(settings: &Settings) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    rt.block_on(serve(settings))
}

async fn serve(settings: &Settings) -> Result<()> {
    let (mut services, report) = open_services(settings)?;
    services.intent = Arc::new(intent_service(&settings.intent));
    services.telemetry = Arc::new(telemetry_reporter(&settings.telemetry));

    let interceptor = Arc::new(
        RequestInterceptor::new(services.clone()).with_lookup_timeout(settings.lookup_timeout),
    );
    audit(&services, AuditEventType::PolicyLoaded, report_details(&report));

    let ca = CertificateAuthority::load_or_create(&settings.data_dir)
        .context("Failed to load or create the local CA")?;
    info!(path = %ca.cert_path().display(), "Local CA ready; trust this certificate in agent environments");
    let certs = Arc::new(CertificateCache::new(Arc::new(ca)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(settings.proxy_config(), interceptor.clone(), certs, shutdown_rx.clone())
        .await
        .with_context(|| format!("Failed to start proxy on {}", settings.listen))?;
    let listen = server.local_addr().context("Failed to read listen address")?;

    audit(
        &services,
        AuditEventType::SystemStarted,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "listen": listen.to_string(),
            "interceptTls": settings.intercept_tls,
            "intentProvider": services.intent.provider().name(),
        }),
    );

    let flush_task = services
        .telemetry
        .is_enabled()
        .then(|| services.telemetry.spawn_flush_task(settings.telemetry.flush_interval));
    let sweep_task = spawn_sweeper(interceptor, shutdown_rx.clone());
    let reload_task = spawn_reloader(services.clone(), shutdown_rx);

    let proxy_task = tokio::spawn(server.run());

    wait_for_shutdown().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    match proxy_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Proxy stopped with an error"),
        Err(e) => error!(error = %e, "Proxy task panicked"),
    }
    sweep_task.abort();
    reload_task.abort();
    if let Some(task) = flush_task {
        task.abort();
    }

    audit(&services, AuditEventType::SystemStopped, json!({}));
    services.telemetry.flush();
    Ok(())
}

fn report_details(report: &LoadReport) -> serde_json::Value {
    json!({
        "loaded": report.loaded,
        "rejected": report
            .rejected
            .iter()
            .map(|e| json!({"file": e.file.display().to_string(), "field": e.field, "message": e.message}))
            .collect::<Vec<_>>(),
    })
}

fn audit(services: &Services, event_type: AuditEventType, details: serde_json::Value) {
    let entry = NewAuditEntry::new(event_type, details).decision("system");
    if let Err(e) = services.audit.append(entry) {
        error!(target: "rashomon::ops", event = %event_type, error = %e, "Audit write failed");
    }
}

fn spawn_sweeper(
    interceptor: Arc<RequestInterceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => interceptor.sweep(),
                _ = shutdown_rx.changed() => break,
            }
        }
    })
}

#[cfg(unix)]
fn spawn_reloader(
    services: Services,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable; policy reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    reload_policies(&services);
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_reloader(
    _services: Services,
    _shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}

fn reload_policies(services: &Services) {
    match services.policy.reload() {
        Ok(report) => {
            info!(loaded = report.loaded, rejected = report.rejected.len(), "Policies reloaded");
            audit(services, AuditEventType::PolicyReloaded, report_details(&report));
        }
        Err(e) => error!(error = %e, "Policy reload failed; keeping the previous snapshot"),
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
}
