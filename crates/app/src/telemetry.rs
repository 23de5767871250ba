use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use courseware_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to install prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

static SUBSCRIBER_READY: OnceLock<()> = OnceLock::new();
static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();
static RECORDER_LOCK: Mutex<()> = Mutex::new(());
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const COUNTERS: &[(&str, &str)] = &[
    ("tasks_total", "Deferred tasks executed, by task and result"),
    ("outline_updates_total", "Outline replacements, by result"),
    ("allowlist_checks_total", "Allowlist eligibility evaluations, by reason"),
    ("certificates_generated_total", "Certificates written by the generator, by status"),
    ("emails_total", "Notification emails attempted, by message and result"),
    ("tracker_events_total", "Analytics events emitted, by name"),
];

fn git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output outside production, JSON lines in it.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_READY.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let registry = tracing_subscriber::registry().with(filter);

    match config.environment {
        Environment::Production => registry.with(fmt_layer.json()).try_init()?,
        Environment::Development | Environment::Test => registry
            .with(fmt_layer.event_format(tracing_fmt::format().pretty()))
            .try_init()?,
    }

    SUBSCRIBER_READY.set(()).ok();
    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = SERVICE_VERSION,
        git_sha = git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Returns the process-wide Prometheus handle, installing the recorder on first use.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = RECORDER.get() {
        return Ok(handle.clone());
    }

    let _guard = RECORDER_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = RECORDER.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    RECORDER.set(handle.clone()).ok();
    STARTED_AT.get_or_init(Instant::now);
    describe_service_metrics();
    Ok(handle)
}

fn describe_service_metrics() {
    describe_gauge!("app_build_info", "Version and commit of the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the recorder was installed");
    describe_histogram!(
        "task_duration_seconds",
        "Wall time of deferred task executions, by task"
    );
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
}

/// Recorder output followed by the build and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    // writing into a String cannot fail
    let _ = write!(
        body,
        "# TYPE app_build_info gauge\n\
         app_build_info{{service=\"courseware\",version=\"{SERVICE_VERSION}\",git=\"{}\"}} 1\n\
         # TYPE app_uptime_seconds gauge\n\
         app_uptime_seconds {uptime}\n",
        git_sha()
    );
    body
}
