use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for the stdout layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for local runs.
    Compact,
    /// One JSON object per line, for log shippers in the worker fleet.
    Json,
}

impl LogFormat {
    /// Parse from `CRAWL_RECOVERY_LOG_FORMAT`. Anything but `json` is compact.
    pub fn from_env() -> Self {
        match std::env::var("CRAWL_RECOVERY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Initialize tracing with a stdout layer and a Sentry layer.
///
/// - Stdout: compact or JSON (see [`LogFormat`])
/// - Sentry: captures ERROR events as issues, WARN as breadcrumbs
/// - Default level: INFO for dependencies, DEBUG for this crate; override via RUST_LOG
///
/// Writes go to stderr so the sidecar protocol on stdout stays clean.
pub fn init(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crawl_recovery=debug"));

    // No-op when Sentry DSN is not configured.
    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    let registry = tracing_subscriber::registry().with(env_filter).with(sentry_layer);

    let result = match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(false),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing already initialized: {e}");
        return;
    }

    tracing::debug!(?format, "Tracing initialized");
}

/// Sentry client options for the sidecar binary. Returns a disabled client when
/// `SENTRY_DSN` is absent.
pub fn sentry_options() -> sentry::ClientOptions {
    sentry::ClientOptions {
        dsn: std::env::var("SENTRY_DSN").ok().and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        ..Default::default()
    }
}
