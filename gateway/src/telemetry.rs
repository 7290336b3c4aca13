use crate::config::{CommonConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use sentry::types::Dsn;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid sentry dsn: {0}")]
    InvalidDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not install log subscriber: {0}")]
    Subscriber(String),
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("could not install metrics recorder: {0}")]
    Recorder(String),
}

/// Keeps the Sentry client alive; events still queued are flushed on drop.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Installs logging (stdout, plus Sentry when a DSN is configured) and the
/// statsd metrics recorder when metrics are configured.
pub fn init(config: &CommonConfig) -> Result<TelemetryGuard, TelemetryError> {
    let logging = config.logging.as_ref();
    let dsn = match logging.and_then(|logging| logging.sentry_dsn.as_deref()) {
        Some(dsn) => Some(dsn.parse::<Dsn>()?),
        None => None,
    };

    let sentry_guard = dsn.map(|dsn| {
        sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            environment: logging
                .and_then(|logging| logging.environment.clone())
                .map(Into::into),
            ..Default::default()
        })
    });
    let sentry_layer = sentry_guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    Ok(TelemetryGuard {
        _sentry: sentry_guard,
    })
}

fn init_metrics(config: &MetricsConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))?;
    metrics::set_global_recorder(recorder).map_err(|e| TelemetryError::Recorder(e.to_string()))?;
    shared::metrics_defs::describe_metrics(rpc_proxy::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Reporting metrics to statsd"
    );
    Ok(())
}
