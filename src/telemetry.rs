use std::sync::Once;

use metrics::{Unit, describe_counter};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Init(err.to_string()))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rivolo_chunks_pushed_total",
            Unit::Count,
            "Total number of chunks pushed by streaming render procedures."
        );
        describe_counter!(
            "rivolo_padding_bytes_total",
            Unit::Bytes,
            "Total padding bytes added to first chunks to meet browser thresholds."
        );
        describe_counter!(
            "rivolo_render_errors_total",
            Unit::Count,
            "Total rendering errors captured at a recovery boundary."
        );
        describe_counter!(
            "rivolo_errors_injected_total",
            Unit::Count,
            "Total captured errors injected into client-visible output."
        );
        describe_counter!(
            "rivolo_autoflush_batches_total",
            Unit::Count,
            "Total coalesced chunk batches forwarded by the autoflush overlay."
        );
        describe_counter!(
            "rivolo_cache_commits_total",
            Unit::Count,
            "Total fully-streamed responses committed to the cache store."
        );
    });
}
