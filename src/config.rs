//! Configuration layer: typed settings with layered precedence (file → env).

use std::{path::Path, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rivolo";

const DEFAULT_MSIE_THRESHOLD: usize = 255;
const DEFAULT_CHROME_THRESHOLD: usize = 2048;
const DEFAULT_SAFARI_THRESHOLD: usize = 1024;

/// Fully validated settings consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Streaming behaviour knobs.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Autoflush cadence. `None` disables autoflushing; a zero duration
    /// forces a flush at every opportunity.
    pub autoflush: Option<Duration>,
    /// Capture rendering errors at partial boundaries instead of aborting
    /// the stream.
    pub recover_errors: bool,
    /// Who may see injected error diagnostics.
    pub show_errors: ShowErrorsPolicy,
    /// First-chunk padding thresholds keyed by user-agent substring.
    pub padding: PaddingTable,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            autoflush: None,
            recover_errors: true,
            show_errors: ShowErrorsPolicy::Trusted,
            padding: PaddingTable::default(),
        }
    }
}

/// Gate for client-visible error diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowErrorsPolicy {
    Never,
    /// Only clients the caller marked as trusted (e.g. loopback requests).
    Trusted,
    Always,
}

impl ShowErrorsPolicy {
    pub fn allows(self, trusted: bool) -> bool {
        match self {
            ShowErrorsPolicy::Never => false,
            ShowErrorsPolicy::Trusted => trusted,
            ShowErrorsPolicy::Always => true,
        }
    }
}

/// One user-agent padding rule. Rules are evaluated in order; the first
/// matching substring wins.
#[derive(Debug, Clone, Deserialize)]
pub struct PaddingRule {
    pub contains: String,
    pub threshold: usize,
}

/// Ordered user-agent → first-chunk threshold table.
///
/// Several browsers sniff the content type or defer rendering until a minimum
/// number of bytes arrive; padding the first chunk up to the threshold keeps
/// incremental rendering working for them. The table is data, not logic: the
/// defaults reflect the browsers measured when this technique was current and
/// deployments are expected to override them as user agents move on.
#[derive(Debug, Clone)]
pub struct PaddingTable {
    rules: Vec<PaddingRule>,
}

impl PaddingTable {
    pub fn new(rules: Vec<PaddingRule>) -> Self {
        Self { rules }
    }

    /// Minimum first-chunk size for the given client. Anything that is not
    /// `text/html` gets no padding; an absent content type counts as HTML
    /// because that is what the response defaults to.
    pub fn threshold(&self, user_agent: Option<&str>, content_type: Option<&str>) -> usize {
        if let Some(content_type) = content_type {
            if !content_type.starts_with("text/html") {
                return 0;
            }
        }
        let Some(user_agent) = user_agent else {
            return 0;
        };
        self.rules
            .iter()
            .find(|rule| user_agent.contains(rule.contains.as_str()))
            .map(|rule| rule.threshold)
            .unwrap_or(0)
    }
}

impl Default for PaddingTable {
    fn default() -> Self {
        // Chrome's user agent also contains "Safari", so the Chrome rule must
        // come first.
        Self::new(vec![
            PaddingRule {
                contains: "MSIE".to_string(),
                threshold: DEFAULT_MSIE_THRESHOLD,
            },
            PaddingRule {
                contains: "Chrome".to_string(),
                threshold: DEFAULT_CHROME_THRESHOLD,
            },
            PaddingRule {
                contains: "Safari".to_string(),
                threshold: DEFAULT_SAFARI_THRESHOLD,
            },
        ])
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("RIVOLO").separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            stream: build_stream_settings(raw.stream)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    stream: RawStreamSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStreamSettings {
    autoflush_ms: Option<u64>,
    recover_errors: Option<bool>,
    show_errors: Option<String>,
    padding: Option<Vec<PaddingRule>>,
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_stream_settings(stream: RawStreamSettings) -> Result<StreamSettings, LoadError> {
    let autoflush = stream.autoflush_ms.map(Duration::from_millis);

    let show_errors = match stream.show_errors.as_deref() {
        None => ShowErrorsPolicy::Trusted,
        Some("never") => ShowErrorsPolicy::Never,
        Some("trusted") => ShowErrorsPolicy::Trusted,
        Some("always") => ShowErrorsPolicy::Always,
        Some(other) => {
            return Err(LoadError::invalid(
                "stream.show_errors",
                format!("unknown policy `{other}`, expected never/trusted/always"),
            ));
        }
    };

    let padding = match stream.padding {
        Some(rules) => {
            for rule in &rules {
                if rule.contains.is_empty() {
                    return Err(LoadError::invalid(
                        "stream.padding",
                        "rule `contains` must not be empty",
                    ));
                }
            }
            PaddingTable::new(rules)
        }
        None => PaddingTable::default(),
    };

    Ok(StreamSettings {
        autoflush,
        recover_errors: stream.recover_errors.unwrap_or(true),
        show_errors,
        padding,
    })
}
