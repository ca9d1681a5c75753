//! Log initialization shared by every binary in the workspace.
//!
//! Configuration comes from the environment:
//! * `TRACING_FILTER_DIRECTIVE`: an `EnvFilter` directive such as `info,controller=debug`.
//! * `LOGGING_FORMATTER`: one of `full`, `compact`, `pretty` or `json`.
//! * `LOGGING_ANSI_ENABLED`: `true` to colorize output.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// The message format for logging tracing events.
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    #[default]
    /// Newline-delimited JSON logs, which is what log shippers in a cluster expect.
    Json,
}

/// How tracing events are rendered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    pub message_format: MessageFormat,
    pub ansi_enabled: bool,
}

impl LogFormatter {
    /// Reads the formatter settings through `lookup`, which maps an environment variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let message_format = match lookup(LOGGING_FORMATTER_ENV_VAR) {
            Some(formatter) => {
                serde_plain::from_str(&formatter).context(error::LogFormatterEnvSnafu {
                    env_value: formatter.clone(),
                })?
            }
            None => MessageFormat::default(),
        };

        let ansi_enabled = match lookup(LOGGING_ANSI_ENABLED_ENV_VAR) {
            Some(ansi_enabled) => {
                ansi_enabled
                    .to_lowercase()
                    .parse()
                    .context(error::LogAnsiEnvSnafu {
                        env_value: ansi_enabled.clone(),
                    })?
            }
            None => false,
        };

        Ok(Self {
            message_format,
            ansi_enabled,
        })
    }

    /// Adds a formatting layer to a tracing event subscriber.
    fn layer_onto<S>(&self, subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Each arm yields a different layer type, so the finished subscriber is what gets boxed.
        let ansi = self.ansi_enabled;
        match self.message_format {
            MessageFormat::Full => Box::new(subscriber.with(fmt::layer().with_ansi(ansi))),
            MessageFormat::Compact => {
                Box::new(subscriber.with(fmt::layer().compact().with_ansi(ansi)))
            }
            MessageFormat::Pretty => Box::new(subscriber.with(fmt::layer().pretty().with_ansi(ansi))),
            MessageFormat::Json => Box::new(subscriber.with(fmt::layer().json().with_ansi(ansi))),
        }
    }
}

/// Installs the global tracing subscriber. Call once, before anything logs.
pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let formatter = LogFormatter::from_lookup(|name| env::var(name).ok())?;
    let subscriber = formatter.layer_onto(Registry::default().with(env_filter));

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use super::{LOGGING_ANSI_ENABLED_ENV_VAR, LOGGING_FORMATTER_ENV_VAR};
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
