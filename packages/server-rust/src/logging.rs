//! `tracing` subscriber setup.
//!
//! `RUST_LOG` overrides the configured directive when set.

use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when neither `RUST_LOG` nor the caller provides one.
pub const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Fmt,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fmt" | "text" | "pretty" => Ok(Self::Fmt),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format `{other}` (expected fmt or json)")),
        }
    }
}

/// Builds the filter: `RUST_LOG` first, then `directive`, then
/// [`DEFAULT_DIRECTIVE`].
///
/// # Errors
///
/// Returns an error if `directive` does not parse.
pub fn filter(directive: Option<&str>) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(directive.unwrap_or(DEFAULT_DIRECTIVE))?)
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the directive is invalid or a global subscriber is
/// already installed.
pub fn init(directive: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let filter = filter(directive)?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Fmt => registry.with(fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
    }
    Ok(())
}
