//! Tracing subscriber setup for applications embedding the session engine.
//!
//! The library itself only emits `tracing` events. Embedders that do not have
//! their own subscriber can call [`init`] to get a daily-rotated log file plus
//! optional stderr output.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// How much goes to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Nothing on stderr; the log file still receives lifecycle events.
    #[default]
    Quiet,
    /// Lifecycle events, no XML traffic.
    Default,
    /// Lifecycle events plus every element sent and received.
    Xmpp,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbosity: Verbosity,
    /// Directory for the rotating log file. `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    /// File name prefix inside `log_dir`.
    pub file_name: Option<String>,
}

/// Filter directives for the stderr layer at `verbosity`.
pub fn default_directives(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Quiet => "fluux_session=warn,warn",
        Verbosity::Default => "fluux_session=info,info",
        Verbosity::Xmpp => "fluux_session=info,fluux_session::stream=trace,info",
    }
}

/// Platform log directory:
///   macOS:   ~/Library/Logs/fluux-session/
///   Linux:   ~/.local/share/fluux-session/logs/  (or $XDG_DATA_HOME)
///   Windows: %LOCALAPPDATA%\fluux-session\logs\
pub fn default_log_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join("fluux-session").join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join("fluux-session"))
        .unwrap_or(dir);

    dir
}

fn filter_for(directives: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(directives)
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the built-in filters.
///
/// The returned guard flushes the file writer on drop; keep it alive for as
/// long as logging is wanted.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_name = options.file_name.as_deref().unwrap_or("fluux-session.log");
            let file_appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter_for(default_directives(Verbosity::Default)));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = match options.verbosity {
        Verbosity::Quiet if std::env::var("RUST_LOG").is_err() => None,
        verbosity => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter_for(default_directives(verbosity))),
        ),
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("tracing subscriber already installed: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_parse() {
        for verbosity in [Verbosity::Quiet, Verbosity::Default, Verbosity::Xmpp] {
            let directives = default_directives(verbosity);
            assert!(directives.starts_with("fluux_session="));
            assert!(EnvFilter::try_new(directives).is_ok());
        }
    }

    #[test]
    fn test_xmpp_verbosity_traces_stream_traffic() {
        assert!(default_directives(Verbosity::Xmpp).contains("fluux_session::stream=trace"));
        assert!(!default_directives(Verbosity::Default).contains("trace"));
    }

    #[test]
    fn test_default_log_dir_is_namespaced() {
        let dir = default_log_dir();
        assert!(dir.components().any(|c| c.as_os_str() == "fluux-session"));
    }
}
