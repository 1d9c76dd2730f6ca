//! Tracing subscriber setup for the binary.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

pub const DEFAULT_FILTER: &str = "spaghettihub=info,tower_http=info";

fn env_filter(fallback: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback.unwrap_or(DEFAULT_FILTER)))
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logging should flush; it is `None` without a log directory.
///
/// A second call leaves the first subscriber in place.
pub fn init_logging(settings: &LoggingSection, verbose: bool) -> Option<WorkerGuard> {
    let filter = if verbose {
        EnvFilter::new("spaghettihub=debug,tower_http=debug")
    } else {
        env_filter(settings.filter.as_deref())
    };

    let (file_writer, guard) = match &settings.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "spaghettihub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match (settings.format, file_writer) {
        (LogFormat::Json, Some(writer)) => registry
            .with(fmt::layer().json())
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
        (LogFormat::Json, None) => registry.with(fmt::layer().json()).try_init(),
        (LogFormat::Pretty, Some(writer)) => registry
            .with(fmt::layer().pretty())
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init(),
        (LogFormat::Pretty, None) => registry.with(fmt::layer().pretty()).try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
    guard
}
