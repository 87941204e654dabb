//! Log output for the `codecraft` command.
//!
//! Records go to stderr; stdout carries the JSON printed by `run` and
//! `status`. The filter comes from `CODECRAFT_LOG`, then `RUST_LOG`, then
//! the verbosity flag.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "CODECRAFT_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    /// One JSON object per line, event fields at the top level.
    Json,
}

/// Directives used when neither variable is set. HTTP client internals stay
/// at `warn` so LLM extraction does not drown the pipeline events.
fn default_directives(level: Level) -> String {
    format!("{},hyper=warn,h2=warn,reqwest=warn", level.as_str())
}

fn env_filter(level: Level) -> EnvFilter {
    [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .into_iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. Returns `false` if one was already set,
/// in which case the existing one stays in place.
pub fn init_tracing(format: LogFormat, level: Level) -> bool {
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter(level));
    match format {
        LogFormat::Text => registry.with(layer).try_init(),
        LogFormat::Json => registry.with(layer.json().flatten_event(true)).try_init(),
    }
    .is_ok()
}
