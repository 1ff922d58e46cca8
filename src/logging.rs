//! Diagnostic logging setup.
//!
//! Console output goes to stderr so that command output on stdout stays
//! machine-readable. When a log directory is configured, a daily rolling
//! JSON file is written alongside.

use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Number of `-v` flags given on the command line
    pub verbose: u8,
    /// Directive from the config file, e.g. `info` or `stagegate=debug`
    pub level: Option<String>,
    pub json: bool,
    pub dir: Option<PathBuf>,
}

/// Pick the filter directive: `-v` flags win, then `RUST_LOG`, then the
/// configured level, then `warn`.
pub fn filter_directive(verbose: u8, env: Option<&str>, configured: Option<&str>) -> String {
    match verbose {
        0 => env
            .or(configured)
            .map(str::to_string)
            .unwrap_or_else(|| "warn".to_string()),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so buffered file output is flushed.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let env = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(options.verbose, env.as_deref(), options.level.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow::anyhow!("Invalid log filter '{}': {}", directive, e))?;

    let json_layer = options
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!options.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let (file_layer, guard) = match options.dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "stagegate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(guard)
}
