//! Tracing setup shared by host binaries and the worker.
//!
//! `RUST_LOG` wins when set. Otherwise `TREELET_LOG` picks the level for the
//! treelet targets. `LOG_FORMAT=json` switches to JSON lines.

use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Later calls are no-ops.
///
/// Logs go to `log_file` (appending) when given and openable, stderr otherwise.
pub fn init_tracing(log_file: Option<&Path>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TREELET_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "treelet={level},treelet_worker={level},treelet::bridge::codec=warn"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let file = log_file.and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("treelet: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    match (file, use_json) {
        (Some(file), true) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(Mutex::new(file)))
                .try_init();
        }
        (Some(file), false) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init();
        }
        (None, true) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init();
        }
        (None, false) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init();
        }
    }
}
