use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use treelet_worker::manifest::{self, Installation};
use treelet_worker::{JavaWorker, worker_info};

enum Mode {
    Resolve(PathBuf),
    Serve { entrypoint: PathBuf, port: u16 },
    Version,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: treelet-worker <entrypoint> <port>");
            eprintln!("       treelet-worker resolve [dir]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <entrypoint>     Installation manifest (worker.json)");
            eprintln!("  <port>           Loopback port to listen on");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  resolve [dir]    Check the installation in dir and write its lock [default: .]");
            process::exit(2);
        }
    };

    let log_file = std::env::var_os("TREELET_LOG_FILE").map(PathBuf::from);
    treelet::logging::init_tracing(log_file.as_deref());

    if let Err(e) = run(mode).await {
        tracing::error!("Worker failed: {e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    let mut positional: Vec<&str> = Vec::new();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Err(String::new()),
            "--version" | "-V" => return Ok(Mode::Version),
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            value => positional.push(value),
        }
    }

    match positional.as_slice() {
        ["resolve"] => Ok(Mode::Resolve(PathBuf::from("."))),
        ["resolve", dir] => Ok(Mode::Resolve(PathBuf::from(dir))),
        [entrypoint, port] => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {port}"))?;
            Ok(Mode::Serve {
                entrypoint: PathBuf::from(entrypoint),
                port,
            })
        }
        [] => Err("missing required arguments: <entrypoint> <port>".to_string()),
        _ => Err(format!("unexpected arguments: {}", positional.join(" "))),
    }
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    match mode {
        Mode::Version => {
            let info = worker_info();
            println!(
                "{} {} (protocol {})",
                info.name,
                info.version,
                treelet::PROTOCOL_VERSION
            );
            Ok(())
        }
        Mode::Resolve(dir) => resolve(&dir),
        Mode::Serve { entrypoint, port } => serve(&entrypoint, port).await,
    }
}

fn resolve(dir: &Path) -> anyhow::Result<()> {
    let lock = manifest::resolve(dir)
        .with_context(|| format!("failed to resolve installation in {}", dir.display()))?;
    tracing::info!(
        name = %lock.name,
        version = %lock.version,
        files = lock.files.len(),
        "Resolved installation"
    );
    Ok(())
}

async fn serve(entrypoint: &Path, port: u16) -> anyhow::Result<()> {
    let install = Installation::open(entrypoint)
        .with_context(|| format!("cannot serve {}", entrypoint.display()))?;
    tracing::info!(
        name = %install.manifest.name,
        version = %install.manifest.version,
        language = %install.manifest.language,
        packages = install.catalog.packages.len(),
        port,
        "Starting worker"
    );

    let handler = Arc::new(JavaWorker::new(install));
    treelet::run_worker(handler, port, worker_info())
        .await
        .with_context(|| format!("failed to serve on port {port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("treelet-worker")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn serve_takes_entrypoint_and_port() {
        match parse_args(&args(&["worker.json", "54817"])).unwrap() {
            Mode::Serve { entrypoint, port } => {
                assert_eq!(entrypoint, PathBuf::from("worker.json"));
                assert_eq!(port, 54817);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn resolve_defaults_to_cwd() {
        assert!(matches!(
            parse_args(&args(&["resolve"])).unwrap(),
            Mode::Resolve(dir) if dir == Path::new(".")
        ));
    }

    #[test]
    fn rejects_bad_port_and_flags() {
        assert_eq!(
            parse_args(&args(&["worker.json", "http"])).err().unwrap(),
            "invalid port: http"
        );
        assert_eq!(
            parse_args(&args(&["--port", "1"])).err().unwrap(),
            "unknown flag: --port"
        );
        assert!(parse_args(&args(&[])).is_err());
    }
}
