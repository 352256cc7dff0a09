//! Engine configuration.
//!
//! Built in code with the `with_*` methods, or from `TREELET_*` environment
//! variables via [`EngineConfig::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Port the worker listens on when nothing else is configured. Fixed so a
/// debugger can attach to a known address.
pub const DEFAULT_DEBUG_PORT: u16 = 54817;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_PARSE_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelection {
    Fixed(u16),
    /// Ask the OS for a free loopback port right before launch.
    Ephemeral,
}

impl Default for PortSelection {
    fn default() -> Self {
        Self::Fixed(DEFAULT_DEBUG_PORT)
    }
}

impl PortSelection {
    /// Pick the concrete port to hand to the worker.
    ///
    /// A fixed port is probed first so a second engine on the same port
    /// fails here instead of talking to someone else's worker.
    pub fn resolve(self) -> Result<u16> {
        let port = match self {
            Self::Fixed(port) => port,
            Self::Ephemeral => 0,
        };
        let probe = std::net::TcpListener::bind(("127.0.0.1", port)).map_err(|e| {
            Error::Startup(format!("loopback port {port} is not available: {e}"))
        })?;
        Ok(probe.local_addr()?.port())
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" | "0" => Some(Self::Ephemeral),
            other => other.parse().ok().map(Self::Fixed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker executable, looked up on `PATH` when relative.
    pub executable: PathBuf,
    /// First argument to the worker, relative to the install directory.
    pub entrypoint: String,
    pub install_dir: PathBuf,
    /// On-disk worker bundle to install from.
    pub bundle: Option<PathBuf>,
    /// Dependency resolution command, run inside the install directory.
    pub resolver: Vec<String>,
    pub port: PortSelection,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
    /// How long `close` waits at each escalation step.
    pub shutdown_grace: Duration,
    pub parse_batch_size: usize,
    /// Passed to the worker as `TREELET_LOG_FILE`.
    pub log_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("treelet-worker"))
    }
}

impl EngineConfig {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: PathBuf::from("treelet-worker"),
            entrypoint: "worker.json".to_string(),
            install_dir: install_dir.into(),
            bundle: None,
            resolver: vec!["treelet-worker".to_string(), "resolve".to_string()],
            port: PortSelection::default(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            parse_batch_size: DEFAULT_PARSE_BATCH_SIZE,
            log_file: None,
        }
    }

    /// Defaults overridden by `TREELET_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T>(
            key: &str,
            value: Option<String>,
            parse: impl Fn(&str) -> Option<T>,
        ) -> Option<T> {
            let value = value?;
            let parsed = parse(value.trim());
            if parsed.is_none() {
                tracing::warn!(key, %value, "Ignoring unparseable setting");
            }
            parsed
        }
        let secs = |s: &str| s.parse::<u64>().ok().map(Duration::from_secs);

        if let Some(port) = parsed("TREELET_PORT", lookup("TREELET_PORT"), PortSelection::parse) {
            self.port = port;
        }
        if let Some(timeout) = parsed(
            "TREELET_STARTUP_TIMEOUT_SECS",
            lookup("TREELET_STARTUP_TIMEOUT_SECS"),
            secs,
        ) {
            self.startup_timeout = timeout;
        }
        if let Some(timeout) = parsed(
            "TREELET_REQUEST_TIMEOUT_SECS",
            lookup("TREELET_REQUEST_TIMEOUT_SECS"),
            secs,
        ) {
            self.request_timeout = timeout;
        }
        if let Some(size) = parsed(
            "TREELET_PARSE_BATCH_SIZE",
            lookup("TREELET_PARSE_BATCH_SIZE"),
            |s| s.parse::<usize>().ok().filter(|n| *n > 0),
        ) {
            self.parse_batch_size = size;
        }
        if let Some(executable) = lookup("TREELET_WORKER") {
            self.executable = executable.into();
        }
        if let Some(dir) = lookup("TREELET_INSTALL_DIR") {
            self.install_dir = dir.into();
        }
        if let Some(bundle) = lookup("TREELET_BUNDLE") {
            self.bundle = Some(bundle.into());
        }
        if let Some(log_file) = lookup("TREELET_LOG_FILE") {
            self.log_file = Some(log_file.into());
        }
        self
    }

    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn with_bundle(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.bundle = Some(bundle.into());
        self
    }

    pub fn with_resolver<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resolver = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: PortSelection) -> Self {
        self.port = port;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_parse_batch_size(mut self, size: usize) -> Self {
        self.parse_batch_size = size.max(1);
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::new("/tmp/install");
        assert_eq!(config.port, PortSelection::Fixed(DEFAULT_DEBUG_PORT));
        assert_eq!(config.startup_timeout, Duration::from_secs(3600));
        assert_eq!(config.request_timeout, Duration::from_secs(3600));
        assert_eq!(config.parse_batch_size, 10);
        assert_eq!(config.entrypoint, "worker.json");
        assert_eq!(config.resolver, vec!["treelet-worker", "resolve"]);
        assert!(config.bundle.is_none());
        assert!(config.log_file.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let config = EngineConfig::new("/tmp/install").apply_env(env(&[
            ("TREELET_PORT", "auto"),
            ("TREELET_STARTUP_TIMEOUT_SECS", "30"),
            ("TREELET_REQUEST_TIMEOUT_SECS", "5"),
            ("TREELET_WORKER", "/opt/treelet/bin/worker"),
            ("TREELET_INSTALL_DIR", "/var/lib/treelet"),
            ("TREELET_BUNDLE", "/opt/treelet/bundle"),
            ("TREELET_LOG_FILE", "/var/log/treelet.log"),
            ("TREELET_PARSE_BATCH_SIZE", "25"),
        ]));

        assert_eq!(config.port, PortSelection::Ephemeral);
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.executable, PathBuf::from("/opt/treelet/bin/worker"));
        assert_eq!(config.install_dir, PathBuf::from("/var/lib/treelet"));
        assert_eq!(config.bundle, Some(PathBuf::from("/opt/treelet/bundle")));
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/treelet.log")));
        assert_eq!(config.parse_batch_size, 25);
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let config = EngineConfig::new("/tmp/install").apply_env(env(&[
            ("TREELET_PORT", "not-a-port"),
            ("TREELET_STARTUP_TIMEOUT_SECS", "-1"),
            ("TREELET_PARSE_BATCH_SIZE", "0"),
        ]));
        assert_eq!(config.port, PortSelection::Fixed(DEFAULT_DEBUG_PORT));
        assert_eq!(config.startup_timeout, DEFAULT_STARTUP_TIMEOUT);
        assert_eq!(config.parse_batch_size, DEFAULT_PARSE_BATCH_SIZE);
    }

    #[test]
    fn fixed_port_parses() {
        assert_eq!(PortSelection::parse("6000"), Some(PortSelection::Fixed(6000)));
        assert_eq!(PortSelection::parse("0"), Some(PortSelection::Ephemeral));
        assert_eq!(PortSelection::parse("70000"), None);
    }

    #[test]
    fn ephemeral_port_resolves_to_nonzero() {
        let port = PortSelection::Ephemeral.resolve().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn occupied_fixed_port_is_rejected() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = PortSelection::Fixed(port).resolve().unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
    }
}
