//! Worker process supervision.
//!
//! Flow:
//! 1. `create`: detect an existing installation
//! 2. `install`: extract the bundle, resolve dependencies
//! 3. `start`: spawn `executable entrypoint port`, poll the port until the
//!    worker greets us, keep that connection as the control session
//! 4. `close`: `shutdown` on the control session, then SIGTERM, then kill
//!
//! State machine:
//!
//! ```text
//! Uninstalled -> Installed -> Starting -> Ready -> Closed
//!                    |            |         |
//!                    +------------+---------+--> Failed
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::bridge::protocol::{Shutdown, WorkerInfo};
use crate::bridge::session::Session;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::install::{self, WorkerBundle};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninstalled,
    Installed,
    Starting,
    Ready,
    Closed,
    Failed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Worker state shared with every session opened against the worker.
#[derive(Debug)]
pub(crate) struct StateCell(StdMutex<WorkerState>);

impl StateCell {
    pub(crate) fn new(state: WorkerState) -> Self {
        Self(StdMutex::new(state))
    }

    pub(crate) fn get(&self) -> WorkerState {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set(&self, state: WorkerState) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != state {
            tracing::debug!(from = %*guard, to = %state, "Worker state change");
            *guard = state;
        }
    }

    /// A session lost its transport. Only a ready worker becomes failed;
    /// a worker being closed stays closed.
    pub(crate) fn fail_if_ready(&self) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard == WorkerState::Ready {
            tracing::error!("Lost connection to worker, marking it failed");
            *guard = WorkerState::Failed;
        }
    }
}

/// What a spawner needs to launch one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub entrypoint: String,
    pub port: u16,
    pub install_dir: PathBuf,
    pub log_file: Option<PathBuf>,
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<Child>;
}

/// Runs `executable entrypoint port` in the install directory.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        let mut command = Command::new(&spec.executable);
        command
            .arg(&spec.entrypoint)
            .arg(spec.port.to_string())
            .current_dir(&spec.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref log_file) = spec.log_file {
            command.env("TREELET_LOG_FILE", log_file);
        }
        command.spawn()
    }
}

pub struct WorkerSupervisor {
    config: EngineConfig,
    state: Arc<StateCell>,
    spawner: Arc<dyn WorkerSpawner>,
    child: Option<Child>,
    control: Option<Session>,
    port: Option<u16>,
    worker: Option<WorkerInfo>,
    exit_status: Option<ExitStatus>,
}

impl WorkerSupervisor {
    pub fn create(config: EngineConfig) -> Self {
        let state = if install::is_installed(&config.install_dir) {
            WorkerState::Installed
        } else {
            WorkerState::Uninstalled
        };
        tracing::debug!(install_dir = %config.install_dir.display(), %state, "Supervisor created");
        Self {
            config,
            state: Arc::new(StateCell::new(state)),
            spawner: Arc::new(ProcessSpawner),
            child: None,
            control: None,
            port: None,
            worker: None,
            exit_status: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Port the running worker listens on.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Identity from the worker's greeting.
    pub fn worker(&self) -> Option<&WorkerInfo> {
        self.worker.as_ref()
    }

    /// How the worker exited, once `close` has reaped it.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub async fn install(&mut self, bundle: &WorkerBundle) -> Result<()> {
        let before = self.state();
        if !matches!(before, WorkerState::Uninstalled | WorkerState::Installed) {
            return Err(Error::InvalidState {
                operation: "install",
                state: before,
            });
        }

        match install::install(bundle, &self.config.install_dir, &self.config.resolver).await {
            Ok(()) => {
                self.state.set(WorkerState::Installed);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker installation failed");
                if before == WorkerState::Installed {
                    self.state.set(WorkerState::Failed);
                }
                Err(e)
            }
        }
    }

    /// Launch the worker and wait for its greeting.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != WorkerState::Installed {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        }
        self.state.set(WorkerState::Starting);

        match self.launch().await {
            Ok(()) => {
                self.state.set(WorkerState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker failed to start");
                self.state.set(WorkerState::Failed);
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<()> {
        let port = self.config.port.resolve()?;
        let spec = LaunchSpec {
            executable: self.config.executable.clone(),
            entrypoint: self.config.entrypoint.clone(),
            port,
            install_dir: self.config.install_dir.clone(),
            log_file: self.config.log_file.clone(),
        };

        tracing::info!(
            executable = %spec.executable.display(),
            port,
            "Spawning worker"
        );
        let child = self.spawner.spawn(&spec).map_err(|e| {
            Error::Startup(format!(
                "failed to spawn {}: {e}",
                spec.executable.display()
            ))
        })?;
        self.port = Some(port);
        let child = self.child.insert(child);

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let timeout = self.config.startup_timeout;
        let session = tokio::time::timeout(
            timeout,
            wait_ready(child, addr, self.config.request_timeout),
        )
        .await
        .map_err(|_| Error::StartupTimeout(timeout))??;

        tracing::info!(
            port,
            pid = ?child.id(),
            worker = %session.worker().name,
            worker_version = %session.worker().version,
            "Worker ready"
        );
        self.worker = Some(session.worker().clone());
        self.control = Some(session.attach(Arc::clone(&self.state)));
        Ok(())
    }

    /// Open a new analysis session on the running worker.
    pub async fn open_session(&self) -> Result<Session> {
        let state = self.state();
        let (WorkerState::Ready, Some(port)) = (state, self.port) else {
            return Err(Error::InvalidState {
                operation: "open a session",
                state,
            });
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let session = Session::connect(addr, self.config.request_timeout).await?;
        Ok(session.attach(Arc::clone(&self.state)))
    }

    /// Shut the worker down. Safe to call in any state, any number of times.
    pub async fn close(&mut self) {
        if self.state() != WorkerState::Failed {
            self.state.set(WorkerState::Closed);
        }

        if let Some(mut control) = self.control.take() {
            match tokio::time::timeout(self.config.shutdown_grace, control.send(&Shutdown)).await {
                Ok(Ok(())) => tracing::debug!("Worker acknowledged shutdown"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Shutdown request failed"),
                Err(_) => tracing::warn!("Worker did not acknowledge shutdown"),
            }
        }

        self.reap().await;
    }

    /// Make sure the child is gone, escalating from waiting to SIGTERM to kill.
    async fn reap(&mut self) {
        self.control = None;
        let Some(mut child) = self.child.take() else {
            return;
        };
        let grace = self.config.shutdown_grace;

        let mut status = wait_for_exit(&mut child, grace).await;
        if status.is_none() {
            tracing::warn!(pid = ?child.id(), "Worker still running, sending SIGTERM");
            terminate(&child);
            status = wait_for_exit(&mut child, grace).await;
        }
        if status.is_none() {
            tracing::warn!(pid = ?child.id(), "Worker ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::error!(error = %e, "Failed to kill worker");
            }
            status = child.try_wait().ok().flatten();
        }

        if let Some(status) = status {
            tracing::info!(%status, "Worker exited");
        }
        self.exit_status = status;
    }
}

impl WorkerSupervisor {
    /// Kill a half-started worker right away. It never acknowledged us, so
    /// there is nothing to wait for.
    async fn abort(&mut self) {
        self.control = None;
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.kill().await {
            tracing::error!(pid = ?child.id(), error = %e, "Failed to kill worker");
        }
        self.exit_status = child.try_wait().ok().flatten();
        if let Some(status) = self.exit_status {
            tracing::info!(%status, "Worker killed after failed start");
        }
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        if self.child.is_some() {
            tracing::warn!("Supervisor dropped without close, killing worker");
        }
    }
}

/// Poll until the worker accepts and greets, or exits.
async fn wait_ready(
    child: &mut Child,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Session> {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Session::handshake(stream, request_timeout).await,
            Err(e) => tracing::trace!(error = %e, "Worker not accepting yet"),
        }
        if let Some(status) = child.try_wait()? {
            return Err(Error::Startup(format!(
                "worker exited with {status} before becoming ready"
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

async fn wait_for_exit(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to wait for worker");
            None
        }
        Err(_) => None,
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id()
        && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
    {
        tracing::warn!(error = %e, pid, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}
