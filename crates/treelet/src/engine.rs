//! Engine: an installed, running worker plus the means to talk to it.

use futures::future::BoxFuture;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::install::WorkerBundle;
use crate::supervisor::{WorkerState, WorkerSupervisor};
use crate::version::VersionInfo;

pub struct Engine {
    supervisor: WorkerSupervisor,
}

impl Engine {
    /// Install (when needed) and start a worker as configured.
    ///
    /// Installs from `config.bundle` when one is set; otherwise the install
    /// directory must already hold a resolved installation.
    pub async fn launch(config: EngineConfig) -> Result<Self> {
        let bundle = match config.bundle {
            Some(ref dir) => Some(WorkerBundle::locate(dir)?),
            None => None,
        };
        Self::start(WorkerSupervisor::create(config), bundle.as_ref()).await
    }

    /// Install from `bundle` and start.
    pub async fn launch_with(config: EngineConfig, bundle: &WorkerBundle) -> Result<Self> {
        Self::start(WorkerSupervisor::create(config), Some(bundle)).await
    }

    /// Take over a supervisor, installing and starting it as needed.
    pub async fn start(
        mut supervisor: WorkerSupervisor,
        bundle: Option<&WorkerBundle>,
    ) -> Result<Self> {
        let result = async {
            match bundle {
                Some(bundle) => supervisor.install(bundle).await?,
                None if supervisor.state() == WorkerState::Uninstalled => {
                    return Err(Error::Installation(format!(
                        "no worker installed in {} and no bundle configured",
                        supervisor.config().install_dir.display()
                    )));
                }
                None => {}
            }
            supervisor.start().await
        }
        .await;

        match result {
            Ok(()) => Ok(Self { supervisor }),
            Err(e) => {
                supervisor.close().await;
                Err(e)
            }
        }
    }

    /// Open a fresh analysis session.
    pub async fn dispatcher(&self) -> Result<Dispatcher> {
        let session = self.supervisor.open_session().await?;
        Ok(Dispatcher::new(session).with_batch_size(self.supervisor.config().parse_batch_size))
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub fn state(&self) -> WorkerState {
        self.supervisor.state()
    }

    pub fn version(&self) -> VersionInfo {
        match self.supervisor.worker() {
            Some(worker) => VersionInfo::new().with_worker(worker.clone()),
            None => VersionInfo::new(),
        }
    }

    /// Shut the worker down and hand back the supervisor for inspection.
    pub async fn close(mut self) -> WorkerSupervisor {
        self.supervisor.close().await;
        self.supervisor
    }
}

/// Launch an engine, run `f` against it, and close it whatever `f` returns.
pub async fn with_engine<T, F>(config: EngineConfig, bundle: &WorkerBundle, f: F) -> Result<T>
where
    F: for<'e> FnOnce(&'e Engine) -> BoxFuture<'e, Result<T>>,
{
    let engine = Engine::launch_with(config, bundle).await?;
    let result = f(&engine).await;
    engine.close().await;
    result
}
