use crate::config::{Config, Directories};
use crate::debug::{self, DebugSession, RelayInput};
use crate::discovery::{self, PortEnumerator, SerialPortEnumerator};
use crate::instance::{Instance, Registry};
use crate::operation::{self, OperationContext, OperationDescriptor, OperationHandle};
use crate::process::{ProcessLauncher, TokioLauncher};
use crate::Result;
use kiln_types::{
    BoardDelta, DebugConfigRequest, DebugRequest, DebugSessionConfig, DetectedPort, InstanceId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

/// Core kiln engine shared by every daemon connection
pub struct KilnCore {
    dirs: Directories,
    config: RwLock<Config>,
    registry: Registry,
    launcher: Arc<dyn ProcessLauncher>,
    enumerator: Arc<dyn PortEnumerator>,
}

impl std::fmt::Debug for KilnCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KilnCore")
            .field("dirs", &self.dirs)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl KilnCore {
    /// Create a core using the standard XDG directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be determined or created, or
    /// the config file is invalid.
    pub fn new() -> Result<Self> {
        Self::load(Directories::new()?)
    }

    /// Create a core rooted at `dirs`, with real processes and serial ports.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is invalid or the data directory
    /// cannot be created.
    pub fn load(dirs: Directories) -> Result<Self> {
        Self::load_with_data_dir(dirs, None)
    }

    /// Like [`KilnCore::load`], with an explicit data directory that wins
    /// over the config file's `dataDir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is invalid or the data directory
    /// cannot be created.
    pub fn load_with_data_dir(dirs: Directories, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = Config::load(&dirs.config_file)?;
        let dirs = match data_dir.or_else(|| config.data_dir.clone()) {
            Some(data) => dirs.with_data_dir(data),
            None => dirs,
        };
        dirs.ensure_exists()?;
        info!("Data directory: {}", dirs.data.display());

        Ok(Self::with_backends(
            dirs,
            config,
            Arc::new(TokioLauncher),
            Arc::new(SerialPortEnumerator::default()),
        ))
    }

    #[must_use]
    pub fn with_backends(
        dirs: Directories,
        config: Config,
        launcher: Arc<dyn ProcessLauncher>,
        enumerator: Arc<dyn PortEnumerator>,
    ) -> Self {
        Self {
            dirs,
            config: RwLock::new(config),
            registry: Registry::new(),
            launcher,
            enumerator,
        }
    }

    #[must_use]
    pub fn dirs(&self) -> &Directories {
        &self.dirs
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Reload config from file (for hot-reload support).
    ///
    /// New values apply to streams opened afterwards. A changed `dataDir`
    /// only takes effect on restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid; the previous
    /// config stays in effect.
    pub async fn reload_config(&self) -> Result<()> {
        match Config::load(&self.dirs.config_file) {
            Ok(new_config) => {
                let mut config = self.config.write().await;
                if new_config.data_dir != config.data_dir {
                    warn!("dataDir changed; restart the daemon to apply it");
                }
                *config = new_config;
                info!("Config reloaded");
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload config: {}", e);
                Err(e)
            }
        }
    }

    pub async fn create_instance(&self) -> InstanceId {
        let max_sessions = self.config.read().await.debug.max_sessions_per_instance;
        self.registry.create(max_sessions).await.id
    }

    /// Destroy an instance, ending its streams.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInstance` if the id is not live.
    pub async fn destroy_instance(&self, id: InstanceId) -> Result<()> {
        self.registry.destroy(id).await
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidInstance` if the id is not live.
    pub async fn instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.registry.get(id).await
    }

    pub async fn instances(&self) -> Vec<InstanceId> {
        self.registry.ids().await
    }

    /// Validate an operation and start it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstance` or `InvalidArgument` before anything runs.
    pub async fn start_operation(&self, descriptor: OperationDescriptor) -> Result<OperationHandle> {
        let instance = self.registry.get(descriptor.instance).await?;
        descriptor.operation.validate()?;
        let buffer = self.config.read().await.operations.event_buffer;

        debug!("[{}] Starting {}", instance.id, descriptor.operation.name());
        let ctx = OperationContext {
            instance,
            dirs: self.dirs.clone(),
            launcher: self.launcher.clone(),
        };
        Ok(operation::run(ctx, descriptor.operation, buffer))
    }

    /// One-shot board discovery. A zero timeout selects the configured default.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstance`, `Timeout`, or the enumerator's error.
    pub async fn board_list(&self, id: InstanceId, timeout_ms: u64) -> Result<Vec<DetectedPort>> {
        let instance = self.registry.get(id).await?;
        let timeout_ms = if timeout_ms == 0 {
            self.config.read().await.discovery.board_list_timeout_ms
        } else {
            timeout_ms
        };
        discovery::snapshot(&self.enumerator, &instance, Duration::from_millis(timeout_ms)).await
    }

    /// Subscribe to board changes on an instance.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInstance` if the id is not live.
    pub async fn board_list_watch(&self, id: InstanceId) -> Result<mpsc::Receiver<BoardDelta>> {
        let instance = self.registry.get(id).await?;
        let config = self.config.read().await;
        Ok(discovery::watch(
            self.enumerator.clone(),
            instance,
            config.discovery.poll_interval(),
            config.operations.event_buffer,
        ))
    }

    /// Resolve a debug configuration without launching anything.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInstance` or any resolver error.
    pub async fn debug_config(&self, req: &DebugConfigRequest) -> Result<DebugSessionConfig> {
        let instance = self.registry.get(req.instance).await?;
        let state = instance.state.read().await;
        debug::resolve(&state, req)
    }

    /// Negotiate a debug session from its opening message.
    ///
    /// `inbound` must already receive the client's later messages so that
    /// anything sent during negotiation is detected.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation`, `InvalidInstance`, `BackendUnavailable`,
    /// any resolver error, or `Cancelled` if the client gives up.
    pub async fn start_debug(
        &self,
        first: DebugRequest,
        inbound: &mut mpsc::Receiver<RelayInput>,
    ) -> Result<DebugSession> {
        let req = debug::opening_request(first)?;
        let instance = self.registry.get(req.instance).await?;
        let settings = self.config.read().await.debug.clone();
        debug::negotiate(instance, self.launcher.as_ref(), &settings, req, inbound).await
    }

    /// Event buffer size for stream channels
    pub async fn event_buffer(&self) -> usize {
        self.config.read().await.operations.event_buffer
    }
}

impl Drop for KilnCore {
    fn drop(&mut self) {
        debug!("Kiln core dropped");
    }
}

