//! Tunnel process supervision
//!
//! The supervisor owns the single tunnel process. The connection monitor only
//! receives a [`ProcessLiveness`] view so termination stays with the owner.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ProcessSettings;
use crate::driver::{AdapterIdentity, DriverKind};
use crate::error::LaunchError;
use crate::privilege::Elevation;

/// Observed state of the tunnel process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
    Unknown(String),
}

/// Everything needed to start the tunnel process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// A running tunnel process
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    fn pid(&self) -> u32;

    fn liveness(&self) -> Liveness;

    /// Request termination and wait up to `timeout` for the exit
    async fn terminate(&self, timeout: Duration);
}

/// Starts tunnel processes
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Arc<dyn TunnelProcess>, LaunchError>;
}

/// Read-only liveness handle given to the connection monitor
#[derive(Clone)]
pub struct ProcessLiveness(Arc<dyn TunnelProcess>);

impl ProcessLiveness {
    pub fn check(&self) -> Liveness {
        self.0.liveness()
    }

    pub fn pid(&self) -> u32 {
        self.0.pid()
    }
}

/// OS process started through tokio
pub struct OsProcess {
    pid: u32,
    child: Mutex<Child>,
}

#[async_trait]
impl TunnelProcess for OsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn liveness(&self) -> Liveness {
        let mut child = match self.child.lock() {
            Ok(child) => child,
            Err(_) => return Liveness::Unknown("process handle poisoned".to_string()),
        };
        match child.try_wait() {
            Ok(None) => Liveness::Running,
            Ok(Some(status)) => Liveness::Exited(status.code()),
            Err(e) => Liveness::Unknown(e.to_string()),
        }
    }

    async fn terminate(&self, timeout: Duration) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.start_kill() {
                debug!("Kill request for pid {} failed: {}", self.pid, e);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.liveness() {
                Liveness::Running => {}
                Liveness::Exited(code) => {
                    debug!("Tunnel process {} exited with {:?}", self.pid, code);
                    return;
                }
                Liveness::Unknown(e) => {
                    warn!("Error waiting for tunnel process {}: {}", self.pid, e);
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Timeout waiting for tunnel process {} to exit", self.pid);
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Spawns real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;

impl ProcessSpawner for OsSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Arc<dyn TunnelProcess>, LaunchError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command.spawn().map_err(|e| LaunchError::ProcessCreationFailed {
            os_error_code: e.raw_os_error(),
            message: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| LaunchError::ProcessCreationFailed {
            os_error_code: None,
            message: "process exited before its id was read".to_string(),
        })?;

        Ok(Arc::new(OsProcess {
            pid,
            child: Mutex::new(child),
        }))
    }
}

/// Build the tunnel program argument list
pub fn build_args(
    settings: &ProcessSettings,
    config_path: &Path,
    kind: DriverKind,
    adapter: Option<&AdapterIdentity>,
) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        config_path.to_string_lossy().into_owned(),
        "--verb".to_string(),
        settings.verbosity.to_string(),
    ];

    if settings.disable_offload {
        args.push("--disable-dco".to_string());
    }

    // The fast driver is picked up from the config's driver directive
    if kind == DriverKind::Legacy {
        if let Some(adapter) = adapter {
            args.push("--dev-type".to_string());
            args.push("tap".to_string());
            args.push("--dev-node".to_string());
            args.push(adapter.display_name.clone());
        }
    }

    args
}

/// Owner of the tunnel process
pub struct ProcessSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    elevation: Arc<dyn Elevation>,
    settings: ProcessSettings,
    working_dir: PathBuf,
    current: Option<Arc<dyn TunnelProcess>>,
}

impl ProcessSupervisor {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        elevation: Arc<dyn Elevation>,
        settings: ProcessSettings,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            spawner,
            elevation,
            settings,
            working_dir,
            current: None,
        }
    }

    /// Launch the tunnel program and return its pid
    pub fn launch(
        &mut self,
        executable: &Path,
        config_path: &Path,
        kind: DriverKind,
        adapter: Option<&AdapterIdentity>,
    ) -> Result<u32, LaunchError> {
        if let Some(current) = &self.current {
            return Err(LaunchError::AlreadyRunning { pid: current.pid() });
        }
        if !executable.is_file() {
            return Err(LaunchError::ExecutableNotFound(
                executable.to_string_lossy().into_owned(),
            ));
        }
        if !self.elevation.is_elevated() {
            return Err(LaunchError::ElevationRequired);
        }

        let spec = LaunchSpec {
            program: executable.to_path_buf(),
            args: build_args(&self.settings, config_path, kind, adapter),
            working_dir: self.working_dir.clone(),
        };
        debug!("Launching {:?} {}", spec.program, spec.args.join(" "));

        let process = self.spawner.spawn(&spec)?;
        let pid = process.pid();
        info!("Tunnel process started (PID: {}, driver: {})", pid, kind);

        self.current = Some(process);
        Ok(pid)
    }

    /// Terminate the tunnel process, waiting a bounded time. Safe with no process.
    pub async fn terminate(&mut self) {
        if let Some(process) = self.current.take() {
            info!("Stopping tunnel process {}", process.pid());
            process.terminate(self.settings.terminate_timeout()).await;
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().map(|p| p.pid())
    }

    pub fn liveness(&self) -> Option<ProcessLiveness> {
        self.current.clone().map(ProcessLiveness)
    }
}
