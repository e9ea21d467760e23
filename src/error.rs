//! Error types for tunnelctl

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the virtual adapter drivers and their installer tooling
#[derive(Debug, Error)]
pub enum DriverError {
    /// Neither driver backend can be used under the current policy
    #[error("no virtual adapter driver available")]
    NoDriverAvailable,
    /// The vendor library could not be loaded from any candidate location
    #[error("adapter library unavailable: {0}")]
    LibraryUnavailable(String),
    /// The vendor "create adapter" entry point failed
    #[error("adapter creation failed (os error {os_error_code})")]
    AdapterCreateFailed { os_error_code: i32 },
    /// The vendor "start session" entry point failed
    #[error("session start failed (os error {os_error_code})")]
    SessionStartFailed { os_error_code: i32 },
    /// The legacy kernel driver is not installed
    #[error("legacy adapter driver is not installed")]
    DriverNotInstalled,
    /// An operation needs a provisioned adapter and none is held
    #[error("no adapter provisioned")]
    AdapterNotProvisioned,
    /// Listing OS network adapters failed, or the expected adapter is missing
    #[error("adapter enumeration failed: {0}")]
    AdapterEnumerationFailed(String),
    /// The user or OS refused elevation
    #[error("elevation denied")]
    ElevationDenied,
    /// An elevated installer step exited unsuccessfully
    #[error("installer exited with code {exit_code}")]
    InstallerExecutionFailed { exit_code: i32 },
    /// An elevated installer step did not finish in time
    #[error("installer did not finish within {seconds}s")]
    InstallerTimedOut { seconds: u64 },
    /// A bundled helper file was not found in any candidate directory
    #[error("bundled file not found: {0}")]
    BundledFileMissing(String),
}

/// Failures launching the tunnel process
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("tunnel executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("elevated privileges required to launch the tunnel process")]
    ElevationRequired,
    #[error("tunnel process already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("failed to create tunnel process: {message}")]
    ProcessCreationFailed {
        os_error_code: Option<i32>,
        message: String,
    },
}

/// Settings and artifact file failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Artifact target path cannot be written
    #[error("cannot write {path:?}: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read settings: {0}")]
    Read(String),
    #[error("failed to parse settings: {0}")]
    Parse(String),
    #[error("failed to serialize settings: {0}")]
    Serialize(String),
}

/// Errors returned by a connect request
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("a connection is already active or in progress")]
    AlreadyActive,
    #[error("invalid tunnel configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConnectError {
    /// Stable snake_case code reported across the control surface
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::AlreadyActive => "already_active",
            ConnectError::InvalidConfig(_) => "invalid_config",
            ConnectError::Driver(DriverError::NoDriverAvailable) => "no_driver_available",
            ConnectError::Driver(_) => "driver_error",
            ConnectError::Launch(LaunchError::ExecutableNotFound(_)) => "executable_not_found",
            ConnectError::Launch(LaunchError::ElevationRequired) => "elevation_required",
            ConnectError::Launch(_) => "launch_failed",
            ConnectError::Config(_) => "config_error",
        }
    }
}

/// Reason behind a monitor-originated transition. Only logged; the caller
/// observes it as a state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("connection not established after {polls} polls")]
    Timeout { polls: u32 },
    #[error("tunnel process exited")]
    ProcessExited { exit_code: Option<i32> },
    #[error("tunnel process state unknown: {0}")]
    ProcessUnknown(String),
    #[error("tunnel adapter lost readiness")]
    ReadinessLost,
}

pub type ConnectResult<T> = Result<T, ConnectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_codes() {
        assert_eq!(ConnectError::AlreadyActive.code(), "already_active");
        assert_eq!(
            ConnectError::from(DriverError::NoDriverAvailable).code(),
            "no_driver_available"
        );
        assert_eq!(
            ConnectError::from(DriverError::InstallerExecutionFailed { exit_code: 2 }).code(),
            "driver_error"
        );
        assert_eq!(
            ConnectError::from(LaunchError::ElevationRequired).code(),
            "elevation_required"
        );
    }

    #[test]
    fn test_wrapped_errors_display_inner_message() {
        let err = ConnectError::from(DriverError::AdapterCreateFailed { os_error_code: 5 });
        assert_eq!(err.to_string(), "adapter creation failed (os error 5)");
    }
}
