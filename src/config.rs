//! Configuration management for tunnelctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::driver::DriverKind;
use crate::error::ConfigError;
use crate::stats::CounterResetPolicy;

/// Main tunnelctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Bundle layout and artifact locations
    #[serde(default)]
    pub paths: PathSettings,
    /// Adapter driver policy and naming
    #[serde(default)]
    pub driver: DriverSettings,
    /// Tunnel process launch settings
    #[serde(default)]
    pub process: ProcessSettings,
    /// Connection monitor timings
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Throughput statistics
    #[serde(default)]
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Application directory; defaults to the directory of the running executable
    #[serde(default)]
    pub app_dir: Option<PathBuf>,
    /// Where the ephemeral config and credential files are written; defaults to `app_dir`
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default = "default_config_file_name")]
    pub config_file_name: String,
    #[serde(default = "default_credential_file_name")]
    pub credential_file_name: String,
    /// Candidate directories for the tunnel executable, relative to `app_dir`
    #[serde(default = "default_executable_dirs")]
    pub executable_dirs: Vec<PathBuf>,
    /// Candidate directories for installer tooling and driver files
    #[serde(default = "default_tool_dirs")]
    pub tool_dirs: Vec<PathBuf>,
    /// Candidate directories for the vendor adapter library
    #[serde(default = "default_library_dirs")]
    pub library_dirs: Vec<PathBuf>,
    /// Retry every candidate list under the current working directory
    #[serde(default = "default_true")]
    pub search_working_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "default_preferred_driver")]
    pub preferred: DriverKind,
    /// Allow the non-preferred driver when the preferred one is unavailable
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
    /// Adapter name prefix; a unique suffix is appended when no name is given
    #[serde(default = "default_adapter_name")]
    pub adapter_name: String,
    #[serde(default = "default_tunnel_type")]
    pub tunnel_type: String,
    /// Vendor library base name (platform prefix/suffix are added)
    #[serde(default = "default_library_name")]
    pub library_name: String,
    #[serde(default = "default_session_capacity")]
    pub session_capacity: u32,
    /// Bundled utility tried before the vendor library to create the adapter
    #[serde(default = "default_adapter_helper")]
    pub adapter_helper: Option<String>,
    #[serde(default = "default_helper_hardware_id")]
    pub helper_hardware_id: String,
    /// Description substrings identifying fast-driver adapters
    #[serde(default = "default_fast_patterns")]
    pub fast_patterns: Vec<String>,
    /// Description substrings identifying legacy-driver adapters
    #[serde(default = "default_legacy_patterns")]
    pub legacy_patterns: Vec<String>,
    #[serde(default = "default_legacy_hardware_id")]
    pub legacy_hardware_id: String,
    #[serde(default = "default_legacy_installer")]
    pub legacy_installer: String,
    #[serde(default = "default_legacy_inf")]
    pub legacy_inf: String,
    #[serde(default = "default_legacy_adapter_name")]
    pub legacy_adapter_name: String,
    #[serde(default = "default_installer_timeout")]
    pub installer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSettings {
    /// Tunnel executable base name (platform suffix is added)
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
    /// Pass the flag disabling kernel data-channel offload
    #[serde(default = "default_true")]
    pub disable_offload: bool,
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Polls ignored after launch before readiness sampling starts
    #[serde(default = "default_grace_polls")]
    pub grace_polls: u32,
    /// Consecutive ready polls needed to promote to connected
    #[serde(default = "default_required_stable_polls")]
    pub required_stable_polls: u32,
    /// Poll budget for the connecting phase
    #[serde(default = "default_max_connecting_polls")]
    pub max_connecting_polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSettings {
    /// Interfaces whose description, alias or name contains one of these
    /// (case-insensitive) are counted as tunnel traffic
    #[serde(default = "default_adapter_patterns")]
    pub adapter_patterns: Vec<String>,
    #[serde(default = "default_min_sample_interval")]
    pub min_sample_interval_ms: u64,
    /// Weight of the newest sample in the moving average
    #[serde(default = "default_smoothing_weight")]
    pub smoothing_weight: f64,
    #[serde(default)]
    pub counter_reset: CounterResetPolicy,
}

fn default_true() -> bool {
    true
}

fn default_config_file_name() -> String {
    "tunnelctl_config.ovpn".to_string()
}

fn default_credential_file_name() -> String {
    "tunnelctl_auth.txt".to_string()
}

fn default_executable_dirs() -> Vec<PathBuf> {
    [
        "openvpn_bundle/bin",
        "bin",
        ".",
        "data/flutter_assets/windows/bin",
        "data/flutter_assets/bin",
        "openvpn",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn default_tool_dirs() -> Vec<PathBuf> {
    [
        "data/flutter_assets/windows/bin",
        "data/flutter_assets/bin",
        "data/flutter_assets/drivers",
        "bin",
        "drivers",
        "openvpn_bundle/bin",
        "openvpn_bundle",
        ".",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn default_library_dirs() -> Vec<PathBuf> {
    [".", "bin", "wintun"].iter().map(PathBuf::from).collect()
}

fn default_preferred_driver() -> DriverKind {
    DriverKind::Fast
}

fn default_adapter_name() -> String {
    "TunnelCtl".to_string()
}

fn default_tunnel_type() -> String {
    "OpenVPN".to_string()
}

fn default_library_name() -> String {
    "wintun".to_string()
}

fn default_session_capacity() -> u32 {
    0x40_0000
}

fn default_adapter_helper() -> Option<String> {
    Some("tapctl".to_string())
}

fn default_helper_hardware_id() -> String {
    "wintun".to_string()
}

fn default_fast_patterns() -> Vec<String> {
    if cfg!(windows) {
        vec!["Wintun".to_string(), "Data Channel Offload".to_string()]
    } else {
        vec!["tun".to_string()]
    }
}

fn default_legacy_patterns() -> Vec<String> {
    if cfg!(windows) {
        vec!["TAP-Windows".to_string(), "TAP-Win32".to_string()]
    } else {
        vec!["tap".to_string()]
    }
}

fn default_legacy_hardware_id() -> String {
    "tap0901".to_string()
}

fn default_legacy_installer() -> String {
    "tapinstall".to_string()
}

fn default_legacy_inf() -> String {
    "OemVista.inf".to_string()
}

fn default_legacy_adapter_name() -> String {
    "TunnelCtl-TAP".to_string()
}

fn default_installer_timeout() -> u64 {
    30
}

fn default_executable() -> String {
    "openvpn".to_string()
}

fn default_verbosity() -> u8 {
    3
}

fn default_terminate_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    100
}

fn default_grace_polls() -> u32 {
    50
}

fn default_required_stable_polls() -> u32 {
    10
}

fn default_max_connecting_polls() -> u32 {
    300
}

fn default_adapter_patterns() -> Vec<String> {
    if cfg!(windows) {
        ["TAP-Windows", "TAP-Win32", "OpenVPN", "Wintun", "Data Channel Offload"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        vec!["tun".to_string(), "tap".to_string()]
    }
}

fn default_min_sample_interval() -> u64 {
    100
}

fn default_smoothing_weight() -> f64 {
    0.7
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            app_dir: None,
            artifact_dir: None,
            config_file_name: default_config_file_name(),
            credential_file_name: default_credential_file_name(),
            executable_dirs: default_executable_dirs(),
            tool_dirs: default_tool_dirs(),
            library_dirs: default_library_dirs(),
            search_working_dir: true,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            preferred: default_preferred_driver(),
            allow_fallback: true,
            adapter_name: default_adapter_name(),
            tunnel_type: default_tunnel_type(),
            library_name: default_library_name(),
            session_capacity: default_session_capacity(),
            adapter_helper: default_adapter_helper(),
            helper_hardware_id: default_helper_hardware_id(),
            fast_patterns: default_fast_patterns(),
            legacy_patterns: default_legacy_patterns(),
            legacy_hardware_id: default_legacy_hardware_id(),
            legacy_installer: default_legacy_installer(),
            legacy_inf: default_legacy_inf(),
            legacy_adapter_name: default_legacy_adapter_name(),
            installer_timeout_secs: default_installer_timeout(),
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            verbosity: default_verbosity(),
            disable_offload: true,
            terminate_timeout_secs: default_terminate_timeout(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            grace_polls: default_grace_polls(),
            required_stable_polls: default_required_stable_polls(),
            max_connecting_polls: default_max_connecting_polls(),
        }
    }
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            adapter_patterns: default_adapter_patterns(),
            min_sample_interval_ms: default_min_sample_interval(),
            smoothing_weight: default_smoothing_weight(),
            counter_reset: CounterResetPolicy::default(),
        }
    }
}

impl PathSettings {
    /// Resolved application directory
    pub fn resolved_app_dir(&self) -> PathBuf {
        self.app_dir.clone().unwrap_or_else(crate::paths::current_app_dir)
    }

    /// Resolved directory for the ephemeral config artifacts
    pub fn resolved_artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .unwrap_or_else(|| self.resolved_app_dir())
    }
}

impl DriverSettings {
    pub fn installer_timeout(&self) -> Duration {
        Duration::from_secs(self.installer_timeout_secs)
    }
}

impl ProcessSettings {
    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    /// Executable file name with the platform suffix
    pub fn executable_file_name(&self) -> String {
        let suffix = std::env::consts::EXE_SUFFIX;
        if suffix.is_empty() || self.executable.ends_with(suffix) {
            self.executable.clone()
        } else {
            format!("{}{}", self.executable, suffix)
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TunnelConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(format!("{:?}: {}", path.as_ref(), e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self.to_toml()?;

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Unwritable {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }
}
