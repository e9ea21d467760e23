//! tunnelctl - Local VPN Tunnel Lifecycle Library
//!
//! Async tunnel management library providing:
//! - Virtual adapter drivers (fast vendor-library driver, legacy TAP driver)
//! - Tunnel process supervision with ephemeral config artifacts
//! - Connection monitoring with debounced readiness
//! - Traffic statistics with smoothed speeds
//! - A string-typed control surface for host integrations

pub mod error;
pub mod config;
pub mod paths;
pub mod privilege;
pub mod interfaces;
pub mod driver;
pub mod process;
pub mod artifacts;
pub mod monitor;
pub mod stats;
pub mod manager;
pub mod control;

// Re-export commonly used types
pub use error::{
    ConfigError, ConnectError, ConnectResult, DriverError, LaunchError,
    MonitorError,
};
pub use config::TunnelConfig;
pub use driver::{AdapterDriver, AdapterIdentity, DriverKind, FastDriver, LegacyDriver};
pub use process::{ProcessSpawner, ProcessSupervisor, TunnelProcess};
pub use artifacts::{ConfigArtifact, Credentials};
pub use monitor::{ConnectionMonitor, ConnectionState, SessionFlags, TransitionQueue};
pub use stats::{StatsEngine, StatusRecord, StatusSnapshot};
pub use manager::{Components, TunnelManager};
pub use control::{ControlError, ControlSurface};
