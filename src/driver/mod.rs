//! Virtual adapter drivers
//!
//! Two kernel adapter technologies are supported behind one contract: the
//! fast driver loaded from a vendor library, and the legacy driver installed
//! through bundled installer tooling. The orchestrator picks one per connect
//! attempt with [`select_driver`].

pub mod fast;
pub mod legacy;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DriverError;

pub use fast::FastDriver;
pub use legacy::{DeviceClassRegistry, LegacyDriver, SystemDeviceRegistry};

/// Adapter technology backing a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Fast,
    Legacy,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Fast => "fast",
            DriverKind::Legacy => "legacy",
        }
    }

    pub fn other(&self) -> DriverKind {
        match self {
            DriverKind::Fast => DriverKind::Legacy,
            DriverKind::Legacy => DriverKind::Fast,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a provisioned adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterIdentity {
    pub display_name: String,
    /// OS GUID of the adapter. Generated when the creating tool reported none.
    pub unique_id: Uuid,
    pub backend: DriverKind,
}

/// Common interface of the adapter driver backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdapterDriver: Send + Sync {
    /// Which technology this backend drives
    fn kind(&self) -> DriverKind;

    /// Whether the backend can be used. May load a probe library.
    async fn is_available(&mut self) -> bool;

    /// Create (or discover) the adapter, generating a name when none is given
    async fn provision(&mut self, preferred_name: Option<String>) -> Result<AdapterIdentity, DriverError>;

    /// Release the adapter. Safe to call repeatedly.
    async fn teardown(&mut self);

    /// Identity of the currently provisioned adapter
    fn identity(&self) -> Option<AdapterIdentity>;
}

/// Pick the driver for one connect attempt: the preferred kind if available,
/// otherwise the other kind when fallback is allowed.
pub async fn select_driver(
    preferred: DriverKind,
    allow_fallback: bool,
    fast: &mut dyn AdapterDriver,
    legacy: &mut dyn AdapterDriver,
) -> Result<DriverKind, DriverError> {
    match preferred {
        DriverKind::Fast => select_in_order(fast, legacy, allow_fallback).await,
        DriverKind::Legacy => select_in_order(legacy, fast, allow_fallback).await,
    }
}

async fn select_in_order(
    first: &mut dyn AdapterDriver,
    second: &mut dyn AdapterDriver,
    allow_fallback: bool,
) -> Result<DriverKind, DriverError> {
    if first.is_available().await {
        info!("Selected {} adapter driver", first.kind());
        return Ok(first.kind());
    }
    debug!("{} adapter driver unavailable", first.kind());

    if allow_fallback {
        if second.is_available().await {
            info!("Falling back to {} adapter driver", second.kind());
            return Ok(second.kind());
        }
        debug!("{} adapter driver unavailable", second.kind());
    }

    Err(DriverError::NoDriverAvailable)
}

/// Unique adapter name derived from a prefix
pub fn generate_adapter_name(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().timestamp_millis())
}
