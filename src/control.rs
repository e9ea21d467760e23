//! Control surface
//!
//! String-typed front of the [`TunnelManager`] for host integrations: results
//! are plain strings and flat records, failures carry a stable code.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::artifacts::Credentials;
use crate::manager::TunnelManager;
use crate::monitor::ConnectionState;
use crate::stats::StatusRecord;

/// Failure reported across the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{code}: {message}")]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

impl ControlError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    fn not_implemented(method: &str) -> Self {
        Self::new("not_implemented", format!("unknown method: {}", method))
    }
}

/// Host-facing control surface owning one manager
pub struct ControlSurface {
    manager: Mutex<TunnelManager>,
}

impl ControlSurface {
    pub fn new(manager: TunnelManager) -> Self {
        Self {
            manager: Mutex::new(manager),
        }
    }

    /// Stage events, starting with the one `initialize` emits
    pub async fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.manager.lock().await.subscribe()
    }

    /// Prime the driver subsystem
    pub async fn initialize(&self) -> Result<bool, ControlError> {
        let mut manager = self.manager.lock().await;
        match manager.initialize().await {
            Ok(_) => Ok(true),
            Err(e) => Err(ControlError::new("initialization_failed", e.to_string())),
        }
    }

    pub async fn connect(
        &self,
        config: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), ControlError> {
        let credentials = Credentials::from_parts(username, password);
        let mut manager = self.manager.lock().await;
        manager
            .connect(config, credentials)
            .await
            .map_err(|e| ControlError::new(e.code(), e.to_string()))
    }

    pub async fn disconnect(&self) {
        self.manager.lock().await.disconnect().await;
    }

    /// Status as a flat string record
    pub async fn status(&self) -> StatusRecord {
        self.manager.lock().await.status().await.to_record()
    }

    /// Current stage string
    pub async fn stage(&self) -> String {
        self.manager
            .lock()
            .await
            .current_state()
            .await
            .as_str()
            .to_string()
    }

    /// Desktop hosts need no runtime permission
    pub async fn request_permission(&self) -> bool {
        true
    }

    /// Dispatch a named call with JSON arguments
    pub async fn handle(&self, method: &str, args: &Value) -> Result<Value, ControlError> {
        debug!("Control call: {}", method);
        match method {
            "initialize" => self.initialize().await.map(Value::Bool),
            "connect" => {
                self.connect(
                    text_arg(args, "config").unwrap_or(""),
                    text_arg(args, "username"),
                    text_arg(args, "password"),
                )
                .await?;
                Ok(json!(true))
            }
            "disconnect" => {
                self.disconnect().await;
                Ok(json!(true))
            }
            "status" => serde_json::to_value(self.status().await)
                .map_err(|e| ControlError::new("internal", e.to_string())),
            "stage" => Ok(Value::String(self.stage().await)),
            "request_permission" => Ok(Value::Bool(self.request_permission().await)),
            _ => {
                warn!("Unsupported control call: {}", method);
                Err(ControlError::not_implemented(method))
            }
        }
    }
}

fn text_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::driver::{DriverKind, MockAdapterDriver};
    use crate::error::{DriverError, LaunchError};
    use crate::interfaces::{InterfaceSnapshot, InterfaceTable};
    use crate::manager::Components;
    use crate::privilege::Elevation;
    use crate::process::{LaunchSpec, ProcessSpawner, TunnelProcess};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    struct NotElevated;

    #[async_trait]
    impl Elevation for NotElevated {
        fn is_elevated(&self) -> bool {
            false
        }

        async fn run_elevated(
            &self,
            _program: &Path,
            _args: &[String],
            _working_dir: &Path,
            _timeout: Duration,
        ) -> Result<i32, DriverError> {
            Err(DriverError::ElevationDenied)
        }
    }

    struct NoSpawn;

    impl ProcessSpawner for NoSpawn {
        fn spawn(&self, _spec: &LaunchSpec) -> Result<Arc<dyn TunnelProcess>, LaunchError> {
            Err(LaunchError::ProcessCreationFailed {
                os_error_code: None,
                message: "unused".to_string(),
            })
        }
    }

    struct NoInterfaces;

    impl InterfaceTable for NoInterfaces {
        fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>, DriverError> {
            Ok(Vec::new())
        }
    }

    fn driver(kind: DriverKind, available: bool) -> MockAdapterDriver {
        let mut driver = MockAdapterDriver::new();
        driver.expect_kind().return_const(kind);
        driver.expect_is_available().returning(move || available);
        driver.expect_teardown().returning(|| ());
        driver.expect_identity().returning(|| None);
        driver
    }

    fn surface(fast_available: bool) -> ControlSurface {
        let components = Components {
            fast: Box::new(driver(DriverKind::Fast, fast_available)),
            legacy: Box::new(driver(DriverKind::Legacy, false)),
            spawner: Arc::new(NoSpawn),
            interfaces: Arc::new(NoInterfaces),
            elevation: Arc::new(NotElevated),
        };
        ControlSurface::new(TunnelManager::with_components(
            TunnelConfig::default(),
            components,
        ))
    }

    #[tokio::test]
    async fn test_initialize_and_stage() {
        let surface = surface(true);
        let mut events = surface.subscribe().await;

        assert_eq!(surface.handle("initialize", &json!({})).await, Ok(json!(true)));
        assert_eq!(events.recv().await.unwrap().as_str(), "disconnected");
        assert_eq!(surface.handle("stage", &json!({})).await, Ok(json!("disconnected")));
    }

    #[tokio::test]
    async fn test_initialize_failure_code() {
        let surface = surface(false);
        let err = surface.initialize().await.unwrap_err();
        assert_eq!(err.code, "initialization_failed");
    }

    #[tokio::test]
    async fn test_idle_status_record() {
        let surface = surface(true);
        let status = surface.handle("status", &json!({})).await.unwrap();

        assert_eq!(status["connected_on"], Value::Null);
        assert_eq!(status["duration"], "00:00:00");
        for key in [
            "byte_in",
            "byte_out",
            "packets_in",
            "packets_out",
            "speed_in_mbps",
            "speed_out_mbps",
            "speed_in_bps",
            "speed_out_bps",
        ] {
            assert_eq!(status[key], "0", "field {}", key);
        }
    }

    #[tokio::test]
    async fn test_connect_errors_carry_codes() {
        let surface = surface(true);

        let err = surface
            .handle("connect", &json!({ "username": "u", "password": "p" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_config");
        assert_eq!(surface.stage().await, "error");

        surface.disconnect().await;
        assert_eq!(surface.stage().await, "disconnected");
    }

    #[tokio::test]
    async fn test_permission_and_unknown_methods() {
        let surface = surface(true);
        assert_eq!(
            surface.handle("request_permission", &Value::Null).await,
            Ok(json!(true))
        );

        let err = surface.handle("reboot", &Value::Null).await.unwrap_err();
        assert_eq!(err.code, "not_implemented");
    }
}
