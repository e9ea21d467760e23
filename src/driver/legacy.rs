//! Legacy adapter driver installed through bundled installer tooling
//!
//! The kernel driver is detected through the OS network device class. When
//! no matching adapter exists the bundled installer is run elevated to
//! install the driver and materialize one.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AdapterDriver, AdapterIdentity, DriverKind};
use crate::config::DriverSettings;
use crate::error::DriverError;
use crate::interfaces::{InterfaceSnapshot, InterfaceTable};
use crate::paths::BundleLocator;
use crate::privilege::Elevation;

/// Where installed network drivers are recorded
pub trait DeviceClassRegistry: Send + Sync {
    /// Whether a driver whose description matches one of `patterns` is installed
    fn driver_installed(&self, patterns: &[String]) -> Result<bool, DriverError>;
}

/// Device class registry of the host operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDeviceRegistry;

#[cfg(windows)]
impl DeviceClassRegistry for SystemDeviceRegistry {
    fn driver_installed(&self, patterns: &[String]) -> Result<bool, DriverError> {
        use winreg::enums::{HKEY_LOCAL_MACHINE, KEY_READ};
        use winreg::RegKey;

        const NET_CLASS_KEY: &str =
            r"SYSTEM\CurrentControlSet\Control\Class\{4D36E972-E325-11CE-BFC1-08002BE10318}";

        let class = RegKey::predef(HKEY_LOCAL_MACHINE)
            .open_subkey_with_flags(NET_CLASS_KEY, KEY_READ)
            .map_err(|e| DriverError::AdapterEnumerationFailed(format!("network class key: {}", e)))?;

        for subkey in class.enum_keys().filter_map(Result::ok) {
            let Ok(entry) = class.open_subkey_with_flags(&subkey, KEY_READ) else {
                continue;
            };
            let Ok(description) = entry.get_value::<String, _>("DriverDesc") else {
                continue;
            };
            if patterns.iter().any(|p| description.contains(p.as_str())) {
                debug!("Found legacy driver entry {}: {}", subkey, description);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(not(windows))]
impl DeviceClassRegistry for SystemDeviceRegistry {
    fn driver_installed(&self, _patterns: &[String]) -> Result<bool, DriverError> {
        // tap devices come from the tun module
        Ok(Path::new("/sys/module/tun").exists() || Path::new("/dev/net/tun").exists())
    }
}

/// Legacy driver backend
pub struct LegacyDriver {
    settings: DriverSettings,
    locator: BundleLocator,
    tool_dirs: Vec<PathBuf>,
    registry: Arc<dyn DeviceClassRegistry>,
    interfaces: Arc<dyn InterfaceTable>,
    elevation: Arc<dyn Elevation>,
    identity: Option<AdapterIdentity>,
}

impl LegacyDriver {
    pub fn new(
        settings: DriverSettings,
        locator: BundleLocator,
        tool_dirs: Vec<PathBuf>,
        registry: Arc<dyn DeviceClassRegistry>,
        interfaces: Arc<dyn InterfaceTable>,
        elevation: Arc<dyn Elevation>,
    ) -> Self {
        Self {
            settings,
            locator,
            tool_dirs,
            registry,
            interfaces,
            elevation,
            identity: None,
        }
    }

    /// Bring the provisioned adapter administratively up
    pub async fn enable(&self) -> Result<(), DriverError> {
        self.set_admin_state(true).await
    }

    /// Take the provisioned adapter administratively down
    pub async fn disable(&self) -> Result<(), DriverError> {
        self.set_admin_state(false).await
    }

    async fn set_admin_state(&self, up: bool) -> Result<(), DriverError> {
        let identity = self.identity.as_ref().ok_or(DriverError::AdapterNotProvisioned)?;
        let name = identity.display_name.clone();

        #[cfg(windows)]
        let (program, args) = (
            "netsh",
            vec![
                "interface".to_string(),
                "set".to_string(),
                "interface".to_string(),
                name.clone(),
                format!("admin={}", if up { "enable" } else { "disable" }),
            ],
        );

        #[cfg(not(windows))]
        let (program, args) = (
            "ip",
            vec![
                "link".to_string(),
                "set".to_string(),
                "dev".to_string(),
                name.clone(),
                if up { "up" } else { "down" }.to_string(),
            ],
        );

        let code = self
            .elevation
            .run_elevated(Path::new(program), &args, self.locator.app_dir(), self.installer_timeout())
            .await?;
        if code != 0 {
            return Err(DriverError::InstallerExecutionFailed { exit_code: code });
        }

        info!("Legacy adapter {} {}", name, if up { "enabled" } else { "disabled" });
        Ok(())
    }

    fn installer_timeout(&self) -> Duration {
        self.settings.installer_timeout()
    }

    fn find_bundled(&self, file_name: &str) -> Result<PathBuf, DriverError> {
        self.locator
            .find(&self.tool_dirs, file_name)
            .ok_or_else(|| DriverError::BundledFileMissing(file_name.to_string()))
    }

    /// Run one elevated installer step
    async fn run_installer(&self, args: Vec<String>) -> Result<(), DriverError> {
        let installer_name = format!("{}{}", self.settings.legacy_installer, std::env::consts::EXE_SUFFIX);
        let installer = self.find_bundled(&installer_name)?;
        let working_dir = installer
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.locator.app_dir().to_path_buf());

        info!("Running {:?} {}", installer, args.join(" "));
        let code = self
            .elevation
            .run_elevated(&installer, &args, &working_dir, self.installer_timeout())
            .await?;

        if code != 0 {
            warn!("{:?} exited with {}", installer, code);
            return Err(DriverError::InstallerExecutionFailed { exit_code: code });
        }
        Ok(())
    }

    async fn install_driver(&self) -> Result<(), DriverError> {
        let inf = self.find_bundled(&self.settings.legacy_inf)?;
        self.run_installer(vec![
            "install".to_string(),
            inf.to_string_lossy().into_owned(),
            self.settings.legacy_hardware_id.clone(),
        ])
        .await
    }

    async fn create_adapter(&self, name: &str) -> Result<(), DriverError> {
        self.run_installer(vec![
            "create".to_string(),
            self.settings.legacy_hardware_id.clone(),
            name.to_string(),
        ])
        .await
    }

    /// First adapter matching the legacy patterns, preferring one called `name`
    fn find_adapter(&self, name: Option<&str>) -> Result<Option<InterfaceSnapshot>, DriverError> {
        let mut matching: Vec<InterfaceSnapshot> = self
            .interfaces
            .snapshot()?
            .into_iter()
            .filter(|iface| iface.matches_any(&self.settings.legacy_patterns))
            .collect();

        if let Some(name) = name {
            if let Some(pos) = matching.iter().position(|iface| iface.is_named(name)) {
                return Ok(Some(matching.swap_remove(pos)));
            }
        }
        Ok(matching.into_iter().next())
    }

    fn adopt(&mut self, adapter: InterfaceSnapshot) -> AdapterIdentity {
        let display_name = if adapter.alias.is_empty() {
            adapter.name.clone()
        } else {
            adapter.alias.clone()
        };
        let unique_id = Uuid::parse_str(adapter.name.trim_matches(|c| c == '{' || c == '}'))
            .unwrap_or_else(|_| Uuid::new_v4());

        let identity = AdapterIdentity {
            display_name,
            unique_id,
            backend: DriverKind::Legacy,
        };
        info!("Using legacy adapter {} ({})", identity.display_name, adapter.description);
        self.identity = Some(identity.clone());
        identity
    }
}

#[async_trait]
impl AdapterDriver for LegacyDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Legacy
    }

    async fn is_available(&mut self) -> bool {
        match self.registry.driver_installed(&self.settings.legacy_patterns) {
            Ok(installed) => installed,
            Err(e) => {
                warn!("Legacy driver lookup failed: {}", e);
                false
            }
        }
    }

    async fn provision(&mut self, preferred_name: Option<String>) -> Result<AdapterIdentity, DriverError> {
        let name = preferred_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.settings.legacy_adapter_name.clone());

        let installed = self.registry.driver_installed(&self.settings.legacy_patterns)?;
        if installed {
            if let Some(adapter) = self.find_adapter(Some(&name))? {
                return Ok(self.adopt(adapter));
            }
            debug!("Legacy driver installed but no adapter present");
        } else {
            info!("Legacy driver not installed, installing");
        }

        match self.install_driver().await {
            Ok(()) => {}
            Err(DriverError::BundledFileMissing(file)) if !installed => {
                warn!("Cannot install legacy driver, {} is not bundled", file);
                return Err(DriverError::DriverNotInstalled);
            }
            Err(e) => return Err(e),
        }
        if let Some(adapter) = self.find_adapter(Some(&name))? {
            return Ok(self.adopt(adapter));
        }

        self.create_adapter(&name).await?;
        match self.find_adapter(Some(&name))? {
            Some(adapter) => Ok(self.adopt(adapter)),
            None => Err(DriverError::AdapterEnumerationFailed(
                "no legacy adapter present after installation".to_string(),
            )),
        }
    }

    async fn teardown(&mut self) {
        // Legacy adapters are persistent OS devices; only the claim is released
        if let Some(identity) = self.identity.take() {
            debug!("Released legacy adapter {}", identity.display_name);
        }
    }

    fn identity(&self) -> Option<AdapterIdentity> {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    struct FakeRegistry(bool);

    impl DeviceClassRegistry for FakeRegistry {
        fn driver_installed(&self, _patterns: &[String]) -> Result<bool, DriverError> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct SharedTable(Mutex<Vec<InterfaceSnapshot>>);

    impl InterfaceTable for SharedTable {
        fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>, DriverError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    /// Records elevated calls; `install` adds an adapter to the table
    struct FakeElevation {
        table: Arc<SharedTable>,
        exit_code: i32,
        deny: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Elevation for FakeElevation {
        fn is_elevated(&self) -> bool {
            true
        }

        async fn run_elevated(
            &self,
            _program: &Path,
            args: &[String],
            _working_dir: &Path,
            _timeout: Duration,
        ) -> Result<i32, DriverError> {
            if self.deny {
                return Err(DriverError::ElevationDenied);
            }
            self.calls.lock().unwrap().push(args.to_vec());
            if self.exit_code == 0 && args.first().map(String::as_str) == Some("install") {
                self.table.0.lock().unwrap().push(tap_adapter("Ethernet 5"));
            }
            Ok(self.exit_code)
        }
    }

    fn tap_adapter(alias: &str) -> InterfaceSnapshot {
        InterfaceSnapshot {
            index: 12,
            name: "{A1B2C3D4-0000-4000-8000-00000000000A}".to_string(),
            alias: alias.to_string(),
            description: "TAP-Windows Adapter V9".to_string(),
            is_up: true,
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 8, 0, 6))],
            ..Default::default()
        }
    }

    fn bundle_with_installer() -> tempfile::TempDir {
        let app = tempfile::tempdir().unwrap();
        fs::create_dir_all(app.path().join("drivers")).unwrap();
        let installer = format!("tapinstall{}", std::env::consts::EXE_SUFFIX);
        fs::write(app.path().join("drivers").join(installer), b"").unwrap();
        fs::write(app.path().join("drivers/OemVista.inf"), b"").unwrap();
        app
    }

    fn driver(
        app: &Path,
        installed: bool,
        table: Arc<SharedTable>,
        elevation: Arc<FakeElevation>,
    ) -> LegacyDriver {
        let settings = DriverSettings {
            legacy_patterns: vec!["TAP-Windows".to_string()],
            ..DriverSettings::default()
        };
        LegacyDriver::new(
            settings,
            BundleLocator::new(app.to_path_buf(), false),
            vec![PathBuf::from("drivers")],
            Arc::new(FakeRegistry(installed)),
            table,
            elevation,
        )
    }

    fn elevation(table: &Arc<SharedTable>, exit_code: i32, deny: bool) -> Arc<FakeElevation> {
        Arc::new(FakeElevation {
            table: table.clone(),
            exit_code,
            deny,
            calls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_existing_adapter_is_adopted_without_installer() {
        let app = bundle_with_installer();
        let table = Arc::new(SharedTable(Mutex::new(vec![tap_adapter("Ethernet 3")])));
        let elevation = elevation(&table, 0, false);
        let mut driver = driver(app.path(), true, table, elevation.clone());

        assert!(driver.is_available().await);
        let identity = driver.provision(None).await.unwrap();

        assert_eq!(identity.display_name, "Ethernet 3");
        assert_eq!(identity.backend, DriverKind::Legacy);
        assert_eq!(
            identity.unique_id,
            Uuid::parse_str("A1B2C3D4-0000-4000-8000-00000000000A").unwrap()
        );
        assert!(elevation.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_driver_is_installed_then_adopted() {
        let app = bundle_with_installer();
        let table = Arc::new(SharedTable::default());
        let elevation = elevation(&table, 0, false);
        let mut driver = driver(app.path(), false, table, elevation.clone());

        assert!(!driver.is_available().await);
        let identity = driver.provision(None).await.unwrap();

        assert_eq!(identity.display_name, "Ethernet 5");
        let calls = elevation.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "install");
        assert!(calls[0][1].ends_with("OemVista.inf"));
        assert_eq!(calls[0][2], "tap0901");
    }

    #[tokio::test]
    async fn test_absent_driver_without_installer() {
        let app = tempfile::tempdir().unwrap();
        let table = Arc::new(SharedTable::default());
        let elevation = elevation(&table, 0, false);
        let mut driver = driver(app.path(), false, table, elevation.clone());

        let err = driver.provision(None).await.unwrap_err();
        assert!(matches!(err, DriverError::DriverNotInstalled));
        assert!(driver.identity().is_none());
        assert!(elevation.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_installed_driver_without_adapter_or_installer() {
        let app = tempfile::tempdir().unwrap();
        let table = Arc::new(SharedTable::default());
        let elevation = elevation(&table, 0, false);
        let mut driver = driver(app.path(), true, table, elevation);

        let err = driver.provision(None).await.unwrap_err();
        assert!(matches!(err, DriverError::BundledFileMissing(_)));
        assert!(driver.identity().is_none());
    }

    #[tokio::test]
    async fn test_installer_failure_reports_exit_code() {
        let app = bundle_with_installer();
        let table = Arc::new(SharedTable::default());
        let elevation = elevation(&table, 2, false);
        let mut driver = driver(app.path(), false, table, elevation);

        let err = driver.provision(None).await.unwrap_err();
        assert!(matches!(err, DriverError::InstallerExecutionFailed { exit_code: 2 }));
    }

    #[tokio::test]
    async fn test_elevation_denied() {
        let app = bundle_with_installer();
        let table = Arc::new(SharedTable::default());
        let elevation = elevation(&table, 0, true);
        let mut driver = driver(app.path(), true, table, elevation);

        let err = driver.provision(None).await.unwrap_err();
        assert!(matches!(err, DriverError::ElevationDenied));
    }

    #[tokio::test]
    async fn test_enable_requires_adapter() {
        let app = bundle_with_installer();
        let table = Arc::new(SharedTable(Mutex::new(vec![tap_adapter("Ethernet 3")])));
        let elevation = elevation(&table, 0, false);
        let mut driver = driver(app.path(), true, table, elevation.clone());

        assert!(matches!(driver.enable().await, Err(DriverError::AdapterNotProvisioned)));

        driver.provision(None).await.unwrap();
        driver.disable().await.unwrap();
        driver.enable().await.unwrap();

        let calls = elevation.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|args| args.contains(&"Ethernet 3".to_string())));
    }

    #[tokio::test]
    async fn test_teardown_releases_identity() {
        let app = bundle_with_installer();
        let table = Arc::new(SharedTable(Mutex::new(vec![tap_adapter("Ethernet 3")])));
        let elevation = elevation(&table, 0, false);
        let mut driver = driver(app.path(), true, table, elevation);

        driver.provision(None).await.unwrap();
        driver.teardown().await;
        driver.teardown().await;
        assert!(driver.identity().is_none());
    }
}
