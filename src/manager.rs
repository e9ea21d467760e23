//! Tunnel lifecycle manager
//!
//! Owns the authoritative [`ConnectionState`] and every per-session resource:
//! the adapter, the tunnel process, the config artifact and the monitor task.
//! Transitions observed by the monitor are queued and applied here, so event
//! subscribers only ever hear from the owning context.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ConfigArtifact, Credentials};
use crate::config::TunnelConfig;
use crate::driver::{
    select_driver, AdapterDriver, AdapterIdentity, DriverKind, FastDriver, LegacyDriver,
    SystemDeviceRegistry,
};
use crate::error::{ConnectError, ConnectResult, DriverError, LaunchError};
use crate::interfaces::{InterfaceTable, SystemInterfaceTable};
use crate::monitor::{
    AdapterReadiness, ConnectionMonitor, ConnectionState, MonitorPolicy, SessionFlags,
    TransitionQueue,
};
use crate::paths::BundleLocator;
use crate::privilege::{Elevation, SystemElevation};
use crate::process::{OsSpawner, ProcessSpawner, ProcessSupervisor};
use crate::stats::{SessionClock, StatsEngine, StatusSnapshot};

const EVENT_CAPACITY: usize = 100;

/// The pluggable seams of the manager
pub struct Components {
    pub fast: Box<dyn AdapterDriver>,
    pub legacy: Box<dyn AdapterDriver>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub interfaces: Arc<dyn InterfaceTable>,
    pub elevation: Arc<dyn Elevation>,
}

impl Components {
    /// Real drivers, processes and interface table of this host
    pub fn system(config: &TunnelConfig) -> Self {
        let locator = BundleLocator::from_settings(&config.paths);
        let interfaces: Arc<dyn InterfaceTable> = Arc::new(SystemInterfaceTable::new());
        let elevation: Arc<dyn Elevation> = Arc::new(SystemElevation);

        let fast = FastDriver::new(
            config.driver.clone(),
            locator.clone(),
            config.paths.library_dirs.clone(),
            config.paths.tool_dirs.clone(),
        );
        let legacy = LegacyDriver::new(
            config.driver.clone(),
            locator,
            config.paths.tool_dirs.clone(),
            Arc::new(SystemDeviceRegistry),
            interfaces.clone(),
            elevation.clone(),
        );

        Self {
            fast: Box::new(fast),
            legacy: Box::new(legacy),
            spawner: Arc::new(OsSpawner),
            interfaces,
            elevation,
        }
    }
}

/// Single-tunnel lifecycle manager
pub struct TunnelManager {
    config: TunnelConfig,
    locator: BundleLocator,
    fast: Box<dyn AdapterDriver>,
    legacy: Box<dyn AdapterDriver>,
    interfaces: Arc<dyn InterfaceTable>,
    supervisor: ProcessSupervisor,
    stats: StatsEngine,
    state: ConnectionState,
    events: broadcast::Sender<ConnectionState>,
    queue: TransitionQueue,
    flags: Arc<SessionFlags>,
    monitor: Option<ConnectionMonitor>,
    artifact: Option<ConfigArtifact>,
    active_kind: Option<DriverKind>,
    session: Option<SessionClock>,
    preferred: DriverKind,
    allow_fallback: bool,
}

impl TunnelManager {
    /// Manager over the system components
    pub fn new(config: TunnelConfig) -> Self {
        let components = Components::system(&config);
        Self::with_components(config, components)
    }

    pub fn with_components(config: TunnelConfig, components: Components) -> Self {
        let locator = BundleLocator::from_settings(&config.paths);
        let supervisor = ProcessSupervisor::new(
            components.spawner,
            components.elevation,
            config.process.clone(),
            locator.app_dir().to_path_buf(),
        );
        let stats = StatsEngine::new(components.interfaces.clone(), &config.stats);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            preferred: config.driver.preferred,
            allow_fallback: config.driver.allow_fallback,
            config,
            locator,
            fast: components.fast,
            legacy: components.legacy,
            interfaces: components.interfaces,
            supervisor,
            stats,
            state: ConnectionState::Disconnected,
            events,
            queue: TransitionQueue::new(),
            flags: Arc::new(SessionFlags::default()),
            monitor: None,
            artifact: None,
            active_kind: None,
            session: None,
        }
    }

    /// Subscribe to stage transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    /// Lock-free connecting/connected flags of the current session
    pub fn session_flags(&self) -> Arc<SessionFlags> {
        self.flags.clone()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Change the driver preference for subsequent connects
    pub fn set_preferred_driver(&mut self, kind: DriverKind, allow_fallback: bool) {
        info!("Preferred driver set to {} (fallback: {})", kind, allow_fallback);
        self.preferred = kind;
        self.allow_fallback = allow_fallback;
    }

    pub fn preferred_driver(&self) -> (DriverKind, bool) {
        (self.preferred, self.allow_fallback)
    }

    /// Driver backing the current session
    pub fn active_driver(&self) -> Option<DriverKind> {
        self.active_kind
    }

    /// Adapter of the current session
    pub fn adapter(&self) -> Option<AdapterIdentity> {
        self.active_kind.and_then(|kind| self.driver(kind).identity())
    }

    /// Pid of the tunnel process, if one is running
    pub fn process_id(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Probe the drivers and announce the initial stage.
    ///
    /// Returns the driver a connect would use now.
    pub async fn initialize(&mut self) -> Result<DriverKind, DriverError> {
        let kind = select_driver(
            self.preferred,
            self.allow_fallback,
            self.fast.as_mut(),
            self.legacy.as_mut(),
        )
        .await?;
        info!("Driver subsystem ready ({} driver)", kind);

        if !self.state.is_active() {
            self.state = ConnectionState::Disconnected;
            self.emit(ConnectionState::Disconnected);
        }
        Ok(kind)
    }

    /// Bring up a tunnel from the given config text
    pub async fn connect(
        &mut self,
        config_text: &str,
        credentials: Option<Credentials>,
    ) -> ConnectResult<()> {
        self.drain_transitions().await;
        if self.state.is_active() {
            warn!("Connect rejected: tunnel is {}", self.state);
            return Err(ConnectError::AlreadyActive);
        }
        self.release_session().await;

        let result = if config_text.trim().is_empty() {
            Err(ConnectError::InvalidConfig("config text is empty".to_string()))
        } else {
            self.start_session(config_text, credentials.as_ref()).await
        };

        if let Err(e) = &result {
            error!("Connect failed: {}", e);
            self.release_session().await;
            self.transition(ConnectionState::Error);
        }
        result
    }

    async fn start_session(
        &mut self,
        config_text: &str,
        credentials: Option<&Credentials>,
    ) -> ConnectResult<()> {
        let kind = select_driver(
            self.preferred,
            self.allow_fallback,
            self.fast.as_mut(),
            self.legacy.as_mut(),
        )
        .await?;
        self.active_kind = Some(kind);

        let identity = self.driver_mut(kind).provision(None).await?;

        let exe_name = self.config.process.executable_file_name();
        let executable = self
            .locator
            .find(&self.config.paths.executable_dirs, &exe_name)
            .ok_or_else(|| LaunchError::ExecutableNotFound(exe_name.clone()))?;
        debug!("Using tunnel executable {:?}", executable);

        let artifact = ConfigArtifact::write(
            &self.config.paths.resolved_artifact_dir(),
            &self.config.paths.config_file_name,
            &self.config.paths.credential_file_name,
            config_text,
            kind,
            credentials,
        )
        .await?;
        let config_path = artifact.config_path().to_path_buf();
        self.artifact = Some(artifact);

        self.supervisor
            .launch(&executable, &config_path, kind, Some(&identity))?;
        let liveness = self
            .supervisor
            .liveness()
            .ok_or_else(|| LaunchError::ProcessCreationFailed {
                os_error_code: None,
                message: "process handle missing after launch".to_string(),
            })?;

        self.session = Some(SessionClock::start());
        self.stats.reset();
        self.flags.set_connecting();
        self.transition(ConnectionState::Connecting);

        let patterns = match kind {
            DriverKind::Fast => self.config.driver.fast_patterns.clone(),
            DriverKind::Legacy => self.config.driver.legacy_patterns.clone(),
        };
        let readiness = AdapterReadiness::new(
            self.interfaces.clone(),
            Some(identity.display_name.clone()),
            patterns,
        );
        self.monitor = Some(ConnectionMonitor::start(
            MonitorPolicy::from(&self.config.monitor),
            self.config.monitor.poll_interval(),
            liveness,
            Arc::new(readiness),
            self.queue.clone(),
            self.flags.clone(),
        ));

        info!(
            "Tunnel connecting on adapter {} via {} driver",
            identity.display_name, kind
        );
        Ok(())
    }

    /// Tear everything down. Always ends in `Disconnected`.
    pub async fn disconnect(&mut self) {
        info!("Disconnecting tunnel");
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        for state in self.queue.drain() {
            self.transition(state);
        }
        self.release_session().await;
        self.transition(ConnectionState::Disconnected);
    }

    /// Current status with freshly sampled counters.
    ///
    /// Counters are read even without a session, so traffic on a tunnel
    /// adapter outside our control still shows up; speeds track sessions only.
    pub async fn status(&mut self) -> StatusSnapshot {
        self.drain_transitions().await;

        let now = Instant::now();
        let sample = self.stats.sample_counters();
        if self.session.is_some() {
            self.stats.update_speed(sample.bytes_in, sample.bytes_out, now);
        }
        self.stats.snapshot(self.state, self.session.as_ref(), now)
    }

    /// Current stage after applying queued transitions
    pub async fn current_state(&mut self) -> ConnectionState {
        self.drain_transitions().await;
        self.state
    }

    async fn drain_transitions(&mut self) {
        let mut finished = false;
        for state in self.queue.drain() {
            debug!("Applying queued transition: {}", state);
            self.transition(state);
            finished |= !state.is_active();
        }
        if finished {
            info!("Tunnel session ended ({}), releasing resources", self.state);
            self.release_session().await;
        }
    }

    /// Release every per-session resource. Safe with nothing to release.
    async fn release_session(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        self.supervisor.terminate().await;
        if let Some(artifact) = self.artifact.take() {
            artifact.remove().await;
        }
        if let Some(kind) = self.active_kind.take() {
            self.driver_mut(kind).teardown().await;
        }
        self.flags.clear();
        self.session = None;
        self.stats.reset();
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Tunnel state: {} -> {}", self.state, state);
        self.state = state;
        self.emit(state);
    }

    fn emit(&self, state: ConnectionState) {
        // No subscribers is fine
        let _ = self.events.send(state);
    }

    fn driver(&self, kind: DriverKind) -> &dyn AdapterDriver {
        match kind {
            DriverKind::Fast => self.fast.as_ref(),
            DriverKind::Legacy => self.legacy.as_ref(),
        }
    }

    fn driver_mut(&mut self, kind: DriverKind) -> &mut dyn AdapterDriver {
        match kind {
            DriverKind::Fast => self.fast.as_mut(),
            DriverKind::Legacy => self.legacy.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockAdapterDriver;
    use crate::interfaces::InterfaceSnapshot;
    use crate::process::{LaunchSpec, TunnelProcess};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Elevated;

    #[async_trait]
    impl Elevation for Elevated {
        fn is_elevated(&self) -> bool {
            true
        }

        async fn run_elevated(
            &self,
            _program: &Path,
            _args: &[String],
            _working_dir: &Path,
            _timeout: Duration,
        ) -> Result<i32, DriverError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct CountingSpawner {
        spawned: AtomicUsize,
    }

    impl ProcessSpawner for CountingSpawner {
        fn spawn(&self, _spec: &LaunchSpec) -> Result<Arc<dyn TunnelProcess>, LaunchError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Err(LaunchError::ProcessCreationFailed {
                os_error_code: Some(2),
                message: "not in unit tests".to_string(),
            })
        }
    }

    struct NoInterfaces;

    impl InterfaceTable for NoInterfaces {
        fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>, DriverError> {
            Ok(Vec::new())
        }
    }

    struct FixedInterfaces(Vec<InterfaceSnapshot>);

    impl InterfaceTable for FixedInterfaces {
        fn snapshot(&self) -> Result<Vec<InterfaceSnapshot>, DriverError> {
            Ok(self.0.clone())
        }
    }

    fn unavailable(kind: DriverKind) -> MockAdapterDriver {
        let mut driver = MockAdapterDriver::new();
        driver.expect_kind().return_const(kind);
        driver.expect_is_available().returning(|| false);
        driver.expect_provision().never();
        driver.expect_teardown().returning(|| ());
        driver.expect_identity().returning(|| None);
        driver
    }

    fn available(kind: DriverKind) -> MockAdapterDriver {
        let mut driver = MockAdapterDriver::new();
        driver.expect_kind().return_const(kind);
        driver.expect_is_available().returning(|| true);
        driver.expect_teardown().returning(|| ());
        driver.expect_identity().returning(|| None);
        driver
    }

    fn manager(
        fast: MockAdapterDriver,
        legacy: MockAdapterDriver,
        spawner: Arc<CountingSpawner>,
    ) -> TunnelManager {
        manager_with_interfaces(fast, legacy, spawner, Arc::new(NoInterfaces))
    }

    fn manager_with_interfaces(
        fast: MockAdapterDriver,
        legacy: MockAdapterDriver,
        spawner: Arc<CountingSpawner>,
        interfaces: Arc<dyn InterfaceTable>,
    ) -> TunnelManager {
        let components = Components {
            fast: Box::new(fast),
            legacy: Box::new(legacy),
            spawner,
            interfaces,
            elevation: Arc::new(Elevated),
        };
        TunnelManager::with_components(TunnelConfig::default(), components)
    }

    #[tokio::test]
    async fn test_initialize_announces_disconnected() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager(
            available(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner,
        );
        let mut events = manager.subscribe();

        let kind = manager.initialize().await.unwrap();
        assert_eq!(kind, DriverKind::Fast);
        assert_eq!(events.try_recv().unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_initialize_without_driver() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager(
            unavailable(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner,
        );
        let mut events = manager.subscribe();

        let err = manager.initialize().await.unwrap_err();
        assert!(matches!(err, DriverError::NoDriverAvailable));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_driver_fails_connect_without_launch() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager(
            unavailable(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner.clone(),
        );

        let err = manager.connect("remote 1.2.3.4 1194", None).await.unwrap_err();
        assert_eq!(err.code(), "no_driver_available");
        assert_eq!(manager.current_state().await, ConnectionState::Error);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);
        assert!(manager.active_driver().is_none());
    }

    #[tokio::test]
    async fn test_empty_config_is_invalid() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager(
            available(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner.clone(),
        );

        let err = manager.connect("  \n", None).await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidConfig(_)));
        assert_eq!(manager.current_state().await, ConnectionState::Error);

        manager.disconnect().await;
        assert_eq!(manager.current_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_preference_without_fallback() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager(
            available(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner,
        );

        manager.set_preferred_driver(DriverKind::Legacy, false);
        assert_eq!(manager.preferred_driver(), (DriverKind::Legacy, false));
        assert!(manager.initialize().await.is_err());

        manager.set_preferred_driver(DriverKind::Legacy, true);
        assert_eq!(manager.initialize().await.unwrap(), DriverKind::Fast);
    }

    #[tokio::test]
    async fn test_status_when_idle() {
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager(
            available(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner,
        );

        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.has_activity());
        assert_eq!(status.to_record(), crate::stats::StatusRecord::idle());
    }

    #[tokio::test]
    async fn test_status_reports_traffic_without_session() {
        let tunnel = InterfaceSnapshot {
            name: "tun7".to_string(),
            description: "Wintun Userspace Tunnel".to_string(),
            rx_bytes: 5000,
            tx_bytes: 700,
            rx_packets: 5,
            tx_packets: 1,
            ..Default::default()
        };
        let spawner = Arc::new(CountingSpawner::default());
        let mut manager = manager_with_interfaces(
            available(DriverKind::Fast),
            unavailable(DriverKind::Legacy),
            spawner,
            Arc::new(FixedInterfaces(vec![tunnel])),
        );

        let status = manager.status().await;
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.bytes_in, 5000);
        assert_eq!(status.bytes_out, 700);
        assert!(status.has_activity());

        let record = status.to_record();
        assert_eq!(record.byte_in, "5000");
        assert_eq!(record.byte_out, "700");
        assert_eq!(record.connected_on, None);
        assert_eq!(record.duration, "00:00:00");
        assert_eq!(record.speed_in_bps, "0");
    }
}
