//! Connection monitoring
//!
//! A background task polls process liveness and adapter readiness on a fixed
//! interval. It never touches the authoritative connection state: observed
//! transitions go onto a [`TransitionQueue`] which the owning manager drains.
//!
//! Debouncing is asymmetric. While connecting, readiness must hold for a run
//! of consecutive polls after a grace period; once connected, a single failed
//! readiness poll ends the connection.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MonitorSettings;
use crate::error::MonitorError;
use crate::interfaces::InterfaceTable;
use crate::process::{Liveness, ProcessLiveness};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FIFO of transitions observed off the owning context
#[derive(Debug, Clone, Default)]
pub struct TransitionQueue {
    inner: Arc<Mutex<VecDeque<ConnectionState>>>,
}

impl TransitionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, state: ConnectionState) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(state);
    }

    /// Take every queued transition, oldest first
    pub fn drain(&self) -> Vec<ConnectionState> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock-free connecting/connected flags readable from any context
#[derive(Debug, Default)]
pub struct SessionFlags {
    connecting: AtomicBool,
    connected: AtomicBool,
}

impl SessionFlags {
    pub fn set_connecting(&self) {
        self.connected.store(false, Ordering::Release);
        self.connecting.store(true, Ordering::Release);
    }

    pub fn set_connected(&self) {
        self.connecting.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.connecting.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Poll counts governing the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorPolicy {
    pub grace_polls: u32,
    pub required_stable_polls: u32,
    pub max_connecting_polls: u32,
}

impl From<&MonitorSettings> for MonitorPolicy {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            grace_polls: settings.grace_polls,
            required_stable_polls: settings.required_stable_polls.max(1),
            max_connecting_polls: settings.max_connecting_polls,
        }
    }
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self::from(&MonitorSettings::default())
    }
}

/// Outcome of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Readiness held long enough; now connected
    Promote,
    /// Monitoring ends in this state
    Finish(ConnectionState, MonitorError),
}

/// Debounce state machine evaluated once per poll
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    policy: MonitorPolicy,
    connected: bool,
    polls: u32,
    stable: u32,
}

impl ConnectionTracker {
    pub fn new(policy: MonitorPolicy) -> Self {
        Self {
            policy,
            connected: false,
            polls: 0,
            stable: 0,
        }
    }

    /// Evaluate one poll. `ready` is only sampled when the policy needs it.
    pub fn observe(&mut self, liveness: Liveness, ready: impl FnOnce() -> bool) -> Step {
        match liveness {
            Liveness::Running => {}
            Liveness::Exited(exit_code) => {
                return Step::Finish(
                    ConnectionState::Disconnected,
                    MonitorError::ProcessExited { exit_code },
                )
            }
            Liveness::Unknown(reason) => {
                return Step::Finish(ConnectionState::Error, MonitorError::ProcessUnknown(reason))
            }
        }

        if self.connected {
            return if ready() {
                Step::Continue
            } else {
                Step::Finish(ConnectionState::Disconnected, MonitorError::ReadinessLost)
            };
        }

        self.polls += 1;
        if self.polls > self.policy.grace_polls {
            if ready() {
                self.stable += 1;
                if self.stable >= self.policy.required_stable_polls {
                    self.connected = true;
                    return Step::Promote;
                }
            } else {
                self.stable = 0;
            }
        }

        if self.polls > self.policy.max_connecting_polls {
            return Step::Finish(
                ConnectionState::Error,
                MonitorError::Timeout { polls: self.polls },
            );
        }

        Step::Continue
    }

    /// Whether the next `observe` with a running process consults readiness
    pub fn needs_readiness(&self) -> bool {
        self.connected || self.polls >= self.policy.grace_polls
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn stable_polls(&self) -> u32 {
        self.stable
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Answers whether the tunnel adapter is usable
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Readiness from the interface table: an up, addressed adapter that is
/// either the provisioned one or matches the active driver's patterns
pub struct AdapterReadiness {
    table: Arc<dyn InterfaceTable>,
    adapter_name: Option<String>,
    patterns: Vec<String>,
}

impl AdapterReadiness {
    pub fn new(table: Arc<dyn InterfaceTable>, adapter_name: Option<String>, patterns: Vec<String>) -> Self {
        Self {
            table,
            adapter_name,
            patterns,
        }
    }
}

impl ReadinessProbe for AdapterReadiness {
    fn is_ready(&self) -> bool {
        let interfaces = match self.table.snapshot() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                debug!("Readiness check could not list adapters: {}", e);
                return false;
            }
        };

        interfaces.iter().any(|iface| {
            let ours = self
                .adapter_name
                .as_deref()
                .map(|name| iface.is_named(name))
                .unwrap_or(false);
            (ours || iface.matches_any(&self.patterns)) && iface.is_ready()
        })
    }
}

/// Background poll task of one connection attempt
pub struct ConnectionMonitor {
    keep_running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionMonitor {
    /// Spawn the poll loop on the current tokio runtime
    pub fn start(
        policy: MonitorPolicy,
        interval: Duration,
        liveness: ProcessLiveness,
        readiness: Arc<dyn ReadinessProbe>,
        queue: TransitionQueue,
        flags: Arc<SessionFlags>,
    ) -> Self {
        let keep_running = Arc::new(AtomicBool::new(true));
        let running = keep_running.clone();

        info!("Starting connection monitor for pid {}", liveness.pid());

        let task = tokio::spawn(async move {
            let mut tracker = ConnectionTracker::new(policy);
            while running.load(Ordering::Acquire) {
                let alive = liveness.check();
                let ready = if matches!(alive, Liveness::Running) && tracker.needs_readiness() {
                    // Interface enumeration is blocking I/O
                    let probe = readiness.clone();
                    match tokio::task::spawn_blocking(move || probe.is_ready()).await {
                        Ok(ready) => ready,
                        Err(e) => {
                            warn!("Readiness check failed: {}", e);
                            false
                        }
                    }
                } else {
                    false
                };
                match tracker.observe(alive, || ready) {
                    Step::Continue => {}
                    Step::Promote => {
                        info!("Tunnel connected after {} polls", tracker.polls());
                        flags.set_connected();
                        queue.push(ConnectionState::Connected);
                    }
                    Step::Finish(state, reason) => {
                        warn!("Connection monitor finished ({}): {}", state, reason);
                        flags.clear();
                        queue.push(state);
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
            debug!("Connection monitor loop exited");
        });

        Self {
            keep_running,
            task: Some(task),
        }
    }

    /// Clear the continue flag and wait for the loop to exit
    pub async fn stop(mut self) {
        self.keep_running.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Connection monitor task failed: {}", e);
            }
        }
        debug!("Connection monitor stopped");
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.keep_running.store(false, Ordering::Release);
    }
}
