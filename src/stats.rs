//! Tunnel throughput statistics
//!
//! Counters are summed across every interface whose description matches the
//! tunnel allow-list, so traffic is reported whichever driver is active.
//! Speeds are smoothed with an exponential moving average.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::StatsSettings;
use crate::interfaces::InterfaceTable;
use crate::monitor::ConnectionState;

/// What to do when a cumulative counter goes backwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterResetPolicy {
    /// Re-base on the new value; that sample leaves the speed unchanged
    #[default]
    #[serde(rename = "reseed")]
    Reseed,
    /// Treat the delta as zero
    #[serde(rename = "clamp")]
    ClampToZero,
}

/// Summed cumulative counters of the tunnel adapters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSample {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// When the current session started
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    pub started: Instant,
    pub started_at: DateTime<Local>,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Local::now(),
        }
    }
}

/// Smoothed throughput from cumulative byte counters
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    min_interval: Duration,
    weight: f64,
    reset_policy: CounterResetPolicy,
    baseline: Option<(Instant, u64, u64)>,
    speed_in: f64,
    speed_out: f64,
}

impl SpeedMeter {
    pub fn new(min_interval: Duration, weight: f64, reset_policy: CounterResetPolicy) -> Self {
        Self {
            min_interval,
            weight: weight.clamp(0.0, 1.0),
            reset_policy,
            baseline: None,
            speed_in: 0.0,
            speed_out: 0.0,
        }
    }

    /// Feed cumulative counters observed at `now`
    pub fn update(&mut self, bytes_in: u64, bytes_out: u64, now: Instant) {
        let Some((at, last_in, last_out)) = self.baseline else {
            self.baseline = Some((now, bytes_in, bytes_out));
            self.speed_in = 0.0;
            self.speed_out = 0.0;
            return;
        };

        let elapsed = now.saturating_duration_since(at);
        if elapsed < self.min_interval {
            return;
        }

        let secs = elapsed.as_secs_f64();
        self.speed_in = self.next_speed(self.speed_in, last_in, bytes_in, secs);
        self.speed_out = self.next_speed(self.speed_out, last_out, bytes_out, secs);
        self.baseline = Some((now, bytes_in, bytes_out));
    }

    fn next_speed(&self, previous: f64, last: u64, current: u64, secs: f64) -> f64 {
        let delta = if current < last {
            match self.reset_policy {
                CounterResetPolicy::Reseed => {
                    debug!("Counter went backwards ({} -> {}), reseeding", last, current);
                    return previous;
                }
                CounterResetPolicy::ClampToZero => 0,
            }
        } else {
            current - last
        };

        let raw = delta as f64 / secs;
        raw * self.weight + previous * (1.0 - self.weight)
    }

    /// Smoothed (in, out) speeds in bytes per second
    pub fn speeds(&self) -> (f64, f64) {
        (self.speed_in, self.speed_out)
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.speed_in = 0.0;
        self.speed_out = 0.0;
    }
}

/// Point-in-time view of the tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub connected_since: Option<DateTime<Local>>,
    pub duration_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub speed_in_bytes_per_sec: f64,
    pub speed_out_bytes_per_sec: f64,
}

/// Status as a flat string-keyed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub connected_on: Option<String>,
    pub duration: String,
    pub byte_in: String,
    pub byte_out: String,
    pub packets_in: String,
    pub packets_out: String,
    pub speed_in_mbps: String,
    pub speed_out_mbps: String,
    pub speed_in_bps: String,
    pub speed_out_bps: String,
}

impl StatusRecord {
    /// Record reported when there is no tunnel activity
    pub fn idle() -> Self {
        let zero = || "0".to_string();
        Self {
            connected_on: None,
            duration: "00:00:00".to_string(),
            byte_in: zero(),
            byte_out: zero(),
            packets_in: zero(),
            packets_out: zero(),
            speed_in_mbps: zero(),
            speed_out_mbps: zero(),
            speed_in_bps: zero(),
            speed_out_bps: zero(),
        }
    }
}

/// "HH:MM:SS"; hours are not wrapped
pub fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn bits_per_sec(bytes_per_sec: f64) -> u64 {
    (bytes_per_sec * 8.0).round() as u64
}

fn megabits_per_sec(bytes_per_sec: f64) -> String {
    format!("{:.2}", bytes_per_sec * 8.0 / (1024.0 * 1024.0))
}

impl StatusSnapshot {
    /// Counters moved, or a connection is up or being set up
    pub fn has_activity(&self) -> bool {
        self.bytes_in > 0
            || self.bytes_out > 0
            || matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn to_record(&self) -> StatusRecord {
        if !self.has_activity() {
            return StatusRecord::idle();
        }

        StatusRecord {
            connected_on: self
                .connected_since
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
            duration: format_duration(self.duration_secs),
            byte_in: self.bytes_in.to_string(),
            byte_out: self.bytes_out.to_string(),
            packets_in: self.packets_in.to_string(),
            packets_out: self.packets_out.to_string(),
            speed_in_mbps: megabits_per_sec(self.speed_in_bytes_per_sec),
            speed_out_mbps: megabits_per_sec(self.speed_out_bytes_per_sec),
            speed_in_bps: bits_per_sec(self.speed_in_bytes_per_sec).to_string(),
            speed_out_bps: bits_per_sec(self.speed_out_bytes_per_sec).to_string(),
        }
    }
}

/// Samples tunnel counters and produces status snapshots
pub struct StatsEngine {
    table: Arc<dyn InterfaceTable>,
    patterns: Vec<String>,
    meter: SpeedMeter,
    counters: CounterSample,
}

impl StatsEngine {
    pub fn new(table: Arc<dyn InterfaceTable>, settings: &StatsSettings) -> Self {
        Self {
            table,
            patterns: settings.adapter_patterns.clone(),
            meter: SpeedMeter::new(
                Duration::from_millis(settings.min_sample_interval_ms),
                settings.smoothing_weight,
                settings.counter_reset,
            ),
            counters: CounterSample::default(),
        }
    }

    /// Sum the counters of every tunnel adapter
    pub fn sample_counters(&mut self) -> CounterSample {
        let interfaces = match self.table.snapshot() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!("Failed to read interface counters: {}", e);
                return self.counters;
            }
        };

        let mut sample = CounterSample::default();
        for iface in interfaces.iter().filter(|i| i.matches_any(&self.patterns)) {
            sample.bytes_in = sample.bytes_in.saturating_add(iface.rx_bytes);
            sample.bytes_out = sample.bytes_out.saturating_add(iface.tx_bytes);
            sample.packets_in = sample.packets_in.saturating_add(iface.rx_packets);
            sample.packets_out = sample.packets_out.saturating_add(iface.tx_packets);
        }

        self.counters = sample;
        sample
    }

    pub fn update_speed(&mut self, bytes_in: u64, bytes_out: u64, now: Instant) {
        self.meter.update(bytes_in, bytes_out, now);
    }

    /// Combine state, session clock, latest counters and speeds
    pub fn snapshot(
        &self,
        state: ConnectionState,
        session: Option<&SessionClock>,
        now: Instant,
    ) -> StatusSnapshot {
        let (speed_in, speed_out) = self.meter.speeds();
        StatusSnapshot {
            state,
            connected_since: session.map(|s| s.started_at),
            duration_secs: session
                .map(|s| now.saturating_duration_since(s.started).as_secs())
                .unwrap_or(0),
            bytes_in: self.counters.bytes_in,
            bytes_out: self.counters.bytes_out,
            packets_in: self.counters.packets_in,
            packets_out: self.counters.packets_out,
            speed_in_bytes_per_sec: speed_in,
            speed_out_bytes_per_sec: speed_out,
        }
    }

    /// Forget speed baselines and the last counters
    pub fn reset(&mut self) {
        self.meter.reset();
        self.counters = CounterSample::default();
    }
}
