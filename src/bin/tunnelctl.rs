//! Tunnel Control CLI (tunnelctl)
//!
//! Command-line host for the tunnel lifecycle library.
//!
//! # Usage
//!
//! ```bash
//! # Show driver availability and located bundle files
//! tunnelctl probe
//!
//! # Print the config that would be handed to the tunnel program
//! tunnelctl render client.ovpn --driver fast
//!
//! # Run a tunnel in the foreground (requires an elevated shell)
//! sudo tunnelctl connect client.ovpn --username alice --password-file pass.txt
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use libtunnelctl::artifacts::render_config;
use libtunnelctl::driver::{AdapterDriver, DriverKind, FastDriver};
use libtunnelctl::manager::{Components, TunnelManager};
use libtunnelctl::paths::BundleLocator;
use libtunnelctl::{ConnectionState, ControlSurface, TunnelConfig};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Tunnel Control CLI
#[derive(Parser, Debug)]
#[command(name = "tunnelctl")]
#[command(version)]
#[command(about = "Local VPN tunnel lifecycle manager", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show driver availability and located bundle files as JSON
    Probe,

    /// Print a tunnel config rewritten for a driver
    Render {
        /// Tunnel config file
        config: PathBuf,

        /// Driver to render for
        #[arg(short, long, value_enum, default_value = "fast")]
        driver: DriverArg,

        /// Reference a credential file at this path
        #[arg(long)]
        credentials_path: Option<PathBuf>,
    },

    /// Print the default settings as TOML
    Settings,

    /// Run a tunnel in the foreground until Ctrl+C
    Connect {
        /// Tunnel config file
        config: PathBuf,

        /// Username for the tunnel
        #[arg(short, long)]
        username: Option<String>,

        /// File whose first line is the password
        #[arg(short, long)]
        password_file: Option<PathBuf>,

        /// Seconds between status records
        #[arg(long, default_value = "5")]
        status_interval: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DriverArg {
    Fast,
    Legacy,
}

impl From<DriverArg> for DriverKind {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Fast => DriverKind::Fast,
            DriverArg::Legacy => DriverKind::Legacy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.settings {
        Some(path) => TunnelConfig::load(path)
            .with_context(|| format!("failed to load settings from {:?}", path))?,
        None => TunnelConfig::default(),
    };

    match args.command {
        Commands::Probe => probe(&config).await,
        Commands::Render {
            config: source,
            driver,
            credentials_path,
        } => {
            let text = read_text(&source)?;
            print!("{}", render_config(&text, driver.into(), credentials_path.as_deref()));
            Ok(())
        }
        Commands::Settings => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Connect {
            config: source,
            username,
            password_file,
            status_interval,
        } => {
            let text = read_text(&source)?;
            let password = match &password_file {
                Some(path) => Some(read_password(path)?),
                None => None,
            };
            run_tunnel(
                config,
                &text,
                username.as_deref(),
                password.as_deref(),
                Duration::from_secs(status_interval.max(1)),
            )
            .await
        }
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tunnelctl={},libtunnelctl={}", log_level, log_level))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_writer(std::io::stderr)
        .init();
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))
}

fn read_password(path: &Path) -> Result<String> {
    let content = read_text(path)?;
    match content.lines().next() {
        Some(line) if !line.is_empty() => Ok(line.to_string()),
        _ => bail!("password file {:?} is empty", path),
    }
}

async fn probe(config: &TunnelConfig) -> Result<()> {
    let locator = BundleLocator::from_settings(&config.paths);
    let mut fast = FastDriver::new(
        config.driver.clone(),
        locator.clone(),
        config.paths.library_dirs.clone(),
        config.paths.tool_dirs.clone(),
    );
    let fast_available = fast.is_available().await;
    let mut components = Components::system(config);
    let legacy_available = components.legacy.is_available().await;

    let helper = config.driver.adapter_helper.as_ref().and_then(|name| {
        locator.find(
            &config.paths.tool_dirs,
            &format!("{}{}", name, std::env::consts::EXE_SUFFIX),
        )
    });
    let executable = locator.find(
        &config.paths.executable_dirs,
        &config.process.executable_file_name(),
    );

    let report = json!({
        "app_dir": locator.app_dir(),
        "preferred": config.driver.preferred,
        "allow_fallback": config.driver.allow_fallback,
        "drivers": {
            "fast": fast_available,
            "legacy": legacy_available,
        },
        "executable": executable,
        "library": fast.library_path(),
        "library_version": fast.driver_version(),
        "helper": helper,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_tunnel(
    config: TunnelConfig,
    text: &str,
    username: Option<&str>,
    password: Option<&str>,
    status_interval: Duration,
) -> Result<()> {
    let poll_interval = config.monitor.poll_interval();
    let surface = ControlSurface::new(TunnelManager::new(config));
    let mut events = surface.subscribe().await;

    if let Err(e) = surface.initialize().await {
        bail!("{}", e);
    }
    if let Err(e) = surface.connect(text, username, password).await {
        error!("Connect failed: {}", e);
        bail!("{}", e);
    }

    let mut pump = tokio::time::interval(poll_interval);
    let mut report = tokio::time::interval(status_interval);
    let mut was_active = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, disconnecting");
                break;
            }
            _ = pump.tick() => {
                surface.stage().await;
            }
            _ = report.tick() => {
                println!("{}", serde_json::to_string(&surface.status().await)?);
            }
            event = events.recv() => match event {
                Ok(state) => {
                    println!("{}", state.as_str());
                    match state {
                        ConnectionState::Connecting | ConnectionState::Connected => was_active = true,
                        ConnectionState::Error => break,
                        ConnectionState::Disconnected if was_active => break,
                        ConnectionState::Disconnected => {}
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} stage events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    surface.disconnect().await;
    while let Ok(state) = events.try_recv() {
        println!("{}", state.as_str());
    }
    Ok(())
}
