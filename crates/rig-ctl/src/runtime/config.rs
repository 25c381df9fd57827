use clap::Parser;
use rig_core::bus::SerialSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_MOTOR_BAUD: u32 = 9600;
pub const DEFAULT_GAS_BAUD: u32 = 19200;
pub const DEFAULT_BIND: &str = "127.0.0.1:7100";
pub const DEFAULT_SCHEDULE_DIR: &str = "schedules";

#[derive(Debug, Parser)]
#[command(name = "rig-ctl", version)]
#[command(about = "Lab rig controller: stepper drives, gas controllers and the schedule engine", long_about = None)]
pub struct Cli {
    /// TOML configuration file; flags given here override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Serial port of the stepper drivers
    #[arg(long)]
    pub motor_port: Option<String>,

    #[arg(long)]
    pub motor_baud: Option<u32>,

    /// Serial port of the gas controllers
    #[arg(long)]
    pub gas_port: Option<String>,

    #[arg(long)]
    pub gas_baud: Option<u32>,

    /// Run against an in-memory register bank instead of serial hardware
    #[arg(long)]
    pub simulate: bool,

    /// Bridge TCP bind address [default: 127.0.0.1:7100]
    #[arg(long)]
    pub bind: Option<String>,

    /// Disable the TCP bridge
    #[arg(long)]
    pub no_bridge: bool,

    /// Reject bridge commands until the client has sent hello
    #[arg(long)]
    pub require_handshake: bool,

    /// Directory bridge save/load names resolve in [default: schedules]
    #[arg(long)]
    pub schedule_dir: Option<PathBuf>,

    /// Snapshot publish interval in milliseconds [default: 500]
    #[arg(long)]
    pub publish_ms: Option<u64>,

    /// Schedule tick interval in milliseconds [default: 1000]
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Do not poll the gas controllers every tick
    #[arg(long)]
    pub no_gas_poll: bool,

    /// Schedule file to load at startup
    #[arg(long)]
    pub schedule: Option<PathBuf>,

    /// Start the schedule as soon as the engine is up
    #[arg(long)]
    pub autostart: bool,

    /// Run for a fixed duration then exit
    #[arg(long)]
    pub run_seconds: Option<u64>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 0.0.0.0:9090)
    #[arg(long)]
    pub metrics_addr: Option<String>,

    /// Append engine events to this JSONL file
    #[arg(long)]
    pub journal: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortSection {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeSection {
    pub enabled: Option<bool>,
    pub bind: Option<String>,
    pub publish_ms: Option<u64>,
    pub require_handshake: Option<bool>,
    pub schedule_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub tick_ms: Option<u64>,
    pub poll_gas: Option<bool>,
    pub schedule: Option<PathBuf>,
    pub autostart: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub json: Option<bool>,
    pub dir: Option<PathBuf>,
    pub journal: Option<PathBuf>,
    pub metrics_addr: Option<String>,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub simulate: Option<bool>,
    pub motor: PortSection,
    pub gas: PortSection,
    pub bridge: BridgeSection,
    pub engine: EngineSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl FileConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub motor_bus: SerialSettings,
    pub gas_bus: SerialSettings,
    pub simulate: bool,
    pub bridge_enabled: bool,
    pub bind_addr: String,
    pub require_handshake: bool,
    pub schedule_dir: PathBuf,
    pub publish_interval: Duration,
    pub tick_interval: Duration,
    pub poll_gas: bool,
    pub schedule: Option<PathBuf>,
    pub autostart: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub journal_path: Option<PathBuf>,
}

fn serial(section: &PortSection, port: Option<String>, baud: Option<u32>, default_baud: u32) -> SerialSettings {
    let port = port
        .or_else(|| section.port.clone())
        .unwrap_or_else(|| DEFAULT_PORT.to_string());
    let mut settings = SerialSettings::new(port, baud.or(section.baud).unwrap_or(default_baud));
    if let Some(ms) = section.timeout_ms {
        settings.timeout = Duration::from_millis(ms);
    }
    settings
}

fn interval(name: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::ZeroInterval(name));
    }
    Ok(Duration::from_millis(ms))
}

impl RuntimeConfig {
    /// Parse the process arguments and the config file they point at.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Flags win over file values, file values over built-in defaults.
    /// Boolean flags can only switch a behavior on (or off, for the `no_`
    /// flags), so an unset flag leaves the file value alone.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let tick_ms = cli.tick_ms.or(file.engine.tick_ms).unwrap_or(1000);
        let publish_ms = cli.publish_ms.or(file.bridge.publish_ms).unwrap_or(500);

        Ok(Self {
            motor_bus: serial(&file.motor, cli.motor_port, cli.motor_baud, DEFAULT_MOTOR_BAUD),
            gas_bus: serial(&file.gas, cli.gas_port, cli.gas_baud, DEFAULT_GAS_BAUD),
            simulate: cli.simulate || file.simulate.unwrap_or(false),
            bridge_enabled: !cli.no_bridge && file.bridge.enabled.unwrap_or(true),
            bind_addr: cli
                .bind
                .or(file.bridge.bind)
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            require_handshake: cli.require_handshake
                || file.bridge.require_handshake.unwrap_or(false),
            schedule_dir: cli
                .schedule_dir
                .or(file.bridge.schedule_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEDULE_DIR)),
            publish_interval: interval("publish interval", publish_ms)?,
            tick_interval: interval("tick interval", tick_ms)?,
            poll_gas: !cli.no_gas_poll && file.engine.poll_gas.unwrap_or(true),
            schedule: cli.schedule.or(file.engine.schedule),
            autostart: cli.autostart || file.engine.autostart.unwrap_or(false),
            run_seconds: cli.run_seconds,
            json_logs: cli.json_logs || file.logging.json.unwrap_or(false),
            log_dir: cli.log_dir.or(file.logging.dir),
            metrics_addr: cli.metrics_addr.or(file.logging.metrics_addr),
            journal_path: cli.journal.or(file.logging.journal),
        })
    }
}
