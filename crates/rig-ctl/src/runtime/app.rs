use crate::infra::journal::{JournalKind, JournalObserver, RunJournal};
use crate::runtime::config::{ConfigError, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use rig_core::bus::{BusConnector, Transport};
use rig_core::bus_sim::SimulatedBus;
use rig_core::devices::RigDevices;
use rig_core::engine::ScheduleEngine;
use rig_core::error::RigError;
use rig_core::exchange::SnapshotExchange;
use rig_core::gas_controller::GasController;
use rig_core::motor_controller::MotorController;
use rig_core::publisher::spawn_publisher;
use rig_core::runner::{EngineConfig, EngineRunner};
use rig_core::schedule::ScheduleFile;
use rig_io::bridge::{Bridge, BridgeConfig};
use rig_io::metrics::MetricsError;
use rig_io::modbus_rtu::RtuConnector;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot open journal {path}: {source}")]
    Journal {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot bind bridge on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("serial bus unavailable: {0}")]
    Serial(RigError),
    #[error("cannot load schedule {path}: {source}")]
    Schedule { path: PathBuf, source: RigError },
    #[error("cannot spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        source: std::io::Error,
    },
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet.
            eprintln!("rig-ctl: {}", StartupError::from(e));
            return ExitCode::from(2);
        }
    };
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

fn spawn_err(what: &'static str) -> impl FnOnce(std::io::Error) -> StartupError {
    move |source| StartupError::Spawn { what, source }
}

pub fn run(config: RuntimeConfig) -> Result<(), StartupError> {
    telemetry::init();
    let stop = Arc::new(AtomicBool::new(false));
    let metrics_handle = telemetry::start_metrics_server(config.metrics_addr.as_deref(), &stop)?;

    let journal = open_journal(config.journal_path.as_deref())?;
    if let Some(journal) = &journal {
        let _ = journal.record(
            JournalKind::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "simulate": config.simulate,
                "motor_port": config.motor_bus.port,
                "gas_port": config.gas_bus.port,
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": config.metrics_addr.is_some(),
            }),
        );
    }

    let bridge = if config.bridge_enabled {
        let bridge_config = BridgeConfig {
            bind_addr: config.bind_addr.clone(),
            publish_interval: config.publish_interval,
            require_handshake: config.require_handshake,
            schedule_dir: config.schedule_dir.clone(),
        };
        let bridge = Bridge::bind(bridge_config).map_err(|source| StartupError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
        Some(bridge)
    } else {
        info!("Bridge disabled");
        None
    };

    let mut devices = build_devices(&config);
    connect_devices(&mut devices, &config)?;

    let mut engine = ScheduleEngine::new();
    if let Some(journal) = &journal {
        engine.add_observer(Box::new(JournalObserver(Arc::clone(journal))));
    }
    if let Some(path) = &config.schedule {
        let schedule = ScheduleFile::load(path).map_err(|source| StartupError::Schedule {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), blocks = schedule.len(), "Startup schedule loaded");
        engine.replace_schedule(schedule);
    }

    info!(
        tick_ms = config.tick_interval.as_millis() as u64,
        publish_ms = config.publish_interval.as_millis() as u64,
        poll_gas = config.poll_gas,
        "Starting schedule engine"
    );
    let exchange = Arc::new(SnapshotExchange::new());
    let (handle, engine_join) = EngineRunner::spawn(
        engine,
        devices,
        EngineConfig {
            tick_interval: config.tick_interval,
            poll_gas: config.poll_gas,
        },
        Arc::clone(&exchange),
    )
    .map_err(spawn_err("engine"))?;

    let publisher_join = spawn_publisher(
        exchange,
        config.publish_interval,
        telemetry::observers(),
        Arc::clone(&stop),
    )
    .map_err(spawn_err("publisher"))?;

    let bridge_join = match bridge {
        Some(bridge) => {
            let engine = handle.clone();
            let stop_bridge = Arc::clone(&stop);
            let join = thread::Builder::new()
                .name("bridge".into())
                .spawn(move || bridge.run(engine, stop_bridge))
                .map_err(spawn_err("bridge"))?;
            Some(join)
        }
        None => None,
    };

    if config.autostart {
        match handle.start() {
            Ok(()) => info!("Schedule autostarted"),
            Err(e) => warn!(error = %e, "Autostart failed"),
        }
    }

    info!("rig-ctl running");

    let Some(seconds) = config.run_seconds else {
        // Runs until the process is killed.
        let _ = engine_join.join();
        return Ok(());
    };
    info!(seconds, "Running for limited duration");
    thread::sleep(Duration::from_secs(seconds));

    stop.store(true, Ordering::Relaxed);
    if let Some(join) = bridge_join {
        let _ = join.join();
    }
    handle.shutdown();
    let mut devices = match engine_join.join() {
        Ok(devices) => Some(devices),
        Err(_) => {
            error!("Engine thread panicked");
            None
        }
    };
    let final_snapshot = handle.snapshot();
    let _ = publisher_join.join();
    if let Some(join) = metrics_handle {
        let _ = join.join();
    }
    if let Some(devices) = devices.as_mut() {
        devices.disconnect();
    }

    let stats = final_snapshot.stats;
    info!(
        ticks = stats.ticks,
        dispatched = stats.dispatched,
        dispatch_failures = stats.dispatch_failures,
        late_ticks = stats.late_ticks,
        "Run complete"
    );
    if let Some(journal) = &journal {
        let _ = journal.record(
            JournalKind::SystemShutdown,
            serde_json::json!({
                "elapsed": final_snapshot.elapsed,
                "ticks": stats.ticks,
                "dispatched": stats.dispatched,
                "dispatch_failures": stats.dispatch_failures,
            }),
        );
    }
    Ok(())
}

/// Both controller groups share one transport when their settings name the
/// same port and baud rate.
fn build_devices(config: &RuntimeConfig) -> RigDevices {
    let motor_transport = Transport::new(config.motor_bus.clone());
    let gas_transport = if config.gas_bus.same_bus(&config.motor_bus) {
        info!(port = %config.motor_bus.port, "Motor and gas controllers share one bus");
        motor_transport.clone()
    } else {
        Transport::new(config.gas_bus.clone())
    };
    RigDevices::new(
        MotorController::new(motor_transport),
        GasController::new(gas_transport),
    )
}

fn connect_devices(devices: &mut RigDevices, config: &RuntimeConfig) -> Result<(), StartupError> {
    let connector: Box<dyn BusConnector> = if config.simulate {
        info!("Using simulated register bus");
        Box::new(SimulatedBus::with_lab_defaults())
    } else {
        Box::new(RtuConnector)
    };
    devices
        .connect(connector.as_ref(), connector.as_ref())
        .map_err(StartupError::Serial)
}

fn open_journal(path: Option<&Path>) -> Result<Option<Arc<RunJournal>>, StartupError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let journal = RunJournal::open(path).map_err(|source| StartupError::Journal {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Run journal enabled");
    Ok(Some(Arc::new(journal)))
}
