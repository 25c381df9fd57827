//! Prometheus metrics for the rig.

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use rig_core::engine::EngineStats;
use rig_core::exchange::EngineSnapshot;
use rig_core::publisher::SnapshotObserver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Response, Server};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!(error = %e, "Metric registration failed; collector stays unexported");
    }
    collector
}

fn counter(name: &str, help: &str) -> IntCounter {
    register(IntCounter::new(name, help).expect("valid counter definition"))
}

fn gauge(name: &str, help: &str) -> Gauge {
    register(Gauge::new(name, help).expect("valid gauge definition"))
}

fn gauge_vec(name: &str, help: &str, label: &str) -> GaugeVec {
    register(GaugeVec::new(Opts::new(name, help), &[label]).expect("valid gauge definition"))
}

// Engine

pub static TICKS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("labrig_ticks_total", "Schedule ticks executed"));

pub static LATE_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "labrig_late_ticks_total",
        "Ticks that started more than one interval late",
    )
});

pub static DISPATCHED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("labrig_blocks_dispatched_total", "Blocks dispatched successfully"));

pub static DISPATCH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "labrig_dispatch_failures_total",
        "Blocks whose device command failed",
    )
});

pub static ELAPSED_SECONDS: LazyLock<IntGauge> = LazyLock::new(|| {
    register(IntGauge::new("labrig_elapsed_seconds", "Schedule clock").expect("valid gauge definition"))
});

pub static RUNNING: LazyLock<Gauge> =
    LazyLock::new(|| gauge("labrig_running", "Schedule running (1) or stopped (0)"));

pub static BLOCKS: LazyLock<Gauge> =
    LazyLock::new(|| gauge("labrig_blocks", "Blocks in the current schedule"));

pub static SNAPSHOTS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("labrig_snapshots_total", "Snapshots seen by the publisher"));

// Devices

pub static COMMANDED_SPEED: LazyLock<GaugeVec> = LazyLock::new(|| {
    gauge_vec(
        "labrig_commanded_speed_pps",
        "Speed the schedule commands per motor",
        "motor",
    )
});

pub static MOTOR_RUNNING: LazyLock<GaugeVec> = LazyLock::new(|| {
    gauge_vec("labrig_motor_running", "Axis running (1) or idle (0)", "motor")
});

pub static GAS_PRESSURE: LazyLock<GaugeVec> =
    LazyLock::new(|| gauge_vec("labrig_gas_pressure", "Last pressure reading", "gas"));

pub static GAS_TEMPERATURE: LazyLock<GaugeVec> =
    LazyLock::new(|| gauge_vec("labrig_gas_temperature", "Last temperature reading", "gas"));

pub static GAS_SETPOINT: LazyLock<GaugeVec> =
    LazyLock::new(|| gauge_vec("labrig_gas_setpoint", "Last setpoint reading", "gas"));

// Bridge

pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "labrig_bridge_connected",
        "Bridge client connection status (1=connected, 0=disconnected)",
    )
});

pub static BRIDGE_COMMANDS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("labrig_bridge_commands_total", "Bridge requests by type"),
            &["type"],
        )
        .expect("valid counter definition"),
    )
});

pub static BRIDGE_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "labrig_bridge_rejected_total",
        "Bridge requests that could not be parsed or failed",
    )
});

/// Force every static into the registry so the first scrape lists them all.
pub fn init_metrics() {
    let _ = TICKS.get();
    let _ = LATE_TICKS.get();
    let _ = DISPATCHED.get();
    let _ = DISPATCH_FAILURES.get();
    let _ = ELAPSED_SECONDS.get();
    let _ = RUNNING.get();
    let _ = BLOCKS.get();
    let _ = SNAPSHOTS.get();
    let _ = &*COMMANDED_SPEED;
    let _ = &*MOTOR_RUNNING;
    let _ = &*GAS_PRESSURE;
    let _ = &*GAS_TEMPERATURE;
    let _ = &*GAS_SETPOINT;
    let _ = BRIDGE_CONNECTED.get();
    let _ = &*BRIDGE_COMMANDS;
    let _ = BRIDGE_REJECTED.get();
}

/// Mirrors each published snapshot into the registry. Engine totals are
/// cumulative, so counters advance by the difference to the last snapshot.
#[derive(Default)]
pub struct MetricsObserver {
    last: EngineStats,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn advance(counter: &IntCounter, now: u64, before: u64) {
    if now > before {
        counter.inc_by(now - before);
    }
}

impl SnapshotObserver for MetricsObserver {
    fn on_snapshot(&mut self, snapshot: &EngineSnapshot) {
        let stats = snapshot.stats;
        // A fresh engine restarts its totals; treat that as a new baseline.
        if stats.ticks < self.last.ticks {
            self.last = EngineStats::default();
        }
        advance(&TICKS, stats.ticks, self.last.ticks);
        advance(&LATE_TICKS, stats.late_ticks, self.last.late_ticks);
        advance(&DISPATCHED, stats.dispatched, self.last.dispatched);
        advance(&DISPATCH_FAILURES, stats.dispatch_failures, self.last.dispatch_failures);
        self.last = stats;

        SNAPSHOTS.inc();
        ELAPSED_SECONDS.set(snapshot.elapsed as i64);
        RUNNING.set(if snapshot.running { 1.0 } else { 0.0 });
        BLOCKS.set(snapshot.blocks.len() as f64);

        for (motor, speed) in &snapshot.commanded.motor_speeds {
            COMMANDED_SPEED
                .with_label_values(&[motor.as_str()])
                .set(*speed as f64);
        }
        for (motor, status) in &snapshot.motors {
            MOTOR_RUNNING
                .with_label_values(&[motor.as_str()])
                .set(if status.running { 1.0 } else { 0.0 });
        }
        for (gas, data) in &snapshot.gas {
            let label = [gas.as_str()];
            GAS_PRESSURE.with_label_values(&label).set(data.pressure as f64);
            GAS_TEMPERATURE
                .with_label_values(&label)
                .set(data.temperature as f64);
            GAS_SETPOINT.with_label_values(&label).set(data.setpoint as f64);
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to start metrics server on {addr}: {reason}")]
pub struct MetricsError {
    pub addr: String,
    pub reason: String,
}

/// Bind the metrics endpoint and serve it on a background thread until
/// `stop` is set.
pub fn serve_metrics(
    bind_addr: &str,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, MetricsError> {
    let server = Server::http(bind_addr).map_err(|e| MetricsError {
        addr: bind_addr.to_string(),
        reason: e.to_string(),
    })?;
    tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

    thread::Builder::new()
        .name("metrics".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let request = match server.recv_timeout(Duration::from_millis(200)) {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Metrics server receive failed");
                        continue;
                    }
                };
                let response = match request.url() {
                    "/metrics" => {
                        let mut buffer = Vec::new();
                        match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                            Ok(()) => {
                                let mut response = Response::from_data(buffer);
                                if let Ok(header) = Header::from_bytes(
                                    &b"Content-Type"[..],
                                    &b"text/plain; version=0.0.4"[..],
                                ) {
                                    response = response.with_header(header);
                                }
                                response
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to encode metrics");
                                Response::from_string("Internal Server Error")
                                    .with_status_code(500)
                            }
                        }
                    }
                    "/health" => Response::from_string("OK"),
                    // Ready once the engine has published at least once.
                    "/ready" if SNAPSHOTS.get() > 0 => {
                        Response::from_string("Ready")
                    }
                    "/ready" => Response::from_string("Not Ready")
                        .with_status_code(503)
                        ,
                    _ => Response::from_string("Not Found")
                        .with_status_code(404)
                        ,
                };
                let _ = request.respond(response);
            }
        })
        .map_err(|e| MetricsError {
            addr: bind_addr.to_string(),
            reason: e.to_string(),
        })
}
