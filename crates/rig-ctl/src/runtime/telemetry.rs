use rig_core::exchange::EngineSnapshot;
use rig_core::publisher::SnapshotObserver;
use rig_io::metrics::{init_metrics, serve_metrics, MetricsError, MetricsObserver};
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use tracing::{debug, info, warn};

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(
    addr: Option<&str>,
    stop: &Arc<AtomicBool>,
) -> Result<Option<thread::JoinHandle<()>>, MetricsError> {
    match addr {
        Some(addr) => serve_metrics(addr, Arc::clone(stop)).map(Some),
        None => Ok(None),
    }
}

/// Snapshot observers every run gets.
pub fn observers() -> Vec<Box<dyn SnapshotObserver>> {
    vec![Box::new(MetricsObserver::new()), Box::new(LogObserver::default())]
}

/// Logs state changes seen in the snapshot stream: run/stop, device
/// connectivity and each schedule second while running.
#[derive(Debug, Default)]
pub struct LogObserver {
    last: Option<Seen>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    running: bool,
    elapsed: u32,
    motors_connected: bool,
    gas_connected: bool,
    dispatch_failures: u64,
}

impl Seen {
    fn of(snapshot: &EngineSnapshot) -> Self {
        Self {
            running: snapshot.running,
            elapsed: snapshot.elapsed,
            motors_connected: snapshot.motors_connected,
            gas_connected: snapshot.gas_connected,
            dispatch_failures: snapshot.stats.dispatch_failures,
        }
    }
}

impl SnapshotObserver for LogObserver {
    fn on_snapshot(&mut self, snapshot: &EngineSnapshot) {
        let now = Seen::of(snapshot);
        let before = self.last.replace(now);

        if before.map(|b| (b.motors_connected, b.gas_connected))
            != Some((now.motors_connected, now.gas_connected))
        {
            info!(
                motors = now.motors_connected,
                gas = now.gas_connected,
                "Device connectivity"
            );
        }
        if before.map(|b| b.running) != Some(now.running) {
            info!(
                running = now.running,
                elapsed = now.elapsed,
                blocks = snapshot.blocks.len(),
                "Schedule state"
            );
        }
        if let Some(b) = before {
            if now.dispatch_failures > b.dispatch_failures {
                warn!(
                    failures = now.dispatch_failures - b.dispatch_failures,
                    elapsed = now.elapsed,
                    "Dispatch failures since last snapshot"
                );
            }
        }
        if now.running && before.map(|b| b.elapsed) != Some(now.elapsed) {
            debug!(
                elapsed = now.elapsed,
                speeds = ?snapshot.commanded.motor_speeds,
                valves = ?snapshot.commanded.valves_open,
                "Schedule second"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_observer_tracks_last_snapshot() {
        let mut observer = LogObserver::default();
        let mut snapshot = EngineSnapshot::default();
        observer.on_snapshot(&snapshot);
        snapshot.running = true;
        snapshot.elapsed = 3;
        observer.on_snapshot(&snapshot);
        let last = observer.last.unwrap();
        assert!(last.running);
        assert_eq!(last.elapsed, 3);
    }

    #[test]
    fn no_metrics_address_starts_nothing() {
        let stop = Arc::new(AtomicBool::new(false));
        assert!(start_metrics_server(None, &stop).unwrap().is_none());
    }
}
