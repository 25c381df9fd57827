use crate::exchange::{EngineSnapshot, SnapshotExchange};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// Consumer of published snapshots (metrics, display, logs).
pub trait SnapshotObserver: Send {
    fn on_snapshot(&mut self, snapshot: &EngineSnapshot);
}

/// Read the exchange every `interval` and hand each snapshot not seen
/// before to every observer, in order.
pub fn spawn_publisher(
    exchange: Arc<SnapshotExchange>,
    interval: Duration,
    mut observers: Vec<Box<dyn SnapshotObserver>>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("snapshot-publisher".into())
        .spawn(move || {
            let mut last_sequence = None;
            while !stop.load(Ordering::Relaxed) {
                let snapshot = exchange.latest();
                if last_sequence != Some(snapshot.sequence) {
                    last_sequence = Some(snapshot.sequence);
                    for observer in observers.iter_mut() {
                        observer.on_snapshot(&snapshot);
                    }
                }
                thread::sleep(interval);
            }
        })
}
