use crate::engine::{BlockView, CommandedTelemetry, EngineStats, ScheduleEngine};
use crate::gas::GasDeviceData;
use crate::gas_controller::GasId;
use crate::motor::AxisStatus;
use crate::motor_controller::MotorId;
use crate::devices::RigDevices;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of the engine and devices at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub elapsed: u32,
    pub running: bool,
    pub motors_connected: bool,
    pub gas_connected: bool,
    pub commanded: CommandedTelemetry,
    pub motors: BTreeMap<MotorId, AxisStatus>,
    pub gas: BTreeMap<GasId, GasDeviceData>,
    pub blocks: Vec<BlockView>,
    pub stats: EngineStats,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            sequence: 0,
            timestamp_ms: 0,
            elapsed: 0,
            running: false,
            motors_connected: false,
            gas_connected: false,
            commanded: CommandedTelemetry::default(),
            motors: BTreeMap::new(),
            gas: BTreeMap::new(),
            blocks: Vec::new(),
            stats: EngineStats::default(),
        }
    }
}

impl EngineSnapshot {
    pub fn capture(sequence: u64, engine: &ScheduleEngine, devices: &RigDevices) -> Self {
        Self {
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            elapsed: engine.elapsed(),
            running: engine.is_running(),
            motors_connected: devices.motors.is_connected(),
            gas_connected: devices.gas.is_connected(),
            commanded: engine.commanded().clone(),
            motors: devices.motors.all_status(),
            gas: devices.gas.all_data(),
            blocks: engine.block_views(),
            stats: engine.stats(),
        }
    }
}

/// Single-writer snapshot slot. The engine thread publishes; any number of
/// readers take the latest `Arc` without blocking the writer for longer
/// than a pointer swap.
pub struct SnapshotExchange {
    latest: RwLock<Arc<EngineSnapshot>>,
}

impl Default for SnapshotExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotExchange {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(Arc::new(EngineSnapshot::default())),
        }
    }

    pub fn publish(&self, snapshot: EngineSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn latest(&self) -> Arc<EngineSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_keep_their_snapshot_after_publish() {
        let exchange = SnapshotExchange::new();
        let before = exchange.latest();
        exchange.publish(EngineSnapshot {
            sequence: 7,
            elapsed: 3,
            ..EngineSnapshot::default()
        });
        assert_eq!(before.sequence, 0);
        assert_eq!(exchange.latest().sequence, 7);
        assert_eq!(exchange.latest().elapsed, 3);
    }

    #[test]
    fn snapshot_serializes_maps_by_name() {
        let value = serde_json::to_value(EngineSnapshot::default()).unwrap();
        assert_eq!(value["commanded"]["motor_speeds"]["upper_stage"], 0);
        assert_eq!(value["commanded"]["valves_open"]["bpr"], false);
    }
}
