pub mod bus;
#[cfg(any(test, feature = "simulation"))]
pub mod bus_sim;
pub mod codec;
mod codec_proptest;
pub mod devices;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod gas;
pub mod gas_controller;
pub mod motor;
pub mod motor_controller;
pub mod publisher;
pub mod runner;
pub mod schedule;
pub mod units;

pub use bus::{BusConnector, BusError, RegisterBus, SerialSettings, SlaveId, Transport};
#[cfg(any(test, feature = "simulation"))]
pub use bus_sim::SimulatedBus;
pub use devices::RigDevices;
pub use engine::{CommandedTelemetry, Dispatcher, EngineEvent, EngineObserver, EngineStats, ScheduleEngine};
pub use error::RigError;
pub use exchange::{EngineSnapshot, SnapshotExchange};
pub use gas::{GasDevice, GasDeviceData, GasDeviceKind, UnitField};
pub use gas_controller::{GasController, GasId};
pub use motor::{Axis, AxisStatus, Direction, MotorDriver, StopMode};
pub use motor_controller::{parse_direction, MotorController, MotorId};
pub use publisher::{spawn_publisher, SnapshotObserver};
pub use runner::{EngineConfig, EngineHandle, EngineRunner};
pub use schedule::{Action, BlockId, DeviceId, Schedule, ScheduleBlock, ScheduleFile};
