pub mod bridge;
pub mod metrics;
pub mod modbus_rtu;
pub mod protocol;

pub use bridge::{Bridge, BridgeConfig};
pub use metrics::{init_metrics, serve_metrics, MetricsError, MetricsObserver};
pub use modbus_rtu::{ModbusRtuBus, RtuConnector};
pub use protocol::{IncomingMessage, ProtocolError, ProtocolVersion, SnapshotMsg};
