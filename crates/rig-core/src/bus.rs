//! Shared serial bus access.
//!
//! A [`Transport`] owns at most one open [`RegisterBus`] and serializes every
//! request through a single mutex, so frames for different slaves never
//! interleave on the half-duplex link. A closed transport fails every call
//! with [`BusError::NotConnected`] without touching the link.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub type SlaveId = u8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("failed to open {port}: {reason}")]
    Connection { port: String, reason: String },
    #[error("bus is not connected")]
    NotConnected,
    #[error("slave {slave}: {reason}")]
    Communication { slave: SlaveId, reason: String },
}

/// Fixed line settings are 8 data bits, no parity, 1 stop bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl SerialSettings {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Two configs describe the same physical bus when port and baud match.
    pub fn same_bus(&self, other: &SerialSettings) -> bool {
        self.port == other.port && self.baud == other.baud
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One open register link. Implementations are driven only through a
/// [`Transport`], which provides the mutual exclusion.
pub trait RegisterBus: Send {
    fn read_holding_registers(
        &mut self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError>;

    fn write_register(&mut self, slave: SlaveId, address: u16, value: u16) -> Result<(), BusError>;

    fn write_registers(
        &mut self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), BusError>;

    fn close(&mut self) {}
}

/// Opens a [`RegisterBus`] for the given settings.
pub trait BusConnector {
    fn connect(&self, settings: &SerialSettings) -> Result<Box<dyn RegisterBus>, BusError>;
}

struct TransportState {
    settings: SerialSettings,
    bus: Option<Box<dyn RegisterBus>>,
}

/// Cloneable handle to one serial bus. All clones share the same gate.
#[derive(Clone)]
pub struct Transport {
    state: Arc<Mutex<TransportState>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Transport")
            .field("settings", &state.settings)
            .field("connected", &state.bus.is_some())
            .finish()
    }
}

impl Transport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                settings,
                bus: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> SerialSettings {
        self.lock().settings.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().bus.is_some()
    }

    /// Open the link. Already-open transports are left untouched.
    pub fn open(&self, connector: &dyn BusConnector) -> Result<(), BusError> {
        let mut state = self.lock();
        if state.bus.is_some() {
            debug!(port = %state.settings.port, "Transport already open");
            return Ok(());
        }
        match connector.connect(&state.settings) {
            Ok(bus) => {
                info!(
                    port = %state.settings.port,
                    baud = state.settings.baud,
                    "Serial transport opened"
                );
                state.bus = Some(bus);
                Ok(())
            }
            Err(e) => {
                warn!(port = %state.settings.port, error = %e, "Serial transport open failed");
                Err(e)
            }
        }
    }

    pub fn close(&self) {
        let mut state = self.lock();
        if let Some(mut bus) = state.bus.take() {
            bus.close();
            info!(port = %state.settings.port, "Serial transport closed");
        }
    }

    fn with_bus<T>(
        &self,
        f: impl FnOnce(&mut dyn RegisterBus) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let mut state = self.lock();
        match state.bus.as_mut() {
            Some(bus) => f(bus.as_mut()),
            None => Err(BusError::NotConnected),
        }
    }

    pub fn read_holding_registers(
        &self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError> {
        let words = self.with_bus(|bus| bus.read_holding_registers(slave, address, count))?;
        if words.len() < count as usize {
            return Err(BusError::Communication {
                slave,
                reason: format!(
                    "short read at {address}: expected {count} registers, got {}",
                    words.len()
                ),
            });
        }
        Ok(words)
    }

    pub fn write_register(&self, slave: SlaveId, address: u16, value: u16) -> Result<(), BusError> {
        self.with_bus(|bus| bus.write_register(slave, address, value))
    }

    pub fn write_registers(
        &self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), BusError> {
        self.with_bus(|bus| bus.write_registers(slave, address, values))
    }
}
