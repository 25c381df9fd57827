//! Modbus RTU link over a local serial port.
//!
//! tokio-modbus is async; the rest of the rig is not. Each open link owns a
//! current-thread runtime and drives one request at a time to completion on
//! it, so callers see a plain blocking [`RegisterBus`].

use rig_core::bus::{BusConnector, BusError, RegisterBus, SerialSettings, SlaveId};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::{debug, info};

pub struct ModbusRtuBus {
    runtime: Runtime,
    ctx: Context,
    port: String,
    timeout: Duration,
}

impl ModbusRtuBus {
    /// Open `settings.port` at 8N1 and attach an RTU client to it.
    pub fn open(settings: &SerialSettings) -> Result<Self, BusError> {
        let fail = |reason: String| BusError::Connection {
            port: settings.port.clone(),
            reason,
        };
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| fail(format!("runtime: {e}")))?;

        let builder = tokio_serial::new(&settings.port, settings.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(settings.timeout);
        // The stream registers with the reactor of the runtime it is opened in.
        let stream = {
            let _guard = runtime.enter();
            SerialStream::open(&builder).map_err(|e| fail(e.to_string()))?
        };
        let ctx = rtu::attach_slave(stream, Slave(1));
        info!(port = %settings.port, baud = settings.baud, "Modbus RTU link attached");

        Ok(Self {
            runtime,
            ctx,
            port: settings.port.clone(),
            timeout: settings.timeout,
        })
    }

    fn call<T, F>(
        runtime: &Runtime,
        timeout: Duration,
        slave: SlaveId,
        request: F,
    ) -> Result<T, BusError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match runtime.block_on(tokio::time::timeout(timeout, request)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BusError::Communication {
                slave,
                reason: e.to_string(),
            }),
            Err(_) => Err(BusError::Communication {
                slave,
                reason: format!("no response within {} ms", timeout.as_millis()),
            }),
        }
    }
}

impl RegisterBus for ModbusRtuBus {
    fn read_holding_registers(
        &mut self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError> {
        self.ctx.set_slave(Slave(slave));
        let words = Self::call(
            &self.runtime,
            self.timeout,
            slave,
            self.ctx.read_holding_registers(address, count),
        )?;
        debug!(slave, address, count, "Holding registers read");
        Ok(words)
    }

    fn write_register(&mut self, slave: SlaveId, address: u16, value: u16) -> Result<(), BusError> {
        self.ctx.set_slave(Slave(slave));
        Self::call(
            &self.runtime,
            self.timeout,
            slave,
            self.ctx.write_single_register(address, value),
        )
    }

    fn write_registers(
        &mut self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), BusError> {
        self.ctx.set_slave(Slave(slave));
        Self::call(
            &self.runtime,
            self.timeout,
            slave,
            self.ctx.write_multiple_registers(address, values),
        )
    }

    // The port itself is released when the bus is dropped.
    fn close(&mut self) {
        info!(port = %self.port, "Modbus RTU link closed");
    }
}

/// Connector for real serial hardware.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtuConnector;

impl BusConnector for RtuConnector {
    fn connect(&self, settings: &SerialSettings) -> Result<Box<dyn RegisterBus>, BusError> {
        Ok(Box::new(ModbusRtuBus::open(settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_is_a_connection_error() {
        let settings = SerialSettings::new("/dev/rig-io-test-no-such-port", 9600);
        match RtuConnector.connect(&settings) {
            Err(BusError::Connection { port, .. }) => assert_eq!(port, settings.port),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("port should not exist"),
        }
    }
}
