use crate::bus::{BusConnector, BusError, RegisterBus, SerialSettings, SlaveId};
use crate::codec::encode_f32_be;
use crate::gas::registers;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One request seen by the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Read { slave: SlaveId, address: u16, count: u16 },
    Write { slave: SlaveId, address: u16, values: Vec<u16> },
}

impl BusCall {
    pub fn slave(&self) -> SlaveId {
        match self {
            BusCall::Read { slave, .. } | BusCall::Write { slave, .. } => *slave,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    memory: HashMap<(SlaveId, u16), u16>,
    failing_reads: HashSet<(SlaveId, u16)>,
    failing_writes: HashSet<(SlaveId, u16)>,
    offline: HashSet<SlaveId>,
    calls: Vec<BusCall>,
}

/// In-memory register map standing in for the RS-485 bus.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the transport owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus preloaded with plausible readings for the two gas slaves.
    pub fn with_lab_defaults() -> Self {
        let sim = Self::new();
        for (slave, pressure) in [(5u8, 1.013f32), (6u8, 1.250f32)] {
            sim.set_float(slave, registers::PRESSURE, pressure);
            sim.set_float(slave, registers::TEMPERATURE, 24.5);
            sim.set_float(slave, registers::SETPOINT, 0.0);
            sim.set_register(slave, registers::PRESSURE_UNIT, 12);
            sim.set_register(slave, registers::TEMPERATURE_UNIT, 20);
            sim.set_register(slave, registers::SETPOINT_UNIT, 1);
            sim.set_register(slave, registers::SETPOINT_DECIMAL, 2);
            sim.set_register(slave, registers::GAS_INDEX, 8);
            sim.set_ascii(slave, registers::GAS_NAME, "N2");
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_register(&self, slave: SlaveId, address: u16, value: u16) {
        self.lock().memory.insert((slave, address), value);
    }

    pub fn set_float(&self, slave: SlaveId, address: u16, value: f32) {
        let [hi, lo] = encode_f32_be(value);
        let mut state = self.lock();
        state.memory.insert((slave, address), hi);
        state.memory.insert((slave, address + 1), lo);
    }

    pub fn set_ascii(&self, slave: SlaveId, address: u16, text: &str) {
        let bytes = text.as_bytes();
        let mut state = self.lock();
        for (i, pair) in bytes.chunks(2).enumerate() {
            let hi = pair[0];
            let lo = pair.get(1).copied().unwrap_or(0);
            state
                .memory
                .insert((slave, address + i as u16), u16::from_be_bytes([hi, lo]));
        }
    }

    pub fn register(&self, slave: SlaveId, address: u16) -> Option<u16> {
        self.lock().memory.get(&(slave, address)).copied()
    }

    /// Reads touching `address` on `slave` fail with a communication error.
    pub fn fail_reads_at(&self, slave: SlaveId, address: u16) {
        self.lock().failing_reads.insert((slave, address));
    }

    pub fn fail_writes_at(&self, slave: SlaveId, address: u16) {
        self.lock().failing_writes.insert((slave, address));
    }

    /// Every request to `slave` fails, as if the device were unpowered.
    pub fn take_offline(&self, slave: SlaveId) {
        self.lock().offline.insert(slave);
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Values written to `address` on `slave`, oldest first.
    pub fn writes_to(&self, slave: SlaveId, address: u16) -> Vec<Vec<u16>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BusCall::Write {
                    slave: s,
                    address: a,
                    values,
                } if *s == slave && *a == address => Some(values.clone()),
                _ => None,
            })
            .collect()
    }
}

fn timeout(slave: SlaveId) -> BusError {
    BusError::Communication {
        slave,
        reason: "response timed out".into(),
    }
}

impl RegisterBus for SimulatedBus {
    fn read_holding_registers(
        &mut self,
        slave: SlaveId,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, BusError> {
        let mut state = self.lock();
        state.calls.push(BusCall::Read {
            slave,
            address,
            count,
        });
        let span = address..address.saturating_add(count);
        if state.offline.contains(&slave)
            || span.clone().any(|a| state.failing_reads.contains(&(slave, a)))
        {
            return Err(timeout(slave));
        }
        Ok(span
            .map(|a| state.memory.get(&(slave, a)).copied().unwrap_or(0))
            .collect())
    }

    fn write_register(&mut self, slave: SlaveId, address: u16, value: u16) -> Result<(), BusError> {
        self.write_registers(slave, address, &[value])
    }

    fn write_registers(
        &mut self,
        slave: SlaveId,
        address: u16,
        values: &[u16],
    ) -> Result<(), BusError> {
        let mut state = self.lock();
        state.calls.push(BusCall::Write {
            slave,
            address,
            values: values.to_vec(),
        });
        if state.offline.contains(&slave) || state.failing_writes.contains(&(slave, address)) {
            return Err(timeout(slave));
        }
        for (i, value) in values.iter().enumerate() {
            state.memory.insert((slave, address + i as u16), *value);
        }
        Ok(())
    }
}

impl BusConnector for SimulatedBus {
    fn connect(&self, _settings: &SerialSettings) -> Result<Box<dyn RegisterBus>, BusError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_f32_be;

    #[test]
    fn reads_unset_registers_as_zero() {
        let mut sim = SimulatedBus::new();
        assert_eq!(sim.read_holding_registers(1, 10, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn failure_injection_covers_multi_register_reads() {
        let mut sim = SimulatedBus::with_lab_defaults();
        sim.fail_reads_at(5, registers::PRESSURE + 1);
        assert!(sim.read_holding_registers(5, registers::PRESSURE, 2).is_err());
        let temp = sim.read_holding_registers(5, registers::TEMPERATURE, 2).unwrap();
        assert_eq!(decode_f32_be([temp[0], temp[1]]), 24.5);
    }

    #[test]
    fn offline_slave_rejects_everything() {
        let mut sim = SimulatedBus::new();
        sim.take_offline(2);
        assert!(sim.write_register(2, 0, 0x0101).is_err());
        assert!(sim.write_register(1, 0, 0x0101).is_ok());
        assert_eq!(sim.calls().len(), 2);
    }
}
