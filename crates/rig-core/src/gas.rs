//! Flow and pressure controllers sharing one register layout.

use crate::bus::{SlaveId, Transport};
use crate::codec::{decode_ascii, decode_f32_be, encode_f32_be};
use crate::error::RigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info_span, warn, Span};

/// Holding register addresses, 0-based.
pub mod registers {
    pub const SETPOINT: u16 = 1350;
    pub const PRESSURE: u16 = 1354;
    pub const TEMPERATURE: u16 = 1360;

    pub const SETPOINT_UNIT: u16 = 1650;
    pub const SETPOINT_DECIMAL: u16 = 1651;
    pub const PRESSURE_UNIT: u16 = 1654;
    pub const PRESSURE_DECIMAL: u16 = 1655;
    pub const TEMPERATURE_UNIT: u16 = 1660;
    pub const TEMPERATURE_DECIMAL: u16 = 1661;

    pub const GAS_INDEX: u16 = 1083;
    pub const GAS_NAME: u16 = 1084;
    pub const GAS_NAME_LEN: u16 = 16;
}

/// Setpoint written to drive a valve fully open.
pub const VALVE_OPEN_SETPOINT: f32 = 10000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasDeviceKind {
    MassFlow,
    BackPressure,
    Gauge,
}

impl GasDeviceKind {
    pub fn supports_setpoint(self) -> bool {
        matches!(self, GasDeviceKind::MassFlow | GasDeviceKind::BackPressure)
    }

    pub fn supports_gas_select(self) -> bool {
        matches!(self, GasDeviceKind::MassFlow)
    }
}

impl fmt::Display for GasDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GasDeviceKind::MassFlow => "mass-flow",
            GasDeviceKind::BackPressure => "back-pressure",
            GasDeviceKind::Gauge => "gauge",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasInfo {
    pub index: u16,
    pub short: &'static str,
    pub name: &'static str,
}

const fn gas(index: u16, short: &'static str, name: &'static str) -> GasInfo {
    GasInfo { index, short, name }
}

pub const GAS_TABLE: [GasInfo; 30] = [
    gas(0, "Air", "Air (Clean Dry)"),
    gas(1, "Ar", "Argon"),
    gas(2, "CH4", "Methane"),
    gas(3, "CO", "Carbon Monoxide"),
    gas(4, "CO2", "Carbon Dioxide"),
    gas(5, "C2H6", "Ethane"),
    gas(6, "H2", "Hydrogen"),
    gas(7, "He", "Helium"),
    gas(8, "N2", "Nitrogen"),
    gas(9, "N2O", "Nitrous Oxide"),
    gas(10, "Ne", "Neon"),
    gas(11, "O2", "Oxygen"),
    gas(12, "C3H8", "Propane"),
    gas(13, "nC4H10", "Normal Butane"),
    gas(14, "C2H2", "Acetylene"),
    gas(15, "C2H4", "Ethylene"),
    gas(16, "iC4H10", "Isobutane"),
    gas(17, "Kr", "Krypton"),
    gas(18, "Xe", "Xenon"),
    gas(19, "SF6", "Sulfur Hexafluoride"),
    gas(20, "C-25", "25% CO2, 75% Ar"),
    gas(21, "C-10", "10% CO2, 90% Ar"),
    gas(22, "C-8", "8% CO2, 92% Ar"),
    gas(23, "C-2", "2% CO2, 98% Ar"),
    gas(24, "C-75", "75% CO2, 25% Ar"),
    gas(25, "He-25", "25% He, 75% Ar"),
    gas(26, "He-75", "75% He, 25% Ar"),
    gas(27, "AT105", "90% He, 7.5% Ar, 2.5% CO2"),
    gas(28, "Star29", "90% Ar, 8% CO2, 2% O2"),
    gas(29, "P-5", "5% CH4, 95% Ar"),
];

pub fn gas_info(index: u16) -> Option<&'static GasInfo> {
    GAS_TABLE.get(index as usize)
}

pub fn gas_label(index: u16) -> String {
    match gas_info(index) {
        Some(info) => info.short.to_string(),
        None => format!("Gas #{index}"),
    }
}

pub fn unit_label(code: u16) -> String {
    let label = match code {
        0 => "SCCM",
        1 => "SLPM",
        2 => "SCFH",
        3 => "SCFM",
        10 => "Pa",
        11 => "kPa",
        12 => "bar",
        13 => "mbar",
        14 => "psi",
        15 => "atm",
        20 => "°C",
        21 => "K",
        22 => "°F",
        other => return format!("Unit {other}"),
    };
    label.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitField {
    Setpoint,
    Pressure,
    Temperature,
}

impl UnitField {
    pub fn register(self) -> u16 {
        match self {
            UnitField::Setpoint => registers::SETPOINT_UNIT,
            UnitField::Pressure => registers::PRESSURE_UNIT,
            UnitField::Temperature => registers::TEMPERATURE_UNIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GasDeviceData {
    pub pressure: f32,
    pub temperature: f32,
    pub setpoint: f32,
    pub gas_index: u16,
    pub gas: String,
    pub pressure_unit: String,
    pub temperature_unit: String,
    pub setpoint_unit: String,
    pub setpoint_decimals: u16,
    pub connected: bool,
    pub last_error: Option<String>,
}

pub struct GasDevice {
    name: &'static str,
    slave: SlaveId,
    kind: GasDeviceKind,
    transport: Transport,
    data: GasDeviceData,
    span: Span,
}

impl GasDevice {
    pub fn new(name: &'static str, slave: SlaveId, kind: GasDeviceKind, transport: Transport) -> Self {
        Self {
            name,
            slave,
            kind,
            transport,
            data: GasDeviceData::default(),
            span: info_span!("gas_device", gas = name, slave),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    pub fn kind(&self) -> GasDeviceKind {
        self.kind
    }

    pub fn data(&self) -> &GasDeviceData {
        &self.data
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.data.connected = connected;
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<(), RigError> {
        if supported {
            Ok(())
        } else {
            Err(RigError::Unsupported {
                operation,
                kind: self.kind,
            })
        }
    }

    fn read_words(&self, address: u16, count: u16) -> Result<Vec<u16>, RigError> {
        Ok(self.transport.read_holding_registers(self.slave, address, count)?)
    }

    fn read_float(&self, address: u16) -> Result<f32, RigError> {
        let words = self.read_words(address, 2)?;
        Ok(decode_f32_be([words[0], words[1]]))
    }

    fn read_word(&self, address: u16) -> Result<u16, RigError> {
        Ok(self.read_words(address, 1)?[0])
    }

    pub fn read_pressure(&mut self) -> Result<f32, RigError> {
        let value = self.read_float(registers::PRESSURE)?;
        self.data.pressure = value;
        Ok(value)
    }

    pub fn read_temperature(&mut self) -> Result<f32, RigError> {
        let value = self.read_float(registers::TEMPERATURE)?;
        self.data.temperature = value;
        Ok(value)
    }

    pub fn read_setpoint(&mut self) -> Result<f32, RigError> {
        self.require(self.kind.supports_setpoint(), "setpoint read")?;
        let value = self.read_float(registers::SETPOINT)?;
        self.data.setpoint = value;
        Ok(value)
    }

    pub fn read_gas_index(&mut self) -> Result<u16, RigError> {
        self.require(self.kind.supports_gas_select(), "gas read")?;
        let index = self.read_word(registers::GAS_INDEX)?;
        self.data.gas_index = index;
        self.data.gas = gas_label(index);
        Ok(index)
    }

    /// Name reported by the device itself, which may differ from the table
    /// for custom mixes.
    pub fn read_gas_name(&self) -> Result<String, RigError> {
        self.require(self.kind.supports_gas_select(), "gas name read")?;
        let words = self.read_words(registers::GAS_NAME, registers::GAS_NAME_LEN)?;
        Ok(decode_ascii(&words))
    }

    pub fn read_unit(&mut self, field: UnitField) -> Result<String, RigError> {
        if field == UnitField::Setpoint {
            self.require(self.kind.supports_setpoint(), "setpoint unit read")?;
        }
        let label = unit_label(self.read_word(field.register())?);
        match field {
            UnitField::Setpoint => self.data.setpoint_unit = label.clone(),
            UnitField::Pressure => self.data.pressure_unit = label.clone(),
            UnitField::Temperature => self.data.temperature_unit = label.clone(),
        }
        Ok(label)
    }

    pub fn read_setpoint_decimals(&mut self) -> Result<u16, RigError> {
        self.require(self.kind.supports_setpoint(), "setpoint decimal read")?;
        let code = self.read_word(registers::SETPOINT_DECIMAL)?;
        self.data.setpoint_decimals = code;
        Ok(code)
    }

    /// Refresh every readable field. A failed field keeps its previous value
    /// and does not stop the remaining reads.
    pub fn read_all(&mut self) -> &GasDeviceData {
        let _enter = self.span.clone().entered();
        let mut failures = Vec::new();
        let mut note = |field: &'static str, result: Result<(), RigError>| {
            if let Err(e) = result {
                warn!(field, error = %e, "Gas field read failed");
                failures.push(format!("{field}: {e}"));
            }
        };

        note("pressure", self.read_pressure().map(drop));
        note("temperature", self.read_temperature().map(drop));
        note("pressure_unit", self.read_unit(UnitField::Pressure).map(drop));
        note("temperature_unit", self.read_unit(UnitField::Temperature).map(drop));
        if self.kind.supports_setpoint() {
            note("setpoint", self.read_setpoint().map(drop));
            note("setpoint_unit", self.read_unit(UnitField::Setpoint).map(drop));
            note("setpoint_decimals", self.read_setpoint_decimals().map(drop));
        }
        if self.kind.supports_gas_select() {
            note("gas", self.read_gas_index().map(drop));
        }

        self.data.connected = self.transport.is_connected();
        self.data.last_error = failures.pop();
        debug!(
            pressure = self.data.pressure,
            temperature = self.data.temperature,
            setpoint = self.data.setpoint,
            "Gas device polled"
        );
        &self.data
    }

    pub fn write_setpoint(&mut self, value: f32) -> Result<(), RigError> {
        self.require(self.kind.supports_setpoint(), "setpoint write")?;
        let _enter = self.span.enter();
        let words = encode_f32_be(value);
        match self
            .transport
            .write_registers(self.slave, registers::SETPOINT, &words)
        {
            Ok(()) => {
                debug!(setpoint = value, "Setpoint written");
                self.data.setpoint = value;
                Ok(())
            }
            Err(e) => {
                warn!(setpoint = value, error = %e, "Setpoint write failed");
                self.data.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    pub fn write_gas(&mut self, index: u16) -> Result<(), RigError> {
        self.require(self.kind.supports_gas_select(), "gas select")?;
        let _enter = self.span.enter();
        match self
            .transport
            .write_register(self.slave, registers::GAS_INDEX, index)
        {
            Ok(()) => {
                debug!(gas_index = index, gas = %gas_label(index), "Gas selected");
                self.data.gas_index = index;
                self.data.gas = gas_label(index);
                Ok(())
            }
            Err(e) => {
                warn!(gas_index = index, error = %e, "Gas select failed");
                self.data.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Only the setpoint and pressure units are writable.
    pub fn write_unit(&mut self, field: UnitField, code: u16) -> Result<(), RigError> {
        match field {
            UnitField::Setpoint => self.require(self.kind.supports_setpoint(), "setpoint unit write")?,
            UnitField::Pressure => {}
            UnitField::Temperature => self.require(false, "temperature unit write")?,
        }
        let _enter = self.span.enter();
        if let Err(e) = self
            .transport
            .write_register(self.slave, field.register(), code)
        {
            warn!(unit_code = code, error = %e, "Unit write failed");
            self.data.last_error = Some(e.to_string());
            return Err(e.into());
        }
        let label = unit_label(code);
        debug!(unit_code = code, unit = %label, "Unit written");
        match field {
            UnitField::Setpoint => self.data.setpoint_unit = label,
            UnitField::Pressure => self.data.pressure_unit = label,
            UnitField::Temperature => {}
        }
        Ok(())
    }

    pub fn set_valve_open(&mut self) -> Result<(), RigError> {
        self.write_setpoint(VALVE_OPEN_SETPOINT)
    }

    pub fn set_valve_close(&mut self) -> Result<(), RigError> {
        self.write_setpoint(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SerialSettings;
    use crate::bus_sim::SimulatedBus;

    fn device(kind: GasDeviceKind) -> (GasDevice, SimulatedBus) {
        let sim = SimulatedBus::with_lab_defaults();
        let transport = Transport::new(SerialSettings::new("sim", 19200));
        transport.open(&sim).unwrap();
        (GasDevice::new("mfc", 5, kind, transport), sim)
    }

    #[test]
    fn table_entries_are_indexed_by_position() {
        for (i, info) in GAS_TABLE.iter().enumerate() {
            assert_eq!(info.index as usize, i);
        }
        assert_eq!(gas_label(8), "N2");
        assert_eq!(gas_info(29).map(|g| g.name), Some("5% CH4, 95% Ar"));
    }

    #[test]
    fn unknown_codes_render_generically() {
        assert_eq!(gas_label(42), "Gas #42");
        assert_eq!(unit_label(12), "bar");
        assert_eq!(unit_label(20), "°C");
        assert_eq!(unit_label(7), "Unit 7");
    }

    #[test]
    fn read_all_decodes_every_field() {
        let (mut dev, _sim) = device(GasDeviceKind::MassFlow);
        let data = dev.read_all().clone();
        assert!((data.pressure - 1.013).abs() < 1e-6);
        assert_eq!(data.temperature, 24.5);
        assert_eq!(data.gas_index, 8);
        assert_eq!(data.gas, "N2");
        assert_eq!(data.pressure_unit, "bar");
        assert_eq!(data.temperature_unit, "°C");
        assert_eq!(data.setpoint_unit, "SLPM");
        assert_eq!(data.setpoint_decimals, 2);
        assert!(data.connected);
        assert_eq!(data.last_error, None);
    }

    #[test]
    fn failed_field_keeps_previous_value() {
        let (mut dev, sim) = device(GasDeviceKind::MassFlow);
        dev.read_all();
        sim.set_float(5, registers::PRESSURE, 2.0);
        sim.set_float(5, registers::TEMPERATURE, 30.0);
        sim.set_float(5, registers::SETPOINT, 4.25);
        sim.set_register(5, registers::GAS_INDEX, 1);
        sim.fail_reads_at(5, registers::PRESSURE);

        let data = dev.read_all().clone();
        assert!((data.pressure - 1.013).abs() < 1e-6);
        assert_eq!(data.temperature, 30.0);
        assert_eq!(data.setpoint, 4.25);
        assert_eq!(data.gas_index, 1);
        assert_eq!(data.gas, "Ar");
        assert!(data.last_error.is_some());
    }

    #[test]
    fn unsupported_writes_do_no_io() {
        let (mut gauge, sim) = device(GasDeviceKind::Gauge);
        sim.clear_calls();
        assert!(matches!(gauge.write_setpoint(1.0), Err(RigError::Unsupported { .. })));
        assert!(matches!(gauge.set_valve_open(), Err(RigError::Unsupported { .. })));
        assert!(matches!(gauge.write_gas(1), Err(RigError::Unsupported { .. })));

        assert!(sim.calls().is_empty());

        let (mut bpr, bpr_sim) = device(GasDeviceKind::BackPressure);
        bpr_sim.clear_calls();
        assert!(matches!(bpr.write_gas(1), Err(RigError::Unsupported { .. })));
        assert!(matches!(
            bpr.write_unit(UnitField::Temperature, 21),
            Err(RigError::Unsupported { .. })
        ));
        assert!(bpr_sim.calls().is_empty());
    }

    #[test]
    fn failed_unit_write_records_error() {
        let (mut dev, sim) = device(GasDeviceKind::MassFlow);
        dev.read_all();
        sim.fail_writes_at(5, registers::PRESSURE_UNIT);

        let err = dev.write_unit(UnitField::Pressure, 14).unwrap_err();
        assert!(err.is_communication());
        assert_eq!(dev.data().pressure_unit, "bar");
        assert!(dev.data().last_error.is_some());

        dev.write_unit(UnitField::Setpoint, 0).unwrap();
        assert_eq!(dev.data().setpoint_unit, "SCCM");
    }

    #[test]
    fn gauge_poll_skips_setpoint_and_gas() {
        let (mut gauge, sim) = device(GasDeviceKind::Gauge);
        sim.clear_calls();
        gauge.read_all();
        assert_eq!(sim.calls().len(), 4);
    }

    #[test]
    fn valve_helpers_write_setpoint_floats() {
        let (mut dev, sim) = device(GasDeviceKind::MassFlow);
        dev.set_valve_open().unwrap();
        assert_eq!(
            sim.writes_to(5, registers::SETPOINT),
            vec![encode_f32_be(10000.0).to_vec()]
        );
        dev.set_valve_close().unwrap();
        assert_eq!(dev.data().setpoint, 0.0);
        assert_eq!(sim.register(5, registers::SETPOINT), Some(0));
    }

    #[test]
    fn gas_name_block_is_decoded() {
        let (dev, sim) = device(GasDeviceKind::MassFlow);
        sim.set_ascii(5, registers::GAS_NAME, "Star29");
        assert_eq!(dev.read_gas_name().unwrap(), "Star29");
    }

    #[test]
    fn write_gas_updates_label() {
        let (mut dev, sim) = device(GasDeviceKind::MassFlow);
        dev.write_gas(1).unwrap();
        assert_eq!(dev.data().gas, "Ar");
        assert_eq!(sim.register(5, registers::GAS_INDEX), Some(1));
    }
}
