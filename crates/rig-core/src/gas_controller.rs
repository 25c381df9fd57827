use crate::bus::{BusConnector, SlaveId, Transport};
use crate::error::RigError;
use crate::gas::{GasDevice, GasDeviceData, GasDeviceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{info, info_span, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasId {
    Mfc,
    Bpr,
}

impl GasId {
    pub const ALL: [GasId; 2] = [GasId::Mfc, GasId::Bpr];

    pub fn as_str(self) -> &'static str {
        match self {
            GasId::Mfc => "mfc",
            GasId::Bpr => "bpr",
        }
    }

    pub fn slave(self) -> SlaveId {
        match self {
            GasId::Mfc => 5,
            GasId::Bpr => 6,
        }
    }

    pub fn kind(self) -> GasDeviceKind {
        match self {
            GasId::Mfc => GasDeviceKind::MassFlow,
            GasId::Bpr => GasDeviceKind::BackPressure,
        }
    }
}

impl fmt::Display for GasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GasId {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GasId::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| RigError::UnknownDevice(s.to_string()))
    }
}

pub struct GasController {
    transport: Transport,
    mfc: GasDevice,
    bpr: GasDevice,
    span: Span,
}

impl GasController {
    pub fn new(transport: Transport) -> Self {
        let device = |id: GasId| GasDevice::new(id.as_str(), id.slave(), id.kind(), transport.clone());
        Self {
            mfc: device(GasId::Mfc),
            bpr: device(GasId::Bpr),
            transport,
            span: info_span!("gas"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connect(&mut self, connector: &dyn BusConnector) -> Result<(), RigError> {
        self.transport.open(connector)?;
        self.mfc.set_connected(true);
        self.bpr.set_connected(true);
        info!(parent: &self.span, "Gas controllers connected");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.close();
        self.mfc.set_connected(false);
        self.bpr.set_connected(false);
        info!(parent: &self.span, "Gas controllers disconnected");
    }

    pub fn device(&self, id: GasId) -> &GasDevice {
        match id {
            GasId::Mfc => &self.mfc,
            GasId::Bpr => &self.bpr,
        }
    }

    pub fn device_mut(&mut self, id: GasId) -> &mut GasDevice {
        match id {
            GasId::Mfc => &mut self.mfc,
            GasId::Bpr => &mut self.bpr,
        }
    }

    /// Poll both devices; a device that fails to answer keeps its last data.
    pub fn read_all_devices(&mut self) -> BTreeMap<GasId, GasDeviceData> {
        GasId::ALL
            .into_iter()
            .map(|id| (id, self.device_mut(id).read_all().clone()))
            .collect()
    }

    pub fn all_data(&self) -> BTreeMap<GasId, GasDeviceData> {
        GasId::ALL
            .into_iter()
            .map(|id| (id, self.device(id).data().clone()))
            .collect()
    }

    pub fn set_valve(&mut self, id: GasId, open: bool) -> Result<(), RigError> {
        let device = self.device_mut(id);
        if open {
            device.set_valve_open()?;
        } else {
            device.set_valve_close()?;
        }
        info!(parent: &self.span, gas = %id, open, "Valve commanded");
        Ok(())
    }

    pub fn write_setpoint(&mut self, id: GasId, value: f32) -> Result<(), RigError> {
        self.device_mut(id).write_setpoint(value)?;
        info!(parent: &self.span, gas = %id, setpoint = value, "Setpoint commanded");
        Ok(())
    }

    pub fn write_gas(&mut self, id: GasId, index: u16) -> Result<(), RigError> {
        self.device_mut(id).write_gas(index)
    }
}
