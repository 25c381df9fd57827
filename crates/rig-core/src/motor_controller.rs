//! The four logical motors spread over two pulse drivers.

use crate::bus::{BusConnector, SlaveId, Transport};
use crate::error::RigError;
use crate::motor::{AxisStatus, Axis, Direction, MotorDriver, StopMode};
use crate::units::{degree_to_pulse, mm_to_pulse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, info_span, warn, Span};

pub const UPPER_DRIVER: SlaveId = 1;
pub const LOWER_DRIVER: SlaveId = 2;

/// Pulse scale applied to every axis on connect (0.01 mm per pulse).
pub const PULSE_SCALE: (u16, u16) = (1, 100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorId {
    UpperStage,
    UpperRotate,
    LowerStage,
    LowerRotate,
}

impl MotorId {
    pub const ALL: [MotorId; 4] = [
        MotorId::UpperStage,
        MotorId::UpperRotate,
        MotorId::LowerStage,
        MotorId::LowerRotate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MotorId::UpperStage => "upper_stage",
            MotorId::UpperRotate => "upper_rotate",
            MotorId::LowerStage => "lower_stage",
            MotorId::LowerRotate => "lower_rotate",
        }
    }

    /// Driver slave and axis wired to this motor.
    pub fn location(self) -> (SlaveId, Axis) {
        match self {
            MotorId::UpperStage => (UPPER_DRIVER, Axis::X),
            MotorId::UpperRotate => (UPPER_DRIVER, Axis::Y),
            MotorId::LowerStage => (LOWER_DRIVER, Axis::X),
            MotorId::LowerRotate => (LOWER_DRIVER, Axis::Y),
        }
    }

    pub fn is_rotary(self) -> bool {
        matches!(self, MotorId::UpperRotate | MotorId::LowerRotate)
    }
}

impl fmt::Display for MotorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MotorId {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MotorId::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RigError::UnknownDevice(s.to_string()))
    }
}

/// Accepts the operator-facing direction words, case-insensitively.
pub fn parse_direction(name: &str) -> Result<Direction, RigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "plus" | "up" | "cw" | "right" | "positive" => Ok(Direction::Positive),
        "minus" | "down" | "ccw" | "left" | "negative" => Ok(Direction::Negative),
        _ => Err(RigError::UnknownDirection(name.to_string())),
    }
}

pub struct MotorController {
    transport: Transport,
    upper: MotorDriver,
    lower: MotorDriver,
    span: Span,
}

impl MotorController {
    pub fn new(transport: Transport) -> Self {
        Self {
            upper: MotorDriver::new(UPPER_DRIVER, transport.clone()),
            lower: MotorDriver::new(LOWER_DRIVER, transport.clone()),
            transport,
            span: info_span!("motors"),
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.upper = self.upper.with_settle_delay(settle);
        self.lower = self.lower.with_settle_delay(settle);
        self
    }

    fn driver(&self, slave: SlaveId) -> &MotorDriver {
        if slave == UPPER_DRIVER {
            &self.upper
        } else {
            &self.lower
        }
    }

    fn driver_mut(&mut self, slave: SlaveId) -> &mut MotorDriver {
        if slave == UPPER_DRIVER {
            &mut self.upper
        } else {
            &mut self.lower
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Open the bus and apply the default pulse scale to every axis.
    /// Scale failures are logged and do not fail the connect.
    pub fn connect(&mut self, connector: &dyn BusConnector) -> Result<(), RigError> {
        let _enter = self.span.clone().entered();
        self.transport.open(connector)?;
        self.upper.set_connected(true);
        self.lower.set_connected(true);
        let (num, den) = PULSE_SCALE;
        for motor in MotorId::ALL {
            let (slave, axis) = motor.location();
            if let Err(e) = self.driver_mut(slave).set_pulse_scale(axis, num, den) {
                warn!(%motor, error = %e, "Pulse scale not applied");
            }
        }
        info!("Motor drivers connected");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.close();
        self.upper.set_connected(false);
        self.lower.set_connected(false);
        info!(parent: &self.span, "Motor drivers disconnected");
    }

    pub fn set_speed(&mut self, motor: MotorId, speed: u16) -> Result<(), RigError> {
        let (slave, axis) = motor.location();
        self.driver_mut(slave).set_speed(axis, 1, speed)
    }

    pub fn start_motor(&mut self, motor: MotorId, direction: &str, speed: u16) -> Result<(), RigError> {
        let direction = parse_direction(direction)?;
        self.start_motor_in(motor, direction, speed)
    }

    pub fn start_motor_in(
        &mut self,
        motor: MotorId,
        direction: Direction,
        speed: u16,
    ) -> Result<(), RigError> {
        let (slave, axis) = motor.location();
        self.driver_mut(slave).move_with_speed(axis, direction, speed)?;
        info!(parent: &self.span, %motor, direction = direction.as_str(), speed, "Motor started");
        Ok(())
    }

    pub fn stop_motor(&mut self, motor: MotorId, mode: StopMode) -> Result<(), RigError> {
        let (slave, axis) = motor.location();
        self.driver_mut(slave).stop(axis, mode)?;
        info!(parent: &self.span, %motor, ?mode, "Motor stopped");
        Ok(())
    }

    /// Stop every axis on both drivers. All four stops are attempted; the
    /// first failure is returned.
    pub fn stop_all(&mut self, mode: StopMode) -> Result<(), RigError> {
        let upper = self.upper.stop_all(mode);
        let lower = self.lower.stop_all(mode);
        upper.and(lower)
    }

    /// Positioned moves are not wired to the driver's index mode yet; the
    /// pulse count is logged and the axis runs continuously toward the
    /// target direction.
    pub fn move_distance(&mut self, motor: MotorId, mm: f64, speed: u16) -> Result<(), RigError> {
        let pulses = mm_to_pulse(mm);
        info!(parent: &self.span, %motor, mm, pulses, "Linear move requested");
        self.start_motor_in(motor, Direction::from_sign(mm), speed)
    }

    pub fn rotate_angle(&mut self, motor: MotorId, degrees: f64, speed: u16) -> Result<(), RigError> {
        let pulses = degree_to_pulse(degrees);
        info!(parent: &self.span, %motor, degrees, pulses, "Rotation requested");
        self.start_motor_in(motor, Direction::from_sign(degrees), speed)
    }

    pub fn axis_status(&self, motor: MotorId) -> &AxisStatus {
        let (slave, axis) = motor.location();
        self.driver(slave).status(axis)
    }

    /// Last commanded speed; zero while the motor is idle.
    pub fn motor_speed(&self, motor: MotorId) -> u16 {
        self.axis_status(motor).speed
    }

    pub fn all_speeds(&self) -> BTreeMap<MotorId, u16> {
        MotorId::ALL
            .into_iter()
            .map(|m| (m, self.motor_speed(m)))
            .collect()
    }

    pub fn all_status(&self) -> BTreeMap<MotorId, AxisStatus> {
        MotorId::ALL
            .into_iter()
            .map(|m| (m, self.axis_status(m).clone()))
            .collect()
    }
}
