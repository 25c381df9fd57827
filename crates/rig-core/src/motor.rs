//! Two-axis stepper pulse driver on the shared bus.
//!
//! Each physical driver answers on one slave address and exposes an X and a
//! Y axis. Motion is open loop: an axis is either idle or running a
//! continuous drive at the speed held in its selected drive-speed slot.

use crate::bus::{SlaveId, Transport};
use crate::codec::encode_cmd;
use crate::error::RigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info_span, warn, Span};

/// Command register (manual address 40001).
pub const CMD_REGISTER: u16 = 0x0000;

pub const SPEED_MIN: u16 = 1;
pub const SPEED_MAX: u16 = 8000;
pub const SPEED_SLOTS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("X"),
            Axis::Y => f.write_str("Y"),
        }
    }
}

/// Plus/CW and minus/CCW share the same drive bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn from_sign(value: f64) -> Self {
        if value >= 0.0 {
            Direction::Positive
        } else {
            Direction::Negative
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Positive => "positive",
            Direction::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    #[default]
    Decelerate,
    Immediate,
}

/// Per-axis configuration registers (0-based; the manual lists them as
/// 4xxxx holding addresses).
#[derive(Debug, Clone, Copy)]
pub struct AxisRegisters {
    pub speed_ratio: u16,
    pub accel: u16,
    pub decel: u16,
    pub start_speed: u16,
    pub drive_speed: [u16; 4],
    pub end_pulse_width: u16,
    pub scale_num: u16,
    pub scale_den: u16,
    pub jerk: u16,
}

pub const X_REGISTERS: AxisRegisters = AxisRegisters {
    speed_ratio: 0x0454 - 1,
    accel: 0x0455 - 1,
    decel: 0x0456 - 1,
    start_speed: 0x0457 - 1,
    drive_speed: [0x0458 - 1, 0x0459 - 1, 0x045A - 1, 0x045B - 1],
    end_pulse_width: 0x045D - 1,
    scale_num: 0x045E - 1,
    scale_den: 0x045F - 1,
    jerk: 0x0472 - 1,
};

// Y also carries post timers at 0x0468..0x046A; nothing here drives them.
pub const Y_REGISTERS: AxisRegisters = AxisRegisters {
    speed_ratio: 0x0460 - 1,
    accel: 0x0461 - 1,
    decel: 0x0462 - 1,
    start_speed: 0x0463 - 1,
    drive_speed: [0x0464 - 1, 0x0465 - 1, 0x0466 - 1, 0x0467 - 1],
    end_pulse_width: 0x046F - 1,
    scale_num: 0x0470 - 1,
    scale_den: 0x0471 - 1,
    jerk: 0x0473 - 1,
};

impl Axis {
    pub fn registers(self) -> &'static AxisRegisters {
        match self {
            Axis::X => &X_REGISTERS,
            Axis::Y => &Y_REGISTERS,
        }
    }
}

/// Values accepted by the command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Continuous(Axis, Direction),
    Stop(Axis, StopMode),
    /// Slot must already be validated to 1..=4.
    SelectSpeed(Axis, u8),
}

impl MotorCommand {
    pub fn op_code(self) -> (u8, u8) {
        match self {
            MotorCommand::Continuous(Axis::X, Direction::Positive) => (0x01, 0x20),
            MotorCommand::Continuous(Axis::X, Direction::Negative) => (0x01, 0x10),
            MotorCommand::Continuous(Axis::Y, Direction::Positive) => (0x01, 0x02),
            MotorCommand::Continuous(Axis::Y, Direction::Negative) => (0x01, 0x01),
            MotorCommand::Stop(Axis::X, StopMode::Decelerate) => (0x05, 0x01),
            MotorCommand::Stop(Axis::Y, StopMode::Decelerate) => (0x05, 0x02),
            MotorCommand::Stop(Axis::X, StopMode::Immediate) => (0x05, 0x10),
            MotorCommand::Stop(Axis::Y, StopMode::Immediate) => (0x05, 0x20),
            MotorCommand::SelectSpeed(Axis::X, slot) => (0x04, slot << 4),
            MotorCommand::SelectSpeed(Axis::Y, slot) => (0x04, slot),
        }
    }

    pub fn word(self) -> u16 {
        let (hi, lo) = self.op_code();
        encode_cmd(hi, lo)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AxisStatus {
    pub connected: bool,
    pub running: bool,
    pub speed: u16,
    pub direction: Option<Direction>,
    pub last_error: Option<String>,
}

fn check_speed(what: &'static str, value: u16) -> Result<(), RigError> {
    if (SPEED_MIN..=SPEED_MAX).contains(&value) {
        Ok(())
    } else {
        Err(RigError::range(what, value, SPEED_MIN as i64, SPEED_MAX as i64))
    }
}

fn check_slot(slot: u8) -> Result<(), RigError> {
    if (1..=SPEED_SLOTS).contains(&slot) {
        Ok(())
    } else {
        Err(RigError::range("speed slot", slot, 1, SPEED_SLOTS as i64))
    }
}

pub struct MotorDriver {
    slave: SlaveId,
    transport: Transport,
    x: AxisStatus,
    y: AxisStatus,
    settle: Duration,
    span: Span,
}

impl MotorDriver {
    /// The driver latches configuration writes before it acts on the next
    /// command; dependent writes must be spaced at least this far apart.
    pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

    pub fn new(slave: SlaveId, transport: Transport) -> Self {
        Self {
            slave,
            transport,
            x: AxisStatus::default(),
            y: AxisStatus::default(),
            settle: Self::DEFAULT_SETTLE,
            span: info_span!("motor_driver", slave),
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }

    pub fn status(&self, axis: Axis) -> &AxisStatus {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
        }
    }

    fn status_mut(&mut self, axis: Axis) -> &mut AxisStatus {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.x.connected = connected;
        self.y.connected = connected;
        if !connected {
            for status in [&mut self.x, &mut self.y] {
                status.running = false;
                status.speed = 0;
                status.direction = None;
            }
        }
    }

    fn write(&mut self, axis: Axis, address: u16, value: u16) -> Result<(), RigError> {
        let _enter = self.span.clone().entered();
        match self.transport.write_register(self.slave, address, value) {
            Ok(()) => {
                debug!(%axis, address, value, "Register written");
                Ok(())
            }
            Err(e) => {
                warn!(%axis, address, value, error = %e, "Register write failed");
                self.status_mut(axis).last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    fn send(&mut self, axis: Axis, command: MotorCommand) -> Result<(), RigError> {
        let word = command.word();
        let _enter = self.span.clone().entered();
        match self.transport.write_register(self.slave, CMD_REGISTER, word) {
            Ok(()) => {
                debug!(%axis, command = word, "Command sent");
                self.status_mut(axis).last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!(%axis, command = word, error = %e, "Command failed");
                self.status_mut(axis).last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    fn settle(&self) {
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
    }

    pub fn set_speed(&mut self, axis: Axis, slot: u8, speed: u16) -> Result<(), RigError> {
        check_slot(slot)?;
        check_speed("drive speed", speed)?;
        let address = axis.registers().drive_speed[slot as usize - 1];
        self.write(axis, address, speed)
    }

    pub fn set_accel(&mut self, axis: Axis, accel: u16) -> Result<(), RigError> {
        check_speed("acceleration", accel)?;
        self.write(axis, axis.registers().accel, accel)
    }

    pub fn set_decel(&mut self, axis: Axis, decel: u16) -> Result<(), RigError> {
        check_speed("deceleration", decel)?;
        self.write(axis, axis.registers().decel, decel)
    }

    pub fn set_start_speed(&mut self, axis: Axis, speed: u16) -> Result<(), RigError> {
        check_speed("start speed", speed)?;
        self.write(axis, axis.registers().start_speed, speed)
    }

    /// Distance per pulse as `numerator / denominator`. With a 0.72° step,
    /// full stepping and 5 mm per revolution, 1/100 gives 0.01 mm per pulse.
    pub fn set_pulse_scale(
        &mut self,
        axis: Axis,
        numerator: u16,
        denominator: u16,
    ) -> Result<(), RigError> {
        if denominator == 0 {
            return Err(RigError::range("pulse scale denominator", 0, 1, u16::MAX as i64));
        }
        let regs = axis.registers();
        self.write(axis, regs.scale_num, numerator)?;
        self.write(axis, regs.scale_den, denominator)
    }

    pub fn select_speed(&mut self, axis: Axis, slot: u8) -> Result<(), RigError> {
        check_slot(slot)?;
        self.send(axis, MotorCommand::SelectSpeed(axis, slot))
    }

    pub fn start_continuous(&mut self, axis: Axis, direction: Direction) -> Result<(), RigError> {
        self.send(axis, MotorCommand::Continuous(axis, direction))?;
        let status = self.status_mut(axis);
        status.running = true;
        status.direction = Some(direction);
        Ok(())
    }

    /// The axis is marked idle even when the stop command fails; the error
    /// is still returned and kept in `last_error`.
    pub fn stop(&mut self, axis: Axis, mode: StopMode) -> Result<(), RigError> {
        let result = self.send(axis, MotorCommand::Stop(axis, mode));
        let status = self.status_mut(axis);
        status.running = false;
        status.speed = 0;
        status.direction = None;
        result
    }

    /// Stops both axes; the Y stop is attempted even if X fails.
    pub fn stop_all(&mut self, mode: StopMode) -> Result<(), RigError> {
        let x = self.stop(Axis::X, mode);
        let y = self.stop(Axis::Y, mode);
        x.and(y)
    }

    /// Load `speed` into slot 1, select it, then start a continuous drive.
    pub fn move_with_speed(
        &mut self,
        axis: Axis,
        direction: Direction,
        speed: u16,
    ) -> Result<(), RigError> {
        self.set_speed(axis, 1, speed)?;
        self.settle();
        self.select_speed(axis, 1)?;
        self.settle();
        self.start_continuous(axis, direction)?;
        self.status_mut(axis).speed = speed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SerialSettings;
    use crate::bus_sim::{BusCall, SimulatedBus};

    fn driver(slave: SlaveId) -> (MotorDriver, SimulatedBus) {
        let sim = SimulatedBus::new();
        let transport = Transport::new(SerialSettings::new("sim", 9600));
        transport.open(&sim).unwrap();
        let mut driver = MotorDriver::new(slave, transport).with_settle_delay(Duration::ZERO);
        driver.set_connected(true);
        (driver, sim)
    }

    #[test]
    fn op_codes_match_command_table() {
        use MotorCommand::*;
        assert_eq!(Continuous(Axis::X, Direction::Positive).word(), 0x0120);
        assert_eq!(Continuous(Axis::X, Direction::Negative).word(), 0x0110);
        assert_eq!(Continuous(Axis::Y, Direction::Positive).word(), 0x0102);
        assert_eq!(Continuous(Axis::Y, Direction::Negative).word(), 0x0101);
        assert_eq!(Stop(Axis::X, StopMode::Decelerate).word(), 0x0501);
        assert_eq!(Stop(Axis::Y, StopMode::Decelerate).word(), 0x0502);
        assert_eq!(Stop(Axis::X, StopMode::Immediate).word(), 0x0510);
        assert_eq!(Stop(Axis::Y, StopMode::Immediate).word(), 0x0520);
        for slot in 1..=4u8 {
            assert_eq!(SelectSpeed(Axis::X, slot).word(), 0x0400 | (slot as u16) << 4);
            assert_eq!(SelectSpeed(Axis::Y, slot).word(), 0x0400 | slot as u16);
        }
    }

    #[test]
    fn register_offsets_follow_manual_addresses() {
        assert_eq!(X_REGISTERS.drive_speed[0], 1111);
        assert_eq!(X_REGISTERS.scale_num, 1117);
        assert_eq!(Y_REGISTERS.drive_speed[0], 1123);
        assert_eq!(Y_REGISTERS.scale_den, 1136);
    }

    #[test]
    fn out_of_range_speed_never_reaches_the_bus() {
        let (mut d, sim) = driver(1);
        assert!(matches!(d.set_speed(Axis::X, 1, 0), Err(RigError::Range { .. })));
        assert!(matches!(d.set_speed(Axis::X, 1, 8001), Err(RigError::Range { .. })));
        assert!(matches!(d.set_speed(Axis::Y, 5, 100), Err(RigError::Range { .. })));
        assert!(matches!(d.set_accel(Axis::Y, 9000), Err(RigError::Range { .. })));
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn move_with_speed_writes_slot_selects_then_drives() {
        let (mut d, sim) = driver(2);
        d.move_with_speed(Axis::Y, Direction::Negative, 1500).unwrap();

        assert_eq!(
            sim.calls(),
            vec![
                BusCall::Write {
                    slave: 2,
                    address: Y_REGISTERS.drive_speed[0],
                    values: vec![1500]
                },
                BusCall::Write {
                    slave: 2,
                    address: CMD_REGISTER,
                    values: vec![0x0401]
                },
                BusCall::Write {
                    slave: 2,
                    address: CMD_REGISTER,
                    values: vec![0x0101]
                },
            ]
        );
        let status = d.status(Axis::Y);
        assert!(status.running);
        assert_eq!(status.speed, 1500);
        assert_eq!(status.direction, Some(Direction::Negative));
        assert!(!d.status(Axis::X).running);
    }

    #[test]
    fn stop_returns_axis_to_idle() {
        let (mut d, sim) = driver(1);
        d.move_with_speed(Axis::X, Direction::Positive, 800).unwrap();
        d.stop(Axis::X, StopMode::Immediate).unwrap();

        let status = d.status(Axis::X);
        assert!(!status.running);
        assert_eq!(status.speed, 0);
        assert_eq!(status.direction, None);
        assert_eq!(sim.writes_to(1, CMD_REGISTER).last(), Some(&vec![0x0510]));
    }

    #[test]
    fn failed_start_keeps_axis_idle() {
        let (mut d, sim) = driver(1);
        sim.fail_writes_at(1, CMD_REGISTER);
        let err = d.move_with_speed(Axis::X, Direction::Positive, 800).unwrap_err();
        assert!(err.is_communication());
        let status = d.status(Axis::X);
        assert!(!status.running);
        assert_eq!(status.speed, 0);
        assert!(status.last_error.is_some());
    }

    #[test]
    fn failed_stop_still_marks_axis_idle() {
        let (mut d, sim) = driver(1);
        d.move_with_speed(Axis::X, Direction::Positive, 800).unwrap();
        assert!(d.status(Axis::X).running);

        sim.fail_writes_at(1, CMD_REGISTER);
        let err = d.stop(Axis::X, StopMode::Immediate).unwrap_err();
        assert!(err.is_communication());

        let status = d.status(Axis::X);
        assert!(!status.running);
        assert_eq!(status.speed, 0);
        assert_eq!(status.direction, None);
        assert!(status.last_error.is_some());
    }

    #[test]
    fn stop_all_attempts_both_axes() {
        let (mut d, sim) = driver(1);
        sim.take_offline(1);
        assert!(d.stop_all(StopMode::Decelerate).is_err());
        assert_eq!(sim.writes_to(1, CMD_REGISTER), vec![vec![0x0501], vec![0x0502]]);
    }

    #[test]
    fn pulse_scale_writes_numerator_and_denominator() {
        let (mut d, sim) = driver(1);
        d.set_pulse_scale(Axis::Y, 1, 100).unwrap();
        assert_eq!(sim.register(1, Y_REGISTERS.scale_num), Some(1));
        assert_eq!(sim.register(1, Y_REGISTERS.scale_den), Some(100));
        assert!(d.set_pulse_scale(Axis::Y, 1, 0).is_err());
    }
}
