use crate::bus::BusConnector;
use crate::engine::Dispatcher;
use crate::error::RigError;
use crate::gas_controller::GasController;
use crate::motor::StopMode;
use crate::motor_controller::MotorController;
use crate::schedule::{Action, DeviceId, ScheduleBlock};
use tracing::warn;

/// Everything the engine can command.
pub struct RigDevices {
    pub motors: MotorController,
    pub gas: GasController,
}

impl RigDevices {
    pub fn new(motors: MotorController, gas: GasController) -> Self {
        Self { motors, gas }
    }

    /// Connect both controller groups. A group that fails to connect is
    /// logged and left disconnected; the error of the first failure is
    /// returned after both have been tried.
    pub fn connect(
        &mut self,
        motor_bus: &dyn BusConnector,
        gas_bus: &dyn BusConnector,
    ) -> Result<(), RigError> {
        let motors = self.motors.connect(motor_bus);
        if let Err(e) = &motors {
            warn!(error = %e, "Motor bus unavailable");
        }
        let gas = self.gas.connect(gas_bus);
        if let Err(e) = &gas {
            warn!(error = %e, "Gas bus unavailable");
        }
        motors.and(gas)
    }

    pub fn disconnect(&mut self) {
        self.motors.disconnect();
        self.gas.disconnect();
    }
}

impl Dispatcher for RigDevices {
    fn dispatch(&mut self, block: &ScheduleBlock) -> Result<(), RigError> {
        match (block.device(), *block.action()) {
            (DeviceId::Motor(motor), Action::Move { direction, speed })
            | (DeviceId::Motor(motor), Action::Rotate { direction, speed }) => {
                self.motors.start_motor_in(motor, direction, speed)
            }
            (DeviceId::Motor(motor), Action::Stop) => {
                self.motors.stop_motor(motor, StopMode::Decelerate)
            }
            (DeviceId::Gas(gas), Action::ValveOpen) => self.gas.set_valve(gas, true),
            (DeviceId::Gas(gas), Action::ValveClose) => self.gas.set_valve(gas, false),
            (DeviceId::Gas(gas), Action::Setpoint { value }) => self.gas.write_setpoint(gas, value),
            (device, action) => Err(RigError::InvalidSchedule(format!(
                "{} cannot run on {device}",
                action.name()
            ))),
        }
    }

    fn stop_all_motors(&mut self) -> Result<(), RigError> {
        self.motors.stop_all(StopMode::Immediate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{SerialSettings, Transport};
    use crate::bus_sim::SimulatedBus;
    use crate::codec::encode_f32_be;
    use crate::gas::registers;
    use crate::gas_controller::GasId;
    use crate::motor::{Direction, CMD_REGISTER};
    use crate::motor_controller::MotorId;
    use std::time::Duration;

    fn shared_bus() -> (RigDevices, SimulatedBus) {
        let sim = SimulatedBus::with_lab_defaults();
        let transport = Transport::new(SerialSettings::new("sim", 9600));
        let mut devices = RigDevices::new(
            MotorController::new(transport.clone()).with_settle_delay(Duration::ZERO),
            GasController::new(transport),
        );
        devices.connect(&sim, &sim).unwrap();
        sim.clear_calls();
        (devices, sim)
    }

    #[test]
    fn rotate_block_drives_y_axis() {
        let (mut devices, sim) = shared_bus();
        let block = ScheduleBlock::new(
            DeviceId::Motor(MotorId::UpperRotate),
            0,
            4,
            Action::Rotate {
                direction: Direction::Positive,
                speed: 250,
            },
        )
        .unwrap();
        devices.dispatch(&block).unwrap();
        assert_eq!(sim.writes_to(1, CMD_REGISTER).last(), Some(&vec![0x0102]));
        assert_eq!(devices.motors.motor_speed(MotorId::UpperRotate), 250);
    }

    #[test]
    fn stop_block_decelerates() {
        let (mut devices, sim) = shared_bus();
        let block =
            ScheduleBlock::new(DeviceId::Motor(MotorId::LowerStage), 0, 1, Action::Stop).unwrap();
        devices.dispatch(&block).unwrap();
        assert_eq!(sim.writes_to(2, CMD_REGISTER), vec![vec![0x0501]]);
    }

    #[test]
    fn setpoint_block_writes_float() {
        let (mut devices, sim) = shared_bus();
        let block = ScheduleBlock::new(
            DeviceId::Gas(GasId::Mfc),
            0,
            1,
            Action::Setpoint { value: 1.5 },
        )
        .unwrap();
        devices.dispatch(&block).unwrap();
        assert_eq!(
            sim.writes_to(5, registers::SETPOINT),
            vec![encode_f32_be(1.5).to_vec()]
        );
    }

    #[test]
    fn engine_all_stop_is_immediate_on_both_drivers() {
        let (mut devices, sim) = shared_bus();
        devices.stop_all_motors().unwrap();
        assert_eq!(sim.writes_to(1, CMD_REGISTER), vec![vec![0x0510], vec![0x0520]]);
        assert_eq!(sim.writes_to(2, CMD_REGISTER), vec![vec![0x0510], vec![0x0520]]);
    }
}
