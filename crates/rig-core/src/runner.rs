//! The engine thread and its command queue.
//!
//! Exactly one thread owns the [`ScheduleEngine`] and the device
//! controllers. Everything else talks to it through an [`EngineHandle`]:
//! each request carries its own reply channel and the thread serves
//! requests between ticks.

use crate::devices::RigDevices;
use crate::engine::ScheduleEngine;
use crate::error::RigError;
use crate::exchange::{EngineSnapshot, SnapshotExchange};
use crate::gas_controller::GasId;
use crate::motor::{Direction, StopMode};
use crate::motor_controller::MotorId;
use crate::schedule::{BlockId, Schedule, ScheduleBlock, ScheduleFile};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    /// Refresh gas readings once per tick while the gas bus is connected.
    pub poll_gas: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            poll_gas: true,
        }
    }
}

type Reply<T> = SyncSender<Result<T, RigError>>;

enum Command {
    Insert(ScheduleBlock, Reply<BlockId>),
    Delete(BlockId, Reply<ScheduleBlock>),
    Clear(Reply<()>),
    Start(Reply<()>),
    Stop(Reply<()>),
    Reset(Reply<()>),
    Replace(Schedule, Reply<usize>),
    Load(PathBuf, Reply<usize>),
    Save(PathBuf, Reply<usize>),
    StartMotor {
        motor: MotorId,
        direction: Direction,
        speed: u16,
        reply: Reply<()>,
    },
    StopMotor(MotorId, StopMode, Reply<()>),
    StopAll(Reply<()>),
    SetValve(GasId, bool, Reply<()>),
    WriteSetpoint(GasId, f32, Reply<()>),
    WriteGas(GasId, u16, Reply<()>),
    Shutdown,
}

/// Cloneable client of the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<Command>,
    exchange: Arc<SnapshotExchange>,
}

impl EngineHandle {
    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, RigError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.commands
            .send(make(tx))
            .map_err(|_| RigError::EngineUnavailable)?;
        rx.recv().map_err(|_| RigError::EngineUnavailable)?
    }

    pub fn insert(&self, block: ScheduleBlock) -> Result<BlockId, RigError> {
        self.request(|r| Command::Insert(block, r))
    }

    pub fn delete(&self, id: BlockId) -> Result<ScheduleBlock, RigError> {
        self.request(|r| Command::Delete(id, r))
    }

    pub fn clear(&self) -> Result<(), RigError> {
        self.request(Command::Clear)
    }

    pub fn start(&self) -> Result<(), RigError> {
        self.request(Command::Start)
    }

    /// Returns once the engine has halted and the all-stop has gone out.
    pub fn stop(&self) -> Result<(), RigError> {
        self.request(Command::Stop)
    }

    pub fn reset(&self) -> Result<(), RigError> {
        self.request(Command::Reset)
    }

    pub fn replace(&self, schedule: Schedule) -> Result<usize, RigError> {
        self.request(|r| Command::Replace(schedule, r))
    }

    pub fn load(&self, path: impl Into<PathBuf>) -> Result<usize, RigError> {
        let path = path.into();
        self.request(|r| Command::Load(path, r))
    }

    pub fn save(&self, path: impl Into<PathBuf>) -> Result<usize, RigError> {
        let path = path.into();
        self.request(|r| Command::Save(path, r))
    }

    pub fn start_motor(&self, motor: MotorId, direction: Direction, speed: u16) -> Result<(), RigError> {
        self.request(|reply| Command::StartMotor {
            motor,
            direction,
            speed,
            reply,
        })
    }

    pub fn stop_motor(&self, motor: MotorId, mode: StopMode) -> Result<(), RigError> {
        self.request(|r| Command::StopMotor(motor, mode, r))
    }

    pub fn stop_all(&self) -> Result<(), RigError> {
        self.request(Command::StopAll)
    }

    pub fn set_valve(&self, gas: GasId, open: bool) -> Result<(), RigError> {
        self.request(|r| Command::SetValve(gas, open, r))
    }

    pub fn write_setpoint(&self, gas: GasId, value: f32) -> Result<(), RigError> {
        self.request(|r| Command::WriteSetpoint(gas, value, r))
    }

    pub fn write_gas(&self, gas: GasId, index: u16) -> Result<(), RigError> {
        self.request(|r| Command::WriteGas(gas, index, r))
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.exchange.latest()
    }

    pub fn exchange(&self) -> Arc<SnapshotExchange> {
        self.exchange.clone()
    }

    /// Ask the engine thread to stop the motors and exit. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct EngineRunner {
    engine: ScheduleEngine,
    devices: RigDevices,
    config: EngineConfig,
    exchange: Arc<SnapshotExchange>,
    commands: Receiver<Command>,
    sequence: u64,
}

impl EngineRunner {
    /// Move the engine and devices onto a dedicated thread. The join handle
    /// yields the devices back after shutdown so the caller can close the
    /// bus.
    pub fn spawn(
        engine: ScheduleEngine,
        devices: RigDevices,
        config: EngineConfig,
        exchange: Arc<SnapshotExchange>,
    ) -> std::io::Result<(EngineHandle, JoinHandle<RigDevices>)> {
        let (tx, rx) = mpsc::channel();
        let runner = EngineRunner {
            engine,
            devices,
            config,
            exchange: exchange.clone(),
            commands: rx,
            sequence: 0,
        };
        let join = thread::Builder::new()
            .name("schedule-engine".into())
            .spawn(move || runner.run())?;
        Ok((
            EngineHandle {
                commands: tx,
                exchange,
            },
            join,
        ))
    }

    fn publish(&mut self) {
        self.sequence += 1;
        self.exchange
            .publish(EngineSnapshot::capture(self.sequence, &self.engine, &self.devices));
    }

    fn run(mut self) -> RigDevices {
        let span = info_span!("engine_runner", tick_ms = self.config.tick_interval.as_millis() as u64);
        let _enter = span.enter();
        info!("Engine thread started");
        let interval = self.config.tick_interval;
        let mut next_tick = Instant::now() + interval;
        self.publish();

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.commands.recv_timeout(wait) {
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => {
                    if self.handle(command) {
                        next_tick = Instant::now();
                    }
                    self.publish();
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            let now = Instant::now();
            if now < next_tick {
                continue;
            }
            if now > next_tick + interval {
                self.engine.record_late_tick();
                debug!(late_ms = now.duration_since(next_tick).as_millis() as u64, "Tick late");
                next_tick = now;
            }
            self.engine.tick(&mut self.devices);
            if self.config.poll_gas && self.devices.gas.is_connected() {
                self.devices.gas.read_all_devices();
            }
            self.publish();
            next_tick += interval;
        }

        if self.engine.is_running() {
            self.engine.stop(&mut self.devices);
        }
        self.publish();
        info!(ticks = self.engine.stats().ticks, "Engine thread exiting");
        self.devices
    }

    /// Serve one request. Returns true when the next tick is due at once.
    fn handle(&mut self, command: Command) -> bool {
        let engine = &mut self.engine;
        let devices = &mut self.devices;
        match command {
            Command::Insert(block, reply) => {
                let _ = reply.send(engine.insert(block));
            }
            Command::Delete(id, reply) => {
                let _ = reply.send(engine.remove(&id));
            }
            Command::Clear(reply) => {
                engine.clear(devices);
                let _ = reply.send(Ok(()));
            }
            Command::Start(reply) => {
                let was_running = engine.is_running();
                engine.start();
                let _ = reply.send(Ok(()));
                return !was_running;
            }
            Command::Stop(reply) => {
                engine.stop(devices);
                let _ = reply.send(Ok(()));
            }
            Command::Reset(reply) => {
                engine.reset(devices);
                let _ = reply.send(Ok(()));
            }
            Command::Replace(schedule, reply) => {
                let blocks = schedule.len();
                engine.replace_schedule(schedule);
                let _ = reply.send(Ok(blocks));
            }
            Command::Load(path, reply) => {
                let result = ScheduleFile::load(&path).map(|schedule| {
                    let blocks = schedule.len();
                    engine.replace_schedule(schedule);
                    blocks
                });
                match &result {
                    Ok(blocks) => info!(path = %path.display(), blocks, "Schedule loaded"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Schedule load failed"),
                }
                let _ = reply.send(result);
            }
            Command::Save(path, reply) => {
                let result = engine.save(&path);
                match &result {
                    Ok(blocks) => info!(path = %path.display(), blocks, "Schedule saved"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Schedule save failed"),
                }
                let _ = reply.send(result);
            }
            Command::StartMotor {
                motor,
                direction,
                speed,
                reply,
            } => {
                let _ = reply.send(devices.motors.start_motor_in(motor, direction, speed));
            }
            Command::StopMotor(motor, mode, reply) => {
                let _ = reply.send(devices.motors.stop_motor(motor, mode));
            }
            Command::StopAll(reply) => {
                let _ = reply.send(devices.motors.stop_all(StopMode::Immediate));
            }
            Command::SetValve(gas, open, reply) => {
                let _ = reply.send(devices.gas.set_valve(gas, open));
            }
            Command::WriteSetpoint(gas, value, reply) => {
                let _ = reply.send(devices.gas.write_setpoint(gas, value));
            }
            Command::WriteGas(gas, index, reply) => {
                let _ = reply.send(devices.gas.write_gas(gas, index));
            }
            Command::Shutdown => {}
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{SerialSettings, Transport};
    use crate::bus_sim::SimulatedBus;
    use crate::gas_controller::GasController;
    use crate::motor::CMD_REGISTER;
    use crate::motor_controller::MotorController;
    use crate::schedule::{Action, DeviceId};

    fn spawn(tick: Duration) -> (EngineHandle, JoinHandle<RigDevices>, SimulatedBus) {
        let sim = SimulatedBus::with_lab_defaults();
        let transport = Transport::new(SerialSettings::new("sim", 9600));
        let mut devices = RigDevices::new(
            MotorController::new(transport.clone()).with_settle_delay(Duration::ZERO),
            GasController::new(transport),
        );
        devices.connect(&sim, &sim).unwrap();
        sim.clear_calls();
        let config = EngineConfig {
            tick_interval: tick,
            poll_gas: true,
        };
        let (handle, join) = EngineRunner::spawn(
            ScheduleEngine::new(),
            devices,
            config,
            Arc::new(SnapshotExchange::new()),
        )
        .unwrap();
        (handle, join, sim)
    }

    fn wait_for(handle: &EngineHandle, pred: impl Fn(&EngineSnapshot) -> bool) -> Arc<EngineSnapshot> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snap = handle.snapshot();
            if pred(&snap) {
                return snap;
            }
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn start_ticks_immediately_at_zero() {
        let (handle, join, sim) = spawn(Duration::from_secs(60));
        let block = ScheduleBlock::new(
            DeviceId::Motor(MotorId::UpperStage),
            0,
            5,
            Action::Move {
                direction: Direction::Positive,
                speed: 1200,
            },
        )
        .unwrap();
        handle.insert(block).unwrap();
        handle.start().unwrap();
        let snap = wait_for(&handle, |s| s.elapsed == 1);
        assert!(snap.blocks[0].executed);
        assert_eq!(snap.commanded.motor_speeds[&MotorId::UpperStage], 1200);
        assert_eq!(sim.writes_to(1, CMD_REGISTER).last(), Some(&vec![0x0120]));
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn stop_returns_after_all_stop() {
        let (handle, join, sim) = spawn(Duration::from_millis(10));
        handle.start().unwrap();
        handle.stop().unwrap();
        assert_eq!(sim.writes_to(1, CMD_REGISTER), vec![vec![0x0510], vec![0x0520]]);
        assert_eq!(sim.writes_to(2, CMD_REGISTER), vec![vec![0x0510], vec![0x0520]]);
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn clock_advances_and_gas_is_polled() {
        let (handle, join, _sim) = spawn(Duration::from_millis(10));
        handle.start().unwrap();
        let snap = wait_for(&handle, |s| s.elapsed >= 3);
        assert!(snap.running);
        assert_eq!(snap.gas[&GasId::Mfc].gas, "N2");
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn requests_fail_after_shutdown() {
        let (handle, join, _sim) = spawn(Duration::from_millis(10));
        handle.shutdown();
        join.join().unwrap();
        assert!(matches!(handle.start(), Err(RigError::EngineUnavailable)));
    }

    #[test]
    fn conflicts_come_back_through_the_handle() {
        let (handle, join, _sim) = spawn(Duration::from_millis(10));
        let open = |start| ScheduleBlock::new(DeviceId::Gas(GasId::Bpr), start, 10, Action::ValveOpen).unwrap();
        handle.insert(open(0)).unwrap();
        assert!(matches!(handle.insert(open(5)), Err(RigError::Conflict { .. })));
        handle.delete("bpr_0".parse().unwrap()).unwrap();
        handle.insert(open(5)).unwrap();
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn save_and_load_go_through_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let (handle, join, _sim) = spawn(Duration::from_millis(10));
        handle
            .insert(ScheduleBlock::new(DeviceId::Gas(GasId::Mfc), 2, 3, Action::ValveClose).unwrap())
            .unwrap();
        assert_eq!(handle.save(&path).unwrap(), 1);
        handle.clear().unwrap();
        assert_eq!(handle.load(&path).unwrap(), 1);
        assert!(handle.load(dir.path().join("missing.json")).is_err());
        let snap = wait_for(&handle, |s| s.blocks.len() == 1);
        assert_eq!(snap.blocks[0].id, "mfc_2");
        handle.shutdown();
        join.join().unwrap();
    }
}
