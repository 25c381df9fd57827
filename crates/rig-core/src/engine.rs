//! Relative-time schedule engine.
//!
//! The engine owns the block collection and the run clock. Each tick it
//! dispatches every not-yet-executed block whose window contains the current
//! elapsed second, marks it executed whatever the outcome, projects the
//! commanded telemetry and advances the clock by one second. Device access is
//! passed in through [`Dispatcher`] so the engine itself performs no I/O.

use crate::error::RigError;
use crate::gas_controller::GasId;
use crate::motor_controller::MotorId;
use crate::schedule::{Action, BlockId, DeviceId, Schedule, ScheduleBlock, ScheduleFile};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info, info_span, warn, Span};

/// Device side of block execution.
pub trait Dispatcher {
    fn dispatch(&mut self, block: &ScheduleBlock) -> Result<(), RigError>;

    /// Halt every motor immediately.
    fn stop_all_motors(&mut self) -> Result<(), RigError>;
}

/// What the schedule says the devices should be doing right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandedTelemetry {
    pub motor_speeds: BTreeMap<MotorId, u16>,
    pub valves_open: BTreeMap<GasId, bool>,
    pub setpoints: BTreeMap<GasId, Option<f32>>,
}

impl Default for CommandedTelemetry {
    fn default() -> Self {
        Self {
            motor_speeds: MotorId::ALL.into_iter().map(|m| (m, 0)).collect(),
            valves_open: GasId::ALL.into_iter().map(|g| (g, false)).collect(),
            setpoints: GasId::ALL.into_iter().map(|g| (g, None)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        elapsed: u32,
    },
    Stopped {
        elapsed: u32,
    },
    Reset,
    Dispatched {
        block: String,
        action: &'static str,
        elapsed: u32,
    },
    DispatchFailed {
        block: String,
        action: &'static str,
        elapsed: u32,
        error: String,
    },
    BlockInserted {
        block: String,
    },
    BlockRemoved {
        block: String,
    },
    Cleared,
    Loaded {
        blocks: usize,
    },
    Saved {
        blocks: usize,
    },
}

pub trait EngineObserver: Send {
    fn on_event(&mut self, event: &EngineEvent);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    /// Ticks that started later than one full interval past their deadline.
    pub late_ticks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockView {
    pub id: String,
    pub device_id: DeviceId,
    pub start_seconds: u32,
    pub duration_seconds: u32,
    pub end_seconds: u32,
    pub action_name: &'static str,
    pub action_params: Value,
    pub executed: bool,
}

pub struct ScheduleEngine {
    schedule: Schedule,
    executed: HashSet<BlockId>,
    elapsed: u32,
    running: bool,
    commanded: CommandedTelemetry,
    stats: EngineStats,
    observers: Vec<Box<dyn EngineObserver>>,
    span: Span,
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleEngine {
    pub fn new() -> Self {
        Self {
            schedule: Schedule::new(),
            executed: HashSet::new(),
            elapsed: 0,
            running: false,
            commanded: CommandedTelemetry::default(),
            stats: EngineStats::default(),
            observers: Vec::new(),
            span: info_span!("schedule_engine"),
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn EngineObserver>) {
        self.observers.push(observer);
    }

    fn emit(&mut self, event: EngineEvent) {
        for observer in &mut self.observers {
            observer.on_event(&event);
        }
    }

    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn commanded(&self) -> &CommandedTelemetry {
        &self.commanded
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn record_late_tick(&mut self) {
        self.stats.late_ticks += 1;
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn blocks(&self) -> &[ScheduleBlock] {
        self.schedule.blocks()
    }

    pub fn is_executed(&self, id: &BlockId) -> bool {
        self.executed.contains(id)
    }

    pub fn block_views(&self) -> Vec<BlockView> {
        self.schedule
            .blocks()
            .iter()
            .map(|b| BlockView {
                id: b.id().to_string(),
                device_id: b.device(),
                start_seconds: b.start(),
                duration_seconds: b.duration(),
                end_seconds: b.end(),
                action_name: b.action().name(),
                action_params: b.action().params(),
                executed: self.executed.contains(&b.id()),
            })
            .collect()
    }

    pub fn insert(&mut self, block: ScheduleBlock) -> Result<BlockId, RigError> {
        let id = self.schedule.insert(block)?;
        info!(parent: &self.span, block = %id, "Block inserted");
        self.emit(EngineEvent::BlockInserted {
            block: id.to_string(),
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: &BlockId) -> Result<ScheduleBlock, RigError> {
        let block = self.schedule.remove(id)?;
        self.executed.remove(id);
        info!(parent: &self.span, block = %id, "Block removed");
        self.emit(EngineEvent::BlockRemoved {
            block: id.to_string(),
        });
        Ok(block)
    }

    /// Remove every block, then reset.
    pub fn clear(&mut self, dispatcher: &mut dyn Dispatcher) {
        self.schedule.clear();
        self.reset(dispatcher);
        self.emit(EngineEvent::Cleared);
    }

    /// Replace the whole collection. Execution flags start fresh; the clock
    /// is left alone.
    pub fn replace_schedule(&mut self, schedule: Schedule) {
        let blocks = schedule.len();
        self.schedule = schedule;
        self.executed.clear();
        self.commanded = self.commanded_at(self.elapsed);
        info!(parent: &self.span, blocks, "Schedule replaced");
        self.emit(EngineEvent::Loaded { blocks });
    }

    /// Write the current collection to `path`, returning the block count.
    pub fn save(&mut self, path: &Path) -> Result<usize, RigError> {
        ScheduleFile::save(&self.schedule, path)?;
        let blocks = self.schedule.len();
        self.emit(EngineEvent::Saved { blocks });
        Ok(blocks)
    }

    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        info!(parent: &self.span, elapsed = self.elapsed, "Schedule started");
        self.emit(EngineEvent::Started {
            elapsed: self.elapsed,
        });
    }

    /// Halt ticking and stop every motor. Executed flags and the clock are
    /// kept so a later start resumes where this left off.
    pub fn stop(&mut self, dispatcher: &mut dyn Dispatcher) {
        self.running = false;
        if let Err(e) = dispatcher.stop_all_motors() {
            warn!(parent: &self.span, error = %e, "All-stop incomplete");
        }
        for speed in self.commanded.motor_speeds.values_mut() {
            *speed = 0;
        }
        info!(parent: &self.span, elapsed = self.elapsed, "Schedule stopped");
        self.emit(EngineEvent::Stopped {
            elapsed: self.elapsed,
        });
    }

    pub fn reset(&mut self, dispatcher: &mut dyn Dispatcher) {
        self.stop(dispatcher);
        self.elapsed = 0;
        self.executed.clear();
        self.commanded = CommandedTelemetry::default();
        info!(parent: &self.span, "Schedule reset");
        self.emit(EngineEvent::Reset);
    }

    /// One scheduling step. Does nothing while stopped.
    pub fn tick(&mut self, dispatcher: &mut dyn Dispatcher) {
        if !self.running {
            return;
        }
        let _enter = self.span.clone().entered();
        let elapsed = self.elapsed;
        let due: Vec<ScheduleBlock> = self
            .schedule
            .active_at(elapsed)
            .filter(|b| !self.executed.contains(&b.id()))
            .cloned()
            .collect();

        for block in due {
            let id = block.id();
            self.executed.insert(id);
            let action = block.action().name();
            match dispatcher.dispatch(&block) {
                Ok(()) => {
                    self.stats.dispatched += 1;
                    info!(block = %id, action, elapsed, "Block dispatched");
                    self.emit(EngineEvent::Dispatched {
                        block: id.to_string(),
                        action,
                        elapsed,
                    });
                }
                Err(e) => {
                    self.stats.dispatch_failures += 1;
                    warn!(block = %id, action, elapsed, error = %e, "Block dispatch failed");
                    self.emit(EngineEvent::DispatchFailed {
                        block: id.to_string(),
                        action,
                        elapsed,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.commanded = self.commanded_at(elapsed);
        self.elapsed = elapsed.saturating_add(1);
        self.stats.ticks += 1;
        debug!(elapsed = self.elapsed, "Tick");
    }

    /// Telemetry implied by the blocks active at `elapsed`.
    pub fn commanded_at(&self, elapsed: u32) -> CommandedTelemetry {
        let mut commanded = CommandedTelemetry::default();
        for block in self.schedule.active_at(elapsed) {
            match (block.device(), block.action()) {
                (DeviceId::Motor(motor), action) => {
                    commanded
                        .motor_speeds
                        .insert(motor, action.commanded_speed());
                }
                (DeviceId::Gas(gas), Action::ValveOpen) => {
                    commanded.valves_open.insert(gas, true);
                }
                (DeviceId::Gas(gas), Action::Setpoint { value }) => {
                    commanded.setpoints.insert(gas, Some(*value));
                }
                (DeviceId::Gas(_), _) => {}
            }
        }
        commanded
    }
}
