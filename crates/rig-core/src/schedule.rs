//! Timed action blocks and their on-disk form.
//!
//! A block occupies the half-open window `[start, start + duration)` on one
//! device. Blocks on the same device never overlap.

use crate::error::RigError;
use crate::gas_controller::GasId;
use crate::motor::{Direction, SPEED_MAX, SPEED_MIN};
use crate::motor_controller::MotorId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_SPEED: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DeviceId {
    Motor(MotorId),
    Gas(GasId),
}

impl DeviceId {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceId::Motor(m) => m.as_str(),
            DeviceId::Gas(g) => g.as_str(),
        }
    }

    pub fn all() -> impl Iterator<Item = DeviceId> {
        MotorId::ALL
            .into_iter()
            .map(DeviceId::Motor)
            .chain(GasId::ALL.into_iter().map(DeviceId::Gas))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceId {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(motor) = s.parse::<MotorId>() {
            return Ok(DeviceId::Motor(motor));
        }
        s.parse::<GasId>().map(DeviceId::Gas)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.as_str().to_string()
    }
}

impl TryFrom<String> for DeviceId {
    type Error = RigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Move { direction: Direction, speed: u16 },
    Rotate { direction: Direction, speed: u16 },
    Stop,
    ValveOpen,
    ValveClose,
    Setpoint { value: f32 },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Move {
                direction: Direction::Positive,
                ..
            } => "move_plus",
            Action::Move {
                direction: Direction::Negative,
                ..
            } => "move_minus",
            Action::Rotate {
                direction: Direction::Positive,
                ..
            } => "rotate_cw",
            Action::Rotate {
                direction: Direction::Negative,
                ..
            } => "rotate_ccw",
            Action::Stop => "stop",
            Action::ValveOpen => "valve_open",
            Action::ValveClose => "valve_close",
            Action::Setpoint { .. } => "setpoint",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Action::Move { speed, .. } | Action::Rotate { speed, .. } => json!({ "speed": speed }),
            Action::Setpoint { value } => json!({ "value": value }),
            Action::Stop | Action::ValveOpen | Action::ValveClose => json!({}),
        }
    }

    /// Build an action from its name and parameter object. A missing speed
    /// defaults to [`DEFAULT_SPEED`].
    pub fn from_parts(name: &str, params: &Value) -> Result<Self, RigError> {
        let speed = || -> Result<u16, RigError> {
            match params.get("speed") {
                None | Some(Value::Null) => Ok(DEFAULT_SPEED),
                Some(v) => {
                    let raw = v.as_f64().ok_or_else(|| {
                        RigError::InvalidSchedule(format!("speed must be a number, got {v}"))
                    })?;
                    let rounded = raw.round();
                    if rounded < SPEED_MIN as f64 || rounded > SPEED_MAX as f64 {
                        return Err(RigError::range(
                            "block speed",
                            rounded as i64,
                            SPEED_MIN as i64,
                            SPEED_MAX as i64,
                        ));
                    }
                    Ok(rounded as u16)
                }
            }
        };
        let action = match name {
            "move_plus" => Action::Move {
                direction: Direction::Positive,
                speed: speed()?,
            },
            "move_minus" => Action::Move {
                direction: Direction::Negative,
                speed: speed()?,
            },
            "rotate_cw" => Action::Rotate {
                direction: Direction::Positive,
                speed: speed()?,
            },
            "rotate_ccw" => Action::Rotate {
                direction: Direction::Negative,
                speed: speed()?,
            },
            "stop" => Action::Stop,
            "valve_open" => Action::ValveOpen,
            "valve_close" => Action::ValveClose,
            "setpoint" => {
                let value = params
                    .get("value")
                    .and_then(Value::as_f64)
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .ok_or_else(|| {
                        RigError::InvalidSchedule("setpoint needs a non-negative \"value\"".into())
                    })?;
                Action::Setpoint {
                    value: value as f32,
                }
            }
            other => return Err(RigError::InvalidSchedule(format!("unknown action {other:?}"))),
        };
        Ok(action)
    }

    pub fn is_motor_action(&self) -> bool {
        matches!(self, Action::Move { .. } | Action::Rotate { .. } | Action::Stop)
    }

    /// Speed this action holds its motor at while active.
    pub fn commanded_speed(&self) -> u16 {
        match self {
            Action::Move { speed, .. } | Action::Rotate { speed, .. } => *speed,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub device: DeviceId,
    pub start: u32,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.device, self.start)
    }
}

impl FromStr for BlockId {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, start) = s
            .rsplit_once('_')
            .ok_or_else(|| RigError::UnknownBlock(s.to_string()))?;
        let start = start
            .parse()
            .map_err(|_| RigError::UnknownBlock(s.to_string()))?;
        Ok(BlockId {
            device: device.parse()?,
            start,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleBlock {
    device: DeviceId,
    start: u32,
    duration: u32,
    action: Action,
}

impl ScheduleBlock {
    pub fn new(device: DeviceId, start: u32, duration: u32, action: Action) -> Result<Self, RigError> {
        if duration == 0 {
            return Err(RigError::InvalidSchedule(format!(
                "{device} block at {start}s has zero duration"
            )));
        }
        if start.checked_add(duration).is_none() {
            return Err(RigError::InvalidSchedule(format!(
                "{device} block at {start}s runs past the end of time"
            )));
        }
        let fits = match device {
            DeviceId::Motor(_) => action.is_motor_action(),
            DeviceId::Gas(gas) => !action.is_motor_action() && gas.kind().supports_setpoint(),
        };
        if !fits {
            return Err(RigError::InvalidSchedule(format!(
                "{} cannot run on {device}",
                action.name()
            )));
        }
        Ok(Self {
            device,
            start,
            duration,
            action,
        })
    }

    pub fn id(&self) -> BlockId {
        BlockId {
            device: self.device,
            start: self.start,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn end(&self) -> u32 {
        self.start + self.duration
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn contains(&self, elapsed: u32) -> bool {
        self.start <= elapsed && elapsed < self.end()
    }

    pub fn overlaps(&self, other: &ScheduleBlock) -> bool {
        self.device == other.device && !(self.end() <= other.start || self.start >= other.end())
    }
}

/// Blocks ordered by (start, device).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    blocks: Vec<ScheduleBlock>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schedule from arbitrary blocks, rejecting the whole set if any
    /// two overlap.
    pub fn from_blocks(blocks: impl IntoIterator<Item = ScheduleBlock>) -> Result<Self, RigError> {
        let mut schedule = Self::new();
        for block in blocks {
            schedule.insert(block)?;
        }
        Ok(schedule)
    }

    pub fn insert(&mut self, block: ScheduleBlock) -> Result<BlockId, RigError> {
        if let Some(other) = self.blocks.iter().find(|b| b.overlaps(&block)) {
            return Err(RigError::Conflict {
                device: block.device.to_string(),
                start: block.start,
                end: block.end(),
                other_start: other.start,
                other_end: other.end(),
            });
        }
        let id = block.id();
        let key = (block.start, block.device);
        let at = self.blocks.partition_point(|b| (b.start, b.device) < key);
        self.blocks.insert(at, block);
        Ok(id)
    }

    pub fn remove(&mut self, id: &BlockId) -> Result<ScheduleBlock, RigError> {
        let at = self
            .blocks
            .iter()
            .position(|b| b.id() == *id)
            .ok_or_else(|| RigError::UnknownBlock(id.to_string()))?;
        Ok(self.blocks.remove(at))
    }

    pub fn get(&self, id: &BlockId) -> Option<&ScheduleBlock> {
        self.blocks.iter().find(|b| b.id() == *id)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn blocks(&self) -> &[ScheduleBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Latest end offset, zero for an empty schedule.
    pub fn end_time(&self) -> u32 {
        self.blocks.iter().map(ScheduleBlock::end).max().unwrap_or(0)
    }

    /// Blocks whose window contains `elapsed`.
    pub fn active_at(&self, elapsed: u32) -> impl Iterator<Item = &ScheduleBlock> {
        self.blocks.iter().filter(move |b| b.contains(elapsed))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub device_id: String,
    pub start_seconds: u32,
    pub duration_seconds: u32,
    pub action_name: String,
    #[serde(default)]
    pub action_params: Value,
}

impl From<&ScheduleBlock> for BlockRecord {
    fn from(block: &ScheduleBlock) -> Self {
        Self {
            device_id: block.device.to_string(),
            start_seconds: block.start,
            duration_seconds: block.duration,
            action_name: block.action.name().to_string(),
            action_params: block.action.params(),
        }
    }
}

impl TryFrom<&BlockRecord> for ScheduleBlock {
    type Error = RigError;

    fn try_from(record: &BlockRecord) -> Result<Self, Self::Error> {
        let device = record.device_id.parse()?;
        let action = Action::from_parts(&record.action_name, &record.action_params)?;
        ScheduleBlock::new(device, record.start_seconds, record.duration_seconds, action)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFile {
    /// Creation time as written; informational only.
    #[serde(default)]
    pub created: String,
    pub blocks: Vec<BlockRecord>,
}

impl ScheduleFile {
    pub fn from_schedule(schedule: &Schedule) -> Self {
        Self {
            created: chrono::Local::now().to_rfc3339(),
            blocks: schedule.blocks().iter().map(BlockRecord::from).collect(),
        }
    }

    pub fn to_schedule(&self) -> Result<Schedule, RigError> {
        let blocks = self
            .blocks
            .iter()
            .map(ScheduleBlock::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Schedule::from_blocks(blocks)
    }

    pub fn save(schedule: &Schedule, path: &Path) -> Result<(), RigError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &Self::from_schedule(schedule))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Schedule, RigError> {
        let file: ScheduleFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        file.to_schedule()
    }
}
