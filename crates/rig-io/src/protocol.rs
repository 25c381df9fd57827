//! JSON-lines messages exchanged with a presentation client.

use rig_core::exchange::EngineSnapshot;
use rig_core::gas_controller::GasId;
use rig_core::motor::StopMode;
use rig_core::motor_controller::MotorId;
use rig_core::schedule::BlockRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn is_supported(&self) -> bool {
        self.major == 1
    }
}

#[derive(Debug, Serialize)]
pub struct SnapshotMsg<'a> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    #[serde(flatten)]
    pub snapshot: &'a EngineSnapshot,
}

impl<'a> SnapshotMsg<'a> {
    pub fn new(snapshot: &'a EngineSnapshot) -> Self {
        Self {
            msg_type: "snapshot",
            protocol_version: ProtocolVersion::v1(),
            snapshot,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AckMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub request: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl AckMsg {
    pub fn new(request: &'static str, result: Option<Value>) -> Self {
        Self {
            msg_type: "ack",
            request,
            result,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub request: String,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(request: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            msg_type: "error",
            request: request.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelloMsg {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    Hello(HelloMsg),
    InsertBlock(BlockRecord),
    DeleteBlock {
        block_id: String,
    },
    Clear,
    Start,
    Stop,
    Reset,
    Save {
        path: String,
    },
    Load {
        path: String,
    },
    StartMotor {
        motor: MotorId,
        direction: String,
        #[serde(default)]
        speed: Option<u16>,
    },
    StopMotor {
        motor: MotorId,
        #[serde(default)]
        mode: StopMode,
    },
    StopAll,
    SetValve {
        gas: GasId,
        open: bool,
    },
    WriteSetpoint {
        gas: GasId,
        value: f32,
    },
    WriteGas {
        gas: GasId,
        index: u16,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has no \"type\"")]
    MissingType,
    #[error("unsupported message type {0:?}")]
    UnknownType(String),
}

const KNOWN_TYPES: &[&str] = &[
    "hello",
    "insert_block",
    "delete_block",
    "clear",
    "start",
    "stop",
    "reset",
    "save",
    "load",
    "start_motor",
    "stop_motor",
    "stop_all",
    "set_valve",
    "write_setpoint",
    "write_gas",
];

impl IncomingMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let msg_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !KNOWN_TYPES.contains(&msg_type) {
            return Err(ProtocolError::UnknownType(msg_type.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            IncomingMessage::Hello(_) => "hello",
            IncomingMessage::InsertBlock(_) => "insert_block",
            IncomingMessage::DeleteBlock { .. } => "delete_block",
            IncomingMessage::Clear => "clear",
            IncomingMessage::Start => "start",
            IncomingMessage::Stop => "stop",
            IncomingMessage::Reset => "reset",
            IncomingMessage::Save { .. } => "save",
            IncomingMessage::Load { .. } => "load",
            IncomingMessage::StartMotor { .. } => "start_motor",
            IncomingMessage::StopMotor { .. } => "stop_motor",
            IncomingMessage::StopAll => "stop_all",
            IncomingMessage::SetValve { .. } => "set_valve",
            IncomingMessage::WriteSetpoint { .. } => "write_setpoint",
            IncomingMessage::WriteGas { .. } => "write_gas",
        }
    }
}

/// Serialize `msg` as one protocol line, newline included.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}
