use crate::metrics::{BRIDGE_COMMANDS, BRIDGE_CONNECTED, BRIDGE_REJECTED};
use crate::protocol::{encode_line, AckMsg, ErrorMsg, HelloMsg, IncomingMessage, SnapshotMsg};
use rig_core::error::RigError;
use rig_core::motor_controller::parse_direction;
use rig_core::runner::EngineHandle;
use rig_core::schedule::{ScheduleBlock, DEFAULT_SPEED};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Longest request line accepted before the client is dropped.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    /// Reject commands until the client has said hello.
    pub require_handshake: bool,
    /// Save and load names resolve inside this directory.
    pub schedule_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7100".to_string(),
            publish_interval: Duration::from_millis(500),
            require_handshake: false,
            schedule_dir: PathBuf::from("schedules"),
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    handshake_seen: bool,
    client_id: Option<String>,
}

impl ClientState {
    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.client_id = hello.client_id.clone();
    }
}

/// Single-client JSON-lines server. Snapshots go out on a fixed interval;
/// each inbound line is answered with an ack or an error.
pub struct Bridge {
    listener: TcpListener,
    config: BridgeConfig,
}

impl Bridge {
    pub fn bind(config: BridgeConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, engine: EngineHandle, stop: Arc<AtomicBool>) {
        info!(
            addr = %self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            handshake = self.config.require_handshake,
            "Bridge listening"
        );

        let mut client: Option<TcpStream> = None;
        let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut send_buf: Vec<u8> = Vec::new();
        let mut send_offset: usize = 0;
        let mut last_publish = Instant::now();
        let mut state = ClientState::default();

        while !stop.load(Ordering::Relaxed) {
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, addr)) => match stream.set_nonblocking(true) {
                        Ok(()) => {
                            info!(client_addr = %addr, "Bridge client connected");
                            client = Some(stream);
                            // First snapshot goes out right away.
                            last_publish = Instant::now()
                                .checked_sub(self.config.publish_interval)
                                .unwrap_or_else(Instant::now);
                            BRIDGE_CONNECTED.set(1.0);
                        }
                        Err(e) => warn!(error = %e, "Bridge client setup failed"),
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => warn!(error = %err, "Bridge accept error"),
                }
            }

            let mut drop_client = false;
            if let Some(stream) = client.as_mut() {
                let mut temp = [0u8; 1024];
                match stream.read(&mut temp) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        recv_buf.extend_from_slice(&temp[..n]);
                        while let Some(pos) = recv_buf.iter().position(|b| *b == b'\n') {
                            let line = recv_buf.drain(..=pos).collect::<Vec<u8>>();
                            let text = String::from_utf8_lossy(&line);
                            let trimmed = text.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let reply = handle_line(trimmed, &engine, &self.config, &mut state);
                            send_buf.extend_from_slice(&reply);
                        }
                        if let Some(reply) = overlong_line_reply(&recv_buf) {
                            warn!(buffered = recv_buf.len(), "Bridge request line too long");
                            // Best effort: the client is dropped either way.
                            send_buf.extend_from_slice(&reply);
                            let _ = stream.write_all(&send_buf[send_offset..]);
                            drop_client = true;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        drop_client = true;
                    }
                }

                if send_buf.is_empty() && last_publish.elapsed() >= self.config.publish_interval {
                    let snapshot = engine.snapshot();
                    match encode_line(&SnapshotMsg::new(&snapshot)) {
                        Ok(line) => {
                            send_buf = line;
                            send_offset = 0;
                        }
                        Err(e) => warn!(error = %e, "Snapshot encode failed"),
                    }
                    last_publish = Instant::now();
                }

                if !drop_client && !send_buf.is_empty() {
                    match stream.write(&send_buf[send_offset..]) {
                        Ok(0) => {
                            info!("Bridge client disconnected");
                            drop_client = true;
                        }
                        Ok(n) => {
                            send_offset += n;
                            if send_offset >= send_buf.len() {
                                send_buf.clear();
                                send_offset = 0;
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            warn!(error = %err, "Bridge write error");
                            drop_client = true;
                        }
                    }
                }
            }

            if drop_client {
                client = None;
                recv_buf.clear();
                send_buf.clear();
                send_offset = 0;
                state = ClientState::default();
                BRIDGE_CONNECTED.set(0.0);
            }

            std::thread::sleep(Duration::from_millis(5));
        }
        info!("Bridge stopped");
    }
}

/// Parse and execute one request line, returning the encoded reply.
fn handle_line(
    line: &str,
    engine: &EngineHandle,
    config: &BridgeConfig,
    state: &mut ClientState,
) -> Vec<u8> {
    let encoded = match IncomingMessage::parse(line) {
        Ok(msg) => {
            let request = msg.type_name();
            BRIDGE_COMMANDS.with_label_values(&[request]).inc();
            match handle_incoming(msg, engine, config, state) {
                Ok(result) => encode_line(&AckMsg::new(request, result)),
                Err(message) => {
                    BRIDGE_REJECTED.inc();
                    encode_line(&ErrorMsg::new(request, message))
                }
            }
        }
        Err(e) => {
            BRIDGE_REJECTED.inc();
            warn!(error = %e, "Bridge message rejected");
            encode_line(&ErrorMsg::new("unknown", e.to_string()))
        }
    };
    encoded.unwrap_or_default()
}

/// Error reply for a partial line that has outgrown `MAX_LINE_LEN`.
fn overlong_line_reply(pending: &[u8]) -> Option<Vec<u8>> {
    if pending.len() <= MAX_LINE_LEN {
        return None;
    }
    BRIDGE_REJECTED.inc();
    let message = format!("request line exceeds {MAX_LINE_LEN} bytes");
    Some(encode_line(&ErrorMsg::new("unknown", message)).unwrap_or_default())
}

/// Clients name schedules, they do not pick paths.
fn schedule_path(config: &BridgeConfig, name: &str) -> Result<PathBuf, String> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(format!("invalid schedule name {name:?}"));
    }
    Ok(config.schedule_dir.join(name))
}

fn rig<T>(result: Result<T, RigError>) -> Result<T, String> {
    result.map_err(|e| e.to_string())
}

#[instrument(skip(engine, config, state), fields(request = msg.type_name()))]
fn handle_incoming(
    msg: IncomingMessage,
    engine: &EngineHandle,
    config: &BridgeConfig,
    state: &mut ClientState,
) -> Result<Option<Value>, String> {
    if let IncomingMessage::Hello(hello) = &msg {
        if !hello.protocol_version.is_supported() {
            warn!(
                major = hello.protocol_version.major,
                minor = hello.protocol_version.minor,
                "Unsupported protocol version"
            );
            return Err(format!(
                "unsupported protocol version {}.{}",
                hello.protocol_version.major, hello.protocol_version.minor
            ));
        }
        state.note_handshake(hello);
        info!(
            client_id = ?state.client_id,
            capabilities = ?hello.capabilities,
            "Bridge handshake received"
        );
        return Ok(None);
    }
    if config.require_handshake && !state.handshake_seen {
        warn!("Command received before handshake");
        return Err("hello required before commands".into());
    }

    debug!("Bridge command");
    let result = match msg {
        IncomingMessage::Hello(_) => None,
        IncomingMessage::InsertBlock(record) => {
            let block = rig(ScheduleBlock::try_from(&record))?;
            let id = rig(engine.insert(block))?;
            Some(json!({ "block_id": id.to_string() }))
        }
        IncomingMessage::DeleteBlock { block_id } => {
            let id = rig(block_id.parse())?;
            rig(engine.delete(id))?;
            None
        }
        IncomingMessage::Clear => rig(engine.clear()).map(|()| None)?,
        IncomingMessage::Start => rig(engine.start()).map(|()| None)?,
        IncomingMessage::Stop => rig(engine.stop()).map(|()| None)?,
        IncomingMessage::Reset => rig(engine.reset()).map(|()| None)?,
        IncomingMessage::Save { path } => {
            let path = schedule_path(config, &path)?;
            std::fs::create_dir_all(&config.schedule_dir).map_err(|e| e.to_string())?;
            let blocks = rig(engine.save(path))?;
            Some(json!({ "blocks": blocks }))
        }
        IncomingMessage::Load { path } => {
            let blocks = rig(engine.load(schedule_path(config, &path)?))?;
            Some(json!({ "blocks": blocks }))
        }
        IncomingMessage::StartMotor {
            motor,
            direction,
            speed,
        } => {
            let direction = rig(parse_direction(&direction))?;
            rig(engine.start_motor(motor, direction, speed.unwrap_or(DEFAULT_SPEED)))?;
            None
        }
        IncomingMessage::StopMotor { motor, mode } => rig(engine.stop_motor(motor, mode)).map(|()| None)?,
        IncomingMessage::StopAll => rig(engine.stop_all()).map(|()| None)?,
        IncomingMessage::SetValve { gas, open } => rig(engine.set_valve(gas, open)).map(|()| None)?,
        IncomingMessage::WriteSetpoint { gas, value } => {
            rig(engine.write_setpoint(gas, value)).map(|()| None)?
        }
        IncomingMessage::WriteGas { gas, index } => rig(engine.write_gas(gas, index)).map(|()| None)?,
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::bus::{SerialSettings, Transport};
    use rig_core::bus_sim::SimulatedBus;
    use rig_core::devices::RigDevices;
    use rig_core::engine::ScheduleEngine;
    use rig_core::exchange::SnapshotExchange;
    use rig_core::gas_controller::GasController;
    use rig_core::motor_controller::MotorController;
    use rig_core::runner::{EngineConfig, EngineRunner};

    fn engine() -> (EngineHandle, std::thread::JoinHandle<RigDevices>) {
        let sim = SimulatedBus::with_lab_defaults();
        let transport = Transport::new(SerialSettings::new("sim", 9600));
        let mut devices = RigDevices::new(
            MotorController::new(transport.clone()).with_settle_delay(Duration::ZERO),
            GasController::new(transport),
        );
        devices.connect(&sim, &sim).unwrap();
        EngineRunner::spawn(
            ScheduleEngine::new(),
            devices,
            EngineConfig {
                tick_interval: Duration::from_secs(60),
                poll_gas: false,
            },
            Arc::new(SnapshotExchange::new()),
        )
        .unwrap()
    }

    fn reply(line: &str, engine: &EngineHandle, config: &BridgeConfig, state: &mut ClientState) -> Value {
        let bytes = handle_line(line, engine, config, state);
        assert_eq!(bytes.last(), Some(&b'\n'));
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn insert_then_conflict_is_reported() {
        let (handle, join) = engine();
        let config = BridgeConfig::default();
        let mut state = ClientState::default();
        let insert = r#"{"type":"insert_block","device_id":"upper_stage","start_seconds":0,
            "duration_seconds":10,"action_name":"move_plus","action_params":{"speed":500}}"#;

        let ok = reply(insert, &handle, &config, &mut state);
        assert_eq!(ok["type"], "ack");
        assert_eq!(ok["result"]["block_id"], "upper_stage_0");

        let err = reply(insert, &handle, &config, &mut state);
        assert_eq!(err["type"], "error");
        assert_eq!(err["request"], "insert_block");

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn handshake_gate_blocks_commands() {
        let (handle, join) = engine();
        let config = BridgeConfig {
            require_handshake: true,
            ..BridgeConfig::default()
        };
        let mut state = ClientState::default();
        assert_eq!(reply(r#"{"type":"start"}"#, &handle, &config, &mut state)["type"], "error");
        let hello = r#"{"type":"hello","protocol_version":{"major":1,"minor":0},"client_id":"ui"}"#;
        assert_eq!(reply(hello, &handle, &config, &mut state)["type"], "ack");
        assert_eq!(reply(r#"{"type":"start"}"#, &handle, &config, &mut state)["type"], "ack");
        assert_eq!(state.client_id.as_deref(), Some("ui"));
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn garbage_and_bad_directions_are_errors() {
        let (handle, join) = engine();
        let config = BridgeConfig::default();
        let mut state = ClientState::default();
        assert_eq!(reply("not json", &handle, &config, &mut state)["type"], "error");
        let bad = r#"{"type":"start_motor","motor":"lower_stage","direction":"sideways"}"#;
        let err = reply(bad, &handle, &config, &mut state);
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("sideways"));
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn schedule_names_stay_inside_the_schedule_dir() {
        let (handle, join) = engine();
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside.json");
        let config = BridgeConfig {
            schedule_dir: dir.path().join("schedules"),
            ..BridgeConfig::default()
        };
        let mut state = ClientState::default();

        for name in ["../escape.json", outside.to_str().unwrap(), "a\\b.json", ""] {
            let line = json!({ "type": "save", "path": name }).to_string();
            let err = reply(&line, &handle, &config, &mut state);
            assert_eq!(err["type"], "error", "{name} was accepted");
            assert_eq!(err["request"], "save");
        }
        assert!(!outside.exists());
        assert!(!dir.path().join("escape.json").exists());

        let saved = reply(r#"{"type":"save","path":"run1.json"}"#, &handle, &config, &mut state);
        assert_eq!(saved["type"], "ack");
        assert!(config.schedule_dir.join("run1.json").exists());
        let loaded = reply(r#"{"type":"load","path":"run1.json"}"#, &handle, &config, &mut state);
        assert_eq!(loaded["type"], "ack");
        let escaped = reply(r#"{"type":"load","path":"../run1.json"}"#, &handle, &config, &mut state);
        assert_eq!(escaped["type"], "error");

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn overlong_partial_line_is_rejected() {
        assert!(overlong_line_reply(&vec![b'x'; MAX_LINE_LEN]).is_none());
        let bytes = overlong_line_reply(&vec![b'x'; MAX_LINE_LEN + 1]).unwrap();
        let msg: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg["type"], "error");
        assert!(msg["message"].as_str().unwrap().contains("exceeds"));
    }

    #[test]
    fn client_without_newline_is_dropped() {
        let (handle, join) = engine();
        let bridge = Bridge::bind(BridgeConfig {
            bind_addr: "127.0.0.1:0".into(),
            publish_interval: Duration::from_secs(60),
            ..BridgeConfig::default()
        })
        .unwrap();
        let addr = bridge.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let server = {
            let stop = Arc::clone(&stop);
            let handle = handle.clone();
            std::thread::spawn(move || bridge.run(handle, stop))
        };

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        // One byte over the limit, so the server reads everything before closing.
        stream.write_all(&vec![b'x'; MAX_LINE_LEN + 1]).unwrap();

        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received);
        let text = String::from_utf8_lossy(&received);
        assert!(text.contains("exceeds"), "no error reply in {text:?}");

        stop.store(true, Ordering::Relaxed);
        server.join().unwrap();
        handle.shutdown();
        join.join().unwrap();
    }
}
