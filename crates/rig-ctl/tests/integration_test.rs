use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

struct RigProcess {
    child: Child,
    addr: String,
}

impl RigProcess {
    fn start(extra: &[&str]) -> Self {
        let bin_path = env!("CARGO_BIN_EXE_rig-ctl");

        let listener = TcpListener::bind("127.0.0.1:0")
            .expect("Failed to bind ephemeral port for integration test");
        let addr = listener
            .local_addr()
            .expect("Failed to resolve bound address");
        let bind_addr = format!("127.0.0.1:{}", addr.port());
        drop(listener);

        let child = Command::new(bin_path)
            .args(["--simulate", "--bind", &bind_addr, "--tick-ms", "50", "--publish-ms", "50"])
            .args(extra)
            .spawn()
            .expect("Failed to start rig-ctl");

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if TcpStream::connect(&bind_addr).is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        Self {
            child,
            addr: bind_addr,
        }
    }

    fn connect(&self) -> (TcpStream, BufReader<TcpStream>) {
        // The readiness probe above may still hold the single client slot.
        thread::sleep(Duration::from_millis(200));
        let stream = TcpStream::connect(&self.addr).expect("Failed to connect to rig-ctl");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }
}

impl Drop for RigProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_json(reader: &mut BufReader<TcpStream>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

/// Skip snapshots until a reply to `request` shows up.
fn read_reply(reader: &mut BufReader<TcpStream>, request: &str) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let msg = read_json(reader);
        if msg["type"] != "snapshot" && msg["request"] == request {
            return msg;
        }
    }
    panic!("no reply to {request}");
}

#[test]
fn test_snapshot_then_block_insert() {
    let rig = RigProcess::start(&[]);
    let (mut stream, mut reader) = rig.connect();

    let snapshot = read_json(&mut reader);
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["protocol_version"]["major"], 1);
    assert_eq!(snapshot["running"], false);

    let hello = serde_json::json!({
        "type": "hello",
        "protocol_version": { "major": 1, "minor": 0 },
        "client_id": "integration"
    });
    writeln!(stream, "{}", hello).unwrap();
    assert_eq!(read_reply(&mut reader, "hello")["type"], "ack");

    let insert = serde_json::json!({
        "type": "insert_block",
        "device_id": "upper_stage",
        "start_seconds": 0,
        "duration_seconds": 5,
        "action_name": "move_plus",
        "action_params": { "speed": 800 }
    });
    writeln!(stream, "{}", insert).unwrap();
    let ack = read_reply(&mut reader, "insert_block");
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["result"]["block_id"], "upper_stage_0");

    writeln!(stream, "{}", insert).unwrap();
    assert_eq!(read_reply(&mut reader, "insert_block")["type"], "error");
}

#[test]
fn test_started_schedule_dispatches_block() {
    let rig = RigProcess::start(&[]);
    let (mut stream, mut reader) = rig.connect();
    let _ = read_json(&mut reader);

    let insert = serde_json::json!({
        "type": "insert_block",
        "device_id": "mfc",
        "start_seconds": 1,
        "duration_seconds": 2,
        "action_name": "valve_open"
    });
    writeln!(stream, "{}", insert).unwrap();
    assert_eq!(read_reply(&mut reader, "insert_block")["type"], "ack");
    writeln!(stream, "{}", serde_json::json!({ "type": "start" })).unwrap();
    assert_eq!(read_reply(&mut reader, "start")["type"], "ack");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "block never executed");
        let msg = read_json(&mut reader);
        if msg["type"] != "snapshot" {
            continue;
        }
        if msg["blocks"][0]["executed"] == true {
            assert!(msg["stats"]["dispatched"].as_u64().unwrap() >= 1);
            break;
        }
    }
}

#[test]
fn test_run_seconds_exits_cleanly() {
    let bin_path = env!("CARGO_BIN_EXE_rig-ctl");
    let status = Command::new(bin_path)
        .args(["--simulate", "--no-bridge", "--tick-ms", "50", "--run-seconds", "1"])
        .status()
        .expect("Failed to run rig-ctl");
    assert!(status.success());
}

#[test]
fn test_bad_config_exits_with_error() {
    let bin_path = env!("CARGO_BIN_EXE_rig-ctl");
    let status = Command::new(bin_path)
        .args(["--config", "/nonexistent/rig.toml", "--run-seconds", "0"])
        .status()
        .expect("Failed to run rig-ctl");
    assert!(!status.success());
}
