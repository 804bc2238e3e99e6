//! Command-line behaviour of the daemon and the CLI.

#![allow(missing_docs)]

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

#[test]
fn test_cli_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_tether-cli"))
        .arg("--help")
        .output()
        .expect("Failed to run tether-cli");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: tether-cli"));
    assert!(stdout.contains("run"));
}

#[test]
fn test_daemon_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_tether-daemon"))
        .arg("--help")
        .output()
        .expect("Failed to run tether-daemon");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: tether-daemon"));
}

struct Daemon(Child);

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn spawn_mock_daemon() -> (Daemon, String) {
    let address = format!("127.0.0.1:{}", free_port());
    let child = Command::new(env!("CARGO_BIN_EXE_tether-daemon"))
        .args(["--mock", "--listen", &address])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start tether-daemon");
    let daemon = Daemon(child);
    for _ in 0..100 {
        if TcpStream::connect(&address).is_ok() {
            return (daemon, address);
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("daemon never listened on {address}");
}

#[test]
fn test_mock_daemon_speaks_the_wire_protocol() {
    let (_daemon, address) = spawn_mock_daemon();
    // The readiness check above was served and closed; this one is next.
    let stream = TcpStream::connect(&address).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    let mut ask = |line: &str| {
        writer.write_all(format!("{line}\n").as_bytes()).unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        reply
    };
    assert_eq!(ask("CORE_OPEN"), "NO_ERROR, TARGET_STATE_HALTED\n");
    assert_eq!(ask("MEM_WRITE(0x10, 0x2, 0xaa 0x55)"), "NO_ERROR\n");
    assert_eq!(ask("MEM_READ(0x10, 0x2)"), "NO_ERROR, 0xaa, 0x55\n");
}

#[test]
fn test_cli_writes_and_reads_memory() {
    let (_daemon, address) = spawn_mock_daemon();
    let cli = |args: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_tether-cli"))
            .args(["--controller", &address])
            .args(args)
            .output()
            .expect("Failed to run tether-cli")
    };

    let write = cli(&["write", "0x200", "DEADBEEF"]);
    assert!(write.status.success(), "{}", String::from_utf8_lossy(&write.stderr));

    let read = cli(&["read", "0x200", "4"]);
    assert!(read.status.success());
    assert!(String::from_utf8_lossy(&read.stdout).contains("deadbeef"));

    let status = cli(&["status"]);
    assert!(String::from_utf8_lossy(&status.stdout).contains("TARGET_STATE_HALTED"));
}

#[test]
fn test_daemon_rejects_image_past_the_end_of_memory() {
    let image = std::env::temp_dir().join(format!("tether-image-{}.bin", std::process::id()));
    std::fs::write(&image, [0x90u8; 16]).unwrap();
    let address = format!("127.0.0.1:{}", free_port());
    let output = Command::new(env!("CARGO_BIN_EXE_tether-daemon"))
        .args(["--mock", "--listen", &address, "--load-address", "0xfff8", "--image"])
        .arg(&image)
        .output()
        .expect("Failed to run tether-daemon");
    let _ = std::fs::remove_file(&image);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not fit at 0xfff8"));
}
