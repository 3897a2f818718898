//! Crash the real binary with the exit fault mode, then recover in a second
//! process over the same data directory.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use xa_recovery_harness::harness::CRASH_EXIT_CODE;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    listener.local_addr().expect("failed to get local addr").port()
}

fn spawn_harness(dir: &Path, port: u16) -> Child {
    Command::new(env!("CARGO_BIN_EXE_xa-recovery-harness"))
        .arg("--port")
        .arg(port.to_string())
        .arg("--data-dir")
        .arg(dir)
        .arg("--fault")
        .arg("exit")
        .arg("--poll-interval-ms")
        .arg("300")
        .arg("--recovery-period-ms")
        .arg("50")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn harness binary")
}

async fn wait_ready(port: u16) {
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("harness did not become ready in time");
}

/// Send a request; `None` when the connection dies without an answer
async fn request(port: u16, method: &str, path: &str, body: &str) -> Option<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.ok()?;
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.ok()?;
    if buf.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

#[tokio::test]
async fn test_process_exit_and_second_process_recovery() {
    let tmp = TempDir::new().expect("failed to create tempdir");

    let port = free_port();
    let mut first = spawn_harness(tmp.path(), port);
    wait_ready(port).await;

    let answer = request(port, "POST", "/executor/crash", "X").await;
    assert!(answer.is_none(), "crash request was answered: {:?}", answer);

    let status = tokio::time::timeout(Duration::from_secs(10), first.wait())
        .await
        .expect("crashed process did not exit")
        .expect("failed to wait for process");
    assert_eq!(status.code(), Some(CRASH_EXIT_CODE));

    let records: Vec<_> = std::fs::read_dir(tmp.path().join("xa-log"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".awaiting"))
        .collect();
    assert_eq!(records.len(), 1);

    let port = free_port();
    let mut second = spawn_harness(tmp.path(), port);
    wait_ready(port).await;

    let response = request(port, "GET", "/executor/recovery", "")
        .await
        .expect("recovery request got no answer");
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("[\"X\"]"), "{}", response);

    second.kill().await.expect("failed to stop harness");
}
