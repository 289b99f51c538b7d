//! Exercises the destination-updater control loop (C6) against a fake
//! admin-channel TCP server on loopback, the way the teacher's integration
//! tests drive a subsystem end to end rather than unit-at-a-time. The fake
//! server mirrors the resync/echo/prompt dance `admin.rs`'s own unit test
//! uses, since `AdminClient::run_command` depends on that exact shape.

use std::time::Duration;

use juicepass_bridge::destination_updater;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

async fn read_until_newline(sock: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        sock.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if byte[0] == b'\n' {
            return buf;
        }
    }
}

/// Serves one `AdminClient::run_command` round trip: waits for the resync
/// newline, replies with a prompt, waits for and echoes back the real
/// command, then writes `body` followed by the terminating prompt.
async fn serve_command(sock: &mut TcpStream, body: &[u8]) {
    read_until_newline(sock).await;
    sock.write_all(b"> ").await.unwrap();
    let command = read_until_newline(sock).await;
    sock.write_all(&command).await.unwrap();
    sock.write_all(body).await.unwrap();
}

#[tokio::test]
async fn rewrites_destination_when_udpc_points_elsewhere() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = listener.local_addr().unwrap();

    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"> ").await.unwrap();

        // `list` -> one UDPC stream pointed at the wrong host.
        serve_command(
            &mut sock,
            b"! # Type  Info\r\n# 1 UDPC  old-cloud-host.example.com:8047 (1)\r\n>",
        )
        .await;

        // `udpc bridge.local 8047`
        serve_command(&mut sock, b">").await;

        let _ = done_tx.send(()).await;
    });

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(destination_updater::run(
        admin_addr,
        "bridge.local".to_string(),
        8047,
        Duration::from_secs(5),
        shutdown_rx,
    ));

    tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("destination updater should complete one tick")
        .expect("channel should not be dropped before firing");

    handle.abort();
}
