//! End-to-end exercise of the MITM relay (C7) in stand-alone mode
//! (`--ignore_enelx`): a fake device sends a telemetry datagram and should
//! receive a synthesized command frame back, with no cloud socket involved.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use juicepass_bridge::frame::Frame;
use juicepass_bridge::relay::{Relay, RelayHooks};
use tokio::net::UdpSocket;
use tokio::sync::watch;

struct NoopHooks;

#[async_trait]
impl RelayHooks for NoopHooks {
    async fn local_hook(&self, _raw: &[u8], _frame: &Frame) {}
    async fn remote_hook(&self, _raw: &[u8]) {}
    async fn publish_unavailable(&self) {}
    async fn publish_oserror(&self, _side: &str, _addr: SocketAddr, _message: &str) {}
}

#[tokio::test]
async fn stand_alone_mode_synthesizes_command_for_device() {
    // Cloud address only needs to exist for the `src.ip() != cloud_ip`
    // distinction; it is never contacted when `ignore_cloud` is set.
    let cloud_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let relay = std::sync::Arc::new(
        Relay::bind("127.0.0.1:0".parse().unwrap(), cloud_addr, true, NoopHooks)
            .await
            .unwrap(),
    );
    relay.set_setpoint_online(32).await;
    relay.set_setpoint_offline(16).await;
    let relay_addr = relay.local_addr();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = relay.clone();
    tokio::spawn(async move {
        let _ = relay_task.run(shutdown_rx).await;
    });

    let telemetry = b"0910000000000000000000000000:V247,L11097,S0,T34,E14,i84,e1,t30:";
    device.send_to(telemetry, relay_addr).await.unwrap();

    let mut buf = [0u8; 256];
    let (n, _from) = tokio::time::timeout(Duration::from_secs(2), device.recv_from(&mut buf))
        .await
        .expect("device should receive a synthesized command frame")
        .unwrap();

    let reply = std::str::from_utf8(&buf[..n]).unwrap();
    assert!(reply.starts_with("CMD"), "expected a command frame, got {reply:?}");
    assert!(reply.contains("A32M16"), "expected the seeded setpoints in the frame, got {reply:?}");
    assert!(reply.ends_with('$'));
}
