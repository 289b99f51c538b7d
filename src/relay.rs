//! MITM relay (C7): a single UDP socket that demultiplexes datagrams between
//! the device and the cloud, invoking the codec and entity-bus hooks on the
//! way, and enforcing timeouts and an error budget.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::frame::{self, CommandFrame, Frame};
use crate::synthesizer::{self, Setpoints, SynthesizerState};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(120);
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RETRY_ATTEMPT: u32 = 3;
pub const REBIND_SPACING: Duration = Duration::from_secs(5);
pub const ERROR_LOOKBACK: Duration = Duration::from_secs(60 * 60);
pub const MAX_ERROR_COUNT: usize = 10;
const MIN_SEND_PACING: Duration = Duration::from_millis(100);

/// Narrow contract the relay invokes on every decoded datagram. Modeled as a
/// trait (not the original's mutable callback fields) so the relay can be
/// constructed once and never mutated after startup.
#[async_trait]
pub trait RelayHooks: Send + Sync {
    /// Called for every datagram from the device, after classification.
    /// Publishes measurements; does not alter what gets forwarded.
    async fn local_hook(&self, raw: &[u8], frame: &Frame);
    /// Called for every datagram from the cloud. Raw echo only.
    async fn remote_hook(&self, raw: &[u8]);
    /// Published when a forward exhausts its retries and the datagram is dropped.
    async fn publish_unavailable(&self);
    /// Published on a cloud-side OS error, per §7's synthetic event.
    async fn publish_oserror(&self, side: &str, addr: SocketAddr, message: &str);
}

/// Per-run session state (§3): learned device address, last-seen frames, and
/// the rolling error-budget window. Mutated only from the relay's receive task.
#[derive(Debug, Default)]
pub struct Session {
    pub device_addr: Option<SocketAddr>,
    pub bound_serial: Option<String>,
    pub last_status_frame: Option<crate::frame::TelemetryFrame>,
    pub first_status_ts: Option<Instant>,
    pub last_command_frame: Option<CommandFrame>,
    pub last_boot_ts: Option<Instant>,
    error_timestamps: VecDeque<Instant>,
}

impl Session {
    /// Appends `now`, trims entries older than [`ERROR_LOOKBACK`], and
    /// returns whether the window now exceeds [`MAX_ERROR_COUNT`].
    fn record_error(&mut self, now: Instant) -> bool {
        self.error_timestamps.push_back(now);
        let cutoff = now.checked_sub(ERROR_LOOKBACK).unwrap_or(now);
        while let Some(&front) = self.error_timestamps.front() {
            if front < cutoff {
                self.error_timestamps.pop_front();
            } else {
                break;
            }
        }
        debug!(count = self.error_timestamps.len(), "errors in lookback window");
        self.error_timestamps.len() > MAX_ERROR_COUNT
    }
}

/// Owns the single UDP socket and enforces the sending lock, rebind policy,
/// and error budget described in §4.7.
pub struct Relay<H: RelayHooks> {
    local_addr: SocketAddr,
    cloud_addr: SocketAddr,
    ignore_cloud: bool,
    socket: RwLock<UdpSocket>,
    sending_lock: Mutex<()>,
    session: Mutex<Session>,
    setpoints: Mutex<Setpoints>,
    act_as_server: std::sync::atomic::AtomicBool,
    hooks: H,
}

impl<H: RelayHooks> Relay<H> {
    pub async fn bind(local_addr: SocketAddr, cloud_addr: SocketAddr, ignore_cloud: bool, hooks: H) -> Result<Self, RelayError> {
        let socket = bind_reuse_port(local_addr).await?;
        Ok(Self {
            local_addr,
            cloud_addr,
            ignore_cloud,
            socket: RwLock::new(socket),
            sending_lock: Mutex::new(()),
            session: Mutex::new(Session::default()),
            setpoints: Mutex::new(Setpoints::default()),
            act_as_server: std::sync::atomic::AtomicBool::new(true),
            hooks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_act_as_server(&self, value: bool) {
        self.act_as_server.store(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn set_setpoint_online(&self, value: u32) {
        self.setpoints.lock().await.current_max_online = Some(value);
    }

    pub async fn set_setpoint_offline(&self, value: u32) {
        self.setpoints.lock().await.current_max_offline = Some(value);
    }

    /// The device serial the session has bound to (first telemetry frame seen), if any.
    pub async fn bound_serial(&self) -> Option<String> {
        self.session.lock().await.bound_serial.clone()
    }

    /// Runs the receive loop until `shutdown` fires or the error budget trips,
    /// in which case [`RelayError::ErrorBudgetExceeded`] propagates to the caller
    /// (the supervisor) so the whole core can be restarted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RelayError> {
        info!(local = %self.local_addr, cloud = %self.cloud_addr, "starting MITM relay");
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut buf = vec![0u8; 2048];
            let recv_result = {
                let socket = self.socket.read().await;
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return Ok(()),
                    res = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => res,
                }
            };

            let (n, src) = match recv_result {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!(error = %e, "relay connection lost");
                    self.trip_or_rebind(RelayError::TransportClosed).await?;
                    continue;
                }
                Err(_) => {
                    warn!(timeout_s = RECV_TIMEOUT.as_secs(), "no message received before timeout");
                    self.trip_or_rebind(RelayError::Timeout).await?;
                    continue;
                }
            };
            buf.truncate(n);

            match timeout(HANDLER_TIMEOUT, self.handle(&buf, src)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "handler error"),
                Err(_) => {
                    warn!(timeout_s = HANDLER_TIMEOUT.as_secs(), "handler timeout");
                    self.trip_or_rebind(RelayError::Timeout).await?;
                }
            }
        }
    }

    /// Records `reason` against the error budget (§4.7/§7: both timeouts and
    /// transport-closed events count as one error each) and rebinds the socket.
    async fn trip_or_rebind(&self, reason: RelayError) -> Result<(), RelayError> {
        warn!(error = %reason, "counting error against budget and rebinding");
        let tripped = {
            let mut session = self.session.lock().await;
            session.record_error(Instant::now())
        };
        if tripped {
            return Err(RelayError::ErrorBudgetExceeded { count: MAX_ERROR_COUNT + 1 });
        }
        self.rebind().await
    }

    async fn rebind(&self) -> Result<(), RelayError> {
        for attempt in 1..=MAX_RETRY_ATTEMPT {
            match bind_reuse_port(self.local_addr).await {
                Ok(new_socket) => {
                    *self.socket.write().await = new_socket;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "rebind attempt failed");
                    tokio::time::sleep(REBIND_SPACING).await;
                }
            }
        }
        Err(RelayError::Fatal("exhausted rebind attempts".into()))
    }

    async fn handle(&self, data: &[u8], src: SocketAddr) -> Result<(), RelayError> {
        let device_addr = {
            let mut session = self.session.lock().await;
            if src.ip() != self.cloud_addr.ip() {
                session.device_addr = Some(src);
            }
            session.device_addr
        };

        if Some(src) == device_addr {
            self.handle_from_device(data, src).await
        } else if device_addr.is_some() && src == self.cloud_addr {
            self.handle_from_cloud(data).await
        } else {
            warn!(%src, "unknown address, dropping datagram");
            Ok(())
        }
    }

    async fn handle_from_device(&self, data: &[u8], device_addr: SocketAddr) -> Result<(), RelayError> {
        let decoded = frame::classify(data);
        let frame = match &decoded {
            Ok(f) => Some(f.clone()),
            Err(e) => {
                warn!(error = %e, "malformed frame from device");
                None
            }
        };

        if let Some(Frame::Telemetry(t)) = &frame {
            let mut session = self.session.lock().await;
            match &session.bound_serial {
                None => session.bound_serial = Some(t.serial.clone()),
                Some(bound) if bound != &t.serial => {
                    warn!(bound, serial = %t.serial, "frame serial does not match bound device serial, publishing anyway");
                }
                Some(_) => {}
            }
            if session.first_status_ts.is_none() {
                session.first_status_ts = Some(Instant::now());
            }
            session.last_status_frame = Some(t.clone());
            let mut setpoints = self.setpoints.lock().await;
            let state = SynthesizerState {
                last_status_frame: session.last_status_frame.clone(),
                last_command_frame: session.last_command_frame.clone(),
                first_status_ts: session.first_status_ts,
                last_boot_ts: session.last_boot_ts,
            };
            synthesizer::seed_setpoints(&mut setpoints, &state, Instant::now());
        }
        if let Some(Frame::Debug(d)) = &frame {
            if d.is_boot {
                self.session.lock().await.last_boot_ts = Some(Instant::now());
            }
        }

        if let Some(f) = &frame {
            self.hooks.local_hook(data, f).await;
        }

        let act_as_server = self.act_as_server.load(std::sync::atomic::Ordering::Relaxed);
        let is_telemetry = matches!(frame, Some(Frame::Telemetry(_)));

        if act_as_server && self.ignore_cloud && is_telemetry {
            self.send_command(false).await
        } else if self.ignore_cloud {
            Ok(())
        } else {
            match self.send(data, self.cloud_addr).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(error = %e, addr = %self.cloud_addr, "send to cloud failed");
                    self.hooks
                        .publish_oserror("server", self.cloud_addr, &e.to_string())
                        .await;
                    self.hooks.publish_unavailable().await;
                    let _ = device_addr;
                    Ok(())
                }
            }
        }
    }

    async fn handle_from_cloud(&self, data: &[u8]) -> Result<(), RelayError> {
        if self.ignore_cloud {
            info!("ignoring datagram from cloud");
            return Ok(());
        }
        self.hooks.remote_hook(data).await;
        let device_addr = self.session.lock().await.device_addr;
        if let Some(addr) = device_addr {
            if let Err(e) = self.send(data, addr).await {
                warn!(error = %e, %addr, "send to device failed");
                self.hooks.publish_oserror("client", addr, &e.to_string()).await;
                self.hooks.publish_unavailable().await;
            }
        }
        Ok(())
    }

    /// Synthesizes the next command frame from current setpoints/last status
    /// and sends it to the device, remembering it as `last_command_frame`.
    pub async fn send_command(&self, new_values: bool) -> Result<(), RelayError> {
        let device_addr = match self.session.lock().await.device_addr {
            Some(addr) => addr,
            None => return Ok(()),
        };

        let (state, setpoints) = {
            let session = self.session.lock().await;
            let state = SynthesizerState {
                last_status_frame: session.last_status_frame.clone(),
                last_command_frame: session.last_command_frame.clone(),
                first_status_ts: session.first_status_ts,
                last_boot_ts: session.last_boot_ts,
            };
            (state, *self.setpoints.lock().await)
        };

        let command = match synthesizer::synthesize(&state, &setpoints, new_values) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "unable to synthesize command");
                return Ok(());
            }
        };

        let wire = synthesizer::build(&command);
        self.session.lock().await.last_command_frame = Some(command);
        self.send(wire.as_bytes(), device_addr).await
    }

    /// Sends raw bytes straight to the device, bypassing the codec. Used by
    /// the experimental `raw_send` text entity for diagnostic injection.
    pub async fn send_raw_to_device(&self, data: &[u8]) -> Result<(), RelayError> {
        let device_addr = match self.session.lock().await.device_addr {
            Some(addr) => addr,
            None => return Ok(()),
        };
        self.send(data, device_addr).await
    }

    /// Acquires the sending lock, writes the datagram, and sleeps to enforce
    /// the ≥100ms inter-send pacing. Retries up to [`MAX_RETRY_ATTEMPT`] on
    /// transport errors, rebinding between attempts.
    async fn send(&self, data: &[u8], to: SocketAddr) -> Result<(), RelayError> {
        for attempt in 1..=MAX_RETRY_ATTEMPT {
            let result = timeout(SEND_TIMEOUT, async {
                let _guard = self.sending_lock.lock().await;
                let socket = self.socket.read().await;
                let sent = socket.send_to(data, to).await;
                tokio::time::sleep(MIN_SEND_PACING).await;
                sent
            })
            .await;

            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, reason = %RelayError::TransportClosed, "send attempt failed, rebinding");
                    self.rebind().await?;
                }
                Err(_) => {
                    warn!(attempt, reason = %RelayError::Timeout, "send timed out");
                }
            }
        }
        Err(RelayError::Fatal("unable to send data after retries".into()))
    }
}

async fn bind_reuse_port(addr: SocketAddr) -> Result<UdpSocket, RelayError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        None,
    )
    .map_err(RelayError::Os)?;
    socket.set_reuse_address(true).map_err(RelayError::Os)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(RelayError::Os)?;
    socket.set_nonblocking(true).map_err(RelayError::Os)?;
    socket.bind(&addr.into()).map_err(RelayError::Os)?;
    UdpSocket::from_std(socket.into()).map_err(RelayError::Os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingHooks {
        local: TokioMutex<Vec<Vec<u8>>>,
        remote: TokioMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl RelayHooks for StdArc<RecordingHooks> {
        async fn local_hook(&self, raw: &[u8], _frame: &Frame) {
            self.local.lock().await.push(raw.to_vec());
        }
        async fn remote_hook(&self, raw: &[u8]) {
            self.remote.lock().await.push(raw.to_vec());
        }
        async fn publish_unavailable(&self) {}
        async fn publish_oserror(&self, _side: &str, _addr: SocketAddr, _message: &str) {}
    }

    #[test]
    fn error_budget_trips_after_eleven_errors_in_one_minute() {
        let mut session = Session::default();
        let now = Instant::now();
        let mut tripped = false;
        for i in 0..11 {
            tripped = session.record_error(now + Duration::from_secs(i));
        }
        assert!(tripped, "11th error within the lookback window must trip the budget");
    }

    #[test]
    fn error_budget_window_excludes_stale_timestamps() {
        let mut session = Session::default();
        let base = Instant::now();
        for i in 0..5 {
            session.record_error(base + Duration::from_secs(i));
        }
        let tripped = session.record_error(base + ERROR_LOOKBACK + Duration::from_secs(3600));
        assert!(!tripped, "errors older than the lookback window must be trimmed");
    }

    #[tokio::test]
    async fn relay_forwards_device_telemetry_to_cloud() {
        let cloud = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cloud_addr = cloud.local_addr().unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let hooks = StdArc::new(RecordingHooks {
            local: TokioMutex::new(Vec::new()),
            remote: TokioMutex::new(Vec::new()),
        });
        let relay = StdArc::new(
            Relay::bind("127.0.0.1:0".parse().unwrap(), cloud_addr, false, hooks.clone())
                .await
                .unwrap(),
        );
        let relay_addr = relay.local_addr;

        let (_tx, rx) = watch::channel(false);
        let relay_task = relay.clone();
        let rx2 = rx.clone();
        tokio::spawn(async move {
            let _ = relay_task.run(rx2).await;
        });

        let payload = b"0910000000000000000000000000:V247,L11097,S0,T34,E14,i84,e1,t30:";
        device.send_to(payload, relay_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), cloud.recv_from(&mut buf))
            .await
            .expect("cloud should receive forwarded datagram")
            .unwrap();
        assert_eq!(&buf[..n], payload);
        assert_eq!(from, relay_addr);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hooks.local.lock().await.len(), 1);
        let _ = rx;
    }
}
