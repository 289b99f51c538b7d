//! CLI entry point: parses arguments, wires up the config store, the entity
//! bus, the destination updater, and the MITM relay, and runs the whole set
//! under the supervisor until shutdown or restart-budget exhaustion.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use juicepass_bridge::config::ConfigStore;
use juicepass_bridge::destination_updater;
use juicepass_bridge::entities::{self, EntityCommand, MqttEntityBus, MqttSettings};
use juicepass_bridge::error::{AdminError, BridgeError, RelayError};
use juicepass_bridge::frame::Frame;
use juicepass_bridge::relay::{Relay, RelayHooks};
use juicepass_bridge::supervisor;

/// Default vendor cloud endpoint, used when `--enelx_ip` is not given.
const DEFAULT_CLOUD_ADDR: &str = "juicenet-udp-prod3-usa.enelx.com:8047";
const DEFAULT_LOCAL_PORT: u16 = 8047;

#[derive(Parser, Debug)]
#[command(name = "juicepass-bridge", author, version, about = "MITM bridge between a JuiceBox EV charger and its vendor cloud", long_about = None)]
struct Cli {
    /// Admin-channel (telnet) target. Required if --update_udpc is set or --enelx_ip is unspecified.
    #[arg(long)]
    juicebox_host: Option<String>,

    /// Reconfigure the device's telemetry destination to point at this bridge.
    #[arg(long)]
    update_udpc: bool,

    /// Externally-visible bridge host, when the bridge sits behind NAT.
    #[arg(long)]
    jpp_host: Option<String>,

    #[arg(long, default_value = "localhost")]
    mqtt_host: String,
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,
    #[arg(long)]
    mqtt_user: Option<String>,
    #[arg(long)]
    mqtt_password: Option<String>,
    #[arg(long, default_value = "homeassistant")]
    mqtt_discovery_prefix: String,

    /// Local address to bind the UDP relay socket to.
    #[arg(long, default_value = "0.0.0.0")]
    local_ip: IpAddr,
    #[arg(long, default_value_t = DEFAULT_LOCAL_PORT)]
    local_port: u16,

    /// Vendor cloud UDP endpoint, `ip:port`. Falls back to the known production endpoint.
    #[arg(long)]
    enelx_ip: Option<String>,

    #[arg(long, default_value_t = 2000)]
    telnet_port: u16,
    #[arg(long, default_value_t = 30)]
    telnet_timeout: u64,

    /// Identifier used as the MQTT discovery unique_id prefix.
    #[arg(long, default_value = "JuiceBox")]
    juicebox_id: String,
    #[arg(long, default_value = "JuiceBox")]
    name: String,

    /// Drop cloud forwarding entirely and synthesize commands locally.
    #[arg(long)]
    ignore_enelx: bool,

    /// Expose raw-echo and raw-send diagnostic entities.
    #[arg(long)]
    experimental: bool,

    #[arg(long)]
    debug: bool,

    #[arg(long, default_value = ".")]
    config_loc: PathBuf,
    #[arg(long)]
    log_loc: Option<PathBuf>,
}

fn setup_logging(debug: bool, log_loc: Option<PathBuf>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match log_loc {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("juicepass-bridge.log"));
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Bridges the relay's narrow `RelayHooks` contract to the entity bus: every
/// decoded field becomes a published measurement, raw frames are echoed when
/// `--experimental` is set, and transport failures surface as the
/// `debug_message`/`status` entities described in SPEC_FULL §7.
struct BridgeHooks {
    bus: Arc<MqttEntityBus>,
    experimental: bool,
}

#[async_trait::async_trait]
impl RelayHooks for BridgeHooks {
    async fn local_hook(&self, raw: &[u8], frame: &Frame) {
        match frame {
            Frame::Telemetry(t) => {
                self.bus.set_state("status", format!("{:?}", t.status())).await;
                for (key, value) in t.to_simple_map() {
                    if key == "status" {
                        continue;
                    }
                    self.bus.set_state(&key, value).await;
                }
            }
            Frame::Debug(d) => {
                self.bus.set_state("debug_message", &d.text).await;
            }
            Frame::Encrypted(_) | Frame::Command(_) => {}
        }
        if self.experimental {
            self.bus.set_state("raw_device_frame", String::from_utf8_lossy(raw)).await;
        }
    }

    async fn remote_hook(&self, raw: &[u8]) {
        if self.experimental {
            self.bus.set_state("raw_cloud_frame", String::from_utf8_lossy(raw)).await;
        }
    }

    async fn publish_unavailable(&self) {
        self.bus.set_state("status", "unavailable").await;
    }

    async fn publish_oserror(&self, side: &str, addr: SocketAddr, message: &str) {
        self.bus
            .set_state("debug_message", format!("JuiceboxMITM_OSERROR|{side}|{addr}|{message}"))
            .await;
    }
}

/// Drains inbound entity commands and applies them to the relay, updating
/// setpoint state *before* triggering a synthesized command so the
/// synthesizer observes the new value (SPEC_FULL §5 ordering guarantee).
async fn dispatch_commands<H: RelayHooks>(
    mut commands: mpsc::Receiver<EntityCommand>,
    bus: Arc<MqttEntityBus>,
    relay: Arc<Relay<H>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            _ = shutdown.changed() => return,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => return,
            },
        };

        match command.entity.as_str() {
            "current_max_online" => match command.payload.trim().parse::<u32>() {
                Ok(value) => {
                    relay.set_setpoint_online(value).await;
                    bus.set_state("current_max_online", value.to_string()).await;
                    if let Err(e) = relay.send_command(true).await {
                        warn!(error = %e, "failed to send command after setpoint update");
                    }
                }
                Err(_) => warn!(payload = command.payload, "non-numeric current_max_online write"),
            },
            "current_max_offline" => match command.payload.trim().parse::<u32>() {
                Ok(value) => {
                    relay.set_setpoint_offline(value).await;
                    bus.set_state("current_max_offline", value.to_string()).await;
                    if let Err(e) = relay.send_command(true).await {
                        warn!(error = %e, "failed to send command after setpoint update");
                    }
                }
                Err(_) => warn!(payload = command.payload, "non-numeric current_max_offline write"),
            },
            "act_as_server" => {
                let on = matches!(command.payload.trim().to_ascii_lowercase().as_str(), "on" | "true" | "1");
                relay.set_act_as_server(on);
                bus.set_state("act_as_server", if on { "on" } else { "off" }).await;
            }
            "raw_send" => {
                if let Err(e) = relay.send_raw_to_device(command.payload.as_bytes()).await {
                    warn!(error = %e, "raw_send injection failed");
                }
            }
            other => warn!(entity = other, "command for unknown entity, ignoring"),
        }
    }
}

/// Restores any `<serial>_<entity>_initial_state` values persisted by a prior
/// run, per §4.3's initial-state policy. Applied before the bus opens its
/// command subscriptions so measurement entities don't momentarily read as
/// undefined after a restart.
async fn seed_initial_state(config: &ConfigStore, bus: &MqttEntityBus, serial: &str, entities: &[(&'static str, entities::EntityInfo)]) {
    for (key, _) in entities {
        if let Some(value) = config.get_device(serial, &format!("{key}_initial_state")) {
            bus.seed_state(key, value).await;
        }
    }
}

enum TaskOutcome {
    Relay(Result<(), RelayError>),
    Other,
}

async fn run_core(cli: &Cli, config: Arc<Mutex<ConfigStore>>, cloud_addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
    let catalogue = entities::catalogue(cli.experimental);
    let settings = MqttSettings {
        host: cli.mqtt_host.clone(),
        port: cli.mqtt_port,
        username: cli.mqtt_user.clone(),
        password: cli.mqtt_password.clone(),
        discovery_prefix: cli.mqtt_discovery_prefix.clone(),
        device_name: cli.name.clone(),
        juicebox_id: cli.juicebox_id.clone(),
    };

    let (bus, commands_rx) = MqttEntityBus::connect(settings, &catalogue).await;
    let bus = Arc::new(bus);
    {
        let config = config.lock().await;
        seed_initial_state(&config, &bus, &cli.juicebox_id, &catalogue).await;
        if let Some(rating) = config.get_device(&cli.juicebox_id, "current_rating") {
            bus.seed_state("current_rating", rating).await;
        }
    }

    let hooks = BridgeHooks { bus: bus.clone(), experimental: cli.experimental };
    let relay = Arc::new(Relay::bind(SocketAddr::new(cli.local_ip, cli.local_port), cloud_addr, cli.ignore_enelx, hooks).await?);

    let mut tasks = tokio::task::JoinSet::new();

    {
        let relay = relay.clone();
        let rx = shutdown.clone();
        tasks.spawn(async move { TaskOutcome::Relay(relay.run(rx).await) });
    }
    {
        let bus = bus.clone();
        let relay = relay.clone();
        let rx = shutdown.clone();
        tasks.spawn(async move {
            dispatch_commands(commands_rx, bus, relay, rx).await;
            TaskOutcome::Other
        });
    }
    if cli.update_udpc {
        let juicebox_addr = resolve_juicebox_addr(cli).await?;
        let bridge_host = cli.jpp_host.clone().unwrap_or_else(|| cli.local_ip.to_string());
        let bridge_port = cli.local_port;
        let op_timeout = Duration::from_secs(cli.telnet_timeout);
        let rx = shutdown.clone();
        tasks.spawn(async move {
            destination_updater::run(juicebox_addr, bridge_host, bridge_port, op_timeout, rx).await;
            TaskOutcome::Other
        });
    }

    let outcome = tasks.join_next().await;
    tasks.abort_all();

    match outcome {
        Some(Ok(TaskOutcome::Relay(Ok(())))) | Some(Ok(TaskOutcome::Other)) | None => Ok(()),
        Some(Ok(TaskOutcome::Relay(Err(e)))) => Err(BridgeError::Relay(e)),
        Some(Err(join_err)) => Err(BridgeError::Relay(RelayError::Fatal(format!("supervised task panicked: {join_err}")))),
    }
}

async fn resolve_juicebox_addr(cli: &Cli) -> Result<SocketAddr, BridgeError> {
    let host = cli
        .juicebox_host
        .clone()
        .expect("validated as required before run_core is reached");
    let target = format!("{host}:{}", cli.telnet_port);
    tokio::net::lookup_host(&target)
        .await
        .map_err(|e| BridgeError::Admin(AdminError::Io(e)))?
        .next()
        .ok_or_else(|| BridgeError::Admin(AdminError::Protocol(format!("could not resolve {target}"))))
}

async fn resolve_cloud_addr(cli: &Cli) -> Result<SocketAddr> {
    let target = cli.enelx_ip.clone().unwrap_or_else(|| DEFAULT_CLOUD_ADDR.to_string());
    tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("resolving cloud endpoint {target}"))?
        .next()
        .with_context(|| format!("no addresses for cloud endpoint {target}"))
}

fn validate(cli: &Cli) -> Result<()> {
    if (cli.update_udpc || cli.enelx_ip.is_none()) && cli.juicebox_host.is_none() {
        anyhow::bail!("--juicebox_host is required when --update_udpc is set or --enelx_ip is not given");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = setup_logging(cli.debug, cli.log_loc.clone())?;

    if let Err(e) = validate(&cli) {
        error!(error = %e, "invalid arguments");
        std::process::exit(2);
    }

    let cloud_addr = resolve_cloud_addr(&cli).await?;
    info!(%cloud_addr, local = %SocketAddr::new(cli.local_ip, cli.local_port), "starting juicepass-bridge");

    let config = Arc::new(Mutex::new(
        ConfigStore::new(&cli.config_loc).context("opening config store")?,
    ));
    {
        let mut store = config.lock().await;
        store.set("ENELX_IP", cloud_addr.to_string());
        store.set("JUICEBOX_ID", cli.juicebox_id.clone());
        let _ = store.flush_if_dirty();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervised = supervisor::run(|| {
        let cli = &cli;
        let config = config.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { run_core(cli, config, cloud_addr, shutdown_rx).await }
    });

    tokio::select! {
        result = supervised => {
            let mut store = config.lock().await;
            let _ = store.flush_if_dirty();
            match result {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(error = %e, "supervisor gave up");
                    std::process::exit(1);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
            let mut store = config.lock().await;
            let _ = store.flush_if_dirty();
            Ok(())
        }
    }
}
