//! Destination updater (C6): a periodic control loop that ensures the
//! device's telemetry destination (its "UDPC stream") points at the bridge.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::admin::AdminClient;
use crate::error::AdminError;

const NORMAL_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_INTERVAL: Duration = Duration::from_secs(3);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs the destination-updater loop until `shutdown` is set to `true`. Each
/// tick opens a fresh admin session, lists UDPC streams, and rewrites the
/// destination if it doesn't already point solely at `(bridge_host, bridge_port)`.
pub async fn run(
    juicebox_addr: SocketAddr,
    bridge_host: String,
    bridge_port: u16,
    op_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let interval = match timeout(WATCHDOG_TIMEOUT, tick(juicebox_addr, &bridge_host, bridge_port, op_timeout)).await {
            Ok(Ok(())) => NORMAL_INTERVAL,
            Ok(Err(e)) => {
                warn!(error = %e, "destination updater tick failed, nothing to worry about unless this happens a lot");
                ERROR_INTERVAL
            }
            Err(_) => {
                warn!("destination updater watchdog timeout");
                ERROR_INTERVAL
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

async fn tick(
    juicebox_addr: SocketAddr,
    bridge_host: &str,
    bridge_port: u16,
    op_timeout: Duration,
) -> Result<(), AdminError> {
    debug!("destination updater check...");
    let mut client = AdminClient::open(juicebox_addr, op_timeout).await?;
    let streams = client.list_streams().await?;

    let mut udpc_ids: Vec<u32> = streams.iter().map(|s| s.id).collect();
    udpc_ids.sort_unstable();

    let matching = streams
        .iter()
        .find(|s| s.destination.contains(bridge_host));

    let update_required = match matching {
        None => {
            info!("UDPC destination not found, updating...");
            true
        }
        Some(_) if udpc_ids.len() > 1 => {
            info!("multiple UDPC streams present, updating...");
            true
        }
        Some(_) => {
            info!("UDPC destination correct");
            false
        }
    };

    if update_required {
        if let Some(&max_id) = udpc_ids.iter().max() {
            for &id in &udpc_ids {
                if id < max_id {
                    debug!(id, "closing stale UDPC stream");
                    client.close_stream(id).await?;
                }
            }
        }
        client.set_udpc(bridge_host, bridge_port).await?;
        info!(bridge_host, bridge_port, "changed UDPC destination");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_match_spec() {
        assert_eq!(NORMAL_INTERVAL, Duration::from_secs(30));
        assert_eq!(ERROR_INTERVAL, Duration::from_secs(3));
        assert_eq!(WATCHDOG_TIMEOUT, Duration::from_secs(60));
    }
}
