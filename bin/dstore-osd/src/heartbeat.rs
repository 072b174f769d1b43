//! Periodic heartbeat to the coordinator

use dstore_client::DirClient;
use dstore_common::{HeartbeatConfig, OsdId, ShutdownSignal};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// Send `HEARTBEAT(osd_id, port)` to the DIR after the initial delay and
/// then on every interval tick, until shutdown. Failed beats are dropped;
/// the DIR notices the silence on its own.
pub async fn heartbeat_loop(
    client: DirClient,
    osd_id: OsdId,
    port: u16,
    config: HeartbeatConfig,
    mut shutdown: ShutdownSignal,
) {
    tokio::select! {
        () = shutdown.wait() => return,
        () = tokio::time::sleep(config.initial_delay()) => {}
    }
    info!(
        "Heartbeating as {} to {} every {:?}",
        osd_id,
        client.address(),
        config.interval()
    );

    let mut interval = tokio::time::interval(config.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            _ = interval.tick() => {
                match client.heartbeat(&osd_id, port).await {
                    Ok(()) => trace!("Heartbeat sent for {}", osd_id),
                    Err(e) => debug!("Heartbeat to {} failed: {}", client.address(), e),
                }
            }
        }
    }
    debug!("Heartbeat loop for {} stopped", osd_id);
}
