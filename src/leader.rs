use std::future::Future;

use anyhow::bail;
use kube::Client;
use kube_lease_manager::LeaseManagerBuilder;
use log::{info, warn};
use tokio::sync::watch;

/// Lease lifetime. A crashed leader blocks the fleet for at most this long.
const LEASE_DURATION_SECS: u64 = 60;

/// How long before expiry the active leader renews.
const RENEW_GRACE_SECS: u64 = 15;

pub(crate) struct LeaderConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub identity: String,
}

/// Leader election gate: at most one replica across the fleet runs `run` at
/// any time.
///
/// Blocks until the lease is acquired, then drives `run` to completion. If
/// leadership is lost while `run` is active the `stop` callback is invoked
/// and the process exits with code 0 — a demoted replica is never kept
/// alive next to the new leader. On graceful shutdown the lease is released
/// so the next replica does not have to wait out the full lease duration.
pub(crate) async fn elect<R, Fut, S>(
    config: LeaderConfig,
    client: Client,
    mut shutdown: watch::Receiver<bool>,
    run: R,
    stop: S,
) -> anyhow::Result<()>
where
    R: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
    S: FnOnce(),
{
    if config.lease_name.is_empty() {
        bail!("unable to get lease lock resource name (missing lease-lock-name flag)");
    }
    if config.lease_namespace.is_empty() {
        bail!("unable to get lease lock resource namespace (missing lease-lock-namespace flag)");
    }

    let manager = LeaseManagerBuilder::new(client, config.lease_name.as_str())
        .with_namespace(config.lease_namespace.clone())
        .with_identity(config.identity.clone())
        .with_duration(LEASE_DURATION_SECS)
        .with_grace(RENEW_GRACE_SECS)
        .build()
        .await?;
    let (mut leader_rx, lease_task) = manager.watch().await;
    info!(
        "attempting to acquire leader lease {}/{} as {}",
        config.lease_namespace, config.lease_name, config.identity
    );

    // Wait until this replica becomes the leader, or give up on shutdown.
    loop {
        if *leader_rx.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = leader_rx.changed() => {
                if changed.is_err() {
                    bail!("lease manager terminated before leadership was acquired");
                }
            }
            _ = shutdown.wait_for(|v| *v) => {
                info!("shutdown requested before leadership was acquired");
                drop(leader_rx);
                join_lease_task(lease_task).await;
                return Ok(());
            }
        }
    }
    info!("I am the leader now: {}", config.identity);

    let run_future = run();
    tokio::pin!(run_future);
    loop {
        tokio::select! {
            result = &mut run_future => {
                stop();
                // Dropping the watch ends the lease task, releasing the lease.
                drop(leader_rx);
                join_lease_task(lease_task).await;
                return result;
            }
            changed = leader_rx.changed() => {
                let lost = changed.is_err() || !*leader_rx.borrow_and_update();
                if lost {
                    warn!("leader lease lost: {}", config.identity);
                    stop();
                    std::process::exit(0);
                }
            }
        }
    }
}

async fn join_lease_task(
    task: tokio::task::JoinHandle<
        Result<kube_lease_manager::LeaseManager, kube_lease_manager::LeaseManagerError>,
    >,
) {
    match task.await {
        Ok(Ok(_)) => (),
        Ok(Err(e)) => warn!("lease manager shut down with error: {}", e),
        Err(e) => warn!("lease manager task failed: {}", e),
    }
}
