use log::{info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Turns SIGINT/SIGTERM into a single shutdown channel.
///
/// The first signal flips the channel to `true`; every long-running loop in
/// the crate observes it and drains. A second signal terminates the process
/// unconditionally.
pub(crate) fn shutdown_channel() -> anyhow::Result<watch::Receiver<bool>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => (),
            _ = terminate.recv() => (),
        }
        info!("received termination, signaling shutdown");
        let _ = tx.send(true);
        tokio::select! {
            _ = interrupt.recv() => (),
            _ = terminate.recv() => (),
        }
        warn!("received second termination signal, exiting immediately");
        std::process::exit(1);
    });
    Ok(rx)
}
