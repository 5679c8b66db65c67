use std::{
    env,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use clap::Parser;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, ResourceExt,
};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    errors::ControllerError,
    leader::{self, LeaderConfig},
    metrics,
    queue::RateLimitingQueue,
    recorder::EventRecorder,
    signals,
};

/// Workers per reconciler queue unless a queue needs stricter ordering.
pub(crate) const DEFAULT_THREADINESS: usize = 2;

/// Pause before restarting a worker loop that returned unexpectedly.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// A reconciling controller driven by [`run_controller_main`].
#[async_trait]
pub trait Controller: Send + Sync {
    /// Runs informers and workers until the shutdown channel fires.
    async fn run(
        self: Arc<Self>,
        threadiness: usize,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;

    /// Invoked when leadership is lost, shortly before the process exits.
    fn stop(&self);
}

/// Shared dependencies handed to a controller at construction time.
#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) client: Client,
    pub(crate) namespace: Option<String>,
    pub(crate) controller_id: String,
    pub(crate) recorder: Arc<EventRecorder>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl ControllerContext {
    pub(crate) fn new(
        client: Client,
        namespace: Option<String>,
        controller_name: &str,
        controller_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let recorder = Arc::new(EventRecorder::new(client.clone(), controller_name));
        Self {
            client,
            namespace,
            controller_id,
            recorder,
            shutdown,
        }
    }

    /// True once shutdown has been signalled; reconcilers bail out with
    /// [`ControllerError::Cancelled`] instead of starting new API writes.
    pub(crate) fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[derive(Parser, Debug)]
#[command(disable_version_flag = true)]
pub struct Flags {
    /// optional, absolute path to the kubeconfig file
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// this controller identity name - use the same string for both
    /// provisioner and releaser
    #[arg(long)]
    pub controller_id: Option<String>,

    /// limit to a specific namespace - only for provisioner
    #[arg(long)]
    pub namespace: Option<String>,

    /// optional, the lease lock holder identity name
    #[arg(long)]
    pub lease_lock_id: Option<String>,

    /// the lease lock resource name
    #[arg(long)]
    pub lease_lock_name: Option<String>,

    /// optional, the lease lock resource namespace; defaults to --namespace
    #[arg(long)]
    pub lease_lock_namespace: Option<String>,

    /// address the Prometheus scrape endpoint listens on
    #[arg(long, default_value = "0.0.0.0:9102")]
    pub metrics_addr: String,

    /// `version` prints the version and exits
    #[arg(value_name = "COMMAND")]
    pub command: Option<String>,
}

/// Top-level driver shared by both binaries.
///
/// Parses flags, builds the client, wires signal handling and leader
/// election, and hands a [`ControllerContext`] to `factory` once this
/// replica is elected. The controller returned by `factory` runs until
/// shutdown or loss of leadership.
pub async fn run_controller_main<F>(controller_name: &'static str, factory: F) -> anyhow::Result<()>
where
    F: FnOnce(ControllerContext) -> Arc<dyn Controller> + Send + 'static,
{
    let flags = Flags::parse();
    if let Some(command) = flags.command.as_deref() {
        if command == "version" {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        debug!("ignoring unknown positional argument {:?}", command);
    }
    debug!("{:?}", flags);

    let controller_id = flags
        .controller_id
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("unable to get controller id (missing controller-id flag)"))?;
    let namespace = flags.namespace.clone().filter(|v| !v.is_empty());
    let lease_namespace = flags
        .lease_lock_namespace
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| namespace.clone())
        .unwrap_or_default();
    let lease_identity = flags
        .lease_lock_id
        .clone()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    metrics::init_metrics(&flags.metrics_addr).await?;
    let config = build_config(flags.kubeconfig.as_deref()).await?;
    let client = Client::try_from(config)?;
    let shutdown = signals::shutdown_channel()?;

    let context = ControllerContext::new(
        client.clone(),
        namespace,
        controller_name,
        controller_id,
        shutdown.clone(),
    );
    let slot: Arc<Mutex<Option<Arc<dyn Controller>>>> = Default::default();
    let run = {
        let slot = slot.clone();
        let shutdown = shutdown.clone();
        move || async move {
            let controller = factory(context);
            *slot.lock().expect("controller slot poisoned") = Some(controller.clone());
            controller.run(DEFAULT_THREADINESS, shutdown).await
        }
    };
    let stop = {
        let slot = slot.clone();
        move || {
            if let Some(controller) = slot.lock().expect("controller slot poisoned").as_ref() {
                controller.stop();
            }
        }
    };
    leader::elect(
        LeaderConfig {
            lease_name: flags.lease_lock_name.clone().unwrap_or_default(),
            lease_namespace,
            identity: lease_identity,
        },
        client,
        shutdown,
        run,
        stop,
    )
    .await
}

/// Resolves cluster credentials: explicit flag, then `$KUBECONFIG`, then
/// in-cluster service account, then `$HOME/.kube/config`.
pub(crate) async fn build_config(kubeconfig: Option<&str>) -> anyhow::Result<Config> {
    if let Some(path) = kubeconfig.filter(|p| !p.is_empty()) {
        debug!("using kubeconfig {}", path);
        return load_kubeconfig(path).await;
    }
    if let Ok(path) = env::var("KUBECONFIG") {
        if !path.is_empty() {
            debug!("using KUBECONFIG={}", path);
            return load_kubeconfig(&path).await;
        }
    }
    if env::var("KUBERNETES_PORT").map_or(false, |v| !v.is_empty()) {
        debug!("using in cluster authentication");
        return Ok(Config::incluster()?);
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("home directory unknown"))?;
    let path = home.join(".kube").join("config");
    debug!("using home kubeconfig {}", path.display());
    load_kubeconfig(&path.to_string_lossy()).await
}

async fn load_kubeconfig(path: &str) -> anyhow::Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path)?;
    Ok(Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?)
}

/// Cache key for an object: `namespace/name`, or `name` when cluster-scoped.
pub(crate) fn object_key<K: ResourceExt>(object: &K) -> String {
    match object.namespace() {
        Some(namespace) if !namespace.is_empty() => {
            format!("{}/{}", namespace, object.name_any())
        }
        _ => object.name_any(),
    }
}

/// Splits a cache key back into `(namespace, name)`.
pub(crate) fn split_key(key: &str) -> anyhow::Result<(String, String)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, _) if !name.is_empty() => Ok((String::new(), name.to_string())),
        (Some(namespace), Some(name), None) if !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => bail!("unexpected key format {:?}", key),
    }
}

/// Spawns a worker draining `queue` through `handler` until shutdown.
///
/// Each handler invocation runs in its own task so a panicking handler is
/// logged and skipped rather than taking the process down. A worker loop
/// that exits without the queue shutting down is restarted after a short
/// pause to avoid spinning.
pub(crate) fn spawn_worker<F, Fut>(
    name: &'static str,
    queue: Arc<RateLimitingQueue>,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(String, String) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let worker_queue = queue.clone();
            let worker_handler = handler.clone();
            let worker = tokio::spawn(async move {
                while process_next_work_item(name, &worker_queue, &worker_handler).await {}
            });
            match worker.await {
                Ok(()) => {
                    if queue.is_shutting_down() {
                        break;
                    }
                    warn!("{} worker stopped unexpectedly, restarting", name);
                }
                Err(e) if e.is_panic() => {
                    error!("{} worker crashed: {}, restarting", name, e);
                }
                Err(_) => break,
            }
            tokio::time::sleep(WORKER_RESTART_DELAY).await;
        }
    })
}

/// Processes a single queue entry, returning `false` once the queue has shut
/// down.
pub(crate) async fn process_next_work_item<F, Fut>(
    name: &'static str,
    queue: &Arc<RateLimitingQueue>,
    handler: &F,
) -> bool
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
{
    let Some(key) = queue.get().await else {
        debug!("{} worker quit", name);
        return false;
    };
    let (namespace, object_name) = match split_key(&key) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("invalid resource key in {} queue: {}", name, e);
            queue.forget(&key);
            queue.done(&key);
            return true;
        }
    };
    // Isolate the handler so a panic only costs this one key.
    match tokio::spawn(handler(namespace, object_name)).await {
        Ok(Ok(())) => {
            queue.forget(&key);
            debug!("successfully synced '{}'", key);
            queue.done(&key);
        }
        Ok(Err(ControllerError::Cancelled)) => {
            debug!("sync of '{}' cancelled", key);
            queue.done(&key);
        }
        Ok(Err(e)) => {
            warn!("error syncing {} '{}': {}, requeuing", name, key, e);
            // The re-add must land before done so the queue sees the new
            // entry while the key is still marked in-flight.
            queue.add_rate_limited(&key);
            queue.done(&key);
        }
        Err(e) => {
            error!("{} handler for '{}' panicked: {}", name, key, e);
            queue.forget(&key);
            queue.done(&key);
        }
    }
    true
}

/// Awaits worker handles during shutdown, surfacing join failures in logs.
pub(crate) async fn join_workers(name: &'static str, workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("{} worker did not shut down cleanly: {}", name, e);
        }
    }
    info!("{} workers drained", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn split_key_handles_both_scopes() {
        assert_eq!(
            split_key("default/app").unwrap(),
            ("default".to_string(), "app".to_string())
        );
        assert_eq!(split_key("pv-1").unwrap(), (String::new(), "pv-1".to_string()));
        assert!(split_key("a/b/c").is_err());
        assert!(split_key("").is_err());
        assert!(split_key("ns/").is_err());
    }

    #[test]
    fn object_keys_round_trip() {
        let pod: k8s_openapi::api::core::v1::Pod = serde_json::from_value(serde_json::json!({
            "metadata": { "namespace": "default", "name": "app" }
        }))
        .unwrap();
        assert_eq!(object_key(&pod), "default/app");
        let pv: k8s_openapi::api::core::v1::PersistentVolume =
            serde_json::from_value(serde_json::json!({
                "metadata": { "name": "pv-1" }
            }))
            .unwrap();
        assert_eq!(object_key(&pv), "pv-1");
        assert_eq!(split_key(&object_key(&pod)).unwrap().0, "default");
    }

    #[test]
    fn flags_default_the_lease_settings() {
        let flags = Flags::try_parse_from(["prog", "--controller-id", "me"]).unwrap();
        assert_eq!(flags.controller_id.as_deref(), Some("me"));
        assert!(flags.lease_lock_id.is_none());
        assert!(flags.lease_lock_namespace.is_none());
        assert_eq!(flags.metrics_addr, "0.0.0.0:9102");
        let flags = Flags::try_parse_from(["prog", "version"]).unwrap();
        assert_eq!(flags.command.as_deref(), Some("version"));
    }

    #[tokio::test]
    async fn worker_forgets_malformed_keys_and_continues() {
        let queue = RateLimitingQueue::new("test");
        queue.add("a/b/c");
        queue.add("default/app");
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = calls.clone();
            move |namespace: String, name: String| {
                let calls = calls.clone();
                async move {
                    assert_eq!((namespace.as_str(), name.as_str()), ("default", "app"));
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };
        assert!(process_next_work_item("test", &queue, &handler).await);
        assert!(process_next_work_item("test", &queue, &handler).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_syncs_are_requeued_with_backoff() {
        let queue = RateLimitingQueue::new("test");
        queue.add("default/app");
        let handler = |_namespace: String, _name: String| async {
            Err(ControllerError::Any(anyhow!("boom")))
        };
        assert!(process_next_work_item("test", &queue, &handler).await);
        assert_eq!(queue.len(), 0);
        tokio::time::sleep(Duration::from_millis(6)).await;
        // The key came back after the base back-off delay.
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_syncs_are_not_requeued() {
        let queue = RateLimitingQueue::new("test");
        queue.add("default/app");
        let handler = |_namespace: String, _name: String| async { Err(ControllerError::Cancelled) };
        assert!(process_next_work_item("test", &queue, &handler).await);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 0);
    }

    async fn panicking(_namespace: String, _name: String) -> Result<(), ControllerError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handlers_do_not_kill_the_worker() {
        let queue = RateLimitingQueue::new("test");
        queue.add("default/app");
        assert!(process_next_work_item("test", &queue, &panicking).await);
        queue.shut_down();
        assert!(!process_next_work_item("test", &queue, &panicking).await);
    }

    #[tokio::test]
    async fn worker_exits_when_the_queue_shuts_down() {
        let queue = RateLimitingQueue::new("test");
        let worker = spawn_worker("test", queue.clone(), |_ns: String, _name: String| async {
            Ok(())
        });
        queue.shut_down();
        worker.await.unwrap();
    }
}
