use std::{
    fmt::Debug,
    hash::Hash,
    sync::Mutex,
    time::Duration,
};

use futures::StreamExt;
use kube::{api::Api, Resource};
use kube_runtime::{
    reflector::{self, store::Writer, Store},
    watcher, WatchStreamExt,
};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

/// Periodic full re-emission of the cache, to recover from missed events.
pub(crate) const RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Change notification dispatched to registered handlers.
///
/// `Applied` covers both creation and modification; the watch protocol does
/// not distinguish them and none of the reconcilers in this crate care.
pub(crate) enum InformerEvent<'a, K> {
    Applied(&'a K),
    Deleted(&'a K),
}

type Handler<K> = Box<dyn for<'a> Fn(InformerEvent<'a, K>) + Send + Sync>;

/// Subscribes to a typed object stream and maintains an in-memory snapshot.
///
/// Built on the reflector/watcher pair from `kube_runtime`; adds handler
/// registration, a periodic resync tick and a synchronous cache-sync
/// barrier ([`wait_for_cache_sync`]).
pub(crate) struct Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    api: Api<K>,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    handlers: Mutex<Vec<Handler<K>>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new(api: Api<K>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            api,
            store,
            writer: Mutex::new(Some(writer)),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// The typed lister backed by the informer's cache.
    pub fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Registers a change handler. Handlers must be registered before
    /// [`run`](Informer::run) is invoked and must not block.
    pub fn add_event_handler(&self, handler: impl for<'a> Fn(InformerEvent<'a, K>) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("informer handlers poisoned")
            .push(Box::new(handler));
    }

    /// Drives the watch until shutdown, dispatching change notifications and
    /// re-emitting the full cache every [`RESYNC_PERIOD`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let writer = self.writer.lock().expect("informer writer poisoned").take();
        let Some(writer) = writer else {
            error!("informer for {} started twice", std::any::type_name::<K>());
            return;
        };
        let stream = reflector::reflector(
            writer,
            watcher(self.api.clone(), watcher::Config::default()),
        )
        .default_backoff();
        futures::pin_mut!(stream);
        let mut resync = interval_at(Instant::now() + RESYNC_PERIOD, RESYNC_PERIOD);
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|v| *v) => return,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.dispatch(&event),
                    Some(Err(e)) => warn!("watch stream error: {}", e),
                    None => return,
                },
                _ = resync.tick() => {
                    let objects = self.store.state();
                    debug!("resyncing {} cached objects", objects.len());
                    for object in objects {
                        self.notify(InformerEvent::Applied(object.as_ref()));
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
                self.notify(InformerEvent::Applied(object))
            }
            watcher::Event::Delete(object) => self.notify(InformerEvent::Deleted(object)),
            watcher::Event::Init | watcher::Event::InitDone => (),
        }
    }

    fn notify(&self, event: InformerEvent<'_, K>) {
        let handlers = self.handlers.lock().expect("informer handlers poisoned");
        match event {
            InformerEvent::Applied(object) => {
                for handler in handlers.iter() {
                    handler(InformerEvent::Applied(object));
                }
            }
            InformerEvent::Deleted(object) => {
                for handler in handlers.iter() {
                    handler(InformerEvent::Deleted(object));
                }
            }
        }
    }

    /// Applies a watch event directly to the cache, bypassing the API server.
    #[cfg(test)]
    pub fn seed(&self, object: K) {
        let mut writer = self.writer.lock().expect("informer writer poisoned");
        if let Some(writer) = writer.as_mut() {
            writer.apply_watcher_event(&watcher::Event::Apply(object));
        }
    }

    #[cfg(test)]
    pub fn unseed(&self, object: K) {
        let mut writer = self.writer.lock().expect("informer writer poisoned");
        if let Some(writer) = writer.as_mut() {
            writer.apply_watcher_event(&watcher::Event::Delete(object));
        }
    }
}

/// Blocks until the store has completed its initial list, returning `false`
/// if shutdown is requested first. Callers must refuse to start workers on a
/// `false` return.
pub(crate) async fn wait_for_cache_sync<K>(
    name: &str,
    shutdown: &mut watch::Receiver<bool>,
    store: &Store<K>,
) -> bool
where
    K: kube_runtime::reflector::Lookup + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    tokio::select! {
        result = store.wait_until_ready() => match result {
            Ok(()) => true,
            Err(e) => {
                error!("{} cache failed to sync: {}", name, e);
                false
            }
        },
        _ = shutdown.wait_for(|v| *v) => {
            warn!("shutdown requested before {} cache synced", name);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube_runtime::reflector::ObjectRef;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pod(namespace: &str, name: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "namespace": namespace, "name": name },
        }))
        .unwrap()
    }

    fn informer() -> Informer<Pod> {
        let (client, _handle) = crate::test_support::mock_client();
        Informer::new(Api::all(client))
    }

    #[tokio::test]
    async fn seeded_objects_are_visible_through_the_store() {
        let informer = informer();
        informer.seed(pod("default", "app"));
        let cached = informer
            .store()
            .get(&ObjectRef::new("app").within("default"));
        assert!(cached.is_some());
        assert!(informer
            .store()
            .get(&ObjectRef::new("other").within("default"))
            .is_none());
    }

    #[tokio::test]
    async fn dispatch_notifies_registered_handlers() {
        let informer = informer();
        let applied = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));
        {
            let applied = applied.clone();
            let deleted = deleted.clone();
            informer.add_event_handler(move |event| match event {
                InformerEvent::Applied(_) => {
                    applied.fetch_add(1, Ordering::SeqCst);
                }
                InformerEvent::Deleted(_) => {
                    deleted.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        informer.dispatch(&watcher::Event::Apply(pod("default", "app")));
        informer.dispatch(&watcher::Event::InitApply(pod("default", "app")));
        informer.dispatch(&watcher::Event::Delete(pod("default", "app")));
        informer.dispatch(&watcher::Event::Init);
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_sync_barrier_yields_to_shutdown() {
        let informer = informer();
        let (tx, mut rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();
        // The store never becomes ready because the informer is not running.
        assert!(!wait_for_cache_sync("pod", &mut rx, informer.store()).await);
    }
}
