use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::bail;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    api::{Api, PostParams},
    Resource, ResourceExt,
};
use kube_runtime::reflector::ObjectRef;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::{
    controller::{join_workers, object_key, spawn_worker, Controller, ControllerContext},
    errors::{ControllerError, ExtKubeApiError},
    informer::{wait_for_cache_sync, Informer, InformerEvent},
    metrics,
    queue::RateLimitingQueue,
};

pub const AGENT_NAME: &str = "reclaimable-pv-releaser";

const ANNOTATION_CONTROLLER_ID: &str = "reclaimable-pv-releaser.kubernetes.io/controller-id";

const RELEASED: &str = "Released";
const MESSAGE_PV_RELEASED: &str = "PV released successfully";

const ERR_RELEASE_PV: &str = "ErrReleasePV";

const SC_ADDED: &str = "SCAdded";
const SC_REMOVED: &str = "SCRemoved";
const SC_LOST: &str = "SCLost";

const EVENT_ACTION: &str = "Releasing";
const SC_EVENT_ACTION: &str = "Tracking";

/// The storage-class queue is intentionally serial: managed-set mutations
/// are small and their ordering matters.
const SC_THREADINESS: usize = 1;

/// Returns `Released` volumes of managed storage classes to `Available` by
/// clearing their stale claim reference, preserving the backing data.
///
/// A storage class is managed iff its
/// `reclaimable-pv-releaser.kubernetes.io/controller-id` annotation matches
/// this controller's id.
pub struct Releaser {
    ctx: ControllerContext,
    classes: Informer<StorageClass>,
    volumes: Informer<PersistentVolume>,
    classes_queue: Arc<RateLimitingQueue>,
    volumes_queue: Arc<RateLimitingQueue>,
    /// Names of managed storage classes. Guarded by a plain mutex; the lock
    /// is only held for the set operation, never across an API call.
    managed: Mutex<HashSet<String>>,
    /// Class names whose informer delete event has been observed but not yet
    /// processed by the class worker. Distinguishes an explicit removal from
    /// a class that silently vanished.
    pending_deletes: Mutex<HashSet<String>>,
}

impl Releaser {
    pub fn new(ctx: ControllerContext) -> Arc<Self> {
        info!("Releaser starting...");
        if let Some(namespace) = &ctx.namespace {
            warn!(
                "Releaser can't run within a namespace as PVs are not namespaced resources - ignoring --namespace={} and acting in the scope of the cluster",
                namespace
            );
        }
        let me = Arc::new(Self {
            classes: Informer::new(Api::all(ctx.client.clone())),
            volumes: Informer::new(Api::all(ctx.client.clone())),
            ctx,
            classes_queue: RateLimitingQueue::new("StorageClasses"),
            volumes_queue: RateLimitingQueue::new("PersistentVolumes"),
            managed: Mutex::new(HashSet::new()),
            pending_deletes: Mutex::new(HashSet::new()),
        });
        debug!("Setting up event handlers");
        {
            let queue = me.volumes_queue.clone();
            me.volumes.add_event_handler(move |event| {
                if let InformerEvent::Applied(volume) = event {
                    queue.add(&object_key(volume));
                }
            });
        }
        {
            let queue = me.classes_queue.clone();
            let releaser = Arc::downgrade(&me);
            me.classes.add_event_handler(move |event| match event {
                InformerEvent::Applied(class) => queue.add(&object_key(class)),
                InformerEvent::Deleted(class) => {
                    let key = object_key(class);
                    if let Some(releaser) = releaser.upgrade() {
                        releaser
                            .pending_deletes
                            .lock()
                            .expect("pending deletes poisoned")
                            .insert(key.clone());
                    }
                    queue.add(&key);
                }
            });
        }
        me
    }

    fn is_managed(&self, class: &str) -> bool {
        self.managed
            .lock()
            .expect("managed set poisoned")
            .contains(class)
    }

    /// Reconciles a storage class key, keeping the managed set in step with
    /// the class's controller-id annotation.
    pub(crate) async fn sync_storage_class(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        if self.ctx.cancelled() {
            return Err(ControllerError::Cancelled);
        }
        match self.classes.store().get(&ObjectRef::new(name)) {
            Some(class) => {
                let manager = class
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_CONTROLLER_ID));
                if manager == Some(&self.ctx.controller_id) {
                    let added = self
                        .managed
                        .lock()
                        .expect("managed set poisoned")
                        .insert(name.to_string());
                    if added {
                        info!("now managing volumes in storage class {}", name);
                        self.ctx
                            .recorder
                            .normal(
                                &class.object_ref(&()),
                                SC_ADDED,
                                SC_EVENT_ACTION,
                                format!("SC is now associated with controller id {}", self.ctx.controller_id),
                            )
                            .await;
                    }
                } else {
                    debug!(
                        "SC {} is not associated with this controller id {}, skip",
                        name, self.ctx.controller_id
                    );
                    let removed = self
                        .managed
                        .lock()
                        .expect("managed set poisoned")
                        .remove(name);
                    if removed {
                        info!("no longer managing volumes in storage class {}", name);
                        self.ctx
                            .recorder
                            .normal(
                                &class.object_ref(&()),
                                SC_REMOVED,
                                SC_EVENT_ACTION,
                                format!("SC is no longer associated with controller id {}", self.ctx.controller_id),
                            )
                            .await;
                    }
                }
            }
            None => {
                let explicit_delete = self
                    .pending_deletes
                    .lock()
                    .expect("pending deletes poisoned")
                    .remove(name);
                let removed = self
                    .managed
                    .lock()
                    .expect("managed set poisoned")
                    .remove(name);
                if removed {
                    info!("no longer managing volumes in storage class {}", name);
                    if explicit_delete {
                        self.ctx
                            .recorder
                            .normal(
                                &class_reference(name),
                                SC_REMOVED,
                                SC_EVENT_ACTION,
                                format!("SC {} was deleted", name),
                            )
                            .await;
                    } else {
                        self.ctx
                            .recorder
                            .warning(
                                &class_reference(name),
                                SC_LOST,
                                SC_EVENT_ACTION,
                                format!("SC {} disappeared without a delete event", name),
                            )
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconciles a persistent volume key from the work queue.
    pub(crate) async fn sync_volume(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        if self.ctx.cancelled() {
            return Err(ControllerError::Cancelled);
        }
        metrics::record_reconcile(AGENT_NAME, "pv");
        let Some(volume) = self.volumes.store().get(&ObjectRef::new(name)) else {
            warn!("pv '{}' in work queue no longer exists", name);
            return Ok(());
        };
        let class = volume
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .unwrap_or_default();
        if class.is_empty() || !self.is_managed(class) {
            debug!(
                "SC {:?} for PV {} is not associated with this controller id {}, skip",
                class, name, self.ctx.controller_id
            );
            return Ok(());
        }
        self.release_volume(&volume).await
    }

    async fn release_volume(&self, volume: &PersistentVolume) -> Result<(), ControllerError> {
        let name = volume.name_any();
        let phase = volume
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();
        if phase == "Available" {
            debug!("PV {} is already '{}' - moving on", name, phase);
            return Ok(());
        }
        if phase != "Released" {
            debug!("PV {} is '{}', can't make it 'Available'", name, phase);
            return Ok(());
        }
        if volume.spec.as_ref().map_or(true, |s| s.claim_ref.is_none()) {
            debug!("PV {} already had nil as claimRef - back off", name);
            return Ok(());
        }

        let mut updated = volume.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.claim_ref = None;
        }
        let volumes: Api<PersistentVolume> = Api::all(self.ctx.client.clone());
        match volumes.replace(&name, &PostParams::default(), &updated).await {
            Ok(_) => {
                metrics::record_volume_released();
                self.ctx
                    .recorder
                    .normal(
                        &volume.object_ref(&()),
                        RELEASED,
                        EVENT_ACTION,
                        MESSAGE_PV_RELEASED.to_string(),
                    )
                    .await;
                Ok(())
            }
            // The watch will re-deliver a fresh version; retrying the stale
            // one would always fail again.
            Err(e) if e.is_conflict() => {
                debug!(
                    "PV {} had a conflict - ignore it, it will be queued again with a new version",
                    name
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("PV {} no longer exists - nothing to release", name);
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .recorder
                    .warning(
                        &volume.object_ref(&()),
                        ERR_RELEASE_PV,
                        EVENT_ACTION,
                        format!("error releasing PV {}: {}", name, e),
                    )
                    .await;
                Err(e.into())
            }
        }
    }
}

/// Event reference for a storage class that may no longer exist.
fn class_reference(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("storage.k8s.io/v1".to_string()),
        kind: Some("StorageClass".to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl Controller for Releaser {
    async fn run(
        self: Arc<Self>,
        threadiness: usize,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Starting {} controller", AGENT_NAME);
        let class_informer = {
            let me = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { me.classes.run(shutdown).await })
        };
        let volume_informer = {
            let me = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { me.volumes.run(shutdown).await })
        };

        debug!("Waiting for informer caches to sync");
        let mut sync_shutdown = shutdown.clone();
        if !wait_for_cache_sync("sc", &mut sync_shutdown, self.classes.store()).await {
            bail!("failed to wait for SC caches to sync");
        }
        if !wait_for_cache_sync("pv", &mut sync_shutdown, self.volumes.store()).await {
            bail!("failed to wait for PV caches to sync");
        }

        // Rebuild the managed set and re-evaluate every volume immediately
        // instead of waiting for the first resync tick.
        for class in self.classes.store().state() {
            self.classes_queue.add(&object_key(class.as_ref()));
        }
        for volume in self.volumes.store().state() {
            self.volumes_queue.add(&object_key(volume.as_ref()));
        }

        debug!("Starting workers");
        let mut workers = Vec::with_capacity(threadiness + SC_THREADINESS);
        for _ in 0..SC_THREADINESS {
            let me = self.clone();
            workers.push(spawn_worker(
                "sc",
                self.classes_queue.clone(),
                move |namespace, name| {
                    let me = me.clone();
                    async move { me.sync_storage_class(&namespace, &name).await }
                },
            ));
        }
        for _ in 0..threadiness {
            let me = self.clone();
            workers.push(spawn_worker(
                "pv",
                self.volumes_queue.clone(),
                move |namespace, name| {
                    let me = me.clone();
                    async move { me.sync_volume(&namespace, &name).await }
                },
            ));
        }
        info!("Started {} controller", AGENT_NAME);

        let mut shutdown = shutdown;
        let _ = shutdown.wait_for(|v| *v).await;
        debug!("Shutting down workers");
        self.classes_queue.shut_down();
        self.volumes_queue.shut_down();
        join_workers("releaser", workers).await;
        let _ = class_informer.await;
        let _ = volume_informer.await;
        Ok(())
    }

    fn stop(&self) {
        self.classes_queue.shut_down();
        self.volumes_queue.shut_down();
        info!("Releaser stopped");
    }
}
