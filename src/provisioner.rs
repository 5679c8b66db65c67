use std::{collections::BTreeMap, sync::Arc};

use anyhow::bail;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
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

pub const AGENT_NAME: &str = "dynamic-pvc-provisioner";

const ANNOTATION_BASE_NAME: &str = "dynamic-pvc-provisioner.kubernetes.io";
const ANNOTATION_ENABLED_KEY: &str = "enabled";
const ANNOTATION_PVC_KEY: &str = "pvc";

pub(crate) const LABEL_MANAGED_BY: &str = "dynamic-pvc-provisioner.kubernetes.io/managed-by";

const PVC_PROVISIONED: &str = "PVCProvisioned";
const MESSAGE_PVC_PROVISIONED: &str = "PVC created successfully";

const ERR_MISSING_PVC: &str = "ErrMissingPVC";
const ERR_INVALID_PVC: &str = "ErrInvalidPVC";
const ERR_MISSING_VOLUME: &str = "ErrMissingVolume";

const ERR_PVC_PROVISION_FAILED: &str = "ErrPVCProvisionFailed";
const MESSAGE_PVC_PROVISION_FAILED: &str = "PVC failed to create";

const EVENT_ACTION: &str = "Provisioning";

/// Watches pending pods and materialises the claims they declare inline
/// through `dynamic-pvc-provisioner.kubernetes.io/<volume>.enabled` /
/// `…/<volume>.pvc` annotation pairs.
pub struct Provisioner {
    ctx: ControllerContext,
    pods: Informer<Pod>,
    pods_queue: Arc<RateLimitingQueue>,
}

impl Provisioner {
    pub fn new(ctx: ControllerContext) -> Arc<Self> {
        info!("Provisioner starting...");
        let api = match &ctx.namespace {
            Some(namespace) => {
                info!("provisioner is only watching pods in namespace {}", namespace);
                Api::namespaced(ctx.client.clone(), namespace)
            }
            None => Api::all(ctx.client.clone()),
        };
        let me = Arc::new(Self {
            ctx,
            pods: Informer::new(api),
            pods_queue: RateLimitingQueue::new("Pods"),
        });
        debug!("Setting up event handlers");
        let queue = me.pods_queue.clone();
        me.pods.add_event_handler(move |event| {
            if let InformerEvent::Applied(pod) = event {
                queue.add(&object_key(pod));
            }
        });
        me
    }

    /// Reconciles a single pod key from the work queue.
    pub(crate) async fn sync_pod(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        if self.ctx.cancelled() {
            return Err(ControllerError::Cancelled);
        }
        metrics::record_reconcile(AGENT_NAME, "pod");
        let Some(pod) = self
            .pods
            .store()
            .get(&ObjectRef::new(name).within(namespace))
        else {
            warn!("pod '{}/{}' in work queue no longer exists", namespace, name);
            return Ok(());
        };
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase != Some("Pending") {
            debug!("pod '{}/{}' is not in 'Pending' status, skip", namespace, name);
            return Ok(());
        }

        let empty = BTreeMap::new();
        let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
        let pod_ref = pod.object_ref(&());

        // volume name -> claim name, or "" until matched against the pod spec
        let mut requested_volumes: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in annotations {
            let Some((base, rest)) = key.split_once('/') else {
                continue;
            };
            if base != ANNOTATION_BASE_NAME {
                continue;
            }
            let Some((volume_name, suffix)) = rest.split_once('.') else {
                continue;
            };
            if suffix != ANNOTATION_ENABLED_KEY {
                continue;
            }
            if !parse_enabled(value).unwrap_or(false) {
                debug!("'{}: {}', skip", key, value);
                continue;
            }
            let pvc_key = pvc_annotation_key(volume_name);
            if !annotations.contains_key(&pvc_key) {
                self.ctx
                    .recorder
                    .warning(
                        &pod_ref,
                        ERR_MISSING_PVC,
                        EVENT_ACTION,
                        format!("'{}' missing PVC", pvc_key),
                    )
                    .await;
                continue;
            }
            requested_volumes.insert(volume_name.to_string(), String::new());
        }

        if requested_volumes.is_empty() {
            debug!("pod '{}/{}' did not request any volumes, skip", namespace, name);
            return Ok(());
        }

        let volumes = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_deref())
            .unwrap_or_default();
        for volume in volumes {
            if !requested_volumes.contains_key(&volume.name) {
                debug!(
                    "pod '{}/{}' volume '{}' is not one of the requested, skip",
                    namespace, name, volume.name
                );
                continue;
            }
            match &volume.persistent_volume_claim {
                Some(source) => {
                    debug!("matched volume={} to pvc={}", volume.name, source.claim_name);
                    requested_volumes.insert(volume.name.clone(), source.claim_name.clone());
                }
                None => {
                    self.ctx
                        .recorder
                        .warning(
                            &pod_ref,
                            ERR_INVALID_PVC,
                            EVENT_ACTION,
                            format!(
                                "'{}' invalid PVC: consumer volume for requested pvc wasn't a persistentVolumeClaim type",
                                volume.name
                            ),
                        )
                        .await;
                    requested_volumes.remove(&volume.name);
                }
            }
        }

        let pod_namespace = pod.namespace().unwrap_or_default();
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(self.ctx.client.clone(), &pod_namespace);
        for (requested_volume, claim_name) in &requested_volumes {
            if claim_name.is_empty() {
                self.ctx
                    .recorder
                    .warning(
                        &pod_ref,
                        ERR_MISSING_VOLUME,
                        EVENT_ACTION,
                        format!("Pod was missing volume '{}'", requested_volume),
                    )
                    .await;
                continue;
            }
            let Some(raw) = annotations.get(&pvc_annotation_key(requested_volume)) else {
                continue;
            };
            let parsed: serde_json::Value = match serde_yaml::from_str(raw) {
                Ok(value) => value,
                Err(e) => {
                    self.ctx
                        .recorder
                        .warning(
                            &pod_ref,
                            ERR_INVALID_PVC,
                            EVENT_ACTION,
                            format!("'{}' invalid PVC: {}", requested_volume, e),
                        )
                        .await;
                    continue;
                }
            };
            match parsed.get("kind").and_then(|k| k.as_str()) {
                Some("PersistentVolumeClaim") => (),
                other => {
                    self.ctx
                        .recorder
                        .warning(
                            &pod_ref,
                            ERR_INVALID_PVC,
                            EVENT_ACTION,
                            format!(
                                "'{}' invalid PVC: expected pvc, got: {}",
                                requested_volume,
                                other.unwrap_or("<no kind>")
                            ),
                        )
                        .await;
                    continue;
                }
            }
            let mut claim: PersistentVolumeClaim = match serde_json::from_value(parsed) {
                Ok(claim) => claim,
                Err(e) => {
                    self.ctx
                        .recorder
                        .warning(
                            &pod_ref,
                            ERR_INVALID_PVC,
                            EVENT_ACTION,
                            format!("'{}' invalid PVC: {}", requested_volume, e),
                        )
                        .await;
                    continue;
                }
            };

            claim.metadata.name = Some(claim_name.clone());
            claim.metadata.owner_references = Some(vec![controller_reference(&pod)]);
            claim
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(LABEL_MANAGED_BY.to_string(), self.ctx.controller_id.clone());

            match claims.create(&PostParams::default(), &claim).await {
                Ok(_) => {
                    metrics::record_claim_provisioned();
                    self.ctx
                        .recorder
                        .normal(
                            &pod_ref,
                            PVC_PROVISIONED,
                            EVENT_ACTION,
                            MESSAGE_PVC_PROVISIONED.to_string(),
                        )
                        .await;
                }
                // Re-processing the same pod must not fail on claims that
                // were already materialised.
                Err(e) if e.is_already_exists() => continue,
                Err(e) => {
                    self.ctx
                        .recorder
                        .warning(
                            &pod_ref,
                            ERR_PVC_PROVISION_FAILED,
                            EVENT_ACTION,
                            MESSAGE_PVC_PROVISION_FAILED.to_string(),
                        )
                        .await;
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }
}

fn pvc_annotation_key(volume_name: &str) -> String {
    format!("{}/{}.{}", ANNOTATION_BASE_NAME, volume_name, ANNOTATION_PVC_KEY)
}

/// Annotation boolean. Accepts `1`/`t`/`T`/`TRUE`/`true`/`True` and the
/// matching false forms; anything else is unparsable.
fn parse_enabled(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Owner reference marking the pod as the claim's controller, so the claim
/// is garbage collected together with the pod.
fn controller_reference(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name_any(),
        uid: pod.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[async_trait]
impl Controller for Provisioner {
    async fn run(
        self: Arc<Self>,
        threadiness: usize,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Starting {} controller", AGENT_NAME);
        let informer = {
            let me = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { me.pods.run(shutdown).await })
        };

        debug!("Waiting for informer caches to sync");
        let mut sync_shutdown = shutdown.clone();
        if !wait_for_cache_sync("pod", &mut sync_shutdown, self.pods.store()).await {
            bail!("failed to wait for caches to sync");
        }

        debug!("Starting workers");
        let mut workers = Vec::with_capacity(threadiness);
        for _ in 0..threadiness {
            let me = self.clone();
            workers.push(spawn_worker(
                "pod",
                self.pods_queue.clone(),
                move |namespace, name| {
                    let me = me.clone();
                    async move { me.sync_pod(&namespace, &name).await }
                },
            ));
        }
        info!("Started {} controller", AGENT_NAME);

        let mut shutdown = shutdown;
        let _ = shutdown.wait_for(|v| *v).await;
        debug!("Shutting down workers");
        self.pods_queue.shut_down();
        join_workers("pod", workers).await;
        let _ = informer.await;
        Ok(())
    }

    fn stop(&self) {
        self.pods_queue.shut_down();
        info!("Provisioner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        calls_matching, event_reasons, json_response, mock_client, spawn_api, status_response,
        ApiCall,
    };
    use http::Response;
    use kube::client::Body;

    const CLAIM_TEMPLATE: &str = "\
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: placeholder
spec:
  accessModes:
    - ReadWriteOnce
  resources:
    requests:
      storage: 1Gi
";

    fn pod(phase: &str, annotations: serde_json::Value, volumes: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "namespace": "default",
                "name": "app",
                "uid": "pod-uid-1",
                "annotations": annotations,
            },
            "spec": { "containers": [], "volumes": volumes },
            "status": { "phase": phase },
        }))
        .unwrap()
    }

    fn annotated_pod() -> Pod {
        pod(
            "Pending",
            serde_json::json!({
                "dynamic-pvc-provisioner.kubernetes.io/data.enabled": "true",
                "dynamic-pvc-provisioner.kubernetes.io/data.pvc": CLAIM_TEMPLATE,
            }),
            serde_json::json!([
                { "name": "data", "persistentVolumeClaim": { "claimName": "app-data" } }
            ]),
        )
    }

    fn provisioner(client: kube::Client) -> Arc<Provisioner> {
        let (_tx, shutdown) = tokio::sync::watch::channel(false);
        let ctx = ControllerContext::new(
            client,
            None,
            AGENT_NAME,
            "test-controller".to_string(),
            shutdown,
        );
        Provisioner::new(ctx)
    }

    fn echo_created(call: &ApiCall) -> Response<Body> {
        json_response(201, &call.body)
    }

    #[tokio::test]
    async fn provisions_an_annotated_claim_for_a_pending_pod() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        provisioner.pods.seed(annotated_pod());

        provisioner.sync_pod("default", "app").await.unwrap();

        assert_eq!(
            calls_matching(&calls, "POST", "/namespaces/default/persistentvolumeclaims"),
            1
        );
        {
            let calls = calls.lock().unwrap();
            let create = calls
                .iter()
                .find(|c| c.path.ends_with("/persistentvolumeclaims"))
                .unwrap();
            assert_eq!(create.body["metadata"]["name"], "app-data");
            assert_eq!(
                create.body["metadata"]["labels"][LABEL_MANAGED_BY],
                "test-controller"
            );
            let owner = &create.body["metadata"]["ownerReferences"][0];
            assert_eq!(owner["kind"], "Pod");
            assert_eq!(owner["name"], "app");
            assert_eq!(owner["uid"], "pod-uid-1");
            assert_eq!(owner["controller"], true);
        }
        assert_eq!(event_reasons(&calls), vec!["PVCProvisioned"]);
    }

    #[tokio::test]
    async fn existing_claims_are_treated_as_success() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, |call| {
            if call.path.ends_with("/persistentvolumeclaims") {
                status_response(409, "AlreadyExists")
            } else {
                json_response(201, &call.body)
            }
        });
        let provisioner = provisioner(client);
        provisioner.pods.seed(annotated_pod());

        provisioner.sync_pod("default", "app").await.unwrap();

        assert!(event_reasons(&calls).is_empty());
    }

    #[tokio::test]
    async fn missing_pvc_annotation_is_reported_without_a_create() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        provisioner.pods.seed(pod(
            "Pending",
            serde_json::json!({
                "dynamic-pvc-provisioner.kubernetes.io/data.enabled": "true",
            }),
            serde_json::json!([
                { "name": "data", "persistentVolumeClaim": { "claimName": "app-data" } }
            ]),
        ));

        provisioner.sync_pod("default", "app").await.unwrap();

        assert_eq!(calls_matching(&calls, "POST", "/persistentvolumeclaims"), 0);
        assert_eq!(event_reasons(&calls), vec!["ErrMissingPVC"]);
    }

    #[tokio::test]
    async fn truthy_annotation_variants_are_accepted() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        provisioner.pods.seed(pod(
            "Pending",
            serde_json::json!({
                "dynamic-pvc-provisioner.kubernetes.io/data.enabled": "1",
                "dynamic-pvc-provisioner.kubernetes.io/data.pvc": CLAIM_TEMPLATE,
            }),
            serde_json::json!([
                { "name": "data", "persistentVolumeClaim": { "claimName": "app-data" } }
            ]),
        ));

        provisioner.sync_pod("default", "app").await.unwrap();

        assert_eq!(calls_matching(&calls, "POST", "/persistentvolumeclaims"), 1);
        assert_eq!(event_reasons(&calls), vec!["PVCProvisioned"]);
    }

    #[test]
    fn enabled_values_parse_like_the_annotation_contract() {
        for value in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_enabled(value), Some(true), "{}", value);
        }
        for value in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_enabled(value), Some(false), "{}", value);
        }
        assert_eq!(parse_enabled("yes"), None);
        assert_eq!(parse_enabled(""), None);
    }

    #[tokio::test]
    async fn non_pending_pods_are_ignored() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        let mut running = annotated_pod();
        running.status.as_mut().unwrap().phase = Some("Running".to_string());
        provisioner.pods.seed(running);

        provisioner.sync_pod("default", "app").await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undeclared_volumes_are_reported() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        provisioner.pods.seed(pod(
            "Pending",
            serde_json::json!({
                "dynamic-pvc-provisioner.kubernetes.io/data.enabled": "true",
                "dynamic-pvc-provisioner.kubernetes.io/data.pvc": CLAIM_TEMPLATE,
            }),
            serde_json::json!([]),
        ));

        provisioner.sync_pod("default", "app").await.unwrap();

        assert_eq!(calls_matching(&calls, "POST", "/persistentvolumeclaims"), 0);
        assert_eq!(event_reasons(&calls), vec!["ErrMissingVolume"]);
    }

    #[tokio::test]
    async fn non_claim_volume_sources_are_invalid() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        provisioner.pods.seed(pod(
            "Pending",
            serde_json::json!({
                "dynamic-pvc-provisioner.kubernetes.io/data.enabled": "true",
                "dynamic-pvc-provisioner.kubernetes.io/data.pvc": CLAIM_TEMPLATE,
            }),
            serde_json::json!([ { "name": "data", "emptyDir": {} } ]),
        ));

        provisioner.sync_pod("default", "app").await.unwrap();

        assert_eq!(calls_matching(&calls, "POST", "/persistentvolumeclaims"), 0);
        assert_eq!(event_reasons(&calls), vec!["ErrInvalidPVC"]);
    }

    #[tokio::test]
    async fn wrong_kind_in_the_claim_template_is_invalid() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);
        provisioner.pods.seed(pod(
            "Pending",
            serde_json::json!({
                "dynamic-pvc-provisioner.kubernetes.io/data.enabled": "true",
                "dynamic-pvc-provisioner.kubernetes.io/data.pvc":
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: oops\n",
            }),
            serde_json::json!([
                { "name": "data", "persistentVolumeClaim": { "claimName": "app-data" } }
            ]),
        ));

        provisioner.sync_pod("default", "app").await.unwrap();

        assert_eq!(calls_matching(&calls, "POST", "/persistentvolumeclaims"), 0);
        assert_eq!(event_reasons(&calls), vec!["ErrInvalidPVC"]);
    }

    #[tokio::test]
    async fn failed_creates_surface_the_error_for_retry() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, |call| {
            if call.path.ends_with("/persistentvolumeclaims") {
                status_response(500, "InternalError")
            } else {
                json_response(201, &call.body)
            }
        });
        let provisioner = provisioner(client);
        provisioner.pods.seed(annotated_pod());

        let result = provisioner.sync_pod("default", "app").await;

        assert!(result.is_err());
        assert_eq!(event_reasons(&calls), vec!["ErrPVCProvisionFailed"]);
    }

    #[tokio::test]
    async fn deleted_pods_are_a_no_op() {
        let (client, handle) = mock_client();
        let (_api, calls) = spawn_api(handle, echo_created);
        let provisioner = provisioner(client);

        provisioner.sync_pod("default", "gone").await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
    }
}
