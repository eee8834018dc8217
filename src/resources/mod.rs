//! Tenant resource deletion
//!
//! Before the infrastructure goes away, everything that holds external
//! resources (cloud load balancers, disks) is removed through the API so
//! the provider releases them. Waves run strictly in order:
//!
//! 1. the `deckhouse` controller deployment
//! 2. `LoadBalancer` services
//! 3. storage classes
//! 4. persistent volume claims and the pods mounting them
//! 5. wait for claims and volumes to disappear
//! 6. machine deployments
//!
//! Pods without claims and other services are left to go with the nodes.

use crate::error::{DestroyError, Result};
use crate::kubernetes::KubeClientProvider;
use crate::retry::RetryLoop;
use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DECKHOUSE_NAMESPACE: &str = "d8-system";
pub const DECKHOUSE_DEPLOYMENT: &str = "deckhouse";
pub const CLOUD_INSTANCE_MANAGER_NAMESPACE: &str = "d8-cloud-instance-manager";

const STORAGE_GROUP: &str = "storage.deckhouse.io";
const STORAGE_VERSION: &str = "v1alpha1";

/// Storage class kinds served by Deckhouse storage modules
const STORAGE_CLASS_KINDS: &[&str] = &[
    "LocalStorageClass",
    "ReplicatedStorageClass",
    "NFSStorageClass",
    "CephStorageClass",
    "SCSIStorageClass",
    "S3StorageClass",
    "YadroTatlinUnifiedStorageClass",
    "NetappStorageClass",
    "HuaweiStorageClass",
    "HPEStorageClass",
];

/// (group, version, kind) of machine deployment flavours
const MACHINE_DEPLOYMENT_KINDS: &[(&str, &str, &str)] = &[
    ("cluster.x-k8s.io", "v1beta1", "MachineDeployment"),
    ("machine.sapcloud.io", "v1alpha1", "MachineDeployment"),
];

#[async_trait]
pub trait TenantResourcesDestroyer: Send + Sync {
    /// Delete tenant resources; returns only after every wave finished
    async fn delete_resources(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResourcesLoops {
    /// Waits for the deployment, services, claims and volumes
    pub wait: (usize, Duration),
    pub machine_deployments: (usize, Duration),
}

impl Default for ResourcesLoops {
    fn default() -> Self {
        Self {
            wait: (45, Duration::from_secs(5)),
            machine_deployments: (10, Duration::from_secs(5)),
        }
    }
}

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "LoadBalancer")
}

pub fn pod_has_pvc_volumes(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.persistent_volume_claim.is_some()))
}

fn object_ref(meta: &kube::api::ObjectMeta) -> String {
    match &meta.namespace {
        Some(ns) => format!("{ns}/{}", meta.name.as_deref().unwrap_or_default()),
        None => meta.name.clone().unwrap_or_default(),
    }
}

fn storage_class_resource(kind: &str) -> ApiResource {
    let gvk = GroupVersionKind::gvk(STORAGE_GROUP, STORAGE_VERSION, kind);
    ApiResource::from_gvk_with_plural(&gvk, &format!("{}es", kind.to_lowercase()))
}

fn machine_deployment_resource(group: &str, version: &str, kind: &str) -> ApiResource {
    let gvk = GroupVersionKind::gvk(group, version, kind);
    ApiResource::from_gvk_with_plural(&gvk, "machinedeployments")
}

fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

pub struct KubeResourcesDestroyer {
    kube: Arc<dyn KubeClientProvider>,
    loops: ResourcesLoops,
    cancel: CancellationToken,
}

impl KubeResourcesDestroyer {
    pub fn new(kube: Arc<dyn KubeClientProvider>, cancel: CancellationToken) -> Self {
        Self {
            kube,
            loops: ResourcesLoops::default(),
            cancel,
        }
    }

    pub fn with_loops(mut self, loops: ResourcesLoops) -> Self {
        self.loops = loops;
        self
    }

    fn retry(&self, name: &str, (attempts, wait): (usize, Duration)) -> RetryLoop {
        RetryLoop::new(name, attempts, wait).with_cancel(self.cancel.clone())
    }

    async fn client(&self) -> Result<kube::Client> {
        self.kube.kube_client().await
    }

    async fn delete_deckhouse_deployment(&self) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client().await?, DECKHOUSE_NAMESPACE);
        match api.delete(DECKHOUSE_DEPLOYMENT, &DeleteParams::foreground()).await {
            Ok(_) => info!(deployment = DECKHOUSE_DEPLOYMENT, "Deckhouse deployment deleted"),
            Err(e) if not_found(&e) => {
                debug!(deployment = DECKHOUSE_DEPLOYMENT, "Deckhouse deployment already absent");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let api = &api;
        self.retry("Wait for Deckhouse deployment deletion", self.loops.wait)
            .run(|| async move {
                match api.get_opt(DECKHOUSE_DEPLOYMENT).await? {
                    Some(_) => Err(DestroyError::Remote(
                        "deckhouse deployment is still present".to_string(),
                    )),
                    None => Ok(()),
                }
            })
            .await
    }

    async fn delete_load_balancer_services(&self) -> Result<()> {
        let api: Api<Service> = Api::all(self.client().await?);
        let services = api.list(&ListParams::default()).await?;
        for svc in services.items.iter().filter(|s| is_load_balancer(s)) {
            let ns = svc.metadata.namespace.as_deref().unwrap_or("default");
            let name = svc.metadata.name.as_deref().unwrap_or_default();
            let namespaced: Api<Service> = Api::namespaced(self.client().await?, ns);
            match namespaced.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(service = %object_ref(&svc.metadata), "LoadBalancer service deleted"),
                Err(e) if not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let api = &api;
        self.retry("Wait for LoadBalancer services deletion", self.loops.wait)
            .run(|| async move {
                let left: Vec<String> = api
                    .list(&ListParams::default())
                    .await?
                    .items
                    .iter()
                    .filter(|s| is_load_balancer(s))
                    .map(|s| object_ref(&s.metadata))
                    .collect();
                if left.is_empty() {
                    Ok(())
                } else {
                    Err(DestroyError::Remote(format!(
                        "load balancer services still present: {}",
                        left.join(", ")
                    )))
                }
            })
            .await
    }

    async fn delete_storage_classes(&self) -> Result<()> {
        let client = self.client().await?;
        for kind in STORAGE_CLASS_KINDS {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &storage_class_resource(kind));
            match api.delete_collection(&DeleteParams::default(), &ListParams::default()).await {
                Ok(_) => info!(kind = %kind, "Storage classes deleted"),
                Err(e) if not_found(&e) => debug!(kind = %kind, "Storage class API not served"),
                Err(e) => return Err(e.into()),
            }
        }

        let api: Api<StorageClass> = Api::all(client);
        api.delete_collection(&DeleteParams::default(), &ListParams::default())
            .await?;
        info!("Kubernetes storage classes deleted");
        Ok(())
    }

    async fn delete_pvcs_and_pods(&self) -> Result<()> {
        let client = self.client().await?;

        let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
        let deletions = pvcs.list(&ListParams::default()).await?.items.into_iter().map(|pvc| {
            let client = client.clone();
            async move {
                let ns = pvc.metadata.namespace.as_deref().unwrap_or("default");
                let api: Api<PersistentVolumeClaim> = Api::namespaced(client, ns);
                match api
                    .delete(pvc.metadata.name.as_deref().unwrap_or_default(), &DeleteParams::default())
                    .await
                {
                    Ok(_) => info!(pvc = %object_ref(&pvc.metadata), "PersistentVolumeClaim deleted"),
                    Err(e) if not_found(&e) => {}
                    Err(e) => return Err(DestroyError::from(e)),
                }
                Ok(())
            }
        });
        try_join_all(deletions).await?;

        let pods: Api<Pod> = Api::all(client.clone());
        let deletions = pods
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(pod_has_pvc_volumes)
            .map(|pod| {
                let client = client.clone();
                async move {
                    let ns = pod.metadata.namespace.as_deref().unwrap_or("default");
                    let api: Api<Pod> = Api::namespaced(client, ns);
                    match api
                        .delete(pod.metadata.name.as_deref().unwrap_or_default(), &DeleteParams::default())
                        .await
                    {
                        Ok(_) => info!(pod = %object_ref(&pod.metadata), "Pod with volumes deleted"),
                        Err(e) if not_found(&e) => {}
                        Err(e) => return Err(DestroyError::from(e)),
                    }
                    Ok(())
                }
            });
        try_join_all(deletions).await?;
        Ok(())
    }

    async fn wait_volumes_deleted(&self) -> Result<()> {
        let client = self.client().await?;
        let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
        let pvs: Api<PersistentVolume> = Api::all(client);
        let (pvcs, pvs) = (&pvcs, &pvs);

        self.retry("Wait for PersistentVolumeClaims deletion", self.loops.wait)
            .run(|| async move {
                let left = pvcs.list(&ListParams::default()).await?.items.len();
                if left == 0 {
                    Ok(())
                } else {
                    Err(DestroyError::Remote(format!("{left} persistent volume claims left")))
                }
            })
            .await?;

        self.retry("Wait for PersistentVolumes deletion", self.loops.wait)
            .run(|| async move {
                let left = pvs.list(&ListParams::default()).await?.items.len();
                if left == 0 {
                    Ok(())
                } else {
                    Err(DestroyError::Remote(format!("{left} persistent volumes left")))
                }
            })
            .await
    }

    async fn delete_machine_deployments(&self) -> Result<()> {
        let client = self.client().await?;
        for (group, version, kind) in MACHINE_DEPLOYMENT_KINDS {
            let resource = machine_deployment_resource(group, version, kind);
            let api: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), CLOUD_INSTANCE_MANAGER_NAMESPACE, &resource);

            let existing = match api.list(&ListParams::default()).await {
                Ok(list) => list.items,
                Err(e) if not_found(&e) => {
                    debug!(group = %group, "Machine deployment API not served");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if existing.is_empty() {
                continue;
            }

            for md in &existing {
                let name = md.metadata.name.as_deref().unwrap_or_default();
                match api.delete(name, &DeleteParams::default()).await {
                    Ok(_) => info!(group = %group, machine_deployment = %name, "Machine deployment deleted"),
                    Err(e) if not_found(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let api = &api;
            self.retry("Wait for machine deployments deletion", self.loops.machine_deployments)
                .run(|| async move {
                    let left = api.list(&ListParams::default()).await?.items.len();
                    if left == 0 {
                        Ok(())
                    } else {
                        Err(DestroyError::Remote(format!("{left} machine deployments left")))
                    }
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TenantResourcesDestroyer for KubeResourcesDestroyer {
    async fn delete_resources(&self) -> Result<()> {
        info!("Deleting tenant resources");
        self.delete_deckhouse_deployment().await?;
        self.delete_load_balancer_services().await?;
        self.delete_storage_classes().await?;
        self.delete_pvcs_and_pods().await?;
        self.wait_volumes_deleted().await?;
        self.delete_machine_deployments().await?;
        info!("Tenant resources deleted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "resources_test.rs"]
mod tests;
