use super::error::{self, Result};
use super::{PodFilter, Workload};
use crate::quarantine::{ResourceKey, ResourceKind};

use async_trait::async_trait;
use http::StatusCode;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Pod, PodTemplateSpec, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{
    Api, DeleteParams, EvictParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams,
};
use kube::ResourceExt;
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use tokio::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, instrument, Level};

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

// Some errors while attempting evictions result in retries with exponential backoff.
// These values configure how long to delay between tries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 10;

/// Wrapper struct to provide retry configurations for evictions.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

impl tokio_retry::Condition<error::Error> for RetryStrategy {
    fn should_retry(&mut self, error: &error::Error) -> bool {
        error.should_retry()
    }
}

#[async_trait]
/// The slice of the cluster API that node isolation depends on. This is provided as a trait in order to
/// allow mocks to be used for testing purposes.
pub trait ClusterClient: Clone + Sized + Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    async fn cordon_node(&self, name: &str) -> Result<()>;
    /// Marks the given node as scheduleable, allowing Pods to be deployed onto it.
    async fn uncordon_node(&self, name: &str) -> Result<()>;
    /// Replaces the taints of a node. The write is guarded by the node's resourceVersion.
    async fn set_node_taints(&self, node: &Node, taints: &[Taint]) -> Result<()>;
    /// Sets a node label, or removes it when `value` is `None`.
    async fn set_node_label(&self, node: &Node, key: &str, value: Option<String>) -> Result<()>;
    async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<Pod>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    async fn create_pod(&self, pod: &Pod) -> Result<()>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    /// Applies a label patch to a pod. `None` values remove the key.
    async fn patch_pod_labels(
        &self,
        pod: &Pod,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;
    async fn get_workload(&self, key: &ResourceKey) -> Result<Workload>;
    async fn set_workload_tolerations(
        &self,
        workload: &Workload,
        tolerations: &[Toleration],
    ) -> Result<()>;
    async fn set_workload_node_selector(
        &self,
        workload: &Workload,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<()>;
    /// Creates an eviction for the Pod. Returns `false` if the eviction was refused, typically by a
    /// PodDisruptionBudget.
    async fn evict_pod(&self, pod: &Pod, dry_run: bool) -> Result<bool>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn get_node(&self, name: &str) -> Result<Node>;
        async fn list_nodes(&self) -> Result<Vec<Node>>;
        async fn cordon_node(&self, name: &str) -> Result<()>;
        async fn uncordon_node(&self, name: &str) -> Result<()>;
        async fn set_node_taints(&self, node: &Node, taints: &[Taint]) -> Result<()>;
        async fn set_node_label(&self, node: &Node, key: &str, value: Option<String>) -> Result<()>;
        async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<Pod>>;
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
        async fn create_pod(&self, pod: &Pod) -> Result<()>;
        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
        async fn patch_pod_labels(
            &self,
            pod: &Pod,
            labels: &BTreeMap<String, Option<String>>,
        ) -> Result<()>;
        async fn get_workload(&self, key: &ResourceKey) -> Result<Workload>;
        async fn set_workload_tolerations(
            &self,
            workload: &Workload,
            tolerations: &[Toleration],
        ) -> Result<()>;
        async fn set_workload_node_selector(
            &self,
            workload: &Workload,
            node_selector: &BTreeMap<String, String>,
        ) -> Result<()>;
        async fn evict_pod(&self, pod: &Pod, dry_run: bool) -> Result<bool>;
    }

    impl Clone for ClusterClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ClusterClient for std::sync::Arc<T>
where
    T: ClusterClient,
{
    async fn get_node(&self, name: &str) -> Result<Node> {
        (**self).get_node(name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        (**self).list_nodes().await
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        (**self).cordon_node(name).await
    }

    async fn uncordon_node(&self, name: &str) -> Result<()> {
        (**self).uncordon_node(name).await
    }

    async fn set_node_taints(&self, node: &Node, taints: &[Taint]) -> Result<()> {
        (**self).set_node_taints(node, taints).await
    }

    async fn set_node_label(&self, node: &Node, key: &str, value: Option<String>) -> Result<()> {
        (**self).set_node_label(node, key, value).await
    }

    async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<Pod>> {
        (**self).list_pods(filter).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        (**self).get_pod(namespace, name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        (**self).create_pod(pod).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        (**self).delete_pod(namespace, name).await
    }

    async fn patch_pod_labels(
        &self,
        pod: &Pod,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        (**self).patch_pod_labels(pod, labels).await
    }

    async fn get_workload(&self, key: &ResourceKey) -> Result<Workload> {
        (**self).get_workload(key).await
    }

    async fn set_workload_tolerations(
        &self,
        workload: &Workload,
        tolerations: &[Toleration],
    ) -> Result<()> {
        (**self).set_workload_tolerations(workload, tolerations).await
    }

    async fn set_workload_node_selector(
        &self,
        workload: &Workload,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<()> {
        (**self)
            .set_workload_node_selector(workload, node_selector)
            .await
    }

    async fn evict_pod(&self, pod: &Pod, dry_run: bool) -> Result<bool> {
        (**self).evict_pod(pod, dry_run).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ClusterClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SClusterClient {
    k8s_client: kube::client::Client,
}

impl K8SClusterClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SClusterClient { k8s_client }
    }

    fn node_api(&self) -> Api<Node> {
        Api::all(self.k8s_client.clone())
    }

    /// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
    fn namespaced_pod_api(&self, pod: &Pod) -> Api<Pod> {
        match pod.metadata.namespace.as_ref() {
            Some(ns) => Api::namespaced(self.k8s_client.clone(), ns),
            None => Api::default_namespaced(self.k8s_client.clone()),
        }
    }

    async fn patch_workload(&self, workload: &Workload, patch: serde_json::Value) -> Result<()> {
        let key = &workload.key;
        let params = PatchParams::default();
        let result = match key.kind {
            ResourceKind::Daemonset => {
                Api::<DaemonSet>::namespaced(self.k8s_client.clone(), &key.namespace)
                    .patch(&key.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
            ResourceKind::Deployment => {
                Api::<Deployment>::namespaced(self.k8s_client.clone(), &key.namespace)
                    .patch(&key.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        };
        result.context(error::UpdateWorkloadSnafu { key: key.clone() })
    }
}

fn workload_from_parts(
    key: &ResourceKey,
    metadata: &ObjectMeta,
    selector: &LabelSelector,
    template: &PodTemplateSpec,
) -> Result<Workload> {
    let pod_spec = template
        .spec
        .as_ref()
        .context(error::MissingPodTemplateSnafu { key: key.clone() })?;
    Ok(Workload {
        key: key.clone(),
        resource_version: metadata.resource_version.clone(),
        match_labels: selector.match_labels.clone().unwrap_or_default(),
        tolerations: pod_spec.tolerations.clone().unwrap_or_default(),
        node_selector: pod_spec.node_selector.clone().unwrap_or_default(),
    })
}

#[async_trait]
impl ClusterClient for K8SClusterClient {
    #[instrument(skip(self), err)]
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.node_api()
            .get(name)
            .await
            .context(error::GetNodeSnafu { node_name: name })
    }

    #[instrument(skip(self), err)]
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self
            .node_api()
            .list(&ListParams::default())
            .await
            .context(error::ListNodesSnafu)?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn cordon_node(&self, name: &str) -> Result<()> {
        self.node_api()
            .cordon(name)
            .await
            .context(error::CordonNodeSnafu { node_name: name })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn uncordon_node(&self, name: &str) -> Result<()> {
        self.node_api()
            .uncordon(name)
            .await
            .context(error::UncordonNodeSnafu { node_name: name })?;
        Ok(())
    }

    #[instrument(skip(self, node, taints), fields(node = %node.name_any()), err)]
    async fn set_node_taints(&self, node: &Node, taints: &[Taint]) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": node.resource_version(),
            },
            "spec": {
                "taints": taints,
            }
        });
        self.node_api()
            .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::UpdateNodeTaintsSnafu {
                node_name: node.name_any(),
            })?;
        Ok(())
    }

    #[instrument(skip(self, node), fields(node = %node.name_any()), err)]
    async fn set_node_label(&self, node: &Node, key: &str, value: Option<String>) -> Result<()> {
        let patch = json!({
            "metadata": {
                "labels": {
                    key: value,
                }
            }
        });
        self.node_api()
            .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::LabelNodeSnafu {
                node_name: node.name_any(),
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = match filter.namespace.as_ref() {
            Some(ns) => Api::namespaced(self.k8s_client.clone(), ns),
            None => Api::all(self.k8s_client.clone()),
        };

        let list_params = ListParams {
            field_selector: filter.field_selector(),
            label_selector: filter.label_selector(),
            ..Default::default()
        };

        Ok(pods
            .list(&list_params)
            .await
            .context(error::ListPodsSnafu {
                filter: format!("{:?}", filter),
            })?
            .items)
    }

    #[instrument(skip(self), err)]
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        pods.get_opt(name)
            .await
            .context(error::GetPodSnafu { namespace, name })
    }

    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.namespaced_pod_api(pod)
            .create(&PostParams::default(), pod)
            .await
            .context(error::CreatePodSnafu {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        pods.delete(name, &DeleteParams::default())
            .await
            .context(error::DeletePodSnafu { namespace, name })?;
        Ok(())
    }

    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    async fn patch_pod_labels(
        &self,
        pod: &Pod,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": pod.resource_version(),
                "labels": labels,
            }
        });
        self.namespaced_pod_api(pod)
            .patch(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(error::LabelPodSnafu {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(workload = %key), err)]
    async fn get_workload(&self, key: &ResourceKey) -> Result<Workload> {
        match key.kind {
            ResourceKind::Daemonset => {
                let daemonset = Api::<DaemonSet>::namespaced(self.k8s_client.clone(), &key.namespace)
                    .get(&key.name)
                    .await
                    .context(error::GetWorkloadSnafu { key: key.clone() })?;
                let spec = daemonset
                    .spec
                    .as_ref()
                    .context(error::MissingPodTemplateSnafu { key: key.clone() })?;
                workload_from_parts(key, &daemonset.metadata, &spec.selector, &spec.template)
            }
            ResourceKind::Deployment => {
                let deployment =
                    Api::<Deployment>::namespaced(self.k8s_client.clone(), &key.namespace)
                        .get(&key.name)
                        .await
                        .context(error::GetWorkloadSnafu { key: key.clone() })?;
                let spec = deployment
                    .spec
                    .as_ref()
                    .context(error::MissingPodTemplateSnafu { key: key.clone() })?;
                workload_from_parts(key, &deployment.metadata, &spec.selector, &spec.template)
            }
        }
    }

    #[instrument(skip(self, workload, tolerations), fields(workload = %workload.key), err)]
    async fn set_workload_tolerations(
        &self,
        workload: &Workload,
        tolerations: &[Toleration],
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": workload.resource_version,
            },
            "spec": {
                "template": {
                    "spec": {
                        "tolerations": tolerations,
                    }
                }
            }
        });
        self.patch_workload(workload, patch).await
    }

    #[instrument(skip(self, workload), fields(workload = %workload.key), err)]
    async fn set_workload_node_selector(
        &self,
        workload: &Workload,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": workload.resource_version,
            },
            "spec": {
                "template": {
                    "spec": {
                        "nodeSelector": node_selector,
                    }
                }
            }
        });
        self.patch_workload(workload, patch).await
    }

    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    async fn evict_pod(&self, pod: &Pod, dry_run: bool) -> Result<bool> {
        let pod_api = self.namespaced_pod_api(pod);
        let pod_name = pod.name_any();
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                dry_run,
                ..Default::default()
            }),
            post_options: PostParams {
                dry_run,
                ..Default::default()
            },
        };

        // When evicting, a 429 (TOO_MANY_REQUESTS) response code means a PodDisruptionBudget does not currently
        // allow the disruption. That is reported to the caller as a refusal. A 500 usually points at
        // misconfigured PodDisruptionBudgets (e.g. several budgets selecting the same Pod) and is retried.
        RetryIf::spawn(
            RetryStrategy::retry_strategy(),
            || async {
                event!(Level::INFO, "Attempting to evict pod {}", &pod_name);
                match pod_api.evict(&pod_name, &params).await {
                    Ok(_) => {
                        event!(Level::INFO, "Successfully evicted Pod '{}'", pod_name);
                        Ok(true)
                    }
                    Err(kube::Error::Api(e)) => match StatusCode::from_u16(e.code) {
                        Ok(StatusCode::TOO_MANY_REQUESTS) => {
                            event!(
                                Level::WARN,
                                "Eviction of Pod '{}' refused: '{}'. This is likely due to respecting a Pod Disruption Budget.",
                                pod_name,
                                e
                            );
                            Ok(false)
                        }
                        Ok(StatusCode::NOT_FOUND) | Ok(StatusCode::FORBIDDEN) => {
                            // An eviction request in a deleting namespace will also throw a forbidden error.
                            Err(error::Error::NonRetriableEviction {
                                source: kube::Error::Api(e.clone()),
                                pod_name: pod_name.clone(),
                            })
                        }
                        _ => {
                            event!(
                                Level::ERROR,
                                "Error when evicting Pod '{}': '{}'. Check for misconfigured PodDisruptionBudgets.",
                                pod_name,
                                e
                            );
                            Err(error::Error::RetriableEviction {
                                source: kube::Error::Api(e.clone()),
                                pod_name: pod_name.clone(),
                            })
                        }
                    },
                    Err(e) => {
                        event!(Level::ERROR, "Eviction failed: '{}'. Retrying...", e);
                        Err(error::Error::RetriableEviction {
                            source: e,
                            pod_name: pod_name.clone(),
                        })
                    }
                }
            },
            RetryStrategy {},
        )
        .await
    }
}
