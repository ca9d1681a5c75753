use super::drain;
use super::error::Result;
use super::{
    debug_pod, debug_pod_name, has_quarantine_taint, labels_match, quarantine_label_patch,
    with_quarantine_taint, with_quarantine_toleration, without_quarantine_taint,
    without_quarantine_toleration, ClusterClient, PodFilter, QuarantinedNode, Workload,
};
use crate::constants::{QUARANTINE_LABEL_KEY, QUARANTINE_LABEL_VALUE};
use crate::quarantine::ResourceRef;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{event, instrument, Level};

/// Makes a single node's workload topology match its desired isolation state.
///
/// Every operation talks to the cluster through `ClusterClient` and returns the first API error it
/// encounters. Nothing is retried here; retries come from the reconciler invoking the engine again.
#[derive(Clone)]
pub struct IsolationEngine<T: ClusterClient> {
    client: T,
}

impl<T: ClusterClient> IsolationEngine<T> {
    pub fn new(client: T) -> Self {
        IsolationEngine { client }
    }

    pub fn client(&self) -> &T {
        &self.client
    }

    /// A node counts as isolated only when it is both cordoned and tainted.
    #[instrument(skip(self), err)]
    pub async fn is_already_isolated(&self, node_name: &str) -> Result<bool> {
        let node = self.client.get_node(node_name).await?;
        let spec = node.spec.unwrap_or_default();
        Ok(spec.unschedulable.unwrap_or(false)
            && has_quarantine_taint(spec.taints.as_deref().unwrap_or_default()))
    }

    #[instrument(skip(self), err)]
    pub async fn disable_scheduling(&self, node_name: &str) -> Result<()> {
        self.client.cordon_node(node_name).await
    }

    #[instrument(skip(self), err)]
    pub async fn enable_scheduling(&self, node_name: &str) -> Result<()> {
        ignore_not_found(self.client.uncordon_node(node_name).await)
    }

    /// Marks the node's Pods of every tracked workload as quarantined and, with `isolated` set, lets each
    /// workload tolerate the quarantine taint.
    ///
    /// Marked Pods lose their original label keys to the quarantined prefix, so the owning controller no
    /// longer selects them and schedules a replacement while the marked Pod stays on the node.
    #[instrument(skip(self, node), fields(node = %node.name), err)]
    pub async fn isolate(&self, node: &QuarantinedNode, isolated: bool) -> Result<()> {
        for resource in node.resources() {
            let workload = self.client.get_workload(&resource.key()).await?;
            self.label_workload_pods(node, &workload).await?;

            if isolated {
                if let Some(tolerations) = with_quarantine_toleration(&workload.tolerations) {
                    event!(
                        Level::INFO,
                        "Adding quarantine toleration to '{}'",
                        workload.key
                    );
                    self.client
                        .set_workload_tolerations(&workload, &tolerations)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn label_workload_pods(&self, node: &QuarantinedNode, workload: &Workload) -> Result<()> {
        if workload.match_labels.is_empty() {
            event!(
                Level::WARN,
                "Workload '{}' has no matchLabels, not marking any Pods",
                workload.key
            );
            return Ok(());
        }

        let filter = PodFilter::on_node(&node.name)
            .with_namespace(&workload.key.namespace)
            .with_labels(&workload.match_labels);

        for pod in self.client.list_pods(&filter).await? {
            if !labels_match(pod.labels(), &workload.match_labels) {
                continue;
            }
            if let Some(patch) = quarantine_label_patch(pod.labels()) {
                event!(
                    Level::INFO,
                    "Marking Pod '{}' of '{}' as quarantined",
                    pod.name_any(),
                    workload.key
                );
                self.client.patch_pod_labels(&pod, &patch).await?;
            }
        }
        Ok(())
    }

    async fn strip_toleration(&self, workload: &Workload) -> Result<()> {
        if let Some(tolerations) = without_quarantine_toleration(&workload.tolerations) {
            event!(
                Level::INFO,
                "Removing quarantine toleration from '{}'",
                workload.key
            );
            self.client
                .set_workload_tolerations(workload, &tolerations)
                .await?;
        }
        Ok(())
    }

    /// Removes the quarantine toleration from a workload's pod template. A workload that no longer exists
    /// has nothing to remove.
    #[instrument(skip(self, resource), fields(resource = %resource.key()), err)]
    pub async fn remove_toleration(&self, resource: &ResourceRef) -> Result<()> {
        match self.client.get_workload(&resource.key()).await {
            Ok(workload) => self.strip_toleration(&workload).await,
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn taint_node(&self, node_name: &str) -> Result<()> {
        let node = self.client.get_node(node_name).await?;
        let taints = node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.clone())
            .unwrap_or_default();
        if let Some(taints) = with_quarantine_taint(&taints) {
            event!(Level::INFO, "Tainting Node '{}'", node_name);
            self.client.set_node_taints(&node, &taints).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn untaint_node(&self, node_name: &str) -> Result<()> {
        let node = match self.client.get_node(node_name).await {
            Ok(node) => node,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };
        let taints = node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.clone())
            .unwrap_or_default();
        if let Some(taints) = without_quarantine_taint(&taints) {
            event!(Level::INFO, "Removing quarantine taint from Node '{}'", node_name);
            self.client.set_node_taints(&node, &taints).await?;
        }
        Ok(())
    }

    /// Removes the node's unprotected Pods. Pods of kept workloads stay, so those workloads are looked up
    /// first; one that has been deleted in the meantime protects nothing.
    #[instrument(skip(self, node), fields(node = %node.name), err)]
    pub async fn deschedule_pods(&self, node: &QuarantinedNode) -> Result<()> {
        let mut kept = Vec::new();
        for resource in node.kept_resources() {
            match self.client.get_workload(&resource.key()).await {
                Ok(workload) => kept.push(workload),
                Err(err) if err.is_not_found() => {
                    event!(
                        Level::WARN,
                        "Kept workload '{}' no longer exists",
                        resource.key()
                    );
                }
                Err(err) => return Err(err),
            }
        }
        drain::deschedule_pods(&self.client, node, &kept).await
    }

    /// Attaches the debug Pod to the node unless one with the well-known name already exists.
    #[instrument(skip(self, node), fields(node = %node.name), err)]
    pub async fn deploy_debug(&self, node: &QuarantinedNode) -> Result<()> {
        let name = debug_pod_name(&node.name);
        if self
            .client
            .get_pod(&node.debug.namespace, &name)
            .await?
            .is_some()
        {
            event!(Level::DEBUG, "Debug Pod '{}' already exists", name);
            return Ok(());
        }

        event!(Level::INFO, "Creating debug Pod '{}'", name);
        self.client
            .create_pod(&debug_pod(&node.name, &node.debug))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn remove_debug(&self, name: &str, namespace: &str) -> Result<()> {
        ignore_not_found(self.client.delete_pod(namespace, name).await)
    }

    /// Deletes the quarantined Pods of a single node.
    #[instrument(skip(self), err)]
    pub async fn remove_isolated_pods(&self, node_name: &str) -> Result<()> {
        let filter =
            PodFilter::on_node(node_name).with_label(QUARANTINE_LABEL_KEY, QUARANTINE_LABEL_VALUE);
        self.delete_pods(self.client.list_pods(&filter).await?)
            .await
    }

    /// Deletes every quarantined Pod in the cluster.
    #[instrument(skip(self), err)]
    pub async fn cleanup_isolated_pods(&self) -> Result<()> {
        let filter = PodFilter::default().with_label(QUARANTINE_LABEL_KEY, QUARANTINE_LABEL_VALUE);
        self.delete_pods(self.client.list_pods(&filter).await?)
            .await
    }

    async fn delete_pods(&self, pods: Vec<Pod>) -> Result<()> {
        for pod in pods {
            let namespace = pod.namespace().unwrap_or_default();
            event!(
                Level::INFO,
                "Deleting quarantined Pod '{}/{}'",
                namespace,
                pod.name_any()
            );
            ignore_not_found(self.client.delete_pod(&namespace, &pod.name_any()).await)?;
        }
        Ok(())
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{quarantine_taint, quarantine_toleration, IsolationError, MockClusterClient};
    use crate::quarantine::{ResourceKey, ResourceKind};
    use k8s_openapi::api::core::v1::{Node, NodeSpec as K8SNodeSpec, Toleration};
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use maplit::btreemap;
    use std::collections::BTreeMap;

    fn not_found() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }

    fn k8s_node(unschedulable: bool, tainted: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("worker1".to_string()),
                ..Default::default()
            },
            spec: Some(K8SNodeSpec {
                unschedulable: Some(unschedulable),
                taints: tainted.then(|| vec![quarantine_taint()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn resource(name: &str, keep: bool) -> ResourceRef {
        ResourceRef {
            kind: ResourceKind::Deployment,
            name: name.to_string(),
            namespace: "prod".to_string(),
            keep,
        }
    }

    fn workload(name: &str, tolerations: Vec<Toleration>) -> Workload {
        Workload {
            key: resource(name, false).key(),
            resource_version: Some("7".to_string()),
            match_labels: btreemap! { "app".to_string() => name.to_string() },
            tolerations,
            node_selector: BTreeMap::new(),
        }
    }

    fn labelled_pod(name: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("prod".to_string()),
                labels: Some(btreemap! { "app".to_string() => app.to_string() }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn quarantined_node(resources: Vec<ResourceRef>) -> QuarantinedNode {
        QuarantinedNode {
            name: "worker1".to_string(),
            isolate: true,
            daemonsets: vec![],
            deployments: resources,
            flags: Default::default(),
            debug: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_is_already_isolated_requires_cordon_and_taint() {
        for (unschedulable, tainted, expected) in [
            (true, true, true),
            (true, false, false),
            (false, true, false),
            (false, false, false),
        ] {
            let mut client = MockClusterClient::new();
            client
                .expect_get_node()
                .returning(move |_| Ok(k8s_node(unschedulable, tainted)));
            let engine = IsolationEngine::new(client);
            assert_eq!(
                engine.is_already_isolated("worker1").await.unwrap(),
                expected
            );
        }
    }

    fn expect_marked(client: &mut MockClusterClient, pod_name: &'static str, app: &'static str) {
        client
            .expect_patch_pod_labels()
            .withf(move |pod, patch| {
                pod.name_any() == pod_name
                    && patch.get(QUARANTINE_LABEL_KEY)
                        == Some(&Some(QUARANTINE_LABEL_VALUE.to_string()))
                    && patch.get("app") == Some(&None)
                    && patch.get("quarantined-app") == Some(&Some(app.to_string()))
            })
            .times(1)
            .returning(|_, _| Ok(()));
    }

    #[tokio::test]
    async fn test_isolate_marks_pods_of_every_tracked_workload() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_workload()
            .returning(|key: &ResourceKey| Ok(workload(&key.name, vec![])));
        client
            .expect_list_pods()
            .withf(|filter| {
                filter.node_name.as_deref() == Some("worker1")
                    && filter.namespace.as_deref() == Some("prod")
            })
            .times(2)
            .returning(|filter| {
                let app = filter.labels.get("app").cloned().unwrap_or_default();
                Ok(vec![labelled_pod(&format!("{}-1", app), &app)])
            });
        expect_marked(&mut client, "web-1", "web");
        expect_marked(&mut client, "api-1", "api");
        client
            .expect_set_workload_tolerations()
            .withf(|_, tolerations| tolerations == [quarantine_toleration()])
            .times(2)
            .returning(|_, _| Ok(()));

        let engine = IsolationEngine::new(client);
        let node = quarantined_node(vec![resource("web", true), resource("api", false)]);
        engine.isolate(&node, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_isolate_without_taint_leaves_tolerations_alone() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_workload()
            .returning(|key: &ResourceKey| Ok(workload(&key.name, vec![quarantine_toleration()])));
        client
            .expect_list_pods()
            .times(1)
            .returning(|_| Ok(vec![labelled_pod("web-1", "web")]));
        expect_marked(&mut client, "web-1", "web");
        client.expect_set_workload_tolerations().never();

        let engine = IsolationEngine::new(client);
        let node = quarantined_node(vec![resource("web", false)]);
        engine.isolate(&node, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_toleration_keeps_unrelated_tolerations() {
        let unrelated = Toleration {
            key: Some("dedicated".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        };
        let existing = vec![unrelated.clone(), quarantine_toleration()];

        let mut client = MockClusterClient::new();
        client
            .expect_get_workload()
            .returning(move |key: &ResourceKey| Ok(workload(&key.name, existing.clone())));
        client
            .expect_set_workload_tolerations()
            .withf(move |_, tolerations| tolerations == [unrelated.clone()])
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = IsolationEngine::new(client);
        engine.remove_toleration(&resource("web", false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_toleration_of_missing_workload() {
        let mut client = MockClusterClient::new();
        client.expect_get_workload().returning(|key: &ResourceKey| {
            Err(IsolationError::GetWorkload {
                source: not_found(),
                key: key.clone(),
            })
        });
        let engine = IsolationEngine::new(client);
        engine.remove_toleration(&resource("web", false)).await.unwrap();
    }

    #[tokio::test]
    async fn test_deploy_debug_is_idempotent() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_pod()
            .withf(|namespace, name| namespace == "default" && name == "quarantine-debug-worker1")
            .times(1)
            .returning(|_, _| Ok(Some(Pod::default())));
        client.expect_create_pod().never();

        let engine = IsolationEngine::new(client);
        engine
            .deploy_debug(&quarantined_node(vec![]))
            .await
            .unwrap();

        let mut client = MockClusterClient::new();
        client.expect_get_pod().returning(|_, _| Ok(None));
        client
            .expect_create_pod()
            .withf(|pod| pod.metadata.name.as_deref() == Some("quarantine-debug-worker1"))
            .times(1)
            .returning(|_| Ok(()));

        let engine = IsolationEngine::new(client);
        engine
            .deploy_debug(&quarantined_node(vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_debug_treats_not_found_as_success() {
        let mut client = MockClusterClient::new();
        client.expect_delete_pod().returning(|namespace, name| {
            Err(IsolationError::DeletePod {
                source: not_found(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        });
        let engine = IsolationEngine::new(client);
        engine
            .remove_debug("quarantine-debug-worker1", "default")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_taint_and_untaint_node() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_node()
            .times(1)
            .returning(|_| Ok(k8s_node(true, false)));
        client
            .expect_set_node_taints()
            .withf(|_, taints| taints == [quarantine_taint()])
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = IsolationEngine::new(client);
        engine.taint_node("worker1").await.unwrap();

        let mut client = MockClusterClient::new();
        client
            .expect_get_node()
            .times(1)
            .returning(|_| Ok(k8s_node(true, true)));
        client
            .expect_set_node_taints()
            .withf(|_, taints| taints.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));
        let engine = IsolationEngine::new(client);
        engine.untaint_node("worker1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_isolated_pods_is_cluster_wide() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .withf(|filter| {
                filter.node_name.is_none()
                    && filter.namespace.is_none()
                    && filter.labels.get(QUARANTINE_LABEL_KEY).map(String::as_str)
                        == Some(QUARANTINE_LABEL_VALUE)
            })
            .times(1)
            .returning(|_| Ok(vec![labelled_pod("web-1", "web"), labelled_pod("web-2", "web")]));
        client
            .expect_delete_pod()
            .times(2)
            .returning(|_, _| Ok(()));

        let engine = IsolationEngine::new(client);
        engine.cleanup_isolated_pods().await.unwrap();
    }
}
