use crate::error::{self, Result};

use models::constants::{
    CONTROLLER_DEPLOYMENT_NAME, CONTROLLER_ELIGIBLE_LABEL, CONTROLLER_ELIGIBLE_VALUE,
};
use models::controller::find_controller_pod;
use models::node::drain::{EvictionPolicy, EvictionStrategy, PodEvictor};
use models::node::ClusterClient;
use models::quarantine::{ResourceKey, ResourceKind};

use kube::ResourceExt;
use maplit::btreemap;
use snafu::{ensure, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{event, instrument, Level};

/// Moves the controller Pod off a set of nodes.
///
/// Nodes outside the exclusion list are labelled as eligible, the controller's node selector is pinned to that
/// label, and the running Pod is evicted so its replacement is scheduled onto an eligible node.
pub struct SelfRescheduler<T: ClusterClient> {
    client: T,
    namespace: String,
}

impl<T: ClusterClient> SelfRescheduler<T> {
    pub fn new(client: T, namespace: &str) -> Self {
        SelfRescheduler {
            client,
            namespace: namespace.to_string(),
        }
    }

    #[instrument(skip(self), fields(namespace = %self.namespace), err)]
    pub async fn reschedule(&self, excluded_nodes: &[String]) -> Result<()> {
        let (pod, node_name) = find_controller_pod(&self.client, &self.namespace)
            .await
            .context(error::LocateControllerSnafu)?;
        event!(
            Level::INFO,
            "Controller Pod '{}' runs on node '{}'",
            pod.name_any(),
            node_name
        );

        self.label_eligible_nodes(excluded_nodes).await?;
        self.pin_controller_selector().await?;

        let evictor = PodEvictor::new(
            &self.client,
            EvictionPolicy {
                strategy: EvictionStrategy::Noop,
                max_pods_to_evict: 1,
                dry_run: false,
            },
        );
        let evicted = evictor
            .evict(&pod)
            .await
            .context(error::EvictControllerSnafu {
                pod_name: pod.name_any(),
            })?;
        ensure!(
            evicted,
            error::ControllerEvictionRefusedSnafu {
                pod_name: pod.name_any(),
            }
        );
        event!(Level::INFO, "Evicted controller Pod '{}'", pod.name_any());
        Ok(())
    }

    async fn label_eligible_nodes(&self, excluded_nodes: &[String]) -> Result<()> {
        let excluded: BTreeSet<&str> = excluded_nodes.iter().map(String::as_str).collect();
        let nodes = self
            .client
            .list_nodes()
            .await
            .context(error::ListEligibleNodesSnafu)?;

        for node in nodes {
            let name = node.name_any();
            let current = node.labels().get(CONTROLLER_ELIGIBLE_LABEL).cloned();
            let desired = (!excluded.contains(name.as_str()))
                .then(|| CONTROLLER_ELIGIBLE_VALUE.to_string());
            if current == desired {
                continue;
            }
            event!(Level::INFO, node = %name, eligible = desired.is_some(), "Updating eligibility");
            self.client
                .set_node_label(&node, CONTROLLER_ELIGIBLE_LABEL, desired)
                .await
                .context(error::LabelEligibleNodeSnafu { node_name: name })?;
        }
        Ok(())
    }

    /// The running Pod's node selector cannot be changed, so the selector goes on the Deployment's Pod
    /// template where the replacement Pod picks it up.
    async fn pin_controller_selector(&self) -> Result<()> {
        let key = ResourceKey {
            kind: ResourceKind::Deployment,
            name: CONTROLLER_DEPLOYMENT_NAME.to_string(),
            namespace: self.namespace.clone(),
        };
        let workload = self
            .client
            .get_workload(&key)
            .await
            .context(error::ControllerNodeSelectorSnafu)?;

        let mut node_selector = workload.node_selector.clone();
        node_selector.extend(eligibility_selector());
        if node_selector == workload.node_selector {
            return Ok(());
        }
        self.client
            .set_workload_node_selector(&workload, &node_selector)
            .await
            .context(error::ControllerNodeSelectorSnafu)
    }
}

/// The label-selector form of the eligibility requirement.
pub fn eligibility_selector() -> BTreeMap<String, String> {
    btreemap! {
        CONTROLLER_ELIGIBLE_LABEL.to_string() => CONTROLLER_ELIGIBLE_VALUE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use models::controller::controller_selector;
    use models::node::{MockClusterClient, Workload};

    use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;
    use std::sync::{Arc, Mutex};

    const NAMESPACE: &str = "node-quarantine";

    fn controller_pod(node_name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("node-quarantine-controller-abc".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(controller_selector()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(name: &str, eligible: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: eligible.then(eligibility_selector),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn controller_workload() -> Workload {
        Workload {
            key: ResourceKey {
                kind: ResourceKind::Deployment,
                name: CONTROLLER_DEPLOYMENT_NAME.to_string(),
                namespace: NAMESPACE.to_string(),
            },
            resource_version: Some("7".to_string()),
            match_labels: controller_selector(),
            tolerations: vec![],
            node_selector: BTreeMap::new(),
        }
    }

    fn cluster(labels: Arc<Mutex<Vec<(String, Option<String>)>>>, evicted: bool) -> MockClusterClient {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .times(1)
            .returning(|_| Ok(vec![controller_pod("worker3")]));
        client.expect_list_nodes().returning(|| {
            Ok(vec![
                node("worker1", true),
                node("worker2", false),
                node("worker3", true),
            ])
        });
        client
            .expect_set_node_label()
            .returning(move |node, key, value| {
                assert_eq!(key, CONTROLLER_ELIGIBLE_LABEL);
                labels
                    .lock()
                    .unwrap()
                    .push((node.name_any(), value));
                Ok(())
            });
        client
            .expect_get_workload()
            .returning(|_| Ok(controller_workload()));
        client
            .expect_set_workload_node_selector()
            .withf(|_, selector| *selector == eligibility_selector())
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_evict_pod()
            .with(mockall::predicate::always(), eq(false))
            .times(1)
            .returning(move |_, _| Ok(evicted));
        client
    }

    #[tokio::test]
    async fn test_reschedule_off_excluded_node() {
        let labels = Arc::new(Mutex::new(Vec::new()));
        let rescheduler = SelfRescheduler::new(Arc::new(cluster(labels.clone(), true)), NAMESPACE);

        rescheduler
            .reschedule(&["worker3".to_string()])
            .await
            .unwrap();

        // worker1 is already eligible and left alone.
        assert_eq!(
            *labels.lock().unwrap(),
            vec![
                ("worker2".to_string(), Some(CONTROLLER_ELIGIBLE_VALUE.to_string())),
                ("worker3".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_eviction_is_an_error() {
        let labels = Arc::new(Mutex::new(Vec::new()));
        let rescheduler = SelfRescheduler::new(Arc::new(cluster(labels, false)), NAMESPACE);

        let err = rescheduler
            .reschedule(&["worker3".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ControllerEvictionRefused { .. }));
    }

    #[tokio::test]
    async fn test_ambiguous_controller_stops_early() {
        let mut client = MockClusterClient::new();
        client.expect_list_pods().returning(|_| {
            Ok(vec![controller_pod("worker1"), controller_pod("worker2")])
        });
        client.expect_list_nodes().never();
        client.expect_evict_pod().never();

        let rescheduler = SelfRescheduler::new(Arc::new(client), NAMESPACE);
        let err = rescheduler.reschedule(&[]).await.unwrap_err();
        assert!(matches!(err, Error::LocateController { .. }));
    }
}
