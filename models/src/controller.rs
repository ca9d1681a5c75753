//! Manifests for running the quarantine controller, and the lookup of the running controller Pod.
use crate::constants::{
    API_GROUP, APP_COMPONENT, APP_MANAGED_BY, APP_PART_OF, CONTROLLER, CONTROLLER_DEPLOYMENT_NAME,
    CONTROLLER_METRICS_PORT, LABEL_COMPONENT, NAMESPACE, QUARANTINE,
};
use crate::node::error as node_error;
use crate::node::{ClusterClient, PodFilter, Result};
use crate::quarantine::{K8S_QUARANTINE_PLURAL, K8S_QUARANTINE_STATUS};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, LocalObjectReference, ObjectFieldSelector,
    Pod, PodSpec, PodTemplateSpec, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use maplit::btreemap;
use snafu::OptionExt;
use tracing::instrument;

use std::collections::BTreeMap;

pub const CONTROLLER_SERVICE_ACCOUNT: &str = "node-quarantine-controller";
pub const CONTROLLER_CLUSTER_ROLE: &str = "node-quarantine-controller";
pub const CONTROLLER_CLUSTER_ROLE_BINDING: &str = "node-quarantine-controller";

/// Labels every controller Pod carries. The Admission Guard and the Self-Rescheduler find the controller
/// through these.
pub fn controller_selector() -> BTreeMap<String, String> {
    btreemap! { LABEL_COMPONENT.to_string() => CONTROLLER.to_string() }
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Defines the controller service account
pub fn controller_service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_SERVICE_ACCOUNT.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Defines the controller cluster role. Isolation touches nodes, pods and the pod templates of
/// workloads in any namespace, so the role is cluster-wide.
pub fn controller_cluster_role() -> ClusterRole {
    const READ_WRITE: &[&str] = &["get", "list", "watch", "patch", "update"];

    ClusterRole {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_CLUSTER_ROLE.to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            rule(
                API_GROUP,
                &[K8S_QUARANTINE_PLURAL, K8S_QUARANTINE_STATUS],
                READ_WRITE,
            ),
            rule("", &["nodes"], READ_WRITE),
            rule(
                "",
                &["pods"],
                &["get", "list", "watch", "create", "delete", "patch"],
            ),
            rule("", &["pods/eviction"], &["create"]),
            rule("apps", &["daemonsets", "deployments"], READ_WRITE),
        ]),
        ..Default::default()
    }
}

/// Defines the controller cluster role binding
pub fn controller_cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(CONTROLLER_CLUSTER_ROLE_BINDING.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CONTROLLER_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: CONTROLLER_SERVICE_ACCOUNT.to_string(),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

/// Defines the controller deployment
pub fn controller_deployment(image: String, image_pull_secret: Option<String>) -> Deployment {
    let image_pull_secrets =
        image_pull_secret.map(|secret| vec![LocalObjectReference { name: Some(secret) }]);

    Deployment {
        metadata: ObjectMeta {
            labels: Some(btreemap! {
                APP_COMPONENT.to_string() => CONTROLLER.to_string(),
                APP_MANAGED_BY.to_string() => QUARANTINE.to_string(),
                APP_PART_OF.to_string() => QUARANTINE.to_string(),
                LABEL_COMPONENT.to_string() => CONTROLLER.to_string(),
            }),
            name: Some(CONTROLLER_DEPLOYMENT_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            // Exactly one controller Pod may exist; the Admission Guard treats more as ambiguous.
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(controller_selector()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(controller_selector()),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        image: Some(image),
                        name: CONTROLLER.to_string(),
                        command: Some(vec!["./controller".to_string()]),
                        env: Some(vec![EnvVar {
                            name: "POD_NAMESPACE".to_string(),
                            value_from: Some(EnvVarSource {
                                field_ref: Some(ObjectFieldSelector {
                                    field_path: "metadata.namespace".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ports: Some(vec![ContainerPort {
                            name: Some("metrics".to_string()),
                            container_port: i32::from(CONTROLLER_METRICS_PORT),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    image_pull_secrets,
                    service_account_name: Some(CONTROLLER_SERVICE_ACCOUNT.to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Resolves the single running controller Pod in `namespace`, along with the name of the node it runs on.
///
/// This performs exactly one list query. No match is a not-found error and more than one match is
/// ambiguous; both are hard errors.
#[instrument(skip(client), err)]
pub async fn find_controller_pod<T: ClusterClient>(
    client: &T,
    namespace: &str,
) -> Result<(Pod, String)> {
    let selector = controller_selector();
    let filter = PodFilter::in_namespace(namespace).with_labels(&selector);
    let mut pods = client.list_pods(&filter).await?;
    let selector = filter.label_selector().unwrap_or_default();

    if pods.len() > 1 {
        return node_error::AmbiguousControllerPodSnafu {
            count: pods.len(),
            selector,
            namespace,
        }
        .fail();
    }

    let pod = pods
        .pop()
        .context(node_error::ControllerPodNotFoundSnafu {
            selector,
            namespace,
        })?;
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .context(node_error::ControllerPodUnscheduledSnafu {
            pod_name: pod.name_any(),
        })?;
    Ok((pod, node_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ErrorClass, MockClusterClient};

    fn controller_pod(name: &str, node_name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                labels: Some(controller_selector()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node_name.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_find_controller_pod() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .withf(|filter| {
                filter.namespace.as_deref() == Some(NAMESPACE)
                    && filter.labels == controller_selector()
            })
            .times(1)
            .returning(|_| Ok(vec![controller_pod("controller-1", Some("worker3"))]));

        let (pod, node_name) = find_controller_pod(&client, NAMESPACE).await.unwrap();
        assert_eq!(pod.name_any(), "controller-1");
        assert_eq!(node_name, "worker3");
    }

    #[tokio::test]
    async fn test_find_controller_pod_errors() {
        let cases: Vec<(Vec<Pod>, ErrorClass)> = vec![
            (vec![], ErrorClass::NotFound),
            (
                vec![
                    controller_pod("controller-1", Some("worker1")),
                    controller_pod("controller-2", Some("worker2")),
                ],
                ErrorClass::Ambiguous,
            ),
            (
                vec![controller_pod("controller-1", None)],
                ErrorClass::Transient,
            ),
        ];

        for (pods, class) in cases {
            let mut client = MockClusterClient::new();
            client
                .expect_list_pods()
                .times(1)
                .return_once(move |_| Ok(pods));
            let err = find_controller_pod(&client, NAMESPACE).await.unwrap_err();
            assert_eq!(err.class(), class);
        }
    }

    #[test]
    fn test_deployment_selects_controller_pods() {
        let deployment = controller_deployment("example.com/quarantine:latest".to_string(), None);
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.selector.match_labels, Some(controller_selector()));
        assert_eq!(
            spec.template.metadata.unwrap().labels,
            Some(controller_selector())
        );
    }
}
