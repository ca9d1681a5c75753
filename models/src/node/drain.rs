//! Removes workloads from a node that is being quarantined, similar in spirit to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side. Cordoning is handled by the isolation engine; this module
//! decides which Pods must leave the node and removes them, either through the Eviction API (which
//! respects PodDisruptionBudgets) or through plain deletion when evictions are disabled.
use super::error::{self, Result};
use super::{
    is_debug_pod, is_quarantined_pod, labels_match, ClusterClient, PodFilter, QuarantinedNode,
    Workload,
};
use crate::quarantine::ResolvedDrainFlags;

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::ResultExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{event, instrument, Level};

// Maximum number of Pods to remove concurrently.
// Keeping this relatively low avoids generating too many TPS to Kubernetes.
pub const CONCURRENT_EVICTIONS: usize = 5;

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// What happens to a single Pod during descheduling.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PodAction {
    Skip(&'static str),
    Evict,
    Delete,
    Refuse(&'static str),
}

fn is_completed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map_or(false, |phase| phase == "Failed" || phase == "Succeeded")
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map_or(false, |annotations| {
            annotations.contains_key(MIRROR_POD_ANNOTATION)
        })
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|reference| reference.controller == Some(true) && reference.kind == "DaemonSet")
}

fn has_controller(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|reference| reference.controller == Some(true))
}

fn uses_empty_dir(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map_or(false, |volumes| {
            volumes.iter().any(|volume| volume.empty_dir.is_some())
        })
}

fn belongs_to(pod: &Pod, workload: &Workload) -> bool {
    pod.namespace().as_deref() == Some(workload.key.namespace.as_str())
        && labels_match(pod.labels(), &workload.match_labels)
}

/// Decides what to do with a Pod found on a node being descheduled.
///
/// The following Pods stay where they are:
/// * Completed Pods.
/// * Pods already marked as quarantined, and Pods of workloads the request keeps on the node.
/// * Debug Pods attached by the isolation engine.
/// * Static Mirror Pods, which cannot be controlled.
/// * DaemonSet Pods when `ignoreAllDaemonSets` is set, since the DaemonSet controller ignores cordons.
///
/// Pods that need local `emptyDir` data deleted, or that have no controller to recreate them, are only removed
/// when the corresponding flag allows it.
pub fn plan_pod(pod: &Pod, flags: &ResolvedDrainFlags, kept: &[Workload]) -> PodAction {
    if is_completed(pod) {
        return PodAction::Skip("completed");
    }
    if is_quarantined_pod(pod) {
        return PodAction::Skip("quarantined");
    }
    if is_debug_pod(pod) {
        return PodAction::Skip("debug");
    }
    if is_mirror_pod(pod) {
        return PodAction::Skip("static mirror pod");
    }
    if kept.iter().any(|workload| belongs_to(pod, workload)) {
        return PodAction::Skip("kept workload");
    }
    if is_daemonset_pod(pod) {
        return if flags.ignore_all_daemon_sets {
            PodAction::Skip("member of a DaemonSet")
        } else {
            PodAction::Refuse("managed by a DaemonSet and ignoreAllDaemonSets is not set")
        };
    }
    if uses_empty_dir(pod) && !flags.delete_empty_dir_data {
        return PodAction::Refuse("uses emptyDir local storage and deleteEmptyDirData is not set");
    }
    if !has_controller(pod) && !flags.force {
        return PodAction::Refuse("not managed by a controller and force is not set");
    }

    if flags.disable_eviction {
        PodAction::Delete
    } else {
        PodAction::Evict
    }
}

async fn remove_pod<T: ClusterClient>(
    client: &T,
    evictor: &PodEvictor<'_, T>,
    pod: &Pod,
    action: &PodAction,
) -> Result<()> {
    let pod_name = pod.name_any();
    let result = match action {
        PodAction::Skip(_) => Ok(()),
        PodAction::Refuse(reason) => error::UndrainablePodSnafu {
            pod_name,
            reason: reason.to_string(),
        }
        .fail(),
        PodAction::Evict => match evictor.evict(pod).await {
            Ok(true) => Ok(()),
            Ok(false) => error::EvictionRefusedSnafu { pod_name }.fail(),
            Err(err) => Err(err),
        },
        PodAction::Delete => {
            client
                .delete_pod(&pod.namespace().unwrap_or_default(), &pod_name)
                .await
        }
    };
    // A Pod that went away after the node was listed no longer needs removing.
    match result {
        Err(err) if err.is_not_found() => {
            event!(Level::DEBUG, "Pod '{}' is already gone", pod.name_any());
            Ok(())
        }
        other => other,
    }
}

/// Removes every Pod from the node that is not protected, handling up to `CONCURRENT_EVICTIONS` at a time.
///
/// With `ignoreErrors` set, per-Pod failures are logged and the node is reported as descheduled. Otherwise
/// the first failure is returned once all in-flight removals have finished.
#[instrument(skip(client, node, kept), fields(node = %node.name), err)]
pub async fn deschedule_pods<T: ClusterClient>(
    client: &T,
    node: &QuarantinedNode,
    kept: &[Workload],
) -> Result<()> {
    let pods = client.list_pods(&PodFilter::on_node(&node.name)).await?;

    let targets: Vec<(Pod, PodAction)> = pods
        .into_iter()
        .filter_map(|pod| match plan_pod(&pod, &node.flags, kept) {
            PodAction::Skip(reason) => {
                event!(
                    Level::DEBUG,
                    "Not descheduling Pod '{}': {}",
                    pod.name_any(),
                    reason
                );
                None
            }
            action => Some((pod, action)),
        })
        .collect();

    let evictor = PodEvictor::new(
        client,
        EvictionPolicy {
            strategy: EvictionStrategy::Drain,
            max_pods_to_evict: targets.len(),
            dry_run: false,
        },
    );
    let evictor = &evictor;
    let results: Vec<Result<()>> = stream::iter(targets)
        .map(|(pod, action)| async move {
            remove_pod(client, evictor, &pod, &action)
                .await
                .context(error::DeschedulePodSnafu {
                    node_name: node.name.clone(),
                    pod_name: pod.name_any(),
                })
        })
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .collect()
        .await;

    let mut first_error = None;
    for err in results.into_iter().filter_map(|result| result.err()) {
        if node.flags.ignore_errors {
            event!(Level::WARN, "Ignoring descheduling error: '{}'", err);
        } else if first_error.is_none() {
            first_error = Some(err);
        } else {
            event!(Level::ERROR, "Additional descheduling error: '{}'", err);
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Which Pods a `PodEvictor` is willing to touch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EvictionStrategy {
    /// Evict exactly the Pods handed over, without any further selection.
    Noop,
    /// Apply the drain rules first: mirror and DaemonSet Pods are never evicted.
    Drain,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EvictionPolicy {
    pub strategy: EvictionStrategy,
    pub max_pods_to_evict: usize,
    pub dry_run: bool,
}

/// Evicts Pods one at a time through the cluster API under a fixed budget.
pub struct PodEvictor<'a, T: ClusterClient> {
    client: &'a T,
    policy: EvictionPolicy,
    evicted: AtomicUsize,
}

impl<'a, T: ClusterClient> PodEvictor<'a, T> {
    pub fn new(client: &'a T, policy: EvictionPolicy) -> Self {
        PodEvictor {
            client,
            policy,
            evicted: AtomicUsize::new(0),
        }
    }

    pub fn total_evicted(&self) -> usize {
        self.evicted.load(Ordering::SeqCst)
    }

    fn reserve(&self) -> bool {
        self.evicted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.policy.max_pods_to_evict).then_some(count + 1)
            })
            .is_ok()
    }

    /// Returns `Ok(true)` when the Pod was evicted and `Ok(false)` when the eviction did not happen because
    /// the policy excludes the Pod, the budget is spent, or the cluster refused it.
    #[instrument(skip(self, pod), fields(pod = %pod.name_any()), err)]
    pub async fn evict(&self, pod: &Pod) -> Result<bool> {
        if self.policy.strategy == EvictionStrategy::Drain
            && (is_mirror_pod(pod) || is_daemonset_pod(pod))
        {
            event!(
                Level::INFO,
                "Pod '{}' is not evictable under the drain strategy",
                pod.name_any()
            );
            return Ok(false);
        }

        if !self.reserve() {
            event!(
                Level::WARN,
                "Eviction budget of {} Pods exhausted, not evicting '{}'",
                self.policy.max_pods_to_evict,
                pod.name_any()
            );
            return Ok(false);
        }

        let result = self.client.evict_pod(pod, self.policy.dry_run).await;
        if !matches!(result, Ok(true)) {
            self.evicted.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{QUARANTINE_LABEL_KEY, QUARANTINE_LABEL_VALUE};
    use crate::node::MockClusterClient;
    use crate::quarantine::{ResourceKey, ResourceKind};
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, PodSpec, PodStatus, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use std::collections::BTreeMap;

    fn owned_pod(name: &str, owner_kind: &str, labels: BTreeMap<String, String>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("prod".to_string()),
                labels: Some(labels),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: owner_kind.to_string(),
                    name: "owner".to_string(),
                    uid: "uid".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    fn web_workload() -> Workload {
        Workload {
            key: ResourceKey {
                kind: ResourceKind::Deployment,
                name: "web".to_string(),
                namespace: "prod".to_string(),
            },
            resource_version: None,
            match_labels: btreemap! { "app".to_string() => "web".to_string() },
            tolerations: vec![],
            node_selector: BTreeMap::new(),
        }
    }

    fn node(flags: ResolvedDrainFlags) -> QuarantinedNode {
        QuarantinedNode {
            name: "worker1".to_string(),
            isolate: true,
            daemonsets: vec![],
            deployments: vec![],
            flags,
            debug: Default::default(),
        }
    }

    #[test]
    fn test_plan_pod_skips_protected_pods() {
        let flags = ResolvedDrainFlags::default();
        let kept = vec![web_workload()];

        let kept_pod = owned_pod(
            "web-1",
            "ReplicaSet",
            btreemap! { "app".to_string() => "web".to_string() },
        );
        assert_eq!(
            plan_pod(&kept_pod, &flags, &kept),
            PodAction::Skip("kept workload")
        );

        let sentinel = owned_pod(
            "api-1",
            "ReplicaSet",
            btreemap! { QUARANTINE_LABEL_KEY.to_string() => QUARANTINE_LABEL_VALUE.to_string() },
        );
        assert_eq!(
            plan_pod(&sentinel, &flags, &[]),
            PodAction::Skip("quarantined")
        );

        let daemon = owned_pod("logs-1", "DaemonSet", BTreeMap::new());
        assert_eq!(
            plan_pod(&daemon, &flags, &[]),
            PodAction::Skip("member of a DaemonSet")
        );

        let mut done = owned_pod("job-1", "Job", BTreeMap::new());
        done.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert_eq!(plan_pod(&done, &flags, &[]), PodAction::Skip("completed"));
    }

    #[test]
    fn test_plan_pod_follows_flags() {
        let mut flags = ResolvedDrainFlags::default();
        let pod = owned_pod("api-1", "ReplicaSet", BTreeMap::new());
        assert_eq!(plan_pod(&pod, &flags, &[]), PodAction::Evict);

        flags.disable_eviction = true;
        assert_eq!(plan_pod(&pod, &flags, &[]), PodAction::Delete);

        let mut bare = pod.clone();
        bare.metadata.owner_references = None;
        assert!(matches!(
            plan_pod(&bare, &flags, &[]),
            PodAction::Refuse(_)
        ));
        flags.force = true;
        assert_eq!(plan_pod(&bare, &flags, &[]), PodAction::Delete);

        let mut scratch = pod.clone();
        scratch.spec = Some(PodSpec {
            volumes: Some(vec![Volume {
                name: "scratch".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(matches!(
            plan_pod(&scratch, &flags, &[]),
            PodAction::Refuse(_)
        ));
        flags.delete_empty_dir_data = true;
        assert_eq!(plan_pod(&scratch, &flags, &[]), PodAction::Delete);

        flags.ignore_all_daemon_sets = false;
        let daemon = owned_pod("logs-1", "DaemonSet", BTreeMap::new());
        assert!(matches!(
            plan_pod(&daemon, &flags, &[]),
            PodAction::Refuse(_)
        ));
    }

    #[tokio::test]
    async fn test_deschedule_evicts_unprotected_pods() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .withf(|filter| filter == &PodFilter::on_node("worker1"))
            .times(1)
            .return_once(|_| {
                Ok(vec![
                    owned_pod(
                        "web-1",
                        "ReplicaSet",
                        btreemap! { "app".to_string() => "web".to_string() },
                    ),
                    owned_pod("api-1", "ReplicaSet", BTreeMap::new()),
                ])
            });
        client
            .expect_evict_pod()
            .withf(|pod, dry_run| pod.name_any() == "api-1" && !dry_run)
            .times(1)
            .returning(|_, _| Ok(true));

        deschedule_pods(&client, &node(Default::default()), &[web_workload()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deschedule_refused_eviction_is_transient() {
        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .return_once(|_| Ok(vec![owned_pod("api-1", "ReplicaSet", BTreeMap::new())]));
        client.expect_evict_pod().returning(|_, _| Ok(false));

        let err = deschedule_pods(&client, &node(Default::default()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.class(), error::ErrorClass::Transient);

        let mut client = MockClusterClient::new();
        client
            .expect_list_pods()
            .return_once(|_| Ok(vec![owned_pod("api-1", "ReplicaSet", BTreeMap::new())]));
        client.expect_evict_pod().returning(|_, _| Ok(false));
        let flags = ResolvedDrainFlags {
            ignore_errors: true,
            ..Default::default()
        };
        deschedule_pods(&client, &node(flags), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_deschedule_ignores_vanished_pods() {
        let mut client = MockClusterClient::new();
        client.expect_list_pods().return_once(|_| {
            Ok(vec![
                owned_pod("api-1", "ReplicaSet", BTreeMap::new()),
                owned_pod("api-2", "ReplicaSet", BTreeMap::new()),
            ])
        });
        client.expect_evict_pod().returning(|pod, _| {
            if pod.name_any() == "api-1" {
                Err(error::Error::NonRetriableEviction {
                    source: kube::Error::Api(kube::core::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "pods \"api-1\" not found".to_string(),
                        reason: "NotFound".to_string(),
                        code: 404,
                    }),
                    pod_name: pod.name_any(),
                })
            } else {
                Ok(true)
            }
        });

        deschedule_pods(&client, &node(Default::default()), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_evictor_respects_budget() {
        let mut client = MockClusterClient::new();
        client
            .expect_evict_pod()
            .times(1)
            .returning(|_, _| Ok(true));

        let evictor = PodEvictor::new(
            &client,
            EvictionPolicy {
                strategy: EvictionStrategy::Noop,
                max_pods_to_evict: 1,
                dry_run: false,
            },
        );
        let pod = owned_pod("controller-1", "ReplicaSet", BTreeMap::new());
        assert!(evictor.evict(&pod).await.unwrap());
        assert!(!evictor.evict(&pod).await.unwrap());
        assert_eq!(evictor.total_evicted(), 1);
    }

    #[tokio::test]
    async fn test_evictor_releases_budget_on_refusal() {
        let mut client = MockClusterClient::new();
        client.expect_evict_pod().times(2).returning(|_, _| Ok(false));

        let evictor = PodEvictor::new(
            &client,
            EvictionPolicy {
                strategy: EvictionStrategy::Noop,
                max_pods_to_evict: 1,
                dry_run: false,
            },
        );
        let pod = owned_pod("controller-1", "ReplicaSet", BTreeMap::new());
        assert!(!evictor.evict(&pod).await.unwrap());
        assert!(!evictor.evict(&pod).await.unwrap());
        assert_eq!(evictor.total_evicted(), 0);
    }

    #[tokio::test]
    async fn test_drain_strategy_skips_daemonset_pods() {
        let client = MockClusterClient::new();
        let evictor = PodEvictor::new(
            &client,
            EvictionPolicy {
                strategy: EvictionStrategy::Drain,
                max_pods_to_evict: 5,
                dry_run: true,
            },
        );
        let pod = owned_pod("logs-1", "DaemonSet", BTreeMap::new());
        assert!(!evictor.evict(&pod).await.unwrap());
    }
}
