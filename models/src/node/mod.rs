//! Per-node isolation: the cluster API seam, the isolation engine built on top of it, and the
//! label/taint/toleration conventions that mark quarantined nodes and pods.
mod client;
pub mod drain;
pub mod error;
mod isolation;

pub use self::client::*;
pub use self::error::{Error as IsolationError, ErrorClass, Result};
pub use self::isolation::IsolationEngine;

use crate::constants::{
    DEBUG_HOST_MOUNT_PATH, DEBUG_LABEL_KEY, DEBUG_POD_PREFIX, QUARANTINED_LABEL_PREFIX,
    QUARANTINE_LABEL_KEY, QUARANTINE_LABEL_VALUE, QUARANTINE_TAINT_EFFECT, QUARANTINE_TAINT_KEY,
    QUARANTINE_TAINT_VALUE,
};
use crate::quarantine::{
    DebugSpec, DrainFlags, NodeSpec, ObservedNode, QuarantineSpec, ResolvedDrainFlags,
    ResourceKey, ResourceKind, ResourceRef,
};

use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Taint, Toleration, Volume,
    VolumeMount,
};
use kube::api::ObjectMeta;
use maplit::btreemap;

use std::collections::{BTreeMap, BTreeSet};

/// A node of a quarantine request with its workloads and flags fully resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuarantinedNode {
    pub name: String,
    pub isolate: bool,
    pub daemonsets: Vec<ResourceRef>,
    pub deployments: Vec<ResourceRef>,
    pub flags: ResolvedDrainFlags,
    pub debug: DebugSpec,
}

impl QuarantinedNode {
    /// Resolves a node from the request: the node's own workload list is merged over the cluster-wide
    /// list, and drain flags are layered once so later steps never see unset values.
    pub fn resolve(node: &NodeSpec, spec: &QuarantineSpec) -> Self {
        let resources = merge_resources(&node.resources, &spec.resources);
        Self::with_resources(
            &node.name,
            node.isolate,
            resources,
            DrainFlags::resolve(&spec.flags, node.flags.as_ref()),
            spec.debug.clone(),
        )
    }

    /// Rebuilds a node that has been dropped from the request from its last observed state, so that its
    /// isolation can be reversed.
    pub fn from_observed(observed: &ObservedNode, spec: &QuarantineSpec) -> Self {
        Self::with_resources(
            &observed.name,
            observed.isolate,
            observed.resources.clone(),
            DrainFlags::resolve(&spec.flags, None),
            spec.debug.clone(),
        )
    }

    fn with_resources(
        name: &str,
        isolate: bool,
        resources: Vec<ResourceRef>,
        flags: ResolvedDrainFlags,
        debug: DebugSpec,
    ) -> Self {
        let (daemonsets, deployments) = resources
            .into_iter()
            .partition(|resource| resource.kind == ResourceKind::Daemonset);
        QuarantinedNode {
            name: name.to_string(),
            isolate,
            daemonsets,
            deployments,
            flags,
            debug,
        }
    }

    /// All tracked workloads on this node.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceRef> {
        self.daemonsets.iter().chain(self.deployments.iter())
    }

    /// Workloads whose pods stay on the node while it is quarantined.
    pub fn kept_resources(&self) -> impl Iterator<Item = &ResourceRef> {
        self.resources().filter(|resource| resource.keep)
    }

    pub fn observed(&self) -> ObservedNode {
        let mut resources: Vec<ResourceRef> = self.resources().cloned().collect();
        resources.sort();
        ObservedNode {
            name: self.name.clone(),
            isolate: self.isolate,
            resources,
        }
    }

    pub fn daemonsets_not_equal(&self, previous: &ObservedNode) -> bool {
        !same_resources(&self.daemonsets, previous, ResourceKind::Daemonset)
    }

    pub fn deployments_not_equal(&self, previous: &ObservedNode) -> bool {
        !same_resources(&self.deployments, previous, ResourceKind::Deployment)
    }

    pub fn debug_pod_name(&self) -> String {
        debug_pod_name(&self.name)
    }
}

fn same_resources(current: &[ResourceRef], previous: &ObservedNode, kind: ResourceKind) -> bool {
    let current: BTreeSet<&ResourceRef> = current.iter().collect();
    let previous: BTreeSet<&ResourceRef> = previous
        .resources
        .iter()
        .filter(|resource| resource.kind == kind)
        .collect();
    current == previous
}

/// Unions two workload lists by identity key. When both lists name the same workload, the entry from
/// `existing` wins. The result never holds two entries with the same key.
pub fn merge_resources(existing: &[ResourceRef], incoming: &[ResourceRef]) -> Vec<ResourceRef> {
    let mut seen: BTreeSet<ResourceKey> = BTreeSet::new();
    existing
        .iter()
        .chain(incoming.iter())
        .filter(|resource| seen.insert(resource.key()))
        .cloned()
        .collect()
}

/// A typed pod query. Selector strings for the API are built from this in one place.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PodFilter {
    pub namespace: Option<String>,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl PodFilter {
    pub fn on_node(node_name: &str) -> Self {
        PodFilter {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }
    }

    pub fn in_namespace(namespace: &str) -> Self {
        PodFilter {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn field_selector(&self) -> Option<String> {
        self.node_name
            .as_ref()
            .map(|node_name| format!("spec.nodeName={}", node_name))
    }

    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// The pod-template view of a Daemonset or Deployment that isolation needs.
#[derive(Clone, Debug, PartialEq)]
pub struct Workload {
    pub key: ResourceKey,
    pub resource_version: Option<String>,
    pub match_labels: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
}

/// Returns whether `labels` contains every pair in `selector`. An empty selector matches nothing, so that a
/// workload without `matchLabels` never claims unrelated pods.
pub fn labels_match(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

pub fn is_quarantined_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(QUARANTINE_LABEL_KEY))
        .map_or(false, |value| value == QUARANTINE_LABEL_VALUE)
}

pub fn is_debug_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .map_or(false, |labels| labels.contains_key(DEBUG_LABEL_KEY))
}

/// Moves a label key out of the way of its controller's selector.
/// `app` becomes `quarantined-app`; `app.kubernetes.io/name` becomes `app.kubernetes.io/quarantined-name`.
pub fn prefixed_label_key(key: &str) -> String {
    match key.rsplit_once('/') {
        Some((prefix, name)) => format!("{}/{}{}", prefix, QUARANTINED_LABEL_PREFIX, name),
        None => format!("{}{}", QUARANTINED_LABEL_PREFIX, key),
    }
}

fn is_prefixed_label_key(key: &str) -> bool {
    let name = key.rsplit_once('/').map_or(key, |(_, name)| name);
    name.starts_with(QUARANTINED_LABEL_PREFIX)
}

/// Computes the label merge patch that marks a pod as quarantined. Every original key is moved to its
/// prefixed form (removed under the old key) so the owning controller no longer selects the pod.
/// Returns `None` when the pod is already marked.
pub fn quarantine_label_patch(
    labels: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, Option<String>>> {
    let mut patch = BTreeMap::new();

    if labels.get(QUARANTINE_LABEL_KEY).map(String::as_str) != Some(QUARANTINE_LABEL_VALUE) {
        patch.insert(
            QUARANTINE_LABEL_KEY.to_string(),
            Some(QUARANTINE_LABEL_VALUE.to_string()),
        );
    }

    for (key, value) in labels {
        if key == QUARANTINE_LABEL_KEY || is_prefixed_label_key(key) {
            continue;
        }
        patch.insert(key.clone(), None);
        patch.insert(prefixed_label_key(key), Some(value.clone()));
    }

    if patch.is_empty() {
        None
    } else {
        Some(patch)
    }
}

pub fn quarantine_taint() -> Taint {
    Taint {
        key: QUARANTINE_TAINT_KEY.to_string(),
        value: Some(QUARANTINE_TAINT_VALUE.to_string()),
        effect: QUARANTINE_TAINT_EFFECT.to_string(),
        time_added: None,
    }
}

pub fn quarantine_toleration() -> Toleration {
    Toleration {
        key: Some(QUARANTINE_TAINT_KEY.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(QUARANTINE_TAINT_VALUE.to_string()),
        effect: Some(QUARANTINE_TAINT_EFFECT.to_string()),
        toleration_seconds: None,
    }
}

fn is_quarantine_taint(taint: &Taint) -> bool {
    taint.key == QUARANTINE_TAINT_KEY && taint.value.as_deref() == Some(QUARANTINE_TAINT_VALUE)
}

/// Both key and value must match; tolerations that share only the key belong to someone else.
pub fn is_quarantine_toleration(toleration: &Toleration) -> bool {
    toleration.key.as_deref() == Some(QUARANTINE_TAINT_KEY)
        && toleration.value.as_deref() == Some(QUARANTINE_TAINT_VALUE)
}

pub fn has_quarantine_taint(taints: &[Taint]) -> bool {
    taints.iter().any(is_quarantine_taint)
}

/// Returns the taint list with the quarantine taint added, or `None` if it is already present.
pub fn with_quarantine_taint(taints: &[Taint]) -> Option<Vec<Taint>> {
    if has_quarantine_taint(taints) {
        return None;
    }
    let mut taints = taints.to_vec();
    taints.push(quarantine_taint());
    Some(taints)
}

/// Returns the taint list without the quarantine taint, or `None` if there was nothing to remove.
pub fn without_quarantine_taint(taints: &[Taint]) -> Option<Vec<Taint>> {
    if !has_quarantine_taint(taints) {
        return None;
    }
    Some(
        taints
            .iter()
            .filter(|taint| !is_quarantine_taint(taint))
            .cloned()
            .collect(),
    )
}

pub fn with_quarantine_toleration(tolerations: &[Toleration]) -> Option<Vec<Toleration>> {
    if tolerations.iter().any(is_quarantine_toleration) {
        return None;
    }
    let mut tolerations = tolerations.to_vec();
    tolerations.push(quarantine_toleration());
    Some(tolerations)
}

pub fn without_quarantine_toleration(tolerations: &[Toleration]) -> Option<Vec<Toleration>> {
    if !tolerations.iter().any(is_quarantine_toleration) {
        return None;
    }
    Some(
        tolerations
            .iter()
            .filter(|toleration| !is_quarantine_toleration(toleration))
            .cloned()
            .collect(),
    )
}

pub fn debug_pod_name(node_name: &str) -> String {
    format!("{}{}", DEBUG_POD_PREFIX, node_name)
}

/// Builds the diagnostic pod for a node. It is pinned to the node, shares the host network, mounts the
/// host root and tolerates the quarantine taint so it survives isolation of its own node.
pub fn debug_pod(node_name: &str, debug: &DebugSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(debug_pod_name(node_name)),
            namespace: Some(debug.namespace.clone()),
            labels: Some(btreemap! {
                DEBUG_LABEL_KEY.to_string() => "true".to_string(),
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            host_network: Some(true),
            host_pid: Some(true),
            restart_policy: Some("Always".to_string()),
            tolerations: Some(vec![quarantine_toleration()]),
            containers: vec![Container {
                name: "debug".to_string(),
                image: Some(debug.image.clone()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                stdin: Some(true),
                tty: Some(true),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "host-root".to_string(),
                    mount_path: DEBUG_HOST_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "host-root".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/".to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
