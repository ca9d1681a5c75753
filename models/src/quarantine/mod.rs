//! The `Quarantine` custom resource: a request to isolate a set of cluster nodes.
mod client;
mod error;

pub use self::client::*;
pub use self::error::Error as QuarantineClientError;

use crate::constants::{DEFAULT_DEBUG_IMAGE, DEFAULT_DEBUG_NAMESPACE, QUARANTINE_FINALIZER};

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use std::collections::BTreeSet;
use std::fmt;

/// The type of the single status condition that is authoritative for lifecycle state.
pub const ACTIVE_CONDITION: &str = "active";
/// The reason recorded on the active condition once isolation is in place.
pub const REASON_RUNNING: &str = "running";
/// The message recorded on the active condition once isolation is in place.
pub const MESSAGE_RUNNING: &str = "all requested nodes are quarantined";

// We can't use these consts inside macros, but we do provide constants for use in generating kubernetes objects.
pub const K8S_QUARANTINE_KIND: &str = "Quarantine";
pub const K8S_QUARANTINE_PLURAL: &str = "quarantines";
pub const K8S_QUARANTINE_STATUS: &str = "quarantines/status";

/// The `QuarantineSpec` describes which nodes should be isolated and how their workloads are treated.
#[derive(
    Clone,
    CustomResource,
    Serialize,
    Deserialize,
    Debug,
    Default,
    Eq,
    PartialEq,
    JsonSchema,
    Validate,
)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "nodequarantine.io",
    kind = "Quarantine",
    namespaced,
    plural = "quarantines",
    shortname = "qr",
    singular = "quarantine",
    status = "QuarantineStatus",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Nodes", "type":"string", "jsonPath":".spec.nodes[*].name"}"#,
    printcolumn = r#"{"name":"Active", "type":"string", "jsonPath":".status.conditions[?(@.type==\"active\")].status"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"active\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineSpec {
    /// The nodes to quarantine. Node names must be unique.
    #[serde(default)]
    #[validate(custom = "validate_node_names")]
    pub nodes: Vec<NodeSpec>,
    /// Debug pod configuration applied to every node in the request.
    #[serde(default)]
    pub debug: DebugSpec,
    /// Cluster-wide drain flags. Individual nodes may override them.
    #[serde(default)]
    pub flags: DrainFlags,
    /// Workloads tracked on every node unless a node lists the same workload itself.
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

fn validate_node_names(nodes: &[NodeSpec]) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for node in nodes {
        if node.name.is_empty() {
            return Err(ValidationError::new("empty_node_name"));
        }
        if !seen.insert(node.name.as_str()) {
            let mut err = ValidationError::new("duplicate_node_name");
            err.add_param("node".into(), &node.name);
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub name: String,
    /// Whether the node is tainted once its pods have been descheduled.
    #[serde(default)]
    pub isolate: bool,
    /// Accepted and stored for clients. Marked pods are always orphaned from their controller.
    #[serde(default)]
    pub rescale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<DrainFlags>,
    /// Per-node workload list. Entries here take precedence over the cluster-wide list.
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

#[derive(
    Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Daemonset,
    Deployment,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daemonset => write!(f, "daemonset"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// A workload tracked during isolation. `keep` marks workloads whose pods stay on the node.
#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, JsonSchema)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub keep: bool,
}

impl ResourceRef {
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Identity of a tracked workload. Two `ResourceRef`s describe the same workload when their keys are equal.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Overridable drain flags. Unset flags fall through to the next layer.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrainFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_all_daemon_sets: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_eviction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_empty_dir_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_errors: Option<bool>,
}

/// Fully-populated drain flags, computed once per node before any work is done.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResolvedDrainFlags {
    pub ignore_all_daemon_sets: bool,
    pub disable_eviction: bool,
    pub delete_empty_dir_data: bool,
    pub force: bool,
    pub ignore_errors: bool,
}

impl Default for ResolvedDrainFlags {
    fn default() -> Self {
        ResolvedDrainFlags {
            ignore_all_daemon_sets: true,
            disable_eviction: false,
            delete_empty_dir_data: false,
            force: false,
            ignore_errors: false,
        }
    }
}

impl DrainFlags {
    /// Layers built-in defaults, then the cluster-wide flags, then an optional node override.
    pub fn resolve(cluster: &DrainFlags, node: Option<&DrainFlags>) -> ResolvedDrainFlags {
        let defaults = ResolvedDrainFlags::default();
        let pick = |field: fn(&DrainFlags) -> Option<bool>, default: bool| {
            node.and_then(field)
                .or_else(|| field(cluster))
                .unwrap_or(default)
        };

        ResolvedDrainFlags {
            ignore_all_daemon_sets: pick(|f| f.ignore_all_daemon_sets, defaults.ignore_all_daemon_sets),
            disable_eviction: pick(|f| f.disable_eviction, defaults.disable_eviction),
            delete_empty_dir_data: pick(|f| f.delete_empty_dir_data, defaults.delete_empty_dir_data),
            force: pick(|f| f.force, defaults.force),
            ignore_errors: pick(|f| f.ignore_errors, defaults.ignore_errors),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DebugSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_debug_image")]
    pub image: String,
    #[serde(default = "default_debug_namespace")]
    pub namespace: String,
}

fn default_debug_image() -> String {
    DEFAULT_DEBUG_IMAGE.to_string()
}

fn default_debug_namespace() -> String {
    DEFAULT_DEBUG_NAMESPACE.to_string()
}

impl Default for DebugSpec {
    fn default() -> Self {
        DebugSpec {
            enabled: false,
            image: default_debug_image(),
            namespace: default_debug_namespace(),
        }
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        ConditionStatus::Unknown
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// JsonSchema cannot appropriately handle DateTime objects, so the RFC3339 form is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// A node as it was last converged, used to detect changes and nodes dropped from the request.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservedNode {
    pub name: String,
    #[serde(default)]
    pub isolate: bool,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineStatus {
    #[serde(default)]
    pub conditions: Vec<QuarantineCondition>,
    #[serde(default)]
    pub observed_nodes: Vec<ObservedNode>,
}

impl QuarantineStatus {
    pub fn active_condition(&self) -> Option<&QuarantineCondition> {
        self.conditions
            .iter()
            .find(|condition| condition.type_ == ACTIVE_CONDITION)
    }

    /// A quarantine is active once the active condition reports it running.
    pub fn is_active(&self) -> bool {
        self.active_condition().map_or(false, |condition| {
            condition.status == ConditionStatus::True && condition.reason == REASON_RUNNING
        })
    }

    /// Returns whether writing the given active condition and observed nodes would change anything.
    pub fn differs_from(
        &self,
        status: ConditionStatus,
        message: &str,
        observed_nodes: &[ObservedNode],
    ) -> bool {
        let condition_changed = self.active_condition().map_or(true, |condition| {
            condition.status != status || condition.message != message
        });
        condition_changed || self.observed_nodes != observed_nodes
    }

    /// Replaces the active condition, leaving other conditions untouched. The transition time only moves
    /// when the condition's status changes.
    pub fn set_active_condition(
        &mut self,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let last_transition_time = match self.active_condition() {
            Some(existing) if existing.status == status => existing.last_transition_time.clone(),
            _ => Some(now.to_rfc3339()),
        };
        let condition = QuarantineCondition {
            type_: ACTIVE_CONDITION.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time,
        };

        match self
            .conditions
            .iter_mut()
            .find(|existing| existing.type_ == ACTIVE_CONDITION)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

impl Quarantine {
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .map_or(false, QuarantineStatus::is_active)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|finalizer| finalizer == QUARANTINE_FINALIZER)
    }

    pub fn observed_nodes(&self) -> &[ObservedNode] {
        self.status
            .as_ref()
            .map(|status| status.observed_nodes.as_slice())
            .unwrap_or_default()
    }

    /// Returns the request's identity for logging: `namespace/name`.
    pub fn request_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
