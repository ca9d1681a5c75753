//! Orchestrates node isolation across every node of a quarantine request.
use crate::error::{self, Result};
use crate::statemachine::QuarantineState;

use models::node::{
    debug_pod_name, ClusterClient, IsolationEngine, QuarantinedNode, Result as IsolationResult,
};
use models::quarantine::{ObservedNode, Quarantine, ResourceKey};

use snafu::ResultExt;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use tokio::time::{timeout, Duration};
use tracing::{event, instrument, Level};

/// The runtime view of one quarantine request, rebuilt from the resource on every reconcile.
///
/// `nodes` are the nodes the request currently names. `marked_nodes` were converged earlier (they appear in
/// the persisted observed set) but are no longer requested; their isolation is reversed on the next pass.
pub struct QuarantineLifecycle<T: ClusterClient> {
    engine: IsolationEngine<T>,
    nodes: Vec<QuarantinedNode>,
    marked_nodes: Vec<QuarantinedNode>,
    observed: BTreeMap<String, ObservedNode>,
    state: QuarantineState,
    is_active: bool,
    node_timeout: Duration,
}

impl<T: ClusterClient> QuarantineLifecycle<T> {
    pub fn new(client: T, quarantine: &Quarantine, node_timeout: Duration) -> Self {
        let spec = &quarantine.spec;
        let nodes: Vec<QuarantinedNode> = spec
            .nodes
            .iter()
            .map(|node| QuarantinedNode::resolve(node, spec))
            .collect();

        let current: BTreeSet<&str> = nodes.iter().map(|node| node.name.as_str()).collect();
        let marked_nodes = quarantine
            .observed_nodes()
            .iter()
            .filter(|observed| !current.contains(observed.name.as_str()))
            .map(|observed| QuarantinedNode::from_observed(observed, spec))
            .collect();

        let observed = quarantine
            .observed_nodes()
            .iter()
            .map(|observed| (observed.name.clone(), observed.clone()))
            .collect();

        let is_active = quarantine.is_active();
        QuarantineLifecycle {
            engine: IsolationEngine::new(client),
            nodes,
            marked_nodes,
            observed,
            state: QuarantineState::from_active(is_active),
            is_active,
            node_timeout,
        }
    }

    /// Whether the request was active when it was loaded. This is not re-read from the cluster.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn state(&self) -> QuarantineState {
        self.state
    }

    pub fn nodes(&self) -> &[QuarantinedNode] {
        &self.nodes
    }

    pub fn marked_nodes(&self) -> &[QuarantinedNode] {
        &self.marked_nodes
    }

    /// The per-node records to persist in status, in the order the request lists its nodes.
    pub fn observed_nodes(&self) -> Vec<ObservedNode> {
        let mut observed: Vec<ObservedNode> = self
            .nodes
            .iter()
            .filter_map(|node| self.observed.get(&node.name).cloned())
            .collect();
        // Marked nodes whose reversal has not completed stay on record so the next pass retries them.
        observed.extend(
            self.marked_nodes
                .iter()
                .filter_map(|node| self.observed.get(&node.name).cloned()),
        );
        observed
    }

    fn advance(&mut self, next: QuarantineState) -> Result<()> {
        let next = self.state.transition(next)?;
        event!(Level::DEBUG, from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        Ok(())
    }

    /// Runs one step against a node under the per-node timeout.
    async fn step<R, F>(&self, step: &'static str, node_name: &str, fut: F) -> Result<R>
    where
        F: Future<Output = IsolationResult<R>>,
    {
        match timeout(self.node_timeout, fut).await {
            Ok(result) => result.context(error::NodeStepSnafu { step, node_name }),
            Err(_) => error::NodeStepTimeoutSnafu {
                step,
                node_name,
                timeout: self.node_timeout,
            }
            .fail(),
        }
    }

    async fn prepare_node(&self, node: &QuarantinedNode) -> Result<()> {
        let engine = &self.engine;
        if node.debug.enabled {
            self.step("deploy debug pod on", &node.name, engine.deploy_debug(node))
                .await?;
        }

        let isolated = self
            .step(
                "check isolation of",
                &node.name,
                engine.is_already_isolated(&node.name),
            )
            .await?;
        if isolated {
            event!(Level::INFO, node = %node.name, "Node is already isolated");
            return Ok(());
        }

        self.step("cordon", &node.name, engine.disable_scheduling(&node.name))
            .await?;
        self.step(
            "isolate workloads on",
            &node.name,
            engine.isolate(node, node.isolate),
        )
        .await
    }

    async fn start_node(&mut self, node: &QuarantinedNode) -> Result<()> {
        // Pods are descheduled before the taint goes on, so nothing evicted lands back on this node.
        self.step(
            "deschedule pods from",
            &node.name,
            self.engine.deschedule_pods(node),
        )
        .await?;
        if node.isolate {
            self.step("taint", &node.name, self.engine.taint_node(&node.name))
                .await?;
        }
        self.observed.insert(node.name.clone(), node.observed());
        Ok(())
    }

    /// Undoes everything isolation may have done to a node. Each step is a no-op if it never happened.
    async fn reverse_node(&mut self, node: &QuarantinedNode) -> Result<()> {
        event!(Level::INFO, node = %node.name, "Reversing isolation");
        let engine = &self.engine;
        self.step("untaint", &node.name, engine.untaint_node(&node.name))
            .await?;
        for resource in node.resources() {
            self.step(
                "remove tolerations for",
                &node.name,
                engine.remove_toleration(resource),
            )
            .await?;
        }
        self.step(
            "remove debug pod from",
            &node.name,
            engine.remove_debug(&debug_pod_name(&node.name), &node.debug.namespace),
        )
        .await?;
        self.step(
            "remove quarantined pods from",
            &node.name,
            engine.remove_isolated_pods(&node.name),
        )
        .await?;
        self.step("uncordon", &node.name, engine.enable_scheduling(&node.name))
            .await?;
        self.observed.remove(&node.name);
        Ok(())
    }

    async fn reverse_marked_nodes(&mut self) -> Result<()> {
        for node in self.marked_nodes.clone() {
            self.reverse_node(&node).await?;
        }
        Ok(())
    }

    fn has_changed(&self, node: &QuarantinedNode) -> bool {
        match self.observed.get(&node.name) {
            None => true,
            Some(previous) => {
                previous.isolate != node.isolate
                    || node.daemonsets_not_equal(previous)
                    || node.deployments_not_equal(previous)
            }
        }
    }

    /// Brings one node in line with its desired workload set and isolation flag.
    async fn converge_node(&mut self, node: &QuarantinedNode) -> Result<()> {
        let previous = self.observed.get(&node.name).cloned();
        if let Some(previous) = &previous {
            let current: BTreeSet<ResourceKey> = node.resources().map(|r| r.key()).collect();
            for dropped in previous
                .resources
                .iter()
                .filter(|resource| !current.contains(&resource.key()))
            {
                self.step(
                    "remove tolerations for",
                    &node.name,
                    self.engine.remove_toleration(dropped),
                )
                .await?;
            }
        }

        let isolated = self
            .step(
                "check isolation of",
                &node.name,
                self.engine.is_already_isolated(&node.name),
            )
            .await?;
        if !isolated {
            self.prepare_node(node).await?;
            return self.start_node(node).await;
        }

        self.step(
            "isolate workloads on",
            &node.name,
            self.engine.isolate(node, node.isolate),
        )
        .await?;
        if !node.isolate && previous.map_or(false, |previous| previous.isolate) {
            event!(Level::INFO, node = %node.name, "Isolation no longer requested, removing taint");
            self.step("untaint", &node.name, self.engine.untaint_node(&node.name))
                .await?;
            for resource in node.resources() {
                self.step(
                    "remove tolerations for",
                    &node.name,
                    self.engine.remove_toleration(resource),
                )
                .await?;
            }
        }
        self.observed.insert(node.name.clone(), node.observed());
        Ok(())
    }

    /// Attaches debug Pods and cordons and isolates every node that is not isolated yet. Nodes dropped from
    /// the request are reversed first. Returns the first error; nodes handled before it stay isolated.
    #[instrument(skip(self), err)]
    pub async fn prepare(&mut self) -> Result<()> {
        self.advance(QuarantineState::Preparing)?;
        self.reverse_marked_nodes().await?;
        for node in &self.nodes {
            self.prepare_node(node).await?;
        }
        Ok(())
    }

    /// Deschedules Pods from every node and taints the nodes that ask for isolation.
    #[instrument(skip(self), err)]
    pub async fn start(&mut self) -> Result<()> {
        self.advance(QuarantineState::Active)?;
        for node in self.nodes.clone() {
            self.start_node(&node).await?;
        }
        Ok(())
    }

    /// Converges the first node whose workload set changed since it was last recorded, after reversing
    /// nodes dropped from the request. Remaining changed nodes are left for later reconciles.
    #[instrument(skip(self), err)]
    pub async fn update(&mut self) -> Result<()> {
        self.advance(QuarantineState::Updating)?;
        self.reverse_marked_nodes().await?;

        let changed = self
            .nodes
            .iter()
            .find(|node| self.has_changed(node))
            .cloned();
        if let Some(node) = changed {
            event!(Level::INFO, node = %node.name, "Workloads changed, converging node");
            self.converge_node(&node).await?;
        }

        self.advance(QuarantineState::Active)
    }

    /// Reverses isolation on every current and dropped node, then deletes any quarantined Pod left in the
    /// cluster. Safe to run against a request that was only partly prepared.
    #[instrument(skip(self), err)]
    pub async fn stop(&mut self) -> Result<()> {
        self.advance(QuarantineState::Stopped)?;
        let nodes: Vec<QuarantinedNode> = self
            .nodes
            .iter()
            .chain(self.marked_nodes.iter())
            .cloned()
            .collect();
        for node in nodes {
            self.reverse_node(&node).await?;
        }

        match timeout(self.node_timeout, self.engine.cleanup_isolated_pods()).await {
            Ok(result) => result.context(error::NodeStepSnafu {
                step: "clean up quarantined pods on",
                node_name: "*",
            }),
            Err(_) => error::NodeStepTimeoutSnafu {
                step: "clean up quarantined pods on",
                node_name: "*",
                timeout: self.node_timeout,
            }
            .fail(),
        }
    }
}
