use crate::error::{self, Error, Result};
use crate::lifecycle::QuarantineLifecycle;
use crate::metrics::ReconcileMetrics;

use models::node::ClusterClient;
use models::quarantine::{
    ConditionStatus, ObservedNode, Quarantine, QuarantineClient, MESSAGE_RUNNING, REASON_RUNNING,
};

use chrono::Utc;
use futures::{future, StreamExt};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{event, instrument, Level};

// Failed reconciles are retried after this delay.
const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

const STEP_PREPARE: &str = "prepare";
const STEP_START: &str = "start";
const STEP_UPDATE: &str = "update";
const STEP_STOP: &str = "stop";

/// Everything a reconcile needs, shared across all Quarantine objects.
pub struct Context<T: ClusterClient, Q: QuarantineClient> {
    pub cluster_client: T,
    pub quarantine_client: Q,
    pub node_timeout: Duration,
    pub resync_interval: Duration,
    pub metrics: ReconcileMetrics,
}

/// Drives one Quarantine towards its desired state and records the outcome in its status.
///
/// Work is only done on the latest copy of the object. Deletion runs `stop()` before the finalizer is released;
/// a fresh request gets the finalizer before anything in the cluster is touched.
#[instrument(skip(quarantine, ctx), fields(quarantine = %quarantine.request_name()), err)]
pub async fn reconcile<T, Q>(quarantine: Arc<Quarantine>, ctx: Arc<Context<T, Q>>) -> Result<Action>
where
    T: ClusterClient + 'static,
    Q: QuarantineClient + 'static,
{
    let started = Instant::now();
    let result = reconcile_quarantine(&quarantine, &ctx).await;
    ctx.metrics.observe(
        if result.is_ok() { "success" } else { "error" },
        started,
    );
    result
}

async fn reconcile_quarantine<T, Q>(quarantine: &Quarantine, ctx: &Context<T, Q>) -> Result<Action>
where
    T: ClusterClient,
    Q: QuarantineClient,
{
    let name = quarantine.name_any();
    let namespace = quarantine
        .namespace()
        .context(error::MissingNamespaceSnafu { name: name.clone() })?;

    let quarantine = match ctx
        .quarantine_client
        .get_quarantine(&namespace, &name)
        .await
        .context(error::LoadQuarantineSnafu)?
    {
        Some(quarantine) => quarantine,
        None => {
            event!(Level::INFO, "Quarantine no longer exists");
            return Ok(Action::await_change());
        }
    };

    let mut lifecycle = QuarantineLifecycle::new(
        ctx.cluster_client.clone(),
        &quarantine,
        ctx.node_timeout,
    );

    if quarantine.is_deleting() {
        if !quarantine.has_finalizer() {
            return Ok(Action::await_change());
        }
        return match lifecycle.stop().await {
            Ok(()) => {
                event!(Level::INFO, "Isolation reversed, releasing finalizer");
                ctx.quarantine_client
                    .remove_finalizer(&quarantine)
                    .await
                    .context(error::FinalizerSnafu)?;
                Ok(Action::await_change())
            }
            Err(err) => fail(ctx, &quarantine, lifecycle.observed_nodes(), STEP_STOP, err).await,
        };
    }

    if !quarantine.has_finalizer() {
        event!(Level::INFO, "Attaching finalizer");
        ctx.quarantine_client
            .add_finalizer(&quarantine)
            .await
            .context(error::FinalizerSnafu)?;
        // The finalizer write triggers another reconcile, which does the actual work.
        return Ok(Action::await_change());
    }

    let outcome = if lifecycle.is_active() {
        lifecycle.update().await.map_err(|err| (STEP_UPDATE, err))
    } else {
        match lifecycle.prepare().await {
            Ok(()) => lifecycle.start().await.map_err(|err| (STEP_START, err)),
            Err(err) => Err((STEP_PREPARE, err)),
        }
    };

    match outcome {
        Ok(()) => {
            write_status(
                ctx,
                &quarantine,
                lifecycle.observed_nodes(),
                ConditionStatus::True,
                REASON_RUNNING,
                MESSAGE_RUNNING,
            )
            .await?;
            Ok(Action::requeue(ctx.resync_interval))
        }
        Err((step, err)) => fail(ctx, &quarantine, lifecycle.observed_nodes(), step, err).await,
    }
}

/// Records a failed step on the active condition and returns the step's error.
async fn fail<T, Q>(
    ctx: &Context<T, Q>,
    quarantine: &Quarantine,
    observed: Vec<ObservedNode>,
    step: &str,
    err: Error,
) -> Result<Action>
where
    T: ClusterClient,
    Q: QuarantineClient,
{
    event!(Level::ERROR, step, class = ?err.class(), "Quarantine step failed: '{}'", err);
    if let Err(status_err) = write_status(
        ctx,
        quarantine,
        observed,
        ConditionStatus::False,
        step,
        &err.to_string(),
    )
    .await
    {
        event!(Level::ERROR, "Unable to record failure in status: '{}'", status_err);
    }
    Err(err)
}

/// Writes the active condition and observed nodes, unless the condition already carries the same status and
/// message and the observed nodes are unchanged. Skipping identical writes keeps our own status updates from
/// triggering an endless series of reconciles.
async fn write_status<T, Q>(
    ctx: &Context<T, Q>,
    quarantine: &Quarantine,
    observed: Vec<ObservedNode>,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> Result<()>
where
    T: ClusterClient,
    Q: QuarantineClient,
{
    let mut next = quarantine.status.clone().unwrap_or_default();
    if !next.differs_from(status, message, &observed) {
        event!(Level::DEBUG, "Status unchanged, skipping write");
        return Ok(());
    }

    next.set_active_condition(status, reason, message, Utc::now());
    next.observed_nodes = observed;
    ctx.quarantine_client
        .update_status(quarantine, &next)
        .await
        .context(error::UpdateStatusSnafu)
}

pub fn error_policy<T, Q>(quarantine: Arc<Quarantine>, error: &Error, _ctx: Arc<Context<T, Q>>) -> Action
where
    T: ClusterClient,
    Q: QuarantineClient,
{
    event!(
        Level::WARN,
        quarantine = %quarantine.request_name(),
        class = ?error.class(),
        "Reconcile failed: '{}'",
        error
    );
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

/// Runs the reconcile loop over every Quarantine in the cluster until a termination signal is received.
pub async fn run<T, Q>(k8s_client: kube::Client, ctx: Arc<Context<T, Q>>)
where
    T: ClusterClient + 'static,
    Q: QuarantineClient + 'static,
{
    let quarantines: Api<Quarantine> = Api::all(k8s_client);
    Controller::new(quarantines, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((object, _)) => {
                    event!(Level::DEBUG, quarantine = %object.name, "Reconciled");
                }
                Err(err) => {
                    event!(Level::WARN, "Reconcile loop error: '{}'", err);
                }
            }
            future::ready(())
        })
        .await;
    event!(Level::INFO, "Controller shut down");
}
