//! Admission checks for Quarantine objects.
//!
//! The one enforced rule: a Quarantine may not name the node the controller itself runs on, since
//! isolating that node would strand the controller on it.
pub mod error;

pub use self::error::Error as AdmissionError;
use self::error::Result;

use models::controller::find_controller_pod;
use models::node::ClusterClient;
use models::quarantine::Quarantine;

use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::ResourceExt;
use snafu::{ensure, ResultExt};
use tracing::{event, instrument, Level};
use validator::Validate;

#[derive(Clone)]
pub struct AdmissionGuard<T: ClusterClient> {
    client: T,
    controller_namespace: String,
}

impl<T: ClusterClient> AdmissionGuard<T> {
    pub fn new(client: T, controller_namespace: &str) -> Self {
        AdmissionGuard {
            client,
            controller_namespace: controller_namespace.to_string(),
        }
    }

    /// Rejects a new Quarantine that is malformed or names the controller's node.
    ///
    /// Any failure to resolve the controller Pod, including finding more than one, denies the request.
    #[instrument(skip(self, quarantine), fields(quarantine = %quarantine.request_name()), err)]
    pub async fn validate_on_create(&self, quarantine: &Quarantine) -> Result<()> {
        quarantine
            .spec
            .validate()
            .context(error::InvalidQuarantineSnafu)?;

        let (pod, node_name) = find_controller_pod(&self.client, &self.controller_namespace)
            .await
            .context(error::LocateControllerSnafu)?;

        ensure!(
            !quarantine
                .spec
                .nodes
                .iter()
                .any(|node| node.name == node_name),
            error::ControllerNodeQuarantinedSnafu {
                node_name,
                pod_name: pod.name_any(),
            }
        );
        Ok(())
    }

    /// Updates are not checked yet. Adding the controller's node to an existing Quarantine is allowed.
    #[instrument(skip_all, err)]
    pub async fn validate_on_update(&self, _old: &Quarantine, _new: &Quarantine) -> Result<()> {
        Ok(())
    }

    /// Dispatches a validating admission request by operation and turns the outcome into a response.
    pub async fn review(&self, request: &AdmissionRequest<Quarantine>) -> AdmissionResponse {
        let result = match request.operation {
            Operation::Create => match request.object.as_ref() {
                Some(quarantine) => self.validate_on_create(quarantine).await,
                None => error::MissingObjectSnafu { operation: "CREATE" }.fail(),
            },
            Operation::Update => {
                match (request.old_object.as_ref(), request.object.as_ref()) {
                    (Some(old), Some(new)) => self.validate_on_update(old, new).await,
                    _ => error::MissingObjectSnafu { operation: "UPDATE" }.fail(),
                }
            }
            Operation::Delete | Operation::Connect => Ok(()),
        };

        let response = AdmissionResponse::from(request);
        match result {
            Ok(()) => response,
            Err(err) => {
                event!(
                    Level::WARN,
                    uid = %request.uid,
                    name = %request.name,
                    class = ?err.class(),
                    "Denying Quarantine admission: {}",
                    err
                );
                response.deny(err.to_string())
            }
        }
    }

    /// Mutation hook. Nothing is changed, so every request is allowed without a patch.
    pub fn mutate(&self, request: &AdmissionRequest<Quarantine>) -> AdmissionResponse {
        AdmissionResponse::from(request)
    }
}
