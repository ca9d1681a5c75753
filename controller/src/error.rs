use crate::statemachine::QuarantineState;
use models::node::{ErrorClass, IsolationError};
use models::quarantine::QuarantineClientError;

use snafu::Snafu;
use std::time::Duration;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Invalid lifecycle transition from {} to {}", from, to))]
    InvalidTransition {
        from: QuarantineState,
        to: QuarantineState,
    },

    #[snafu(display("Failed to {} node '{}': '{}'", step, node_name, source))]
    NodeStep {
        source: IsolationError,
        step: &'static str,
        node_name: String,
    },

    #[snafu(display(
        "Timed out after {:.0}s trying to {} node '{}'",
        timeout.as_secs_f64(),
        step,
        node_name
    ))]
    NodeStepTimeout {
        step: &'static str,
        node_name: String,
        timeout: Duration,
    },

    #[snafu(display("Unable to load Quarantine: '{}'", source))]
    LoadQuarantine { source: QuarantineClientError },

    #[snafu(display("Unable to update Quarantine finalizer: '{}'", source))]
    Finalizer { source: QuarantineClientError },

    #[snafu(display("Unable to update Quarantine status: '{}'", source))]
    UpdateStatus { source: QuarantineClientError },

    #[snafu(display("Quarantine '{}' has no namespace", name))]
    MissingNamespace { name: String },

    #[snafu(display("Unable to locate the controller Pod: '{}'", source))]
    LocateController { source: IsolationError },

    #[snafu(display("Unable to list Nodes eligible for the controller: '{}'", source))]
    ListEligibleNodes { source: IsolationError },

    #[snafu(display("Unable to update eligibility label of Node '{}': '{}'", node_name, source))]
    LabelEligibleNode {
        source: IsolationError,
        node_name: String,
    },

    #[snafu(display("Unable to update the controller's node selector: '{}'", source))]
    ControllerNodeSelector { source: IsolationError },

    #[snafu(display("Unable to evict controller Pod '{}': '{}'", pod_name, source))]
    EvictController {
        source: IsolationError,
        pod_name: String,
    },

    #[snafu(display("Eviction of controller Pod '{}' did not succeed", pod_name))]
    ControllerEvictionRefused { pod_name: String },

    #[snafu(display("Unable to register metrics: '{}'", source))]
    MetricsRegistration { source: prometheus::Error },

    #[snafu(display("Invalid value '{}' for environment variable '{}': '{}'", value, name, source))]
    InvalidSetting {
        source: std::num::ParseIntError,
        name: &'static str,
        value: String,
    },

    #[snafu(display("Environment variable '{}' must be set", name))]
    MissingSetting { name: &'static str },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NodeStep { source, .. }
            | Self::LocateController { source }
            | Self::ListEligibleNodes { source }
            | Self::LabelEligibleNode { source, .. }
            | Self::ControllerNodeSelector { source }
            | Self::EvictController { source, .. } => source.class(),
            Self::LoadQuarantine { source }
            | Self::Finalizer { source }
            | Self::UpdateStatus { source } => source.class(),
            Self::NodeStepTimeout { .. } | Self::ControllerEvictionRefused { .. } => {
                ErrorClass::Transient
            }
            Self::InvalidTransition { .. }
            | Self::MissingNamespace { .. }
            | Self::MetricsRegistration { .. }
            | Self::InvalidSetting { .. }
            | Self::MissingSetting { .. } => ErrorClass::InvariantViolation,
        }
    }
}
