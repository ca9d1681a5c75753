use models::node::{ErrorClass, IsolationError};

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a Quarantine change is denied at admission.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Quarantine is invalid: {}", source))]
    InvalidQuarantine { source: validator::ValidationErrors },

    #[snafu(display("Unable to determine where the controller runs: {}", source))]
    LocateController { source: IsolationError },

    #[snafu(display(
        "Node '{}' runs the controller Pod '{}' and cannot be quarantined; reschedule the controller first",
        node_name,
        pod_name
    ))]
    ControllerNodeQuarantined { node_name: String, pod_name: String },

    #[snafu(display("Admission request for {} carries no object", operation))]
    MissingObject { operation: &'static str },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::LocateController { source } => source.class(),
            Self::InvalidQuarantine { .. }
            | Self::ControllerNodeQuarantined { .. }
            | Self::MissingObject { .. } => ErrorClass::InvariantViolation,
        }
    }
}
