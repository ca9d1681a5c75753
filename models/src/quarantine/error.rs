use crate::node::ErrorClass;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to get Quarantine '{}': '{}'", name, source))]
    GetQuarantine { source: kube::Error, name: String },

    #[snafu(display("Unable to update finalizers of Quarantine '{}': '{}'", name, source))]
    UpdateFinalizers { source: kube::Error, name: String },

    #[snafu(display("Unable to update status of Quarantine '{}': '{}'", name, source))]
    UpdateQuarantineStatus { source: kube::Error, name: String },

    #[snafu(display("Quarantine object is missing a namespace."))]
    MissingNamespace,

    #[snafu(display("Unable to create patch to send to Kubernetes API: '{}'", source))]
    CreateK8SPatch { source: serde_json::error::Error },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::GetQuarantine { source, .. }
            | Self::UpdateFinalizers { source, .. }
            | Self::UpdateQuarantineStatus { source, .. } => ErrorClass::from_kube(source),
            Self::MissingNamespace | Self::CreateK8SPatch { .. } => ErrorClass::InvariantViolation,
        }
    }
}
