use crate::quarantine::ResourceKey;

use http::StatusCode;
use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be handled by whoever receives it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The target object is absent. Success for removals, a hard error for required lookups.
    NotFound,
    /// More than one object matched a selector that must be unique. Never retried.
    Ambiguous,
    /// Network, conflict, throttling or timeout. Retried by re-reconciling.
    Transient,
    /// The request itself is wrong and retrying will not help.
    InvariantViolation,
    /// A multi-node operation stopped partway.
    PartialFailure,
}

impl ErrorClass {
    pub fn from_kube(err: &kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => match StatusCode::from_u16(response.code) {
                Ok(StatusCode::NOT_FOUND) => ErrorClass::NotFound,
                Ok(StatusCode::BAD_REQUEST)
                | Ok(StatusCode::FORBIDDEN)
                | Ok(StatusCode::UNPROCESSABLE_ENTITY) => ErrorClass::InvariantViolation,
                _ => ErrorClass::Transient,
            },
            kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => {
                ErrorClass::InvariantViolation
            }
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::PartialFailure)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to get Node '{}': '{}'", node_name, source))]
    GetNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to list Nodes: '{}'", source))]
    ListNodes { source: kube::Error },

    #[snafu(display("Unable to cordon Node '{}': '{}'", node_name, source))]
    CordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to uncordon Node '{}': '{}'", node_name, source))]
    UncordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to update taints of Node '{}': '{}'", node_name, source))]
    UpdateNodeTaints {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to update labels of Node '{}': '{}'", node_name, source))]
    LabelNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to list Pods matching '{}': '{}'", filter, source))]
    ListPods { source: kube::Error, filter: String },

    #[snafu(display("Unable to get Pod '{}/{}': '{}'", namespace, name, source))]
    GetPod {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("Unable to create Pod '{}/{}': '{}'", namespace, name, source))]
    CreatePod {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("Unable to delete Pod '{}/{}': '{}'", namespace, name, source))]
    DeletePod {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("Unable to update labels of Pod '{}/{}': '{}'", namespace, name, source))]
    LabelPod {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("Unable to get workload '{}': '{}'", key, source))]
    GetWorkload { source: kube::Error, key: ResourceKey },

    #[snafu(display("Unable to update pod template of workload '{}': '{}'", key, source))]
    UpdateWorkload { source: kube::Error, key: ResourceKey },

    #[snafu(display("Workload '{}' has no pod template", key))]
    MissingPodTemplate { key: ResourceKey },

    #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
    /// An error occurred while attempting to evict a Pod. This may result in an attempt to retry the eviction.
    RetriableEviction {
        source: kube::Error,
        pod_name: String,
    },

    #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
    /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
    NonRetriableEviction {
        source: kube::Error,
        pod_name: String,
    },

    #[snafu(display("Eviction of Pod '{}' was refused", pod_name))]
    EvictionRefused { pod_name: String },

    #[snafu(display("Refusing to remove Pod '{}': {}", pod_name, reason))]
    UndrainablePod { pod_name: String, reason: String },

    #[snafu(display("Unable to deschedule Pod '{}' from Node '{}': '{}'", pod_name, node_name, source))]
    DeschedulePod {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
        node_name: String,
        pod_name: String,
    },

    #[snafu(display("No controller Pod matching '{}' in namespace '{}'", selector, namespace))]
    ControllerPodNotFound { selector: String, namespace: String },

    #[snafu(display(
        "Found {} controller Pods matching '{}' in namespace '{}', expected exactly one",
        count,
        selector,
        namespace
    ))]
    AmbiguousControllerPod {
        count: usize,
        selector: String,
        namespace: String,
    },

    #[snafu(display("Controller Pod '{}' is not scheduled to a Node", pod_name))]
    ControllerPodUnscheduled { pod_name: String },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::GetNode { source, .. }
            | Self::ListNodes { source }
            | Self::CordonNode { source, .. }
            | Self::UncordonNode { source, .. }
            | Self::UpdateNodeTaints { source, .. }
            | Self::LabelNode { source, .. }
            | Self::ListPods { source, .. }
            | Self::GetPod { source, .. }
            | Self::CreatePod { source, .. }
            | Self::DeletePod { source, .. }
            | Self::LabelPod { source, .. }
            | Self::GetWorkload { source, .. }
            | Self::UpdateWorkload { source, .. }
            | Self::NonRetriableEviction { source, .. } => ErrorClass::from_kube(source),
            Self::RetriableEviction { .. }
            | Self::EvictionRefused { .. }
            | Self::ControllerPodUnscheduled { .. } => ErrorClass::Transient,
            Self::MissingPodTemplate { .. } | Self::UndrainablePod { .. } => {
                ErrorClass::InvariantViolation
            }
            Self::DeschedulePod { source, .. } => source.class(),
            Self::ControllerPodNotFound { .. } => ErrorClass::NotFound,
            Self::AmbiguousControllerPod { .. } => ErrorClass::Ambiguous,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn should_retry(&self) -> bool {
        match self {
            Self::RetriableEviction { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_error_classes() {
        assert_eq!(ErrorClass::from_kube(&api_error(404)), ErrorClass::NotFound);
        assert_eq!(ErrorClass::from_kube(&api_error(409)), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_kube(&api_error(429)), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_kube(&api_error(503)), ErrorClass::Transient);
        assert_eq!(
            ErrorClass::from_kube(&api_error(422)),
            ErrorClass::InvariantViolation
        );
    }

    #[test]
    fn test_deschedule_error_keeps_inner_class() {
        let err = Error::DeschedulePod {
            source: Box::new(Error::EvictionRefused {
                pod_name: "web-1".to_string(),
            }),
            node_name: "worker1".to_string(),
            pod_name: "web-1".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(Error::DeletePod {
            source: api_error(404),
            namespace: "default".to_string(),
            name: "web-1".to_string(),
        }
        .is_not_found());
    }
}
