use snafu::Snafu;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Error configuring telemetry: {}", source))]
    TelemetryInit {
        source: models::telemetry::TelemetryConfigError,
    },

    #[snafu(display("Unable to create Kubernetes client: {}", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Failed to apply {} '{}': {}", kind, name, source))]
    Apply {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("Failed to delete {} '{}': {}", kind, name, source))]
    Delete {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("Failed to render CRD: {}", source))]
    RenderCrd { source: serde_yaml::Error },

    #[snafu(display("Failed to reschedule the controller: {}", source))]
    Reschedule { source: controller::error::Error },
}
