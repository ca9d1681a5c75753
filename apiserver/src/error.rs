use models::telemetry::TelemetryConfigError;

use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("Unable to detect cluster IP family: '{}'", source))]
    MissingClusterIPFamily { source: std::env::VarError },

    #[snafu(display("Invalid value '{}' for APISERVER_PORT: '{}'", value, source))]
    InvalidPort {
        source: std::num::ParseIntError,
        value: String,
    },

    #[snafu(display("Error running HTTP server: '{}'", source))]
    HttpServerError { source: std::io::Error },

    #[snafu(display("Failed to install crypto provider."))]
    CryptoProvider,

    #[snafu(display("Failed to read TLS material from '{}': '{}'", path, source))]
    ReadTlsFile {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("No private key found in '{}'", path))]
    MissingPrivateKey { path: String },

    #[snafu(display("Failed to build TLS server config: '{}'", source))]
    TlsConfig { source: rustls::Error },

    #[snafu(display("Error configuring telemetry: '{}'", source))]
    TelemetryInit { source: TelemetryConfigError },
}
