//! This module contains the admission webhook server. Endpoints are stored in submodules.
mod admission;
mod ping;
mod tls;

use crate::{
    admission::AdmissionGuard,
    error::{self, Result},
    telemetry,
};
use models::constants::{
    APISERVER_HEALTH_CHECK_ROUTE, APISERVER_INTERNAL_PORT, APISERVER_MUTATE_ROUTE,
    APISERVER_VALIDATE_ROUTE, NAMESPACE,
};
use models::node::ClusterClient;

use actix_web::{
    web::{self, Data},
    App, HttpServer,
};
use snafu::ResultExt;
use tracing::{event, Level};
use tracing_actix_web::TracingLogger;

use std::env;

// The set of API endpoints for which `tracing::Span`s will not be recorded.
pub const NO_TELEMETRY_ENDPOINTS: &[&str] = &[APISERVER_HEALTH_CHECK_ROUTE];

const APISERVER_PORT_ENV_VAR: &str = "APISERVER_PORT";
const TLS_CERT_PATH_ENV_VAR: &str = "TLS_CERT_PATH";
const TLS_KEY_PATH_ENV_VAR: &str = "TLS_KEY_PATH";
const POD_NAMESPACE_ENV_VAR: &str = "POD_NAMESPACE";

const DEFAULT_TLS_CERT_PATH: &str = "/etc/node-quarantine-tls/tls.crt";
const DEFAULT_TLS_KEY_PATH: &str = "/etc/node-quarantine-tls/tls.key";

#[derive(Clone)]
/// Settings that are applied to the apiserver. These settings are provided to each HTTP route
/// via actix's application data system.
pub struct APIServerSettings<T: ClusterClient> {
    pub guard: AdmissionGuard<T>,
    pub server_port: u16,
    pub tls_cert_path: String,
    pub tls_key_path: String,
}

impl<T: ClusterClient> APIServerSettings<T> {
    /// Builds settings from the environment. The guard looks for the controller in `POD_NAMESPACE`, which
    /// defaults to the operator's namespace.
    pub fn from_environment(cluster_client: T) -> Result<Self> {
        Self::from_lookup(cluster_client, |name| env::var(name).ok())
    }

    pub fn from_lookup<F>(cluster_client: T, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_port = match lookup(APISERVER_PORT_ENV_VAR) {
            Some(value) => value
                .parse()
                .context(error::InvalidPortSnafu { value: value.clone() })?,
            None => APISERVER_INTERNAL_PORT,
        };
        let namespace = lookup(POD_NAMESPACE_ENV_VAR).unwrap_or_else(|| NAMESPACE.to_string());

        Ok(APIServerSettings {
            guard: AdmissionGuard::new(cluster_client, &namespace),
            server_port,
            tls_cert_path: lookup(TLS_CERT_PATH_ENV_VAR)
                .unwrap_or_else(|| DEFAULT_TLS_CERT_PATH.to_string()),
            tls_key_path: lookup(TLS_KEY_PATH_ENV_VAR)
                .unwrap_or_else(|| DEFAULT_TLS_KEY_PATH.to_string()),
        })
    }
}

/// Runs the apiserver using the given settings.
pub async fn run_server<T: 'static + ClusterClient>(settings: APIServerSettings<T>) -> Result<()> {
    let server_port = settings.server_port;

    // Use IP for KUBERNETES_SERVICE_HOST to decide the IP family for the cluster,
    // Match API server IP family same as cluster
    let k8s_service_addr =
        env::var("KUBERNETES_SERVICE_HOST").context(error::MissingClusterIPFamilySnafu)?;
    let server_addr = if k8s_service_addr.contains(':') {
        // IPv6 format
        format!("[::]:{}", server_port)
    } else {
        // IPv4 format
        format!("0.0.0.0:{}", server_port)
    };

    event!(Level::DEBUG, ?server_addr, "Server addr localhost.");

    tls::install_default_crypto_provider()?;
    let tls_config = tls::server_config(&settings.tls_cert_path, &settings.tls_key_path)?;

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::<telemetry::QuarantineApiserverRootSpanBuilder>::new())
            .app_data(Data::new(settings.clone()))
            .route(
                APISERVER_VALIDATE_ROUTE,
                web::post().to(admission::validate::<T>),
            )
            .route(APISERVER_MUTATE_ROUTE, web::post().to(admission::mutate::<T>))
            .route(
                APISERVER_HEALTH_CHECK_ROUTE,
                web::get().to(ping::health_check),
            )
    })
    .bind_rustls_0_23(server_addr, tls_config)
    .context(error::HttpServerSnafu)?
    .run();

    server.await.context(error::HttpServerSnafu)
}
