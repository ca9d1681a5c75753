use std::{convert::TryFrom, sync::Arc};

use controller::{
    metrics::ReconcileMetrics, telemetry::vending_metrics, Context, ControllerSettings,
};
use models::{node::K8SClusterClient, quarantine::K8SQuarantineClient, telemetry};

use actix_web::{web::Data, App, HttpServer};
use prometheus::Registry;
use snafu::ResultExt;
use tracing::{event, Level};

/// The module-wide result type.
type Result<T> = std::result::Result<T, controller_error::Error>;

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry_from_env().context(controller_error::TelemetryInitSnafu)?;

    let incluster_config =
        kube::Config::incluster_dns().context(controller_error::ConfigCreateSnafu)?;

    // The in-cluster namespace is used when POD_NAMESPACE is unset.
    let settings = ControllerSettings::from_environment(&incluster_config.default_namespace)
        .context(controller_error::SettingsSnafu)?;
    event!(Level::INFO, ?settings, "Starting node quarantine controller");

    let k8s_client = kube::client::Client::try_from(incluster_config)
        .context(controller_error::ClientCreateSnafu)?;

    let registry = Registry::new();
    let metrics = ReconcileMetrics::new(&registry).context(controller_error::ControllerSnafu)?;

    let ctx = Arc::new(Context {
        cluster_client: K8SClusterClient::new(k8s_client.clone()),
        quarantine_client: K8SQuarantineClient::new(k8s_client.clone()),
        node_timeout: settings.node_timeout,
        resync_interval: settings.resync_interval,
        metrics,
    });
    let controller_runner = controller::run(k8s_client, ctx);

    // Setup Http server to vend prometheus metrics
    let prometheus_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(registry.clone()))
            .service(vending_metrics)
    })
    .bind(format!("{}:{}", settings.bind_address, settings.metrics_port))
    .context(controller_error::PrometheusServerSnafu)?
    .run();

    tokio::select! {
        _ = controller_runner => {
            event!(Level::INFO, "controller exited");
        },
        result = prometheus_server => {
            event!(Level::ERROR, "metric server exited");
            result.context(controller_error::PrometheusServerSnafu)?
        }
    };
    Ok(())
}

pub mod controller_error {
    use models::telemetry;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create Kubernetes client config: '{}'", source))]
        ConfigCreate {
            source: kube::config::InClusterError,
        },

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Unable to set up the controller: '{}'", source))]
        Controller { source: controller::error::Error },

        #[snafu(display("Invalid controller settings: '{}'", source))]
        Settings { source: controller::error::Error },

        #[snafu(display("Error running prometheus HTTP server: '{}'", source))]
        PrometheusServerError { source: std::io::Error },

        #[snafu(display("Error configuring telemetry: '{}'", source))]
        TelemetryInit {
            source: telemetry::TelemetryConfigError,
        },
    }
}
