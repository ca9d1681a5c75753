use apiserver::api::{self, APIServerSettings};
use apiserver::error::{self, Result};
use models::node::K8SClusterClient;
use models::telemetry;
use tracing::{event, Level};

use snafu::ResultExt;

use std::env;
use std::fs;

// By default, errors resulting in termination of the apiserver are written to this file,
// which is the location kubernetes uses by default to surface termination-causing errors.
const TERMINATION_LOG: &str = "/dev/termination-log";

#[actix_web::main]
async fn main() {
    let termination_log =
        env::var("TERMINATION_LOG").unwrap_or_else(|_| TERMINATION_LOG.to_string());

    if let Err(error) = run_server().await {
        event!(Level::ERROR, %error, "node quarantine apiserver failed.");
        if let Err(write_err) = fs::write(&termination_log, format!("{}", error)) {
            eprintln!("Could not write k8s termination log: {}", write_err);
        }
        std::process::exit(1);
    }
}

async fn run_server() -> Result<()> {
    telemetry::init_telemetry_from_env().context(error::TelemetryInitSnafu)?;

    let k8s_client = kube::client::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    let settings = APIServerSettings::from_environment(K8SClusterClient::new(k8s_client))?;

    api::run_server(settings).await
}
