mod error;
mod install;

use crate::error::Result;
use controller::SelfRescheduler;
use models::constants::NAMESPACE;
use models::node::K8SClusterClient;
use models::telemetry;

use snafu::ResultExt;
use std::process;
use structopt::StructOpt;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// Installs and operates the node quarantine controller.
#[derive(StructOpt, Debug)]
#[structopt(name = "quarantinectl")]
pub(crate) struct Arguments {
    #[structopt(subcommand)]
    subcommand: SubCommand,
}

#[derive(StructOpt, Debug, PartialEq)]
enum SubCommand {
    /// Applies the namespace, CRD, RBAC and controller Deployment.
    Install(InstallArgs),
    /// Deletes everything `install` created.
    Uninstall,
    /// Prints the Quarantine CRD as YAML.
    Crd,
    /// Moves the controller Pod off the given nodes.
    Reschedule(RescheduleArgs),
}

#[derive(StructOpt, Debug, PartialEq)]
struct InstallArgs {
    #[structopt(long = "--image")]
    image: String,

    #[structopt(long = "--image-pull-secret")]
    image_pull_secret: Option<String>,
}

#[derive(StructOpt, Debug, PartialEq)]
struct RescheduleArgs {
    /// Comma-separated nodes the controller must leave.
    #[structopt(long = "--excludedNodes", use_delimiter = true)]
    excluded_nodes: Vec<String>,

    #[structopt(long = "--namespace", default_value = NAMESPACE)]
    namespace: String,
}

async fn run() -> Result<()> {
    // Parse and store the args passed to the program
    let args = Arguments::from_args();

    if args.subcommand == SubCommand::Crd {
        print!("{}", install::crd_yaml()?);
        return Ok(());
    }

    telemetry::init_telemetry_from_env().context(error::TelemetryInitSnafu)?;
    let k8s_client = kube::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;

    match args.subcommand {
        SubCommand::Install(install_args) => {
            install::install(
                k8s_client,
                install_args.image,
                install_args.image_pull_secret,
            )
            .await
        }
        SubCommand::Uninstall => install::uninstall(k8s_client).await,
        SubCommand::Reschedule(reschedule_args) => {
            SelfRescheduler::new(
                K8SClusterClient::new(k8s_client),
                &reschedule_args.namespace,
            )
            .reschedule(&reschedule_args.excluded_nodes)
            .await
            .context(error::RescheduleSnafu)
        }
        SubCommand::Crd => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_nodes_are_split() {
        let args = Arguments::from_iter_safe([
            "quarantinectl",
            "reschedule",
            "--excludedNodes",
            "worker1,worker3",
        ])
        .unwrap();
        assert_eq!(
            args.subcommand,
            SubCommand::Reschedule(RescheduleArgs {
                excluded_nodes: vec!["worker1".to_string(), "worker3".to_string()],
                namespace: NAMESPACE.to_string(),
            })
        );
    }

    #[test]
    fn test_install_requires_image() {
        assert!(Arguments::from_iter_safe(["quarantinectl", "install"]).is_err());
        let args = Arguments::from_iter_safe([
            "quarantinectl",
            "install",
            "--image",
            "example.com/node-quarantine:v1",
        ])
        .unwrap();
        assert_eq!(
            args.subcommand,
            SubCommand::Install(InstallArgs {
                image: "example.com/node-quarantine:v1".to_string(),
                image_pull_secret: None,
            })
        );
    }
}
