use crate::error::{self, Result};
use models::constants::CONTROLLER_METRICS_PORT;

use snafu::{OptionExt, ResultExt};
use std::env;
use std::time::Duration;

const POD_NAMESPACE_ENV_VAR: &str = "POD_NAMESPACE";
const METRICS_PORT_ENV_VAR: &str = "METRICS_PORT";
const RESYNC_INTERVAL_ENV_VAR: &str = "QUARANTINE_RESYNC_INTERVAL_SECS";
const NODE_TIMEOUT_ENV_VAR: &str = "QUARANTINE_NODE_TIMEOUT_SECS";
const KUBERNETES_SERVICE_HOST_ENV_VAR: &str = "KUBERNETES_SERVICE_HOST";

const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Controller configuration, resolved once at startup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControllerSettings {
    pub namespace: String,
    pub metrics_port: u16,
    pub resync_interval: Duration,
    pub node_timeout: Duration,
    /// `0.0.0.0` or `[::]`, following the address family of the cluster's API service.
    pub bind_address: &'static str,
}

impl ControllerSettings {
    /// Reads settings from the process environment. `default_namespace` is used when `POD_NAMESPACE` is unset,
    /// typically the namespace of the in-cluster config.
    pub fn from_environment(default_namespace: &str) -> Result<Self> {
        Self::from_lookup(default_namespace, |name| env::var(name).ok())
    }

    pub fn from_lookup<F>(default_namespace: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |name: &'static str| -> Result<Option<u64>> {
            lookup(name)
                .map(|value| {
                    value
                        .parse()
                        .context(error::InvalidSettingSnafu { name, value: value.clone() })
                })
                .transpose()
        };

        let metrics_port = match lookup(METRICS_PORT_ENV_VAR) {
            Some(value) => value.parse().context(error::InvalidSettingSnafu {
                name: METRICS_PORT_ENV_VAR,
                value: value.clone(),
            })?,
            None => CONTROLLER_METRICS_PORT,
        };

        let k8s_service_addr = lookup(KUBERNETES_SERVICE_HOST_ENV_VAR).context(
            error::MissingSettingSnafu {
                name: KUBERNETES_SERVICE_HOST_ENV_VAR,
            },
        )?;

        Ok(ControllerSettings {
            namespace: lookup(POD_NAMESPACE_ENV_VAR)
                .unwrap_or_else(|| default_namespace.to_string()),
            metrics_port,
            resync_interval: parse(RESYNC_INTERVAL_ENV_VAR)?
                .map_or(DEFAULT_RESYNC_INTERVAL, Duration::from_secs),
            node_timeout: parse(NODE_TIMEOUT_ENV_VAR)?
                .map_or(DEFAULT_NODE_TIMEOUT, Duration::from_secs),
            bind_address: bind_address_for(&k8s_service_addr),
        })
    }
}

pub fn bind_address_for(k8s_service_addr: &str) -> &'static str {
    if k8s_service_addr.contains(':') {
        // IPv6 format
        "[::]"
    } else {
        // IPv4 format
        "0.0.0.0"
    }
}
