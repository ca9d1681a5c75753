/// Helper macro to avoid retyping the base domain-like name of our system when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name of
/// the system. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! quarantine_domain {
    () => {
        "nodequarantine.io"
    };
    ($s:literal) => {
        concat!(quarantine_domain!(), "/", $s)
    };
}

pub const API_GROUP: &str = quarantine_domain!();
pub const API_VERSION: &str = quarantine_domain!("v1alpha1");
pub const NAMESPACE: &str = "node-quarantine";
pub const QUARANTINE: &str = "node-quarantine";

// Label keys
pub const LABEL_COMPONENT: &str = quarantine_domain!("component");

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_COMPONENT: &str = "app.kubernetes.io/component";
pub const APP_PART_OF: &str = "app.kubernetes.io/part-of";
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

// controller constants
pub const CONTROLLER: &str = "controller";
pub const CONTROLLER_DEPLOYMENT_NAME: &str = "node-quarantine-controller";
pub const CONTROLLER_METRICS_PORT: u16 = 8080;
pub const QUARANTINE_FINALIZER: &str = quarantine_domain!("finalizer");

// apiserver constants
pub const APISERVER_INTERNAL_PORT: u16 = 8443;
pub const APISERVER_HEALTH_CHECK_ROUTE: &str = "/ping";
pub const APISERVER_VALIDATE_ROUTE: &str = "/validate";
pub const APISERVER_MUTATE_ROUTE: &str = "/mutate";

// Sentinel label for preserved pods, prefix for their orphaned label keys, and the node taint.
pub const QUARANTINE_LABEL_KEY: &str = "quarantine";
pub const QUARANTINE_LABEL_VALUE: &str = "true";
pub const QUARANTINED_LABEL_PREFIX: &str = "quarantined-";
pub const QUARANTINE_TAINT_KEY: &str = quarantine_domain!("quarantine");
pub const QUARANTINE_TAINT_VALUE: &str = "true";
pub const QUARANTINE_TAINT_EFFECT: &str = "NoSchedule";

// Debug pods
pub const DEBUG_POD_PREFIX: &str = "quarantine-debug-";
pub const DEBUG_LABEL_KEY: &str = quarantine_domain!("debug");
pub const DEBUG_HOST_MOUNT_PATH: &str = "/host";
pub const DEFAULT_DEBUG_IMAGE: &str = "busybox:stable";
pub const DEFAULT_DEBUG_NAMESPACE: &str = "default";

// Nodes carrying this label are eligible to run the controller after a self-reschedule.
pub const CONTROLLER_ELIGIBLE_LABEL: &str = quarantine_domain!("controller-eligible");
pub const CONTROLLER_ELIGIBLE_VALUE: &str = "true";
