use crate::constants::{APP_MANAGED_BY, APP_PART_OF, NAMESPACE, QUARANTINE};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use maplit::btreemap;

/// Defines the namespace the controller is installed into.
pub fn quarantine_namespace() -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            labels: Some(btreemap! {
                "name".to_string() => NAMESPACE.to_string(),
                APP_MANAGED_BY.to_string() => QUARANTINE.to_string(),
                APP_PART_OF.to_string() => QUARANTINE.to_string(),
            }),
            name: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: None,
        status: None,
    }
}
