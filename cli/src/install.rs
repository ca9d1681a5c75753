//! Creates and removes the cluster objects the controller needs.
use crate::error::{self, Result};

use models::constants::NAMESPACE;
use models::controller::{
    controller_cluster_role, controller_cluster_role_binding, controller_deployment,
    controller_service_account,
};
use models::namespace::quarantine_namespace;
use models::quarantine::Quarantine;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{CustomResourceExt, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::ResultExt;
use std::fmt::Debug;
use tracing::{event, Level};

const FIELD_MANAGER: &str = "quarantinectl";

/// Server-side applies one object, taking ownership of any conflicting fields.
async fn apply<K>(api: &Api<K>, object: &K) -> Result<()>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
    K::DynamicType: Default,
{
    let name = object.name_any();
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await
    .context(error::ApplySnafu {
        kind: K::kind(&K::DynamicType::default()).to_string(),
        name: name.clone(),
    })?;
    event!(Level::INFO, kind = %K::kind(&K::DynamicType::default()), %name, "Applied");
    Ok(())
}

/// Deletes one object. An object that is already gone counts as deleted.
async fn delete<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + Debug + DeserializeOwned,
    K::DynamicType: Default,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            event!(Level::INFO, kind = %K::kind(&K::DynamicType::default()), %name, "Deleted");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(source) => Err(source).context(error::DeleteSnafu {
            kind: K::kind(&K::DynamicType::default()).to_string(),
            name: name.to_string(),
        }),
    }
}

/// Applies the namespace, the Quarantine CRD, the controller's RBAC objects and its Deployment.
pub async fn install(
    k8s_client: kube::Client,
    image: String,
    image_pull_secret: Option<String>,
) -> Result<()> {
    apply(&Api::<Namespace>::all(k8s_client.clone()), &quarantine_namespace()).await?;
    apply(
        &Api::<CustomResourceDefinition>::all(k8s_client.clone()),
        &Quarantine::crd(),
    )
    .await?;
    apply(
        &Api::<ServiceAccount>::namespaced(k8s_client.clone(), NAMESPACE),
        &controller_service_account(),
    )
    .await?;
    apply(
        &Api::<ClusterRole>::all(k8s_client.clone()),
        &controller_cluster_role(),
    )
    .await?;
    apply(
        &Api::<ClusterRoleBinding>::all(k8s_client.clone()),
        &controller_cluster_role_binding(),
    )
    .await?;
    apply(
        &Api::<Deployment>::namespaced(k8s_client, NAMESPACE),
        &controller_deployment(image, image_pull_secret),
    )
    .await
}

/// Removes everything `install` created, in reverse order.
pub async fn uninstall(k8s_client: kube::Client) -> Result<()> {
    delete(
        &Api::<Deployment>::namespaced(k8s_client.clone(), NAMESPACE),
        &controller_deployment(String::new(), None).name_any(),
    )
    .await?;
    delete(
        &Api::<ClusterRoleBinding>::all(k8s_client.clone()),
        &controller_cluster_role_binding().name_any(),
    )
    .await?;
    delete(
        &Api::<ClusterRole>::all(k8s_client.clone()),
        &controller_cluster_role().name_any(),
    )
    .await?;
    delete(
        &Api::<ServiceAccount>::namespaced(k8s_client.clone(), NAMESPACE),
        &controller_service_account().name_any(),
    )
    .await?;
    delete(
        &Api::<CustomResourceDefinition>::all(k8s_client.clone()),
        &Quarantine::crd().name_any(),
    )
    .await?;
    delete(
        &Api::<Namespace>::all(k8s_client),
        &quarantine_namespace().name_any(),
    )
    .await
}

/// Renders the Quarantine CRD as a YAML document.
pub fn crd_yaml() -> Result<String> {
    serde_yaml::to_string(&Quarantine::crd()).context(error::RenderCrdSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_yaml() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("name: quarantines.nodequarantine.io"));
        assert!(yaml.contains("kind: Quarantine"));
        assert!(yaml.contains("- qr"));
    }
}
