use super::error::{self, Result};
use super::{Quarantine, QuarantineStatus, K8S_QUARANTINE_KIND};
use crate::constants::{API_VERSION, QUARANTINE_FINALIZER};

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use snafu::{OptionExt, ResultExt};
use tracing::instrument;

#[cfg(any(feature = "mockall", test))]
use mockall::{mock, predicate::*};

#[async_trait]
/// A trait providing an interface to read and bookkeep Quarantine objects. This is provided as a trait
/// in order to allow mocks to be used for testing purposes.
pub trait QuarantineClient: Clone + Sized + Send + Sync {
    /// Fetches the latest copy of a Quarantine. Returns `None` if it no longer exists.
    async fn get_quarantine(&self, namespace: &str, name: &str) -> Result<Option<Quarantine>>;
    /// Attaches our finalizer to the given Quarantine.
    async fn add_finalizer(&self, quarantine: &Quarantine) -> Result<()>;
    /// Removes our finalizer from the given Quarantine, allowing its deletion to complete.
    async fn remove_finalizer(&self, quarantine: &Quarantine) -> Result<()>;
    /// Replaces the `.status` of the given Quarantine.
    async fn update_status(&self, quarantine: &Quarantine, status: &QuarantineStatus)
        -> Result<()>;
}

#[cfg(any(feature = "mockall", test))]
mock! {
    /// A Mock QuarantineClient for use in tests.
    pub QuarantineClient {}
    #[async_trait]
    impl QuarantineClient for QuarantineClient {
        async fn get_quarantine(&self, namespace: &str, name: &str) -> Result<Option<Quarantine>>;
        async fn add_finalizer(&self, quarantine: &Quarantine) -> Result<()>;
        async fn remove_finalizer(&self, quarantine: &Quarantine) -> Result<()>;
        async fn update_status(&self, quarantine: &Quarantine, status: &QuarantineStatus)
            -> Result<()>;
    }

    impl Clone for QuarantineClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> QuarantineClient for std::sync::Arc<T>
where
    T: QuarantineClient,
{
    async fn get_quarantine(&self, namespace: &str, name: &str) -> Result<Option<Quarantine>> {
        (**self).get_quarantine(namespace, name).await
    }

    async fn add_finalizer(&self, quarantine: &Quarantine) -> Result<()> {
        (**self).add_finalizer(quarantine).await
    }

    async fn remove_finalizer(&self, quarantine: &Quarantine) -> Result<()> {
        (**self).remove_finalizer(quarantine).await
    }

    async fn update_status(
        &self,
        quarantine: &Quarantine,
        status: &QuarantineStatus,
    ) -> Result<()> {
        (**self).update_status(quarantine, status).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `QuarantineClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SQuarantineClient {
    k8s_client: kube::client::Client,
}

impl K8SQuarantineClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SQuarantineClient { k8s_client }
    }

    fn api(&self, quarantine: &Quarantine) -> Result<Api<Quarantine>> {
        let namespace = quarantine.namespace().context(error::MissingNamespaceSnafu)?;
        Ok(Api::namespaced(self.k8s_client.clone(), &namespace))
    }

    /// Writes the finalizer list. The patch carries the object's resourceVersion so that a stale
    /// write is rejected with a conflict instead of clobbering a concurrent change.
    async fn patch_finalizers(&self, quarantine: &Quarantine, finalizers: Vec<String>) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": quarantine.resource_version(),
                "finalizers": finalizers,
            }
        });

        self.api(quarantine)?
            .patch(
                &quarantine.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context(error::UpdateFinalizersSnafu {
                name: quarantine.request_name(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl QuarantineClient for K8SQuarantineClient {
    #[instrument(skip(self), err)]
    async fn get_quarantine(&self, namespace: &str, name: &str) -> Result<Option<Quarantine>> {
        let api: Api<Quarantine> = Api::namespaced(self.k8s_client.clone(), namespace);
        api.get_opt(name)
            .await
            .context(error::GetQuarantineSnafu {
                name: format!("{}/{}", namespace, name),
            })
    }

    #[instrument(skip(self, quarantine), fields(quarantine = %quarantine.request_name()), err)]
    async fn add_finalizer(&self, quarantine: &Quarantine) -> Result<()> {
        let mut finalizers = quarantine.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == QUARANTINE_FINALIZER) {
            finalizers.push(QUARANTINE_FINALIZER.to_string());
        }
        self.patch_finalizers(quarantine, finalizers).await
    }

    #[instrument(skip(self, quarantine), fields(quarantine = %quarantine.request_name()), err)]
    async fn remove_finalizer(&self, quarantine: &Quarantine) -> Result<()> {
        let finalizers = quarantine
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != QUARANTINE_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(quarantine, finalizers).await
    }

    #[instrument(skip(self, quarantine, status), fields(quarantine = %quarantine.request_name()), err)]
    async fn update_status(
        &self,
        quarantine: &Quarantine,
        status: &QuarantineStatus,
    ) -> Result<()> {
        let patch = json!({
            "apiVersion": API_VERSION,
            "kind": K8S_QUARANTINE_KIND,
            "metadata": {
                "resourceVersion": quarantine.resource_version(),
            },
            "status": serde_json::to_value(status).context(error::CreateK8SPatchSnafu)?,
        });

        self.api(quarantine)?
            .patch_status(
                &quarantine.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context(error::UpdateQuarantineStatusSnafu {
                name: quarantine.request_name(),
            })?;
        Ok(())
    }
}
