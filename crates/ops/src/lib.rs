//! recertify ops: the remote API surface the controller acts through.
//!
//! The controller only ever reads and deletes Certificates; creation is left to
//! cert-manager, which re-issues a deleted Certificate from its owner.

#![forbid(unsafe_code)]

use kube::{
    api::{Api, DeleteParams},
    Client,
};
use recertify_core::ResourceKey;
use recertify_kubehub::Certificate;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("certificate {0} not found")]
    NotFound(ResourceKey),
    #[error("api request for {key} failed: {source}")]
    Api {
        key: ResourceKey,
        #[source]
        source: kube::Error,
    },
}

impl OpsError {
    fn from_kube(key: &ResourceKey, e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => OpsError::NotFound(key.clone()),
            source => OpsError::Api { key: key.clone(), source },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The API server accepted the delete (possibly still finalizing).
    Deleted,
    /// The object was already gone.
    AlreadyGone,
}

/// Remote Certificate operations. Implemented against kube-rs in production and
/// by in-memory fakes in tests.
#[async_trait::async_trait]
pub trait CertificateOps: Send + Sync {
    /// Fetch the live object, bypassing any cache.
    async fn get(&self, key: &ResourceKey) -> Result<Certificate, OpsError>;

    /// Delete the object so its issuer recreates it.
    async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome, OpsError>;
}

/// Default implementation using kube-rs client APIs.
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ResourceKey) -> Api<Certificate> {
        if key.namespace.is_empty() {
            Api::default_namespaced(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &key.namespace)
        }
    }
}

#[async_trait::async_trait]
impl CertificateOps for KubeOps {
    async fn get(&self, key: &ResourceKey) -> Result<Certificate, OpsError> {
        self.api(key).get(&key.name).await.map_err(|e| OpsError::from_kube(key, e))
    }

    async fn delete(&self, key: &ResourceKey) -> Result<DeleteOutcome, OpsError> {
        match self.api(key).delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {
                metrics::counter!("certificate_deletes_total", 1u64, "mode" => "live");
                info!(ns = %key.namespace, name = %key.name, "certificate deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) => match OpsError::from_kube(key, e) {
                OpsError::NotFound(_) => {
                    debug!(ns = %key.namespace, name = %key.name, "certificate already gone");
                    Ok(DeleteOutcome::AlreadyGone)
                }
                other => Err(other),
            },
        }
    }
}
