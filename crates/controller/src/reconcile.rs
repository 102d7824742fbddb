//! The sync function: compare a Certificate's reported conditions against the
//! policy and delete it when a failure message is allow-listed by the trigger.

use std::sync::Arc;

use recertify_core::{ConditionAction, Policy, ResourceKey};
use recertify_ops::{CertificateOps, OpsError};
use recertify_store::LookupError;
use tracing::{debug, error, info};

use crate::informer::CertificateInformer;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No conditions reported yet; the object was probably just created.
    #[error("status of {0} not populated yet; retrying")]
    NotReady(ResourceKey),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("delete failed: {0}")]
    Delete(#[source] OpsError),
    /// The attempt panicked.
    #[error("sync of {0} panicked")]
    Panicked(ResourceKey),
}

/// What a successful attempt observed or did. Ordered by significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncOutcome {
    /// Not in cache: deleted upstream or never existed.
    Absent,
    /// Every condition is `True`.
    Healthy,
    /// Some condition is not `True` but none matched the trigger.
    Unhealthy,
    /// A matching condition was found but dry-run suppressed the delete.
    DryRun,
    Deleted,
}

pub struct Reconciler {
    policy: Arc<Policy>,
    informer: Arc<dyn CertificateInformer>,
    ops: Arc<dyn CertificateOps>,
}

impl Reconciler {
    pub fn new(policy: Arc<Policy>, informer: Arc<dyn CertificateInformer>, ops: Arc<dyn CertificateOps>) -> Self {
        Self { policy, informer, ops }
    }

    /// One reconciliation attempt for `key`.
    ///
    /// Issues at most one delete request. A failed delete does not stop the
    /// remaining conditions from being evaluated, but fails the attempt.
    pub async fn sync(&self, key: &ResourceKey) -> Result<SyncOutcome, SyncError> {
        let Some(cert) = self.informer.get(key)? else {
            info!(ns = %key.namespace, name = %key.name, "certificate not in cache; nothing to do");
            return Ok(SyncOutcome::Absent);
        };

        if cert.is_pending_status() {
            info!(ns = %key.namespace, name = %key.name, "no status conditions yet; probably just created");
            return Err(SyncError::NotReady(key.clone()));
        }

        let mut outcome = SyncOutcome::Healthy;
        let mut failure: Option<OpsError> = None;
        for cond in cert.unhealthy_conditions() {
            info!(
                ns = %key.namespace,
                name = %key.name,
                condition = %cond.type_,
                status = %cond.status,
                reason = %cond.reason,
                message = %cond.message,
                "condition not True"
            );
            match self.policy.action(cond) {
                ConditionAction::Healthy => continue,
                ConditionAction::Skip => {
                    outcome = outcome.max(SyncOutcome::Unhealthy);
                    continue;
                }
                ConditionAction::DryRun => {
                    metrics::counter!("certificate_deletes_total", 1u64, "mode" => "dry_run");
                    info!(ns = %key.namespace, name = %key.name, trigger = %self.policy.trigger(), "dry-run: would delete certificate");
                    outcome = outcome.max(SyncOutcome::DryRun);
                    continue;
                }
                ConditionAction::Delete => {}
            }
            if outcome == SyncOutcome::Deleted || failure.is_some() {
                debug!(ns = %key.namespace, name = %key.name, "delete already attempted in this pass");
                continue;
            }
            match self.ops.delete(key).await {
                Ok(result) => {
                    info!(ns = %key.namespace, name = %key.name, ?result, "deleted certificate for re-issuance");
                    outcome = SyncOutcome::Deleted;
                }
                Err(e) => {
                    error!(ns = %key.namespace, name = %key.name, error = %e, "deleting certificate failed");
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(SyncError::Delete(e)),
            None => {
                debug!(
                    ns = %key.namespace,
                    name = %key.name,
                    resource_version = cert.metadata.resource_version.as_deref().unwrap_or(""),
                    ?outcome,
                    "certificate synced"
                );
                Ok(outcome)
            }
        }
    }
}
