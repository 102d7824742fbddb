//! recertify core types
//!
//! Identity, snapshot and policy types shared by the cache, the work queue and
//! the controller. Nothing in here performs I/O.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Errors produced while deriving a [`ResourceKey`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?} (expect namespace/name or name)")]
    Malformed(String),
}

/// Identity of one managed object: `(namespace, name)`.
///
/// Cluster-scoped objects carry an empty namespace and render as `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Extract the key from a raw object's `metadata`.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, KeyError> {
        let meta = raw.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(KeyError::MissingName)?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("");
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

/// Status of a single condition as reported by the issuer.
///
/// Anything other than `"True"` or `"False"` decodes as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<String> for ConditionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }
}

impl From<ConditionStatus> for String {
    fn from(s: ConditionStatus) -> Self {
        s.to_string()
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl StatusCondition {
    pub fn is_healthy(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    /// `None` until the issuer has written status at least once.
    #[serde(default)]
    pub conditions: Option<Vec<StatusCondition>>,
}

/// Point-in-time view of one certificate as last observed in the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateSnapshot {
    #[serde(default)]
    pub metadata: SnapshotMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: Option<SnapshotStatus>,
}

impl CertificateSnapshot {
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(raw)
    }

    /// Conditions in reported order; empty when status is absent.
    pub fn conditions(&self) -> &[StatusCondition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or(&[])
    }

    /// True when the issuer has not reported any condition yet.
    pub fn is_pending_status(&self) -> bool {
        self.conditions().is_empty()
    }

    pub fn unhealthy_conditions(&self) -> impl Iterator<Item = &StatusCondition> {
        self.conditions().iter().filter(|c| !c.is_healthy())
    }
}

/// Operator policy shared by all workers. Immutable after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    trigger: String,
    dry_run: bool,
}

impl Policy {
    pub fn new(trigger: impl Into<String>, dry_run: bool) -> Self {
        Self { trigger: trigger.into(), dry_run }
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// An empty trigger matches nothing.
    pub fn matches(&self, message: &str) -> bool {
        !self.trigger.is_empty() && message.contains(self.trigger.as_str())
    }

    /// What to do about one condition.
    pub fn action(&self, condition: &StatusCondition) -> ConditionAction {
        if condition.is_healthy() {
            ConditionAction::Healthy
        } else if !self.matches(&condition.message) {
            ConditionAction::Skip
        } else if self.dry_run {
            ConditionAction::DryRun
        } else {
            ConditionAction::Delete
        }
    }
}

/// Verdict of a [`Policy`] for a single status condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionAction {
    Healthy,
    /// Unhealthy, but the message is not allow-listed by the trigger.
    Skip,
    /// Allow-listed, but deletes are suppressed.
    DryRun,
    Delete,
}

// ---- watch feed and cache notifications ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One change observed on the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub key: ResourceKey,
    pub kind: DeltaKind,
    /// Raw object with `metadata.managedFields` stripped.
    pub raw: serde_json::Value,
}

impl Delta {
    pub fn applied(raw: serde_json::Value) -> Result<Self, KeyError> {
        Ok(Self { key: ResourceKey::from_raw(&raw)?, kind: DeltaKind::Applied, raw })
    }

    pub fn deleted(raw: serde_json::Value) -> Result<Self, KeyError> {
        Ok(Self { key: ResourceKey::from_raw(&raw)?, kind: DeltaKind::Deleted, raw })
    }
}

/// Message from the watch producer into the cache.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Delta(Delta),
    /// Full list after a (re)start of the watch. Replaces the cache contents.
    Relisted(Vec<Delta>),
}

/// An object as held by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    pub key: ResourceKey,
    pub raw: serde_json::Value,
}

impl CachedObject {
    pub fn resource_version(&self) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str())
    }

    pub fn snapshot(&self) -> Result<CertificateSnapshot, serde_json::Error> {
        CertificateSnapshot::from_raw(&self.raw)
    }
}

impl From<Delta> for CachedObject {
    fn from(d: Delta) -> Self {
        Self { key: d.key, raw: d.raw }
    }
}

/// Notification delivered to cache subscribers after the cache has changed.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Added(Arc<CachedObject>),
    Updated { old: Arc<CachedObject>, new: Arc<CachedObject> },
    Deleted(Arc<CachedObject>),
}

impl CacheEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Added(_) => "added",
            CacheEvent::Updated { .. } => "updated",
            CacheEvent::Deleted(_) => "deleted",
        }
    }
}
