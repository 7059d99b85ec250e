//! Generic reconciler.
//!
//! One `GenericReconciler` per managed kind. A reconcile is keyed by
//! namespace/name and always resyncs the whole object: it asks the network
//! mode gate whether the namespace is in scope, fetches the CR and then
//! takes one of three paths.
//!
//! - CR gone: delete the backend object by the identity kept in the store.
//! - CR being deleted: delete the backend object, then drop the finalizer.
//! - Otherwise: ensure the finalizer, create or update the backend object,
//!   and record the outcome on the CR status.
//!
//! Backend work is bounded by a timeout and by the caller's cancellation
//! token. A cancelled or timed-out reconcile is requeued, never reported as
//! a success.

use crate::backoff::BackoffTracker;
use crate::error::{ControllerError, RetryClass};
use crate::network_mode::NetworkModeGate;
use crate::resource::{finalizer_name, has_finalizer, CrApi, ManagedResource, ObjectKey};
use crate::services::{CrIdentity, ResourceService};
use crate::status::{ready_conditions, ConditionBuilder, StatusUpdater};
use crate::store::ResourceStore;
use chrono::Utc;
use crds::merge_conditions;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged, wait for the next change
    Normal,
    /// Try again after a backoff of the given class
    Requeue(RetryClass),
}

/// Keyed async mutex: one in-flight reconcile per key
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<ObjectKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &ObjectKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// The per-kind reconcile state machine
pub struct GenericReconciler<K: ManagedResource> {
    api: Arc<dyn CrApi<K>>,
    service: Arc<dyn ResourceService<K>>,
    store: Arc<ResourceStore>,
    gate: Arc<NetworkModeGate>,
    status: Arc<dyn StatusUpdater<K>>,
    conditions: ConditionBuilder<K>,
    key_locks: KeyLocks,
    backoff: BackoffTracker,
    timeout: Duration,
}

impl<K: ManagedResource> std::fmt::Debug for GenericReconciler<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericReconciler")
            .field("resource_type", &K::RESOURCE_TYPE)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<K: ManagedResource> GenericReconciler<K> {
    pub fn new(
        api: Arc<dyn CrApi<K>>,
        service: Arc<dyn ResourceService<K>>,
        store: Arc<ResourceStore>,
        gate: Arc<NetworkModeGate>,
        status: Arc<dyn StatusUpdater<K>>,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            service,
            store,
            gate,
            status,
            conditions: ready_conditions::<K>,
            key_locks: KeyLocks::new(),
            backoff: BackoffTracker::new(),
            timeout,
        }
    }

    /// Replace the default Ready condition builder
    pub fn with_conditions(mut self, conditions: ConditionBuilder<K>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Reconcile one key
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        self.status.increase_sync_total();
        debug!("Reconciling {} {}", K::RESOURCE_TYPE, key);
        self.gate
            .reconcile_with_filters(K::RESOURCE_TYPE, key, || self.reconcile_enabled(key, cancel))
            .await
    }

    /// Requeue delay for an outcome; resets the key's backoff on `Normal`
    pub fn requeue_after(&self, key: &ObjectKey, outcome: ReconcileOutcome) -> Option<Duration> {
        match outcome {
            ReconcileOutcome::Normal => {
                self.backoff.reset(key);
                None
            }
            ReconcileOutcome::Requeue(class) => Some(self.backoff.next(key, class)),
        }
    }

    async fn reconcile_enabled(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let _guard = self.key_locks.lock(key).await;

        let Some(obj) = self.api.get(key).await? else {
            return Ok(self.delete_by_key(key, cancel).await);
        };
        if obj.meta().deletion_timestamp.is_some() {
            return self.finalize(key, obj, cancel).await;
        }
        self.apply(key, obj, cancel).await
    }

    // Run backend work under the reconcile deadline and cancellation token
    async fn bounded<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, ControllerError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(ControllerError::Cancelled),
            res = tokio::time::timeout(self.timeout, work) => {
                res.unwrap_or_else(|_| Err(ControllerError::Timeout(self.timeout.as_secs())))
            }
        }
    }

    async fn delete_by_key(&self, key: &ObjectKey, cancel: &CancellationToken) -> ReconcileOutcome {
        let Some(entry) = self.store.lookup_by_key(K::RESOURCE_TYPE, key) else {
            debug!("{} {} not found and not tracked, nothing to delete", K::RESOURCE_TYPE, key);
            return ReconcileOutcome::Normal;
        };

        self.status.increase_delete_total();
        let identity = CrIdentity::from_entry(&entry);
        info!("{} {} is gone, deleting backend object {}", K::RESOURCE_TYPE, key, entry.backend_path);
        match self.bounded(cancel, self.service.delete(&identity)).await {
            Ok(()) => {
                self.status.delete_success(key, None).await;
                ReconcileOutcome::Normal
            }
            Err(ControllerError::Cancelled) => ReconcileOutcome::Requeue(RetryClass::Transient),
            Err(e) => {
                warn!("Failed to delete backend object of {} {}: {}", K::RESOURCE_TYPE, key, e);
                self.status.delete_fail(key, None, &e).await;
                ReconcileOutcome::Requeue(e.retry_class())
            }
        }
    }

    async fn finalize(
        &self,
        key: &ObjectKey,
        obj: K,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let finalizer = finalizer_name::<K>();
        if !has_finalizer(&obj, &finalizer) {
            debug!("{} {} is being deleted without our finalizer", K::RESOURCE_TYPE, key);
            return Ok(ReconcileOutcome::Normal);
        }

        self.status.increase_delete_total();
        let identity = CrIdentity::from_resource(&obj)?;
        match self.bounded(cancel, self.service.delete(&identity)).await {
            Ok(()) => {
                self.api.remove_finalizer(&obj, &finalizer).await?;
                info!("Deleted {} {}", K::RESOURCE_TYPE, key);
                self.status.delete_success(key, Some(&obj)).await;
                Ok(ReconcileOutcome::Normal)
            }
            Err(ControllerError::Cancelled) => Ok(ReconcileOutcome::Requeue(RetryClass::Transient)),
            Err(e) => {
                warn!("Failed to delete {} {}: {}", K::RESOURCE_TYPE, key, e);
                self.status.delete_fail(key, Some(&obj), &e).await;
                Ok(ReconcileOutcome::Requeue(e.retry_class()))
            }
        }
    }

    async fn apply(
        &self,
        key: &ObjectKey,
        mut obj: K,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        self.status.increase_update_total();

        let finalizer = finalizer_name::<K>();
        if !has_finalizer(&obj, &finalizer) {
            self.api.add_finalizer(&obj, &finalizer).await?;
        }

        match self.bounded(cancel, self.service.create_or_update(&mut obj)).await {
            Ok(changed) => {
                if !changed && !self.conditions_stale(&obj) {
                    debug!("{} {} unchanged, skipping status update", K::RESOURCE_TYPE, key);
                    return Ok(ReconcileOutcome::Normal);
                }
                info!("Created or updated {} {}", K::RESOURCE_TYPE, key);
                self.status.update_success(&mut obj, self.conditions).await;
                Ok(ReconcileOutcome::Normal)
            }
            Err(ControllerError::Cancelled) => {
                info!("Reconcile of {} {} cancelled", K::RESOURCE_TYPE, key);
                Ok(ReconcileOutcome::Requeue(RetryClass::Transient))
            }
            Err(e) => {
                warn!("Failed to create or update {} {}: {}", K::RESOURCE_TYPE, key, e);
                self.status.update_fail(&mut obj, &e, self.conditions).await;
                Ok(ReconcileOutcome::Requeue(e.retry_class()))
            }
        }
    }

    // True if writing success conditions would change what the CR shows
    fn conditions_stale(&self, obj: &K) -> bool {
        let mut current = obj.conditions().to_vec();
        merge_conditions(&mut current, (self.conditions)(obj, Utc::now(), None))
    }
}
