//! Garbage collector.
//!
//! Periodically compares the CR UIDs a service tracks backend objects for
//! with the UIDs of live CRs and deletes the backend objects of the rest.
//! The tracked set is read before the live list, so an object created
//! between the two reads is never considered an orphan.
//!
//! One orphan failing to delete does not stop the others; failures are
//! aggregated into one error and the next tick retries them.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::resource::{CrApi, ManagedResource};
use crate::services::{CrIdentity, ResourceService};
use crate::store::ResourceStore;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from one collection pass over one kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub tracked: usize,
    pub live: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// A kind the collector can clean up
#[async_trait]
pub trait GcTarget: Send + Sync {
    fn resource_type(&self) -> &'static str;

    /// One pass; `Err` aggregates every orphan that failed to delete
    async fn collect_garbage(&self) -> Result<GcReport, ControllerError>;
}

/// `GcTarget` for one managed kind
pub struct ResourceGc<K> {
    api: Arc<dyn CrApi<K>>,
    service: Arc<dyn ResourceService<K>>,
    store: Arc<ResourceStore>,
    metrics: Arc<Metrics>,
}

impl<K: ManagedResource> ResourceGc<K> {
    pub fn new(
        api: Arc<dyn CrApi<K>>,
        service: Arc<dyn ResourceService<K>>,
        store: Arc<ResourceStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            service,
            store,
            metrics,
        }
    }
}

#[async_trait]
impl<K: ManagedResource> GcTarget for ResourceGc<K> {
    fn resource_type(&self) -> &'static str {
        K::RESOURCE_TYPE
    }

    async fn collect_garbage(&self) -> Result<GcReport, ControllerError> {
        let tracked = self.service.list_tracked_ids();
        if tracked.is_empty() {
            debug!("GC {}: nothing tracked", K::RESOURCE_TYPE);
            return Ok(GcReport::default());
        }

        let live: BTreeSet<String> = self
            .api
            .list()
            .await?
            .iter()
            .filter_map(|obj| obj.meta().uid.clone())
            .collect();

        let mut report = GcReport {
            tracked: tracked.len(),
            live: live.len(),
            ..Default::default()
        };
        let mut errors = Vec::new();
        for uid in tracked.difference(&live) {
            let Some(entry) = self.store.lookup(uid) else {
                // Deleted by a reconcile since the snapshot
                continue;
            };
            let identity = CrIdentity::from_entry(&entry);
            info!("GC {}: deleting orphaned backend object {} of {}", K::RESOURCE_TYPE, entry.backend_path, identity.key);
            match self.service.delete(&identity).await {
                Ok(()) => {
                    self.metrics.inc_gc_deleted(K::RESOURCE_TYPE);
                    report.deleted.push(uid.clone());
                }
                Err(e) => {
                    warn!("GC {}: failed to delete orphan {}: {}", K::RESOURCE_TYPE, uid, e);
                    errors.push(format!("{}: {}", uid, e));
                    report.failed.push(uid.clone());
                }
            }
        }

        info!(
            "GC {}: tracked={} live={} deleted={} failed={}",
            K::RESOURCE_TYPE,
            report.tracked,
            report.live,
            report.deleted.len(),
            report.failed.len()
        );
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(ControllerError::GarbageCollection(format!(
                "{} orphan(s) of {} not deleted: {}",
                errors.len(),
                K::RESOURCE_TYPE,
                errors.join("; ")
            )))
        }
    }
}

// Clears the single-flight flag when a pass ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodic, single-flight collector over all registered kinds
pub struct GarbageCollector {
    targets: Vec<Arc<dyn GcTarget>>,
    interval: Duration,
    running: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("targets", &self.targets.iter().map(|t| t.resource_type()).collect::<Vec<_>>())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl GarbageCollector {
    pub fn new(targets: Vec<Arc<dyn GcTarget>>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            targets,
            interval,
            running: AtomicBool::new(false),
            cancel,
            task: Mutex::new(None),
        }
    }

    /// One pass over every target. Returns `Ok(false)` without doing
    /// anything when another pass is already running.
    pub async fn collect_once(&self) -> Result<bool, ControllerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("GC pass already running, skipping");
            return Ok(false);
        }
        let _guard = RunningGuard(&self.running);

        let mut errors = Vec::new();
        for target in &self.targets {
            if let Err(e) = target.collect_garbage().await {
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(true)
        } else {
            Err(ControllerError::GarbageCollection(errors.join("; ")))
        }
    }

    /// Run `collect_once` every interval until `stop` or the token fires
    pub fn start(self: &Arc<Self>) {
        let gc = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("Starting garbage collector, interval {:?}", gc.interval);
            let mut ticker = tokio::time::interval(gc.interval);
            // The first tick fires immediately; rehydration already ran
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = gc.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = gc.collect_once().await {
                            error!("Garbage collection failed: {}", e);
                        }
                    }
                }
            }
            info!("Garbage collector stopped");
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the periodic task and wait for it to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Garbage collector task ended abnormally: {}", e);
            }
        }
    }
}
