//! Status updater.
//!
//! Records the outcome of a reconciliation on the CR: merges the conditions
//! built by the kind-specific builder into `status.conditions`, persists the
//! status sub-resource, publishes an Event and bumps the matching counter.
//!
//! Events are fire-and-forget. A failed Event or status write is logged and
//! never turns a successful backend operation into a failure.

use crate::error::ControllerError;
use crate::metrics::{ControllerCounter, Metrics};
use crate::resource::{CrApi, ManagedResource, ObjectKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crds::{merge_conditions, Condition};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::{Client, Resource};
use std::sync::Arc;
use tracing::{debug, warn};

/// Event reasons
pub mod reasons {
    pub const SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
    pub const FAIL_UPDATE: &str = "FailUpdate";
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    pub const FAIL_DELETE: &str = "FailDelete";
}

/// Builds the conditions describing an outcome. Pure: same inputs, same output.
pub type ConditionBuilder<K> = fn(&K, DateTime<Utc>, Option<&ControllerError>) -> Vec<Condition>;

/// Default builder: Ready=True on success, Ready=False with the error otherwise
pub fn ready_conditions<K: ManagedResource>(
    _obj: &K,
    now: DateTime<Utc>,
    err: Option<&ControllerError>,
) -> Vec<Condition> {
    let kind = K::kind(&());
    match err {
        None => vec![Condition::ready(
            "Realized",
            format!("{} has been successfully created/updated", kind),
            now,
        )],
        Some(e) => vec![Condition::not_ready(
            e.reason(),
            format!("Failed to create or update {}: {}", kind, e),
            now,
        )],
    }
}

/// Publishes Kubernetes Events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: String);
}

/// `EventSink` backed by `kube::runtime::events::Recorder`
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, reference: &ObjectReference, type_: EventType, reason: &str, note: String) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!("Failed to publish {} event: {}", reason, e);
        }
    }
}

/// Records reconciliation outcomes on CRs of one kind
#[async_trait]
pub trait StatusUpdater<K: ManagedResource>: Send + Sync {
    fn increase_sync_total(&self);
    fn increase_update_total(&self);
    fn increase_delete_total(&self);

    /// Create-or-update succeeded
    async fn update_success(&self, obj: &mut K, build: ConditionBuilder<K>);

    /// Create-or-update failed
    async fn update_fail(&self, obj: &mut K, err: &ControllerError, build: ConditionBuilder<K>);

    /// Backend object deleted; `obj` is `None` when the CR is already gone
    async fn delete_success(&self, key: &ObjectKey, obj: Option<&K>);

    async fn delete_fail(&self, key: &ObjectKey, obj: Option<&K>, err: &ControllerError);
}

/// `StatusUpdater` writing through a `CrApi`
pub struct CrStatusUpdater<K> {
    api: Arc<dyn CrApi<K>>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl<K: ManagedResource> CrStatusUpdater<K> {
    pub fn new(api: Arc<dyn CrApi<K>>, events: Arc<dyn EventSink>, metrics: Arc<Metrics>) -> Self {
        Self { api, events, metrics }
    }

    fn reference(key: &ObjectKey, obj: Option<&K>) -> ObjectReference {
        match obj {
            Some(obj) => obj.object_ref(&()),
            None => ObjectReference {
                api_version: Some(K::api_version(&()).into_owned()),
                kind: Some(K::kind(&()).into_owned()),
                namespace: Some(key.namespace.clone()),
                name: Some(key.name.clone()),
                ..Default::default()
            },
        }
    }

    // Merge and persist; returns true if a write happened
    async fn apply(&self, obj: &mut K, updates: Vec<Condition>, always_write: bool) -> bool {
        let changed = merge_conditions(obj.conditions_mut(), updates);
        if !changed && !always_write {
            debug!(
                "Conditions of {} {} unchanged, skipping status write",
                K::RESOURCE_TYPE,
                obj.meta().name.as_deref().unwrap_or_default()
            );
            return false;
        }
        if let Err(e) = self.api.update_status(obj).await {
            warn!(
                "Failed to update status of {} {}: {}",
                K::RESOURCE_TYPE,
                obj.meta().name.as_deref().unwrap_or_default(),
                e
            );
            return false;
        }
        true
    }
}

#[async_trait]
impl<K: ManagedResource> StatusUpdater<K> for CrStatusUpdater<K> {
    fn increase_sync_total(&self) {
        self.metrics.inc(ControllerCounter::Sync, K::RESOURCE_TYPE);
    }

    fn increase_update_total(&self) {
        self.metrics.inc(ControllerCounter::Update, K::RESOURCE_TYPE);
    }

    fn increase_delete_total(&self) {
        self.metrics.inc(ControllerCounter::Delete, K::RESOURCE_TYPE);
    }

    async fn update_success(&self, obj: &mut K, build: ConditionBuilder<K>) {
        let updates = build(obj, Utc::now(), None);
        // Kind-specific status fields may have changed even when conditions did not
        self.apply(obj, updates, true).await;
        self.events
            .publish(
                &obj.object_ref(&()),
                EventType::Normal,
                reasons::SUCCESSFUL_UPDATE,
                format!("{} has been successfully created/updated", K::kind(&())),
            )
            .await;
        self.metrics.inc(ControllerCounter::UpdateSuccess, K::RESOURCE_TYPE);
    }

    async fn update_fail(&self, obj: &mut K, err: &ControllerError, build: ConditionBuilder<K>) {
        let updates = build(obj, Utc::now(), Some(err));
        self.apply(obj, updates, false).await;
        self.events
            .publish(
                &obj.object_ref(&()),
                EventType::Warning,
                reasons::FAIL_UPDATE,
                err.to_string(),
            )
            .await;
        self.metrics.inc(ControllerCounter::UpdateFail, K::RESOURCE_TYPE);
    }

    async fn delete_success(&self, key: &ObjectKey, obj: Option<&K>) {
        self.events
            .publish(
                &Self::reference(key, obj),
                EventType::Normal,
                reasons::SUCCESSFUL_DELETE,
                format!("{} has been successfully deleted", K::kind(&())),
            )
            .await;
        self.metrics.inc(ControllerCounter::DeleteSuccess, K::RESOURCE_TYPE);
    }

    async fn delete_fail(&self, key: &ObjectKey, obj: Option<&K>, err: &ControllerError) {
        self.events
            .publish(
                &Self::reference(key, obj),
                EventType::Warning,
                reasons::FAIL_DELETE,
                err.to_string(),
            )
            .await;
        self.metrics.inc(ControllerCounter::DeleteFail, K::RESOURCE_TYPE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_ip_allocation, FakeCrApi, FakeEventSink};
    use crds::{find_condition, ConditionStatus, ConditionedResource, IPAddressAllocation, CONDITION_READY};

    fn updater(api: &Arc<FakeCrApi<IPAddressAllocation>>, events: &Arc<FakeEventSink>, metrics: &Arc<Metrics>) -> CrStatusUpdater<IPAddressAllocation> {
        CrStatusUpdater::new(
            Arc::clone(api) as Arc<dyn CrApi<IPAddressAllocation>>,
            Arc::clone(events) as Arc<dyn EventSink>,
            Arc::clone(metrics),
        )
    }

    #[tokio::test]
    async fn test_update_success_twice_keeps_single_ready_condition() {
        let api = Arc::new(FakeCrApi::new());
        let events = Arc::new(FakeEventSink::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let updater = updater(&api, &events, &metrics);

        let mut alloc = create_test_ip_allocation("ns-1", "alloc", "uid-1");
        api.insert(alloc.clone());

        updater.update_success(&mut alloc, ready_conditions::<IPAddressAllocation>).await;
        let first_time = find_condition(alloc.conditions(), CONDITION_READY)
            .unwrap()
            .last_transition_time;
        updater.update_success(&mut alloc, ready_conditions::<IPAddressAllocation>).await;

        let ready: Vec<_> = alloc.conditions().iter().filter(|c| c.type_ == CONDITION_READY).collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].status, ConditionStatus::True);
        assert_eq!(ready[0].last_transition_time, first_time);

        let stored = api.stored(&ObjectKey::new("ns-1", "alloc")).unwrap();
        assert_eq!(stored.conditions().len(), 1);
        assert_eq!(events.reasons(), vec![reasons::SUCCESSFUL_UPDATE, reasons::SUCCESSFUL_UPDATE]);
        assert_eq!(metrics.get(ControllerCounter::UpdateSuccess, "ipaddressallocation"), 2);
    }

    #[tokio::test]
    async fn test_update_fail_replaces_ready_condition() {
        let api = Arc::new(FakeCrApi::new());
        let events = Arc::new(FakeEventSink::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let updater = updater(&api, &events, &metrics);

        let mut alloc = create_test_ip_allocation("ns-1", "alloc", "uid-1");
        api.insert(alloc.clone());
        updater.update_success(&mut alloc, ready_conditions::<IPAddressAllocation>).await;

        let err = ControllerError::Timeout(30);
        updater.update_fail(&mut alloc, &err, ready_conditions::<IPAddressAllocation>).await;
        let writes_after_first_fail = api.status_writes();
        updater.update_fail(&mut alloc, &err, ready_conditions::<IPAddressAllocation>).await;

        assert_eq!(alloc.conditions().len(), 1);
        let ready = find_condition(alloc.conditions(), CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("Timeout"));
        // Identical failure does not rewrite status
        assert_eq!(api.status_writes(), writes_after_first_fail);
        assert_eq!(metrics.get(ControllerCounter::UpdateFail, "ipaddressallocation"), 2);
        assert_eq!(events.reasons().last().map(String::as_str), Some(reasons::FAIL_UPDATE));
    }

    #[tokio::test]
    async fn test_delete_events_without_object() {
        let api = Arc::new(FakeCrApi::<IPAddressAllocation>::new());
        let events = Arc::new(FakeEventSink::default());
        let metrics = Arc::new(Metrics::new().unwrap());
        let updater = updater(&api, &events, &metrics);

        let key = ObjectKey::new("ns-1", "gone");
        updater.delete_success(&key, None).await;
        updater.delete_fail(&key, None, &ControllerError::Cancelled).await;

        let published = events.published();
        assert_eq!(published[0].0.name.as_deref(), Some("gone"));
        assert_eq!(published[0].0.kind.as_deref(), Some("IPAddressAllocation"));
        assert_eq!(events.reasons(), vec![reasons::SUCCESSFUL_DELETE, reasons::FAIL_DELETE]);
        assert_eq!(metrics.get(ControllerCounter::DeleteSuccess, "ipaddressallocation"), 1);
        assert_eq!(metrics.get(ControllerCounter::DeleteFail, "ipaddressallocation"), 1);
        assert_eq!(api.status_writes(), 0);
    }
}
