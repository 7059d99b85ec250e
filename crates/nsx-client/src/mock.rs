//! Mock NsxClient for unit testing
//!
//! Stores policy objects in memory keyed by path, plays back scripted
//! realization states, and counts mutating calls so tests can assert on
//! exactly which backend operations happened.

use crate::error::NsxError;
use crate::models::*;
use crate::nsx_trait::NsxClientTrait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Mock NsxClient for testing
#[derive(Clone, Default)]
pub struct MockNsxClient {
    base_url: String,
    objects: Arc<Mutex<HashMap<String, PolicyObject>>>,
    // Scripted realization results per path; the last entry repeats.
    realization: Arc<Mutex<HashMap<String, VecDeque<Vec<RealizedEntity>>>>>,
    failing_paths: Arc<Mutex<HashSet<String>>>,
    unavailable: Arc<Mutex<bool>>,
    patch_calls: Arc<Mutex<Vec<String>>>,
    delete_calls: Arc<Mutex<Vec<String>>>,
    effective_deletes: Arc<Mutex<Vec<String>>>,
    realization_polls: Arc<Mutex<u32>>,
}

impl MockNsxClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Add an object to the mock store (for test setup)
    pub fn add_object(&self, object: PolicyObject) {
        self.objects.lock().unwrap().insert(object.path.clone(), object);
    }

    /// Snapshot of a stored object
    pub fn object(&self, path: &str) -> Option<PolicyObject> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Script the realization states returned for a path, in order
    pub fn script_realization(&self, path: &str, states: Vec<Vec<RealizedEntity>>) {
        self.realization
            .lock()
            .unwrap()
            .insert(path.to_string(), states.into_iter().collect());
    }

    /// Make every mutating call on `path` fail with a 500
    pub fn fail_path(&self, path: &str) {
        self.failing_paths.lock().unwrap().insert(path.to_string());
    }

    /// Stop failing calls on `path`
    pub fn heal_path(&self, path: &str) {
        self.failing_paths.lock().unwrap().remove(path);
    }

    /// Simulate the backend being unreachable for every call
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// Paths passed to `patch_object`, in call order
    pub fn patch_calls(&self) -> Vec<String> {
        self.patch_calls.lock().unwrap().clone()
    }

    /// Paths passed to `delete_object`, in call order
    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }

    /// Deletes that actually removed an object
    pub fn effective_deletes(&self) -> Vec<String> {
        self.effective_deletes.lock().unwrap().clone()
    }

    /// Number of realization polls served
    pub fn realization_polls(&self) -> u32 {
        *self.realization_polls.lock().unwrap()
    }

    /// Total number of calls that could mutate backend state
    pub fn mutating_calls(&self) -> usize {
        self.patch_calls.lock().unwrap().len() + self.delete_calls.lock().unwrap().len()
    }

    fn check_available(&self) -> Result<(), NsxError> {
        if *self.unavailable.lock().unwrap() {
            return Err(NsxError::Api {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn check_path(&self, path: &str) -> Result<(), NsxError> {
        if self.failing_paths.lock().unwrap().contains(path) {
            return Err(NsxError::Api {
                status: 500,
                message: format!("injected failure for {}", path),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl NsxClientTrait for MockNsxClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn validate_connection(&self) -> Result<(), NsxError> {
        self.check_available()
    }

    async fn get_object(&self, path: &str) -> Result<Option<PolicyObject>, NsxError> {
        self.check_available()?;
        Ok(self.object(path))
    }

    async fn patch_object(&self, path: &str, object: &PolicyObject) -> Result<(), NsxError> {
        self.check_available()?;
        self.patch_calls.lock().unwrap().push(path.to_string());
        self.check_path(path)?;
        let mut stored = object.clone();
        stored.path = path.to_string();
        self.objects.lock().unwrap().insert(path.to_string(), stored);
        Ok(())
    }

    async fn delete_object(&self, path: &str) -> Result<(), NsxError> {
        self.check_available()?;
        self.delete_calls.lock().unwrap().push(path.to_string());
        self.check_path(path)?;
        if self.objects.lock().unwrap().remove(path).is_some() {
            self.effective_deletes.lock().unwrap().push(path.to_string());
        }
        Ok(())
    }

    async fn search_by_tag(&self, resource_type: &str, scope: &str, value: Option<&str>) -> Result<Vec<PolicyObject>, NsxError> {
        self.check_available()?;
        let objects = self.objects.lock().unwrap();
        let mut found: Vec<PolicyObject> = objects
            .values()
            .filter(|o| o.resource_type == resource_type && !o.marked_for_delete)
            .filter(|o| {
                o.tags
                    .iter()
                    .any(|t| t.scope == scope && value.is_none_or(|v| t.tag == v))
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    async fn get_realized_entities(&self, intent_path: &str) -> Result<Vec<RealizedEntity>, NsxError> {
        self.check_available()?;
        *self.realization_polls.lock().unwrap() += 1;
        let mut scripts = self.realization.lock().unwrap();
        match scripts.get_mut(intent_path) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap_or_default()),
            Some(queue) => Ok(queue.front().cloned().unwrap_or_default()),
            // Unscripted paths realize immediately
            None => Ok(vec![RealizedEntity::new("GenericPolicyRealizedResource", RealizationState::Realized)]),
        }
    }
}
