//! NsxClient trait for mocking
//!
//! This trait abstracts the NsxClient to enable mocking in unit tests.
//! The concrete NsxClient implements this trait, and tests can use mock implementations.

use crate::error::NsxError;
use crate::models::*;

/// Trait for NSX Policy API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait NsxClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Check credentials and connectivity
    async fn validate_connection(&self) -> Result<(), NsxError>;

    /// Fetch a policy object by path, `None` if it does not exist
    async fn get_object(&self, path: &str) -> Result<Option<PolicyObject>, NsxError>;

    /// Create or update a policy object (PATCH semantics)
    async fn patch_object(&self, path: &str, object: &PolicyObject) -> Result<(), NsxError>;

    /// Delete a policy object; deleting a missing object succeeds
    async fn delete_object(&self, path: &str) -> Result<(), NsxError>;

    /// Search objects of a resource type carrying a tag scope (and value, if given)
    async fn search_by_tag(&self, resource_type: &str, scope: &str, value: Option<&str>) -> Result<Vec<PolicyObject>, NsxError>;

    /// Realized entities behind an intent path
    async fn get_realized_entities(&self, intent_path: &str) -> Result<Vec<RealizedEntity>, NsxError>;
}
