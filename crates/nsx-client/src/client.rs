//! NSX Policy API client
//!
//! Implements `NsxClientTrait` against the NSX Manager REST API
//! (`/policy/api/v1/...`). Object paths are the policy intent paths
//! (e.g. `/orgs/default/projects/default/vpcs/ns-1/subnets/web_1a2b`).

use crate::common::HttpClient;
use crate::error::NsxError;
use crate::models::*;
use crate::nsx_trait::NsxClientTrait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// NSX Policy API client
pub struct NsxClient {
    http: HttpClient,
}

impl NsxClient {
    /// Create a new NSX client
    ///
    /// # Arguments
    /// * `base_url` - NSX Manager URL (e.g., "https://nsx-manager:443")
    /// * `username` / `password` - basic auth credentials
    /// * `insecure` - skip TLS certificate verification
    pub fn new(base_url: String, username: String, password: String, insecure: bool) -> Result<Self, NsxError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            http: HttpClient::new(client, base_url, username, password),
        })
    }
}

#[async_trait::async_trait]
impl NsxClientTrait for NsxClient {
    fn base_url(&self) -> &str {
        self.http.base_url()
    }

    async fn validate_connection(&self) -> Result<(), NsxError> {
        debug!("Validating NSX credentials and connectivity");
        let _: serde_json::Value = self.http.get("/api/v1/node/version").await?;
        Ok(())
    }

    async fn get_object(&self, path: &str) -> Result<Option<PolicyObject>, NsxError> {
        match self.http.get::<PolicyObject>(path).await {
            Ok(obj) if obj.marked_for_delete => Ok(None),
            Ok(obj) => Ok(Some(obj)),
            Err(NsxError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn patch_object(&self, path: &str, object: &PolicyObject) -> Result<(), NsxError> {
        if !path.starts_with('/') {
            return Err(NsxError::InvalidRequest(format!("object path must be absolute: {}", path)));
        }
        let body = serde_json::to_value(object)?;
        self.http.patch(path, &body).await
    }

    async fn delete_object(&self, path: &str) -> Result<(), NsxError> {
        match self.http.delete(path).await {
            Err(NsxError::NotFound(_)) => {
                debug!("Object {} already absent", path);
                Ok(())
            }
            other => other,
        }
    }

    async fn search_by_tag(&self, resource_type: &str, scope: &str, value: Option<&str>) -> Result<Vec<PolicyObject>, NsxError> {
        let query = self.http.build_search_query(resource_type, scope, value);
        self.http.fetch_all_pages(&query).await
    }

    async fn get_realized_entities(&self, intent_path: &str) -> Result<Vec<RealizedEntity>, NsxError> {
        let path = format!(
            "/infra/realized-state/realized-entities?intent_path={}",
            urlencoding::encode(intent_path)
        );
        let list: ListResult<RealizedEntity> = self.http.get(&path).await?;
        Ok(list.results)
    }
}
