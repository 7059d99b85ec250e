//! Common utilities for the NSX API client
//!
//! Provides the authenticated HTTP wrapper shared by all API calls.

use crate::error::NsxError;
use crate::models::ListResult;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// HTTP client wrapper with basic authentication
pub struct HttpClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpClient {
    /// Create a new HTTP client wrapper
    pub fn new(client: Client, base_url: String, username: String, password: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full policy API URL from an object path or API path
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else if path.starts_with("/policy/") || path.starts_with("/api/") {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/policy/api/v1{}", self.base_url, path)
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
    }

    async fn check(path: &str, method: &str, response: Response) -> Result<Response, NsxError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(NsxError::NotFound(format!("{} - {}", path, body))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NsxError::Authentication(format!(
                "{} {} failed: {} - {}",
                method, path, status, body
            ))),
            _ => Err(NsxError::Api {
                status: status.as_u16(),
                message: format!("{} {} failed: {}", method, path, body),
            }),
        }
    }

    /// Make a GET request
    pub async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, NsxError> {
        let url = self.build_url(path);
        debug!("GET {}", url);

        let response = self.authed(self.client.get(&url)).send().await?;
        let response = Self::check(path, "GET", response).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Make a PATCH request
    pub async fn patch(&self, path: &str, body: &serde_json::Value) -> Result<(), NsxError> {
        let url = self.build_url(path);
        debug!("PATCH {} with body: {}", url, body);

        let response = self
            .authed(self.client.patch(&url))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        Self::check(path, "PATCH", response).await?;
        Ok(())
    }

    /// Make a DELETE request
    pub async fn delete(&self, path: &str) -> Result<(), NsxError> {
        let url = self.build_url(path);
        debug!("DELETE {}", url);

        let response = self.authed(self.client.delete(&url)).send().await?;
        Self::check(path, "DELETE", response).await?;
        Ok(())
    }

    /// Fetch all pages of a cursor-paginated list
    pub async fn fetch_all_pages<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Vec<T>, NsxError> {
        let mut all_results = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page_path = match &cursor {
                Some(c) => {
                    let sep = if path.contains('?') { '&' } else { '?' };
                    format!("{}{}cursor={}", path, sep, urlencoding::encode(c))
                }
                None => path.to_string(),
            };
            let page: ListResult<T> = self.get(&page_path).await?;
            all_results.extend(page.results);

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(all_results)
    }

    /// Build a search query string
    pub fn build_search_query(&self, resource_type: &str, scope: &str, value: Option<&str>) -> String {
        // Search API requires '/' in tag scopes to be escaped.
        let mut query = format!(
            "resource_type:{} AND tags.scope:{}",
            resource_type,
            scope.replace('/', "\\/")
        );
        if let Some(v) = value {
            query.push_str(&format!(" AND tags.tag:{}", v));
        }
        query.push_str(" AND marked_for_delete:false");
        format!("/search/query?query={}", urlencoding::encode(&query))
    }
}
