//! Request resolution.
//!
//! Two exact-match tables turn a client request into the workload to run:
//! request -> application image, then application image -> the IoT resource
//! the application consumes. A missing mapping is an explicit
//! [`LookupError`], never an empty string.

use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use edgeplace_events::UnresolvedReason;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request with no mapping in the lookup tables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("no application mapped for request '{0}'")]
    UnknownRequest(String),

    #[error("no resource mapped for application '{application}' (request '{request}')")]
    UnknownApplication { request: String, application: String },
}

impl LookupError {
    pub fn request(&self) -> &str {
        match self {
            LookupError::UnknownRequest(request) => request,
            LookupError::UnknownApplication { request, .. } => request,
        }
    }

    pub fn reason(&self) -> UnresolvedReason {
        match self {
            LookupError::UnknownRequest(_) => UnresolvedReason::UnknownRequest,
            LookupError::UnknownApplication { .. } => UnresolvedReason::UnknownApplication,
        }
    }
}

/// A request resolved to its application and required resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub request: String,
    pub application: String,
    pub resource_id: String,
    /// When the request entered the pipeline.
    pub received_at: Instant,
}

/// Request -> application and application -> resource tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTables {
    #[serde(default)]
    pub request_to_app: HashMap<String, String>,
    #[serde(default)]
    pub app_to_resource: HashMap<String, String>,
}

impl Default for LookupTables {
    fn default() -> Self {
        let mut tables = Self::empty();
        for n in 1..=3 {
            tables.insert(
                format!("client_request_{n}"),
                format!("application_image_{n}"),
                format!("IoT_resource_{n}"),
            );
        }
        tables
    }
}

impl LookupTables {
    /// Tables with no mappings.
    pub fn empty() -> Self {
        Self {
            request_to_app: HashMap::new(),
            app_to_resource: HashMap::new(),
        }
    }

    /// Load tables from a JSON file of the form
    /// `{"request_to_app": {...}, "app_to_resource": {...}}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lookup tables from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse lookup tables in {}", path.display()))
    }

    /// Add both mappings for one request.
    pub fn insert(
        &mut self,
        request: impl Into<String>,
        application: impl Into<String>,
        resource_id: impl Into<String>,
    ) {
        let application = application.into();
        self.request_to_app.insert(request.into(), application.clone());
        self.app_to_resource.insert(application, resource_id.into());
    }

    /// Resource consumed by `application`, if mapped.
    pub fn resource_for(&self, application: &str) -> Option<&str> {
        self.app_to_resource.get(application).map(String::as_str)
    }

    /// Resolve a request received now.
    pub fn resolve(&self, request: &str) -> Result<ResolvedRequest, LookupError> {
        self.resolve_at(request, Instant::now())
    }

    /// Resolve a request that entered the pipeline at `received_at`.
    pub fn resolve_at(
        &self,
        request: &str,
        received_at: Instant,
    ) -> Result<ResolvedRequest, LookupError> {
        let application = self
            .request_to_app
            .get(request)
            .ok_or_else(|| LookupError::UnknownRequest(request.to_string()))?;

        let resource_id =
            self.resource_for(application)
                .ok_or_else(|| LookupError::UnknownApplication {
                    request: request.to_string(),
                    application: application.clone(),
                })?;

        Ok(ResolvedRequest {
            request: request.to_string(),
            application: application.clone(),
            resource_id: resource_id.to_string(),
            received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("client_request_1", "application_image_1", "IoT_resource_1")]
    #[case("client_request_2", "application_image_2", "IoT_resource_2")]
    #[case("client_request_3", "application_image_3", "IoT_resource_3")]
    fn test_default_tables_resolve_builtin_requests(
        #[case] request: &str,
        #[case] application: &str,
        #[case] resource_id: &str,
    ) {
        let tables = LookupTables::default();
        let resolved = tables.resolve(request).unwrap();
        assert_eq!(resolved.application, application);
        assert_eq!(resolved.resource_id, resource_id);
    }

    #[test]
    fn test_unknown_request() {
        let tables = LookupTables::default();
        let err = tables.resolve("nope").unwrap_err();
        assert_eq!(err, LookupError::UnknownRequest("nope".to_string()));
        assert_eq!(err.reason(), UnresolvedReason::UnknownRequest);
        assert_eq!(err.request(), "nope");
    }

    #[test]
    fn test_unknown_application() {
        let mut tables = LookupTables::empty();
        tables
            .request_to_app
            .insert("req1".to_string(), "orphan".to_string());

        let err = tables.resolve("req1").unwrap_err();
        assert_eq!(
            err,
            LookupError::UnknownApplication {
                request: "req1".to_string(),
                application: "orphan".to_string(),
            }
        );
        assert_eq!(err.reason(), UnresolvedReason::UnknownApplication);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"request_to_app": {{"req1": "a1"}}, "app_to_resource": {{"a1": "r1"}}}}"#
        )
        .unwrap();

        let tables = LookupTables::from_file(file.path()).unwrap();
        let resolved = tables.resolve("req1").unwrap();
        assert_eq!(resolved.application, "a1");
        assert_eq!(resolved.resource_id, "r1");
    }

    #[test]
    fn test_from_file_missing() {
        let err = LookupTables::from_file("/nonexistent/lookup.json").unwrap_err();
        assert!(err.to_string().contains("failed to read lookup tables"));
    }
}
