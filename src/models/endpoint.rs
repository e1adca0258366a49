//! Driver endpoint registration models.

use serde::{Deserialize, Serialize};

use crate::error::{DeltaError, DeltaResult, ErrorCode};

/// In-cluster service address for a driver backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    pub service_name: String,
    pub service_namespace: String,
    /// Request path on the backend, defaults to "/".
    #[serde(default = "default_path")]
    pub path: String,
    pub port: u16,
}

fn default_path() -> String {
    "/".to_string()
}

/// Resolves a driver name to a reachable backend.
///
/// Exactly one addressing form is populated: either `endpoint_url` or
/// `service`, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverEndpoint {
    /// Driver name, unique cluster-wide.
    pub driver_name: String,
    /// Direct URL to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    /// Service-based address of the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
}

impl DriverEndpoint {
    /// Creates an endpoint addressed by a direct URL.
    pub fn with_url(driver_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            endpoint_url: Some(url.into()),
            service: None,
        }
    }

    /// Creates an endpoint addressed through an in-cluster service.
    pub fn with_service(driver_name: impl Into<String>, service: ServiceReference) -> Self {
        Self {
            driver_name: driver_name.into(),
            endpoint_url: None,
            service: Some(service),
        }
    }

    /// Validates that exactly one addressing form is populated and that a
    /// direct URL, when given, parses.
    pub fn validate(&self) -> DeltaResult<()> {
        if self.driver_name.is_empty() {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "driverName must not be empty",
            ));
        }
        match (&self.endpoint_url, &self.service) {
            (Some(endpoint), None) => {
                url::Url::parse(endpoint).map_err(|e| {
                    DeltaError::with_message(
                        ErrorCode::InvalidInput,
                        format!("endpointURL is not a valid URL: {e}"),
                    )
                })?;
                Ok(())
            }
            (None, Some(service)) => {
                if service.service_name.is_empty() || service.service_namespace.is_empty() {
                    return Err(DeltaError::with_message(
                        ErrorCode::InvalidInput,
                        "serviceName and serviceNamespace must not be empty",
                    ));
                }
                Ok(())
            }
            _ => Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "exactly one of endpointURL or service must be set",
            )),
        }
    }

    /// Returns the base URL the enrichment proxy should call.
    pub fn base_url(&self) -> DeltaResult<String> {
        match (&self.endpoint_url, &self.service) {
            (Some(endpoint), _) => Ok(endpoint.clone()),
            (None, Some(service)) => {
                let path = service.path.trim_start_matches('/');
                Ok(format!(
                    "http://{}.{}:{}/{}",
                    service.service_name, service.service_namespace, service.port, path
                ))
            }
            (None, None) => Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "driver endpoint has no addressing information",
            )),
        }
    }
}
