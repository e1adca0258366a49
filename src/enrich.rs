//! Enrichment proxy: fetches changed-block entries from a driver backend.
//!
//! One client-facing enrichment request maps to exactly one backend attempt;
//! the proxy never retries and never buffers or re-pages results. Pagination
//! controls are forwarded unmodified.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{DeltaError, DeltaResult, ErrorCode};
use crate::models::{ChangedBlockEntry, DataToken, DriverEndpoint};
use crate::token::{default_token_ttl, TokenIssuer};

/// Changed-block entries fetched from a backend, with its paging state.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub entries: Vec<ChangedBlockEntry>,
    pub volume_size_bytes: Option<u64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendToken {
    token: String,
    issuance_time: DateTime<Utc>,
    ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendEntry {
    offset: u64,
    block_size_bytes: u64,
    /// Backends that delegate credential issuance omit this.
    #[serde(default)]
    data_token: Option<BackendToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendResponse {
    #[serde(default)]
    entries: Vec<BackendEntry>,
    #[serde(default)]
    volume_size_bytes: Option<u64>,
    #[serde(default)]
    next_token: Option<String>,
}

/// Translates a backend response field-for-field into domain entries,
/// issuing a fresh token for any entry the backend left without one.
///
/// Entries must arrive unique and in ascending offset order; a backend that
/// violates that produced a malformed payload.
fn translate(response: BackendResponse, issuer: &TokenIssuer) -> DeltaResult<FetchResult> {
    let mut entries = Vec::with_capacity(response.entries.len());
    let mut previous: Option<u64> = None;
    for entry in response.entries {
        if let Some(prev) = previous {
            if entry.offset <= prev {
                return Err(DeltaError::with_message(
                    ErrorCode::DecodeError,
                    format!(
                        "backend entries are not in strictly ascending offset order ({prev} then {})",
                        entry.offset
                    ),
                ));
            }
        }
        previous = Some(entry.offset);
        let data_token = match entry.data_token {
            Some(token) => DataToken {
                token: token.token,
                issuance_time: token.issuance_time,
                ttl_seconds: token.ttl_seconds,
            },
            None => issuer.issue(default_token_ttl()),
        };
        entries.push(ChangedBlockEntry {
            offset: entry.offset,
            block_size_bytes: entry.block_size_bytes,
            data_token,
        });
    }
    Ok(FetchResult {
        entries,
        volume_size_bytes: response.volume_size_bytes,
        next_token: response.next_token,
    })
}

/// Proxy performing the single synchronous backend call per enrichment.
pub struct EnrichmentProxy {
    http: reqwest::Client,
    issuer: TokenIssuer,
}

impl EnrichmentProxy {
    /// Creates a proxy whose backend calls time out after `timeout`.
    pub fn new(timeout: Duration) -> DeltaResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeltaError::with_message(ErrorCode::InternalError, e.to_string()))?;
        Ok(Self {
            http,
            issuer: TokenIssuer::new(),
        })
    }

    /// Fetches changed-block entries for `target` vs `base` from the
    /// resolved backend. An empty `base` asks the backend for all blocks.
    pub async fn fetch_changed_blocks(
        &self,
        endpoint: &DriverEndpoint,
        target_snapshot: &str,
        base_snapshot: &str,
        limit: u64,
        offset: u64,
    ) -> DeltaResult<FetchResult> {
        let base_url = endpoint.base_url()?;
        debug!(
            driver = %endpoint.driver_name,
            url = %base_url,
            target = target_snapshot,
            "fetching changed blocks from driver backend"
        );

        let mut query: Vec<(&str, String)> = vec![
            ("targetSnapshotName", target_snapshot.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        if !base_snapshot.is_empty() {
            query.push(("baseSnapshotName", base_snapshot.to_string()));
        }

        let response = self
            .http
            .get(&base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                DeltaError::with_message(
                    ErrorCode::UpstreamUnavailable,
                    format!("backend call to {base_url} failed: {e}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeltaError::with_message(
                ErrorCode::UpstreamUnavailable,
                format!("backend at {base_url} returned status {status}"),
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            DeltaError::with_message(
                ErrorCode::UpstreamUnavailable,
                format!("failed reading backend response: {e}"),
            )
        })?;

        let decoded: BackendResponse = serde_json::from_slice(&body)
            .map_err(|e| DeltaError::with_message(ErrorCode::DecodeError, e.to_string()))?;

        translate(decoded, &self.issuer)
    }
}
