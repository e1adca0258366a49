//! Delta record data models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{DeltaError, DeltaResult, ErrorCode};

/// Default maximum number of changed-block entries returned by the
/// enrichment subresource.
pub const DEFAULT_ENRICH_LIMIT: u64 = 256;

/// Opaque, time-limited credential for retrieving one changed block's raw
/// payload from a block-retrieval service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataToken {
    /// Backend-issued or synthesized token string.
    pub token: String,
    /// Timestamp when the token was issued.
    pub issuance_time: DateTime<Utc>,
    /// Token lifetime in seconds, counted from the issuance time.
    pub ttl_seconds: u64,
}

impl DataToken {
    /// Returns the instant after which downstream consumers must treat
    /// this token as invalid.
    pub fn expiry(&self) -> DateTime<Utc> {
        self.issuance_time + Duration::seconds(self.ttl_seconds as i64)
    }
}

/// One changed region of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedBlockEntry {
    /// Logical byte offset of the block on the volume.
    pub offset: u64,
    /// Size of the block in bytes.
    pub block_size_bytes: u64,
    /// Credential for retrieving the block's raw payload.
    pub data_token: DataToken,
}

/// A named request to compare two volume snapshots and surface changed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRecord {
    /// Record name, unique within a namespace.
    pub name: String,
    /// Namespace the record lives in.
    #[serde(default)]
    pub namespace: String,
    /// Base snapshot for the comparison. Empty means "all blocks changed".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_snapshot_name: String,
    /// Target snapshot for the comparison. Required.
    pub target_snapshot_name: String,
    /// Volume mode, defaults to "block".
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Storage driver whose backend serves the changed-block data.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub driver_name: String,
    /// Monotonic version assigned by the store on every successful mutation.
    #[serde(default)]
    pub resource_version: u64,
    /// Immutable identity assigned at creation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Set by the store when the record is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// User-supplied labels, matchable by list/watch selectors.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Last error observed while resolving this delta, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    /// Changed-block entries, empty until enriched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_blocks: Vec<ChangedBlockEntry>,
}

fn default_mode() -> String {
    "block".to_string()
}

impl DeltaRecord {
    /// Creates a new record comparing `base` (may be empty) against `target`.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        base: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            base_snapshot_name: base.into(),
            target_snapshot_name: target.into(),
            mode: default_mode(),
            driver_name: String::new(),
            resource_version: 0,
            uid: String::new(),
            creation_timestamp: None,
            labels: BTreeMap::new(),
            last_error: String::new(),
            changed_blocks: Vec::new(),
        }
    }

    /// Returns the unique storage key for this record.
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.name.clone())
    }

    /// Validates client-settable fields.
    pub fn validate(&self) -> DeltaResult<()> {
        if self.name.is_empty() {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "record name must not be empty",
            ));
        }
        if self.namespace.is_empty() {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "record namespace must not be empty",
            ));
        }
        if self.target_snapshot_name.is_empty() {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "targetSnapshotName must not be empty",
            ));
        }
        Ok(())
    }
}

/// List envelope returned by the list operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRecordList {
    /// Store resource version at which the listing was taken.
    pub resource_version: u64,
    /// Continuation token for the next page, absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "continue")]
    pub continue_token: Option<String>,
    pub items: Vec<DeltaRecord>,
}

/// Options accepted by the enrichment subresource.
///
/// Malformed query values fall back silently to the defaults rather than
/// failing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichOptions {
    /// When false the stored record is returned verbatim.
    pub fetch_changed_blocks: bool,
    /// Maximum number of entries to return.
    pub limit: u64,
    /// Index of the first block entry to return.
    pub offset: u64,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            fetch_changed_blocks: false,
            limit: DEFAULT_ENRICH_LIMIT,
            offset: 0,
        }
    }
}

impl EnrichOptions {
    /// Parses `fetchcbd`, `limit` and `offset` query parameters.
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            fetch_changed_blocks: query
                .get("fetchcbd")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_changed_blocks),
            limit: query
                .get("limit")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.limit),
            offset: query
                .get("offset")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.offset),
        }
    }
}

/// A delta record combined with live enrichment results.
///
/// This view is never persisted; the changed blocks are a best-effort
/// snapshot fetched from the driver backend for this request only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedDeltaView {
    #[serde(flatten)]
    pub record: DeltaRecord,
    /// Volume size reported by the backend, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size_bytes: Option<u64>,
    /// Backend continuation token for the next page of entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}
