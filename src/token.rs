//! Data token issuance.

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::models::DataToken;

/// Default token lifetime handed to changed-block entries (3 hours).
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3 * 60 * 60;

/// Returns the default token lifetime as a duration.
pub fn default_token_ttl() -> Duration {
    Duration::seconds(DEFAULT_TOKEN_TTL_SECS)
}

/// Issues opaque, time-limited retrieval tokens for changed-block payloads.
///
/// Tokens are never validated or consumed here; they are opaque values
/// handed to downstream block-retrieval services.
#[derive(Debug, Clone, Default)]
pub struct TokenIssuer;

impl TokenIssuer {
    pub fn new() -> Self {
        Self
    }

    /// Issues a fresh token valid for `ttl` from now.
    pub fn issue(&self, ttl: Duration) -> DataToken {
        DataToken {
            token: Uuid::new_v4().simple().to_string(),
            issuance_time: Utc::now(),
            ttl_seconds: ttl.num_seconds().max(0) as u64,
        }
    }
}
