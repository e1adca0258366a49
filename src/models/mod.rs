//! Data models for the delta service.

pub mod delta;
pub mod endpoint;

pub use delta::{
    ChangedBlockEntry, DataToken, DeltaRecord, DeltaRecordList, EnrichOptions, EnrichedDeltaView,
    DEFAULT_ENRICH_LIMIT,
};
pub use endpoint::{DriverEndpoint, ServiceReference};
