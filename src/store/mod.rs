//! Delta record persistence.
//!
//! [`DeltaStore`] is the CRUD+watch contract over the backing key-value
//! store. Per-record `resourceVersion` starts at 1 on create and strictly
//! increases on every successful mutation of that key. Listings additionally
//! report a store-wide revision; a watch started from that revision receives
//! exactly the mutations committed after it, in commit order.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{DeltaError, DeltaResult, ErrorCode};
use crate::models::{DeltaRecord, DeltaRecordList};

pub use memory::MemoryDeltaStore;

/// Expected uid/resourceVersion for optimistic concurrency control.
///
/// A supplied field must match the stored record exactly; a mismatch fails
/// the operation with `PreconditionFailed` and is never retried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: Option<String>,
    pub resource_version: Option<u64>,
}

impl Preconditions {
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.resource_version.is_none()
    }

    /// Checks the preconditions against a stored record.
    pub fn check(&self, record: &DeltaRecord) -> DeltaResult<()> {
        if let Some(uid) = &self.uid {
            if *uid != record.uid {
                return Err(DeltaError::with_message(
                    ErrorCode::PreconditionFailed,
                    format!("uid mismatch: expected {uid}, stored {}", record.uid),
                ));
            }
        }
        if let Some(rv) = self.resource_version {
            if rv != record.resource_version {
                return Err(DeltaError::with_message(
                    ErrorCode::PreconditionFailed,
                    format!(
                        "resourceVersion mismatch: expected {rv}, stored {}",
                        record.resource_version
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// One term of a selector: key op value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectorTerm {
    key: String,
    value: String,
    negated: bool,
}

/// Label/field selector for list and watch.
///
/// Labels support `key=value` and `key!=value` terms. Fields support
/// `metadata.name` and `metadata.namespace`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    label_terms: Vec<SelectorTerm>,
    field_terms: Vec<SelectorTerm>,
}

fn parse_terms(input: &str) -> DeltaResult<Vec<SelectorTerm>> {
    let mut terms = Vec::new();
    for raw in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value, negated) = if let Some((k, v)) = raw.split_once("!=") {
            (k, v, true)
        } else if let Some((k, v)) = raw.split_once('=') {
            (k, v, false)
        } else {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                format!("malformed selector term: {raw}"),
            ));
        };
        terms.push(SelectorTerm {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
            negated,
        });
    }
    Ok(terms)
}

impl Selector {
    /// Parses label and field selector strings, either of which may be empty.
    pub fn parse(labels: Option<&str>, fields: Option<&str>) -> DeltaResult<Self> {
        let label_terms = labels.map(parse_terms).transpose()?.unwrap_or_default();
        let field_terms = fields.map(parse_terms).transpose()?.unwrap_or_default();
        for term in &field_terms {
            if term.key != "metadata.name" && term.key != "metadata.namespace" {
                return Err(DeltaError::with_message(
                    ErrorCode::InvalidInput,
                    format!("unsupported field selector: {}", term.key),
                ));
            }
        }
        Ok(Self {
            label_terms,
            field_terms,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.label_terms.is_empty() && self.field_terms.is_empty()
    }

    /// Returns whether a record satisfies every term.
    pub fn matches(&self, record: &DeltaRecord) -> bool {
        for term in &self.label_terms {
            let matched = record.labels.get(&term.key).map(String::as_str) == Some(&term.value);
            if matched == term.negated {
                return false;
            }
        }
        for term in &self.field_terms {
            let actual = match term.key.as_str() {
                "metadata.name" => record.name.as_str(),
                "metadata.namespace" => record.namespace.as_str(),
                _ => return false,
            };
            if (actual == term.value) == term.negated {
                return false;
            }
        }
        true
    }
}

/// Options for the list operation.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub selector: Selector,
    /// Maximum number of records per page; unlimited when absent.
    pub limit: Option<u64>,
    /// Continuation token from a previous page.
    pub continue_token: Option<String>,
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// One committed mutation, delivered to watch subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub record: DeltaRecord,
}

/// Internal watch frame carrying the store-wide commit revision.
#[derive(Debug, Clone)]
pub(crate) struct CommittedEvent {
    pub revision: u64,
    pub event: WatchEvent,
}

/// A live watch: replayed backlog first, then events as they commit.
#[derive(Debug)]
pub struct WatchSubscription {
    backlog: std::collections::VecDeque<WatchEvent>,
    live: broadcast::Receiver<CommittedEvent>,
    namespace: Option<String>,
    selector: Selector,
}

impl WatchSubscription {
    pub(crate) fn new(
        backlog: Vec<WatchEvent>,
        live: broadcast::Receiver<CommittedEvent>,
        namespace: Option<String>,
        selector: Selector,
    ) -> Self {
        Self {
            backlog: backlog.into(),
            live,
            namespace,
            selector,
        }
    }

    fn accepts(&self, event: &WatchEvent) -> bool {
        if let Some(ns) = &self.namespace {
            if event.record.namespace != *ns {
                return false;
            }
        }
        self.selector.matches(&event.record)
    }

    /// Receives the next event in commit order.
    ///
    /// Returns `Ok(None)` when the store shuts down. A subscriber that falls
    /// too far behind gets `HistoryExpired` rather than silently missing
    /// events, and must re-list.
    pub async fn recv(&mut self) -> DeltaResult<Option<WatchEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.live.recv().await {
                Ok(committed) => {
                    if self.accepts(&committed.event) {
                        return Ok(Some(committed.event));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(DeltaError::with_message(
                        ErrorCode::HistoryExpired,
                        format!("watch fell behind by {n} events; re-list and re-watch"),
                    ));
                }
            }
        }
    }
}

/// Persistence contract for delta records.
#[async_trait]
pub trait DeltaStore: Send + Sync {
    /// Persists a new record, assigning resourceVersion 1, a fresh uid and
    /// the creation timestamp. Fails with `AlreadyExists` if the key is
    /// occupied.
    async fn create(&self, record: DeltaRecord) -> DeltaResult<DeltaRecord>;

    /// Fetches the current record. Fails with `NotFound` if absent.
    async fn get(&self, namespace: &str, name: &str) -> DeltaResult<DeltaRecord>;

    /// Compare-and-swap update: re-reads the current value, applies
    /// preconditions and the caller's mutation, and writes back. CAS races
    /// are retried internally a bounded number of times before surfacing
    /// `Conflict`; precondition mismatches surface immediately.
    async fn update(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
        mutate: &(dyn Fn(DeltaRecord) -> DeltaResult<DeltaRecord> + Send + Sync),
    ) -> DeltaResult<DeltaRecord>;

    /// Removes the record and returns its last value. Fails with `NotFound`
    /// if absent, `PreconditionFailed` on precondition mismatch.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> DeltaResult<DeltaRecord>;

    /// Lists records in a namespace (or all namespaces when `None`) matching
    /// the selector, ordered by storage key, stable across pages.
    async fn list(&self, namespace: Option<&str>, options: ListOptions)
        -> DeltaResult<DeltaRecordList>;

    /// Opens an event stream starting after store revision `start_revision`
    /// (or "now" when absent). Fails with `HistoryExpired` if the start
    /// point was compacted away.
    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: Selector,
        start_revision: Option<u64>,
    ) -> DeltaResult<WatchSubscription>;
}
