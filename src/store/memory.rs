//! In-memory versioned implementation of the delta store.
//!
//! Mirrors the contract of the external key-value store: a store-wide
//! revision counter in commit order, per-record resource versions, and a
//! bounded event history backing watch replay.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{DeltaError, DeltaResult, ErrorCode};
use crate::models::{DeltaRecord, DeltaRecordList};

use super::{
    CommittedEvent, DeltaStore, EventKind, ListOptions, Preconditions, Selector, WatchEvent,
    WatchSubscription,
};

/// Internal CAS attempts before a race surfaces as `Conflict`.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Watch events retained for replay before compaction.
const DEFAULT_HISTORY_LIMIT: usize = 4096;

/// Buffered events per live watch subscriber.
const BROADCAST_CAPACITY: usize = 1024;

type Key = (String, String);

struct Inner {
    records: BTreeMap<Key, DeltaRecord>,
    /// Store-wide revision, bumped once per committed mutation.
    revision: u64,
    /// Retained events, oldest first.
    history: VecDeque<CommittedEvent>,
    /// Highest revision discarded from history; 0 when nothing was compacted.
    compacted_through: u64,
    history_limit: usize,
}

/// In-memory delta record store.
pub struct MemoryDeltaStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<CommittedEvent>,
}

impl MemoryDeltaStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Creates a store retaining at most `history_limit` watch events.
    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                records: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                compacted_through: 0,
                history_limit,
            }),
            events,
        }
    }

    fn key(namespace: &str, name: &str) -> Key {
        (namespace.to_string(), name.to_string())
    }

    /// Records a committed mutation: bumps the revision, appends to history
    /// (compacting the oldest entry past the limit) and fans out to live
    /// watchers. Must be called with the write lock held.
    fn commit(&self, inner: &mut Inner, kind: EventKind, record: DeltaRecord) {
        inner.revision += 1;
        let committed = CommittedEvent {
            revision: inner.revision,
            event: WatchEvent { kind, record },
        };
        inner.history.push_back(committed.clone());
        while inner.history.len() > inner.history_limit {
            if let Some(evicted) = inner.history.pop_front() {
                inner.compacted_through = evicted.revision;
            }
        }
        // No receivers is fine; history still serves replay.
        let _ = self.events.send(committed);
    }

    fn not_found(namespace: &str, name: &str) -> DeltaError {
        DeltaError::with_message(
            ErrorCode::NotFound,
            format!("delta record {namespace}/{name} does not exist"),
        )
    }
}

impl Default for MemoryDeltaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeltaStore for MemoryDeltaStore {
    async fn create(&self, record: DeltaRecord) -> DeltaResult<DeltaRecord> {
        record.validate()?;

        let mut inner = self.inner.write();
        let key = record.key();
        if inner.records.contains_key(&key) {
            return Err(DeltaError::with_message(
                ErrorCode::AlreadyExists,
                format!("delta record {}/{} already exists", key.0, key.1),
            ));
        }

        let mut stored = record;
        stored.resource_version = 1;
        stored.uid = Uuid::new_v4().to_string();
        stored.creation_timestamp = Some(Utc::now());

        inner.records.insert(key, stored.clone());
        self.commit(&mut inner, EventKind::Added, stored.clone());
        Ok(stored)
    }

    async fn get(&self, namespace: &str, name: &str) -> DeltaResult<DeltaRecord> {
        self.inner
            .read()
            .records
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn update(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
        mutate: &(dyn Fn(DeltaRecord) -> DeltaResult<DeltaRecord> + Send + Sync),
    ) -> DeltaResult<DeltaRecord> {
        let key = Self::key(namespace, name);

        for _ in 0..MAX_CAS_ATTEMPTS {
            // Read the current value without blocking writers while the
            // caller's mutation runs.
            let current = self
                .inner
                .read()
                .records
                .get(&key)
                .cloned()
                .ok_or_else(|| Self::not_found(namespace, name))?;

            // Explicit precondition mismatches are never retried.
            preconditions.check(&current)?;

            let mutated = mutate(current.clone())?;

            let mut inner = self.inner.write();
            let stored = inner
                .records
                .get(&key)
                .ok_or_else(|| Self::not_found(namespace, name))?;
            if stored.resource_version != current.resource_version {
                // Lost the race; re-read and retry.
                continue;
            }

            let mut next = mutated;
            next.name = current.name;
            next.namespace = current.namespace;
            next.uid = current.uid;
            next.creation_timestamp = current.creation_timestamp;
            next.resource_version = current.resource_version + 1;

            inner.records.insert(key.clone(), next.clone());
            self.commit(&mut inner, EventKind::Modified, next.clone());
            return Ok(next);
        }

        Err(DeltaError::with_message(
            ErrorCode::Conflict,
            format!("update of {namespace}/{name} kept losing to concurrent writers"),
        ))
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Preconditions,
    ) -> DeltaResult<DeltaRecord> {
        let key = Self::key(namespace, name);
        let mut inner = self.inner.write();

        let stored = inner
            .records
            .get(&key)
            .ok_or_else(|| Self::not_found(namespace, name))?;
        preconditions.check(stored)?;

        let removed = inner
            .records
            .remove(&key)
            .ok_or_else(|| Self::not_found(namespace, name))?;
        self.commit(&mut inner, EventKind::Deleted, removed.clone());
        Ok(removed)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        options: ListOptions,
    ) -> DeltaResult<DeltaRecordList> {
        let inner = self.inner.read();

        let continue_key: Option<Key> = match &options.continue_token {
            Some(token) => {
                let (ns, name) = token.split_once('/').ok_or_else(|| {
                    DeltaError::with_message(ErrorCode::InvalidInput, "malformed continue token")
                })?;
                Some((ns.to_string(), name.to_string()))
            }
            None => None,
        };

        let mut items: Vec<DeltaRecord> = Vec::new();
        let mut next_token = None;
        let limit = options.limit.unwrap_or(u64::MAX) as usize;

        for (key, record) in inner.records.iter() {
            if let Some(ns) = namespace {
                if key.0 != ns {
                    continue;
                }
            }
            if let Some(after) = &continue_key {
                if key <= after {
                    continue;
                }
            }
            if !options.selector.matches(record) {
                continue;
            }
            if items.len() == limit {
                let last = items.last().map(|r| format!("{}/{}", r.namespace, r.name));
                next_token = last;
                break;
            }
            items.push(record.clone());
        }

        Ok(DeltaRecordList {
            resource_version: inner.revision,
            continue_token: next_token,
            items,
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        selector: Selector,
        start_revision: Option<u64>,
    ) -> DeltaResult<WatchSubscription> {
        // Subscribing under the lock guarantees no commit falls between the
        // replayed backlog and the live stream.
        let inner = self.inner.read();
        let live = self.events.subscribe();

        let backlog = match start_revision {
            None => Vec::new(),
            Some(start) => {
                if start < inner.compacted_through {
                    return Err(DeltaError::with_message(
                        ErrorCode::HistoryExpired,
                        format!(
                            "watch start revision {start} is older than the oldest retained event ({})",
                            inner.compacted_through
                        ),
                    ));
                }
                inner
                    .history
                    .iter()
                    .filter(|c| c.revision > start)
                    .filter(|c| {
                        namespace.map_or(true, |ns| c.event.record.namespace == ns)
                            && selector.matches(&c.event.record)
                    })
                    .map(|c| c.event.clone())
                    .collect()
            }
        };

        Ok(WatchSubscription::new(
            backlog,
            live,
            namespace.map(str::to_string),
            selector,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(namespace: &str, name: &str) -> DeltaRecord {
        DeltaRecord::new(namespace, name, "snap-base", "snap-target")
    }

    #[tokio::test]
    async fn create_assigns_identity_and_version_one() {
        let store = MemoryDeltaStore::new();
        let stored = store.create(record("default", "delta-1")).await.unwrap();

        assert_eq!(stored.resource_version, 1);
        assert!(!stored.uid.is_empty());
        assert!(stored.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn create_of_occupied_key_fails() {
        let store = MemoryDeltaStore::new();
        store.create(record("default", "delta-1")).await.unwrap();

        let err = store.create(record("default", "delta-1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);

        // Same name in another namespace is a different key.
        store.create(record("other", "delta-1")).await.unwrap();
    }

    #[tokio::test]
    async fn create_rejects_missing_target_snapshot() {
        let store = MemoryDeltaStore::new();
        let mut bad = record("default", "delta-1");
        bad.target_snapshot_name.clear();

        let err = store.create(bad).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn get_of_absent_key_is_not_found() {
        let store = MemoryDeltaStore::new();
        let err = store.get("default", "missing").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn update_bumps_version_and_preserves_identity() {
        let store = MemoryDeltaStore::new();
        let created = store.create(record("default", "delta-1")).await.unwrap();

        let updated = store
            .update("default", "delta-1", Preconditions::default(), &|mut r| {
                r.last_error = "backend flaked".to_string();
                r.uid = "attempted-uid-change".to_string();
                Ok(r)
            })
            .await
            .unwrap();

        assert_eq!(updated.resource_version, 2);
        assert_eq!(updated.last_error, "backend flaked");
        assert_eq!(updated.uid, created.uid);
        assert_eq!(updated.creation_timestamp, created.creation_timestamp);
    }

    #[tokio::test]
    async fn update_precondition_mismatch_is_not_retried() {
        let store = MemoryDeltaStore::new();
        let created = store.create(record("default", "delta-1")).await.unwrap();

        let err = store
            .update(
                "default",
                "delta-1",
                Preconditions {
                    uid: Some(created.uid.clone()),
                    resource_version: Some(99),
                },
                &|r| Ok(r),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PreconditionFailed);

        let err = store
            .update(
                "default",
                "delta-1",
                Preconditions {
                    uid: Some("wrong-uid".to_string()),
                    resource_version: None,
                },
                &|r| Ok(r),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PreconditionFailed);
    }

    #[tokio::test]
    async fn stale_concurrent_updates_lose_exactly_once() {
        let store = Arc::new(MemoryDeltaStore::new());
        store.create(record("default", "delta-1")).await.unwrap();

        let stale = Preconditions {
            uid: None,
            resource_version: Some(1),
        };

        let mut results = Vec::new();
        for tag in ["a", "b"] {
            let store = store.clone();
            let stale = stale.clone();
            results.push(tokio::spawn(async move {
                store
                    .update("default", "delta-1", stale, &move |mut r| {
                        r.last_error = tag.to_string();
                        Ok(r)
                    })
                    .await
            }));
        }

        let mut ok = 0;
        let mut failed = 0;
        for handle in results {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert!(matches!(
                        e.code,
                        ErrorCode::PreconditionFailed | ErrorCode::Conflict
                    ));
                    failed += 1;
                }
            }
        }
        assert_eq!((ok, failed), (1, 1));
    }

    #[tokio::test]
    async fn delete_returns_last_value_and_honors_preconditions() {
        let store = MemoryDeltaStore::new();
        let created = store.create(record("default", "delta-1")).await.unwrap();

        let err = store
            .delete(
                "default",
                "delta-1",
                Preconditions {
                    uid: None,
                    resource_version: Some(7),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PreconditionFailed);

        let deleted = store
            .delete(
                "default",
                "delta-1",
                Preconditions {
                    uid: Some(created.uid.clone()),
                    resource_version: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(deleted.uid, created.uid);

        let err = store
            .delete("default", "delta-1", Preconditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn list_orders_by_key_and_paginates() {
        let store = MemoryDeltaStore::new();
        for name in ["c", "a", "b"] {
            store.create(record("ns1", name)).await.unwrap();
        }
        store.create(record("ns2", "z")).await.unwrap();

        let page1 = store
            .list(
                Some("ns1"),
                ListOptions {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let names: Vec<_> = page1.items.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        let token = page1.continue_token.clone().unwrap();

        let page2 = store
            .list(
                Some("ns1"),
                ListOptions {
                    limit: Some(2),
                    continue_token: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let names: Vec<_> = page2.items.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["c"]);
        assert!(page2.continue_token.is_none());

        let all = store.list(None, ListOptions::default()).await.unwrap();
        assert_eq!(all.items.len(), 4);
    }

    #[tokio::test]
    async fn list_applies_selectors() {
        let store = MemoryDeltaStore::new();
        let mut labeled = record("default", "labeled");
        labeled.labels.insert("app".to_string(), "db".to_string());
        store.create(labeled).await.unwrap();
        store.create(record("default", "plain")).await.unwrap();

        let selector = Selector::parse(Some("app=db"), None).unwrap();
        let listed = store
            .list(
                Some("default"),
                ListOptions {
                    selector,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].name, "labeled");
    }

    #[tokio::test]
    async fn watch_replays_mutations_after_start_revision_in_commit_order() {
        let store = MemoryDeltaStore::new();
        store.create(record("default", "delta-1")).await.unwrap();

        let listed = store.list(Some("default"), ListOptions::default()).await.unwrap();
        let mut watch = store
            .watch(Some("default"), Selector::default(), Some(listed.resource_version))
            .await
            .unwrap();

        store
            .update("default", "delta-1", Preconditions::default(), &|mut r| {
                r.last_error = "first".to_string();
                Ok(r)
            })
            .await
            .unwrap();
        store
            .delete("default", "delta-1", Preconditions::default())
            .await
            .unwrap();

        let event = watch.recv().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Modified);
        assert_eq!(event.record.last_error, "first");

        let event = watch.recv().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Deleted);
    }

    #[tokio::test]
    async fn watch_from_now_skips_existing_history() {
        let store = MemoryDeltaStore::new();
        store.create(record("default", "delta-1")).await.unwrap();

        let mut watch = store
            .watch(Some("default"), Selector::default(), None)
            .await
            .unwrap();

        store.create(record("default", "delta-2")).await.unwrap();

        let event = watch.recv().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.record.name, "delta-2");
    }

    #[tokio::test]
    async fn watch_filters_by_namespace() {
        let store = MemoryDeltaStore::new();
        let mut watch = store
            .watch(Some("ns1"), Selector::default(), None)
            .await
            .unwrap();

        store.create(record("ns2", "ignored")).await.unwrap();
        store.create(record("ns1", "seen")).await.unwrap();

        let event = watch.recv().await.unwrap().unwrap();
        assert_eq!(event.record.namespace, "ns1");
        assert_eq!(event.record.name, "seen");
    }

    #[tokio::test]
    async fn watch_from_compacted_revision_is_history_expired() {
        let store = MemoryDeltaStore::with_history_limit(2);
        for i in 0..5 {
            store.create(record("default", &format!("delta-{i}"))).await.unwrap();
        }

        let err = store
            .watch(Some("default"), Selector::default(), Some(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HistoryExpired);

        // A start point still inside the retained window works.
        let listed = store.list(Some("default"), ListOptions::default()).await.unwrap();
        assert!(store
            .watch(Some("default"), Selector::default(), Some(listed.resource_version))
            .await
            .is_ok());
    }
}
