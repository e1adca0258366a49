//! Delta record handlers: CRUD, list, watch and the enrichment subresource.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::bitmap::ChangedBlocksBitmap;
use crate::error::{DeltaError, DeltaResult, ErrorCode};
use crate::models::{DeltaRecord, EnrichOptions, EnrichedDeltaView};
use crate::router::AppState;
use crate::store::{ListOptions, Preconditions, Selector, WatchSubscription};

use super::json_response;

/// POST /namespaces/{ns}/deltas - Create a delta record.
pub async fn create_delta(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    axum::Json(mut record): axum::Json<DeltaRecord>,
) -> DeltaResult<Response> {
    if !record.namespace.is_empty() && record.namespace != namespace {
        return Err(DeltaError::with_message(
            ErrorCode::InvalidInput,
            "record namespace does not match the request path",
        ));
    }
    record.namespace = namespace;
    record.validate()?;

    let stored = state.store.create(record).await?;
    info!(namespace = %stored.namespace, name = %stored.name, "created delta record");
    Ok(json_response(StatusCode::CREATED, &stored))
}

/// GET /namespaces/{ns}/deltas/{name} - Get a delta record.
pub async fn get_delta(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> DeltaResult<Response> {
    let record = state.store.get(&namespace, &name).await?;
    Ok(json_response(StatusCode::OK, &record))
}

/// PUT /namespaces/{ns}/deltas/{name} - Update a delta record.
///
/// The submitted record's uid and resourceVersion, when set, act as
/// preconditions for the write.
pub async fn update_delta(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    axum::Json(mut submitted): axum::Json<DeltaRecord>,
) -> DeltaResult<Response> {
    if submitted.name != name {
        return Err(DeltaError::with_message(
            ErrorCode::InvalidInput,
            "record name does not match the request path",
        ));
    }
    if !submitted.namespace.is_empty() && submitted.namespace != namespace {
        return Err(DeltaError::with_message(
            ErrorCode::InvalidInput,
            "record namespace does not match the request path",
        ));
    }
    submitted.namespace = namespace.clone();
    submitted.validate()?;

    let preconditions = Preconditions {
        uid: (!submitted.uid.is_empty()).then(|| submitted.uid.clone()),
        resource_version: (submitted.resource_version != 0)
            .then_some(submitted.resource_version),
    };

    let updated = state
        .store
        .update(&namespace, &name, preconditions, &move |_current| {
            Ok(submitted.clone())
        })
        .await?;
    info!(
        namespace = %updated.namespace,
        name = %updated.name,
        resource_version = updated.resource_version,
        "updated delta record"
    );
    Ok(json_response(StatusCode::OK, &updated))
}

/// DELETE /namespaces/{ns}/deltas/{name} - Delete a delta record.
///
/// Optional `uid` and `resourceVersion` query parameters guard the delete.
pub async fn delete_delta(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> DeltaResult<Response> {
    let resource_version = match query.get("resourceVersion") {
        Some(raw) => Some(raw.parse().map_err(|_| {
            DeltaError::with_message(
                ErrorCode::InvalidInput,
                "resourceVersion precondition must be an unsigned integer",
            )
        })?),
        None => None,
    };
    let preconditions = Preconditions {
        uid: query.get("uid").cloned(),
        resource_version,
    };

    let deleted = state.store.delete(&namespace, &name, preconditions).await?;
    info!(namespace = %namespace, name = %name, "deleted delta record");
    Ok(json_response(StatusCode::OK, &deleted))
}

/// GET /namespaces/{ns}/deltas - List or watch delta records.
pub async fn list_deltas(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> DeltaResult<Response> {
    list_or_watch(state, Some(namespace), query).await
}

/// GET /deltas - List or watch delta records across all namespaces.
pub async fn list_all_deltas(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> DeltaResult<Response> {
    list_or_watch(state, None, query).await
}

async fn list_or_watch(
    state: AppState,
    namespace: Option<String>,
    query: HashMap<String, String>,
) -> DeltaResult<Response> {
    let selector = Selector::parse(
        query.get("labelSelector").map(String::as_str),
        query.get("fieldSelector").map(String::as_str),
    )?;

    if query.get("watch").map(String::as_str) == Some("true") {
        let start_revision = match query.get("resourceVersion") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                DeltaError::with_message(
                    ErrorCode::InvalidInput,
                    "resourceVersion must be an unsigned integer",
                )
            })?),
            None => None,
        };
        let subscription = state
            .store
            .watch(namespace.as_deref(), selector, start_revision)
            .await?;
        return watch_response(subscription);
    }

    let options = ListOptions {
        selector,
        limit: query.get("limit").and_then(|v| v.parse().ok()),
        continue_token: query.get("continue").cloned(),
    };
    let listed = state.store.list(namespace.as_deref(), options).await?;
    Ok(json_response(StatusCode::OK, &listed))
}

/// Streams watch events as newline-delimited JSON.
fn watch_response(subscription: WatchSubscription) -> DeltaResult<Response> {
    let stream = futures::stream::unfold(Some(subscription), |sub| async move {
        let mut sub = sub?;
        match sub.recv().await {
            Ok(Some(event)) => match serde_json::to_vec(&event) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some((Ok(Bytes::from(line)), Some(sub)))
                }
                Err(e) => Some((
                    Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                    None,
                )),
            },
            Ok(None) => None,
            // The subscriber fell behind; end the stream so the client
            // re-lists rather than missing events silently.
            Err(e) => Some((
                Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
                None,
            )),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from_stream(stream))
        .map_err(|e| DeltaError::with_message(ErrorCode::InternalError, e.to_string()))
}

/// GET /namespaces/{ns}/deltas/{name}/changedblocks - Enrichment subresource.
///
/// Without `fetchcbd=true` the stored record is returned verbatim. With it,
/// the driver backend is asked for the changed blocks and the response is a
/// live combined view; nothing is persisted. `packed=true` additionally
/// returns the fetched entries as a bit-packed bitmap envelope.
pub async fn enrich_delta(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> DeltaResult<Response> {
    let options = EnrichOptions::from_query(&query);
    let record = state.store.get(&namespace, &name).await?;

    if !options.fetch_changed_blocks {
        let view = EnrichedDeltaView {
            record,
            volume_size_bytes: None,
            next_token: None,
        };
        return Ok(json_response(StatusCode::OK, &view));
    }

    if record.driver_name.is_empty() {
        return Err(DeltaError::with_message(
            ErrorCode::InvalidInput,
            "record does not name a storage driver to fetch changed blocks from",
        ));
    }

    let endpoint = state.registry.resolve(&record.driver_name).await?;
    let fetched = state
        .proxy
        .fetch_changed_blocks(
            &endpoint,
            &record.target_snapshot_name,
            &record.base_snapshot_name,
            options.limit,
            options.offset,
        )
        .await
        .map_err(|e| {
            warn!(
                namespace = %namespace,
                name = %name,
                driver = %record.driver_name,
                error = %e,
                "enrichment fetch failed"
            );
            e
        })?;

    if query.get("packed").map(String::as_str) == Some("true") {
        let volume_size = fetched.volume_size_bytes.ok_or_else(|| {
            DeltaError::with_message(
                ErrorCode::InvalidInput,
                "backend did not report a volume size; packed view unavailable",
            )
        })?;
        let block_size = fetched
            .entries
            .first()
            .map(|e| e.block_size_bytes)
            .ok_or_else(|| {
                DeltaError::with_message(
                    ErrorCode::InvalidInput,
                    "no changed blocks; packed view unavailable",
                )
            })?;
        let bitmap =
            ChangedBlocksBitmap::from_entries(&fetched.entries, block_size, volume_size)?;
        return Ok(json_response(StatusCode::OK, &bitmap));
    }

    let mut enriched = record;
    enriched.changed_blocks = fetched.entries;
    let view = EnrichedDeltaView {
        record: enriched,
        volume_size_bytes: fetched.volume_size_bytes,
        next_token: fetched.next_token,
    };
    Ok(json_response(StatusCode::OK, &view))
}
