use crate::chain::consumer::ForcedRollback;
use crate::error::AppError;
use crate::http::{json_line, ndjson_response, AppState, BLOCK_HEADER_HASH_HEADER};
use crate::model::{
    AssetName, Checkpoint, DatumHash, Point, PolicyId, ScriptHash, SortDirection, StatusFlag, TransactionId,
};
use crate::pattern::Pattern;
use crate::storage::ops::{self, MatchFilters};
use crate::storage::checkpoints;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub async fn not_found() -> AppError {
    AppError::NotFound
}

pub async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

/// `GET /health` — negotiated between the Prometheus text exposition and the
/// JSON health object.
pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let accept = headers.get(http::header::ACCEPT).and_then(|value| value.to_str().ok()).unwrap_or("*/*");
    if accept.contains("text/plain") {
        return Ok((
            [(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            state.health.prometheus_text(),
        )
            .into_response());
    }
    if accept.contains("application/json") || accept.contains("*/*") {
        return Ok(Json(state.health.snapshot()).into_response());
    }
    Err(AppError::UnsupportedContentType)
}

/// `GET /checkpoints` — every stored checkpoint, most recent first.
pub async fn list_checkpoints(State(state): State<AppState>) -> Response {
    ndjson_response(&state.storage, |conn: &rusqlite::Connection, yield_row: &mut dyn FnMut(Vec<u8>) -> bool| {
        let mut stmt = conn.prepare("SELECT slot_no, header_hash FROM checkpoints ORDER BY slot_no DESC")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let slot_no: i64 = row.get(0)?;
            let header_hash: Vec<u8> = row.get(1)?;
            match crate::model::HeaderHash::from_slice(&header_hash) {
                None => continue,
                Some(header_hash) => {
                    let checkpoint = Checkpoint { slot_no: slot_no as u64, header_hash };
                    if !yield_row(json_line(&checkpoint)) {
                        break;
                    }
                }
            }
        }
        Ok(())
    })
}

/// `GET /checkpoints/{slot}?strict=` — the checkpoint at the slot, or its
/// closest ancestor; `null` when there is none.
pub async fn checkpoint_by_slot(
    State(state): State<AppState>,
    Path(slot): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let slot_no: u64 = slot.parse().map_err(|_| AppError::InvalidSlotNo)?;
    let strict = match params.get("strict").map(String::as_str) {
        None => false,
        Some("true") => true,
        Some("false") => false,
        Some(_) => return Err(AppError::BadRequest("Invalid 'strict' flag. Expecting 'true' or 'false'.".to_string())),
    };
    let checkpoint = state.storage.read(move |conn| checkpoints::at_slot(conn, slot_no, strict)).await?;
    Ok(Json(checkpoint).into_response())
}

fn pattern_from_segments(prefix: &str, suffix: Option<&str>) -> Result<Pattern, AppError> {
    match suffix {
        None => prefix.parse(),
        Some(suffix) => format!("{}/{}", prefix, suffix).parse(),
    }
}

struct MatchQuery {
    status: StatusFlag,
    sort: SortDirection,
    filters: MatchFilters,
}

fn parse_match_query(params: &HashMap<String, String>) -> Result<MatchQuery, AppError> {
    let mut query = MatchQuery { status: StatusFlag::Any, sort: SortDirection::Desc, filters: MatchFilters::default() };
    for (key, value) in params {
        match key.as_str() {
            "spent" | "unspent" => {
                if query.status != StatusFlag::Any {
                    return Err(AppError::InvalidStatusFlag);
                }
                query.status = if key == "spent" { StatusFlag::OnlySpent } else { StatusFlag::OnlyUnspent };
            }
            "order" => {
                query.sort = match value.as_str() {
                    "asc" => SortDirection::Asc,
                    "desc" => SortDirection::Desc,
                    _ => return Err(AppError::InvalidSortDirection),
                }
            }
            "policy_id" => {
                query.filters.policy_id =
                    Some(value.parse::<PolicyId>().map_err(|_| {
                        AppError::InvalidMatchFilter("'policy_id' must be a 56-character hex digest".to_string())
                    })?)
            }
            "asset_name" => {
                query.filters.asset_name = Some(AssetName(hex::decode(value).map_err(|_| {
                    AppError::InvalidMatchFilter("'asset_name' must be hex-encoded".to_string())
                })?))
            }
            "transaction_id" => {
                query.filters.transaction_id =
                    Some(value.parse::<TransactionId>().map_err(|_| {
                        AppError::InvalidMatchFilter("'transaction_id' must be a 64-character hex digest".to_string())
                    })?)
            }
            "output_index" => {
                query.filters.output_index = Some(value.parse::<u16>().map_err(|_| {
                    AppError::InvalidMatchFilter("'output_index' must be a small non-negative integer".to_string())
                })?)
            }
            other => {
                return Err(AppError::InvalidMatchFilter(format!("unknown query parameter '{}'", other)));
            }
        }
    }
    if query.filters.asset_name.is_some() && query.filters.policy_id.is_none() {
        return Err(AppError::InvalidMatchFilter("'asset_name' requires 'policy_id'".to_string()));
    }
    if query.filters.output_index.is_some() && query.filters.transaction_id.is_none() {
        return Err(AppError::InvalidMatchFilter("'output_index' requires 'transaction_id'".to_string()));
    }
    Ok(query)
}

fn stream_matches(state: &AppState, pattern: Pattern, query: MatchQuery) -> Response {
    ndjson_response(&state.storage, move |conn: &rusqlite::Connection, yield_row: &mut dyn FnMut(Vec<u8>) -> bool| {
        ops::fold_matches(conn, &pattern, query.status, query.sort, &query.filters, &mut |input| {
            yield_row(json_line(&input))
        })
    })
}

/// `GET /matches` and friends — stream every indexed output selected by the
/// path pattern, narrowed by the query parameters.
pub async fn get_all_matches(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let query = parse_match_query(&params)?;
    Ok(stream_matches(&state, Pattern::Any, query))
}

pub async fn get_matches_1(
    State(state): State<AppState>,
    Path(pattern): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&pattern, None)?;
    let query = parse_match_query(&params)?;
    Ok(stream_matches(&state, pattern, query))
}

pub async fn get_matches_2(
    State(state): State<AppState>,
    Path((prefix, suffix)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&prefix, Some(&suffix))?;
    let query = parse_match_query(&params)?;
    Ok(stream_matches(&state, pattern, query))
}

/// `DELETE /matches/{pattern}` — drop indexed rows, refused while any active
/// pattern still covers them.
async fn delete_matches_for(state: AppState, pattern: Pattern, params: HashMap<String, String>) -> Result<Response, AppError> {
    if params.keys().any(|key| key != "spent" && key != "unspent") {
        return Err(AppError::InvalidMatchFilter("only 'spent' or 'unspent' may qualify a deletion".to_string()));
    }
    let query = parse_match_query(&params)?;
    let registered = state.registry.snapshot();
    if pattern.overlaps_any(registered.iter()) {
        return Err(AppError::StillActivePattern);
    }
    let status = query.status;
    let deleted = state.storage.write(move |conn| ops::delete_matches(conn, &pattern, status)).await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

pub async fn delete_matches_1(
    State(state): State<AppState>,
    Path(pattern): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&pattern, None)?;
    delete_matches_for(state, pattern, params).await
}

pub async fn delete_matches_2(
    State(state): State<AppState>,
    Path((prefix, suffix)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&prefix, Some(&suffix))?;
    delete_matches_for(state, pattern, params).await
}

/// `GET /datums/{hash}` — the datum as hex, or `null` when unknown.
pub async fn get_datum(State(state): State<AppState>, Path(hash): Path<String>) -> Result<Response, AppError> {
    let hash: DatumHash = hash.parse().map_err(|_| AppError::MalformedDatumHash)?;
    let datum = state.storage.read(move |conn| ops::get_binary_data(conn, &hash)).await?;
    match datum {
        None => Ok(Json(serde_json::Value::Null).into_response()),
        Some(bytes) => Ok(Json(json!({ "datum": hex::encode(bytes) })).into_response()),
    }
}

/// `GET /scripts/{hash}` — the script with its language tag, or `null`.
pub async fn get_script(State(state): State<AppState>, Path(hash): Path<String>) -> Result<Response, AppError> {
    let hash: ScriptHash = hash.parse().map_err(|_| AppError::MalformedScriptHash)?;
    let script = state.storage.read(move |conn| ops::get_script(conn, &hash)).await?;
    match script {
        None => Ok(Json(serde_json::Value::Null).into_response()),
        Some(script) => {
            Ok(Json(json!({ "language": script.language.as_str(), "script": hex::encode(&script.bytes) }))
                .into_response())
        }
    }
}

/// `GET /metadata/{slot}` — fetch the block at the slot's closest ancestor
/// from the producer and stream its transaction metadata.
pub async fn get_metadata(State(state): State<AppState>, Path(slot): Path<String>) -> Result<Response, AppError> {
    let slot_no: u64 = slot.parse().map_err(|_| AppError::InvalidSlotNo)?;
    let ancestor = state
        .storage
        .read(move |conn| checkpoints::at_slot(conn, slot_no, false))
        .await?
        .ok_or(AppError::NoAncestor)?;
    let block = state.fetch.fetch_block(&ancestor.as_point()).await?.ok_or(AppError::NoAncestor)?;

    let mut lines = Vec::new();
    for tx in &block.transactions {
        if let Some(metadata) = &tx.metadata {
            lines.push(json_line(&json!({ "transaction_id": tx.id, "schema": metadata })));
        }
    }
    let body: Vec<u8> = lines.concat();
    Ok((
        StatusCode::OK,
        [
            (http::header::CONTENT_TYPE.as_str(), "application/json".to_string()),
            (BLOCK_HEADER_HASH_HEADER, block.header_hash.to_string()),
        ],
        body,
    )
        .into_response())
}

fn patterns_as_text<'a, I: IntoIterator<Item = &'a Pattern>>(patterns: I) -> Vec<String> {
    patterns.into_iter().map(Pattern::to_string).collect()
}

/// `GET /patterns` — every active pattern.
pub async fn list_patterns(State(state): State<AppState>) -> Response {
    Json(patterns_as_text(state.registry.snapshot().iter())).into_response()
}

async fn list_patterns_included(state: AppState, pattern: Pattern) -> Response {
    let snapshot = state.registry.snapshot();
    Json(patterns_as_text(snapshot.iter().filter(|registered| pattern.includes(registered)))).into_response()
}

pub async fn list_patterns_1(State(state): State<AppState>, Path(pattern): Path<String>) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&pattern, None)?;
    Ok(list_patterns_included(state, pattern).await)
}

pub async fn list_patterns_2(
    State(state): State<AppState>,
    Path((prefix, suffix)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&prefix, Some(&suffix))?;
    Ok(list_patterns_included(state, pattern).await)
}

#[derive(serde::Deserialize)]
struct PutPatternBody {
    since: serde_json::Value,
    limit: Option<String>,
}

/// How far back a `PUT /patterns` may force the index.
enum RollbackLimit {
    WithinSafeZone,
    Any,
}

/// `PUT /patterns/{pattern}` — activate a pattern after rolling the index
/// back to `since`, so historical matches get re-indexed. A `since` naming a
/// point we never checkpointed is trusted as-is when it stays within the
/// safe zone (it becomes a synthetic checkpoint); going further back
/// requires `limit: "any"`.
async fn put_pattern(state: AppState, pattern: Pattern, body: Bytes) -> Result<Response, AppError> {
    let body: PutPatternBody = serde_json::from_slice(&body).map_err(|_| {
        AppError::BadRequest(
            "Malformed request body. Expecting {\"since\": <point|slot>, \"limit\": \"within_safe_zone\"|\"any\"}."
                .to_string(),
        )
    })?;
    let limit = match body.limit.as_deref() {
        Some("within_safe_zone") => RollbackLimit::WithinSafeZone,
        Some("any") => RollbackLimit::Any,
        _ => {
            return Err(AppError::BadRequest(
                "Missing or invalid 'limit'. Expecting \"within_safe_zone\" or \"any\".".to_string(),
            ))
        }
    };

    let since = resolve_since(&state, &body.since).await?;
    if let RollbackLimit::WithinSafeZone = limit {
        let tip_slot = state.health.most_recent_checkpoint().map(|c| c.slot_no).unwrap_or(0);
        if tip_slot.saturating_sub(since.slot_no()) > state.storage.longest_rollback {
            return Err(AppError::UnsafeRollbackBeyondSafeZone);
        }
    }

    let (reply, done) = oneshot::channel();
    state
        .forced
        .send(ForcedRollback { point: since, pattern, reply })
        .await
        .map_err(|_| AppError::Internal("the chain consumer is not running".to_string()))?;
    match done.await {
        Err(_) => Err(AppError::Internal("the chain consumer dropped the request".to_string())),
        Ok(Err(hint)) => Err(AppError::FailedToRollback(hint)),
        Ok(Ok(_point)) => Ok(Json(patterns_as_text(state.registry.snapshot().iter())).into_response()),
    }
}

/// A numeric `since` must resolve to a known checkpoint (or an ancestor of
/// one); a full point is accepted optimistically even when unknown.
async fn resolve_since(state: &AppState, since: &serde_json::Value) -> Result<Point, AppError> {
    match since {
        serde_json::Value::Number(slot) => {
            let slot_no = slot.as_u64().ok_or(AppError::InvalidSlotNo)?;
            let checkpoint = state.storage.read(move |conn| checkpoints::at_slot(conn, slot_no, false)).await?;
            checkpoint.map(|c| c.as_point()).ok_or(AppError::NonExistingPoint)
        }
        serde_json::Value::String(text) => text.parse::<Point>(),
        serde_json::Value::Object(fields) => {
            let slot_no = fields.get("slot_no").and_then(|v| v.as_u64()).ok_or(AppError::MalformedPoint)?;
            let header_hash = fields
                .get("header_hash")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .ok_or(AppError::MalformedPoint)?;
            Ok(Point::At { slot_no, header_hash })
        }
        _ => Err(AppError::MalformedPoint),
    }
}

pub async fn put_pattern_1(
    State(state): State<AppState>,
    Path(pattern): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&pattern, None)?;
    put_pattern(state, pattern, body).await
}

pub async fn put_pattern_2(
    State(state): State<AppState>,
    Path((prefix, suffix)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&prefix, Some(&suffix))?;
    put_pattern(state, pattern, body).await
}

/// `DELETE /patterns/{pattern}` — deactivate the pattern and everything it
/// includes. Indexed data stays put until garbage collection or an explicit
/// `DELETE /matches`.
async fn delete_pattern(state: AppState, pattern: Pattern) -> Result<Response, AppError> {
    let snapshot = state.registry.snapshot();
    let doomed: Vec<Pattern> =
        snapshot.iter().filter(|registered| pattern.includes(registered)).cloned().collect();
    let persisted = doomed.clone();
    state
        .storage
        .write(move |conn| {
            for pattern in &persisted {
                ops::delete_pattern(conn, pattern)?;
            }
            Ok(())
        })
        .await?;
    for pattern in &doomed {
        state.registry.remove(pattern);
    }
    Ok(Json(json!({ "deleted": doomed.len() })).into_response())
}

pub async fn delete_pattern_1(
    State(state): State<AppState>,
    Path(pattern): Path<String>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&pattern, None)?;
    delete_pattern(state, pattern).await
}

pub async fn delete_pattern_2(
    State(state): State<AppState>,
    Path((prefix, suffix)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let pattern = pattern_from_segments(&prefix, Some(&suffix))?;
    delete_pattern(state, pattern).await
}
