//! HTTP endpoint handlers serving a revision store to replicating peers.
//!
//! Endpoints (relative to any base path, e.g. `/todo`):
//!   GET  {base}/info        → store identity & newest sequence
//!   GET  {base}/changes     → change feed slice (since/limit query params)
//!   POST {base}/revisions   → accept a pushed batch

use base64::Engine;
use bytes::Bytes;
use cakedb_core::replication::DEFAULT_BATCH_SIZE;
use cakedb_core::transport::{accept_push, read_changes, store_info};
use cakedb_core::{CakeError, PushRequest, SqliteRevisionStore};
use http_body_util::Full;
use sha2::{Digest, Sha256};
use hyper::header::{CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;

/// Credentials a peer must present as HTTP basic auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAuth {
    pub user: String,
    pub password: String,
}

impl PeerAuth {
    /// Parse `user:password`.
    pub fn parse(credentials: &str) -> Option<Self> {
        let (user, password) = credentials.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Check an `Authorization` header value.
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let expected = format!("{}:{}", self.user, self.password);
        digests_match(&decoded, expected.as_bytes())
    }
}

/// Compare two secrets through their SHA-256 digests without an early exit.
fn digests_match(a: &[u8], b: &[u8]) -> bool {
    let (a, b) = (Sha256::digest(a), Sha256::digest(b));
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Route a peer request to the appropriate handler.
/// The last path segment selects the endpoint.
pub async fn handle_peer_request(
    path: &str,
    method: &str,
    authorization: Option<&str>,
    body: &[u8],
    query: &str,
    store: &Arc<SqliteRevisionStore>,
    auth: Option<&PeerAuth>,
) -> Response<Full<Bytes>> {
    if let Some(auth) = auth {
        if !auth.verify(authorization) {
            let mut resp = json_error(401, "Authentication required");
            resp.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"cakedb\""),
            );
            return resp;
        }
    }

    let endpoint = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    match (method, endpoint) {
        ("GET", "info") => handle_info(store).await,
        ("GET", "changes") => handle_changes(store, query).await,
        ("POST", "revisions") => handle_push(store, body).await,
        _ => json_error(404, &format!("Unknown peer endpoint: {} {}", method, path)),
    }
}

// GET {base}/info

async fn handle_info(store: &Arc<SqliteRevisionStore>) -> Response<Full<Bytes>> {
    match store_info(store.as_ref()).await {
        Ok(info) => json_ok(&info),
        Err(e) => store_error(e),
    }
}

// GET {base}/changes?since=N&limit=M

async fn handle_changes(store: &Arc<SqliteRevisionStore>, query: &str) -> Response<Full<Bytes>> {
    let params = parse_query(query);
    let since: u64 = match params.get("since").map(|v| v.parse()) {
        None => 0,
        Some(Ok(v)) => v,
        Some(Err(_)) => return json_error(400, "since must be a non-negative integer"),
    };
    let limit: usize = match params.get("limit").map(|v| v.parse()) {
        None => DEFAULT_BATCH_SIZE,
        Some(Ok(v)) if v > 0 => v,
        Some(_) => return json_error(400, "limit must be a positive integer"),
    };

    match read_changes(store.as_ref(), since, limit).await {
        Ok(batch) => {
            tracing::debug!(since, count = batch.revisions.len(), "Serving changes");
            json_ok(&batch)
        }
        Err(e) => store_error(e),
    }
}

// POST {base}/revisions

async fn handle_push(store: &Arc<SqliteRevisionStore>, body: &[u8]) -> Response<Full<Bytes>> {
    let request: PushRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return json_error(400, &format!("Invalid push body: {}", e)),
    };

    match accept_push(store.as_ref(), &request).await {
        Ok(result) => {
            tracing::debug!(accepted = result.accepted, ignored = result.ignored, "Accepted push");
            json_ok(&result)
        }
        Err(e) => store_error(e),
    }
}

fn store_error(e: CakeError) -> Response<Full<Bytes>> {
    match e {
        CakeError::InvalidRevision(msg) => json_error(400, &msg),
        CakeError::Closed => json_error(503, "Store is closed"),
        other => {
            tracing::error!("Peer store error: {}", other);
            json_error(500, &other.to_string())
        }
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(urldecode(k), urldecode(v));
        }
    }
    map
}

/// Minimal URL percent-decoding.
fn urldecode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let hi = bytes.next().unwrap_or(b'0');
                let lo = bytes.next().unwrap_or(b'0');
                out.push(hex_val(hi) << 4 | hex_val(lo));
            }
            b'+' => out.push(b' '),
            _ => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

fn json_response(status: u16, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn json_ok<T: serde::Serialize>(data: &T) -> Response<Full<Bytes>> {
    json_response(200, serde_json::to_vec(data).unwrap_or_default())
}

pub fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    #[derive(serde::Serialize)]
    struct ErrorBody {
        error: String,
    }
    let body = serde_json::to_vec(&ErrorBody {
        error: message.to_string(),
    })
    .unwrap_or_default();
    json_response(status, body)
}
