// Auth extraction at the HTTP boundary (spec §6.1, SPEC_FULL §6.1): a
// thin extractor that turns the `Authorization` header into a
// `Principal` once, so handlers never touch the raw header. Real
// bearer-token verification is out of scope; this accepts the
// non-production `Bearer <user_id>:<wallet>` stub spec.md names.
// Node-originated requests instead carry an HMAC signature, verified
// against the node's shared secret by `verify_node_signature` below.

use crate::http::envelope::ApiError;
use crate::Server;
use axum::async_trait;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use orbit_auth::Principal;
use orbit_base::DomainError;

/// Newtype so the extractor impl stays local (axum's `FromRequestParts`
/// and `orbit_auth::Principal` are both foreign to this crate).
/// Handlers take this and immediately destructure it.
pub struct AuthPrincipal(pub Principal);

#[async_trait]
impl FromRequestParts<Server> for AuthPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &Server) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DomainError::Forbidden("missing Authorization header".into()))?;
        Principal::from_bearer(header)
            .map(AuthPrincipal)
            .map_err(|e| ApiError::from(DomainError::Forbidden(format!("{e:?}"))))
    }
}

/// Verify a node-originated request's HMAC signature against the
/// timestamp/signature headers spec §6 names (`X-Orbit-Timestamp`,
/// `X-Orbit-Signature`), over the exact bytes the node signed.
pub fn verify_node_signature(
    server: &Server,
    method: &str,
    path: &str,
    headers: &axum::http::HeaderMap,
    body: &[u8],
) -> Result<(), ApiError> {
    let timestamp: i64 = headers
        .get("X-Orbit-Timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| DomainError::Forbidden("missing or malformed X-Orbit-Timestamp".into()))?;
    let signature = headers
        .get("X-Orbit-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DomainError::Forbidden("missing X-Orbit-Signature".into()))?;
    orbit_auth::verify(&server.node_secret, method, path, timestamp, body, signature, chrono::Utc::now())
        .map_err(|e| ApiError::from(DomainError::Forbidden(format!("{e:?}"))))
}

/// Pulled apart just far enough to hand handlers the method/path/body
/// bytes they need to re-verify a node signature without consuming the
/// body twice.
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub headers: axum::http::HeaderMap,
    pub body: axum::body::Bytes,
}

pub async fn extract_raw(request: Request) -> Result<RawRequest, ApiError> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| DomainError::Validation(format!("reading request body: {e}")))?;
    Ok(RawRequest { method, path, headers, body })
}
