// The `{ok, error?, data?}` response envelope (spec §6 HTTP API), built
// over `orbit_base::DomainError` (spec §7: Validation, NotFound,
// Forbidden, Conflict, TransientExternal, PermanentExternal, Internal).
// `ApiError` exists only because axum's `IntoResponse` and
// `orbit_base::DomainError` are both foreign to this crate — the
// orphan rule blocks implementing one for the other directly, so this
// is the thinnest wrapper that lets a handler still write
// `DomainError::Validation(...)` and have it "just work" through `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orbit_base::DomainError;
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        ApiError(e)
    }
}

/// Classifies a store/channel failure using the `ErrorKind` it was
/// constructed with, rather than collapsing every failure to
/// `Internal`: a lookup miss (`update_node` on an unregistered node)
/// maps to 404, a queue at capacity maps to 409, anything else is 500.
impl From<orbit_base::error::Error> for ApiError {
    fn from(e: orbit_base::error::Error) -> Self {
        let domain = if e.is_not_found() {
            DomainError::NotFound(format!("{e:?}"))
        } else if e.is_conflict() {
            DomainError::Conflict(format!("{e:?}"))
        } else {
            DomainError::Internal(format!("{e:?}"))
        };
        ApiError(domain)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

pub type ApiResult<T> = Result<Data<T>, ApiError>;

/// Wraps a successful payload so `IntoResponse` can emit the envelope
/// with `ok: true` and no status-code juggling at each call site.
pub struct Data<T>(pub T);

impl<T: Serialize> IntoResponse for Data<T> {
    fn into_response(self) -> Response {
        Json(Envelope {
            ok: true,
            error: None,
            data: Some(self.0),
        })
        .into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Envelope::<()> {
            ok: false,
            error: Some(ErrorBody {
                code: self.0.code(),
                message: self.0.to_string(),
            }),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}
