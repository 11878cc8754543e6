// =============================================================================
// API Error Taxonomy
// =============================================================================
//
// The visible error kinds and their HTTP mappings:
//   Unauthorized 401 · BadRequest 400 · Validation 422 · Conflict 409 ·
//   NotFound 404 · Transient 500
//
// Transactional units either commit fully or roll back, so a Transient never
// leaves partial state behind and is always retry-safe.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug)]
pub enum ApiError {
    /// Missing/invalid signature or admin key.
    Unauthorized(String),
    /// Schema parses but semantics fail (unknown symbol, weight sum).
    BadRequest(String),
    /// The schema itself fails (parse error, range violation).
    Validation(String),
    /// Duplicate create; already-decided audit.
    Conflict(String),
    /// Unknown audit/order/symbol on read.
    NotFound(String),
    /// Persistence or downstream call failed; retry-safe.
    Transient(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient",
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Unauthorized(d)
            | Self::BadRequest(d)
            | Self::Validation(d)
            | Self::Conflict(d)
            | Self::NotFound(d) => d.clone(),
            Self::Transient(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "error": self.kind(),
            "detail": self.detail(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(e)
    }
}
