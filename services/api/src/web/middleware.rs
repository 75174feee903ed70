//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::web::state::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
pub const INSTRUCTOR_ID_HEADER: &str = "x-instructor-id";

/// The authenticated instructor, inserted into request extensions by
/// [`require_instructor`].
#[derive(Debug, Clone, Copy)]
pub struct InstructorId(pub Uuid);

/// Middleware that admits a request only if it carries the configured admin token.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !constant_time_eq(token.as_bytes(), state.config.admin_token.as_bytes()) {
        warn!(path = %req.uri().path(), "Rejected admin request with a wrong token");
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(next.run(req).await)
}

/// Middleware that extracts the calling instructor's id.
///
/// If valid, inserts an [`InstructorId`] into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_instructor(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let instructor_id = req
        .headers()
        .get(INSTRUCTOR_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(InstructorId(instructor_id));
    Ok(next.run(req).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
