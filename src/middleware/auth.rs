use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::models::client::ClientId;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_SECRET_HEADER: &str = "x-api-secret";

/// Authenticated caller, injected into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentity {
    pub client_id: ClientId,
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn header_str<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name)?.to_str().ok()
}

/// Middleware that validates the Admin Key from env config.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let valid = extract_bearer(&req)
        .is_some_and(|t| bool::from(t.as_bytes().ct_eq(state.config.admin_key.as_bytes())));
    if !valid {
        return AppError::Unauthenticated.into_response();
    }

    next.run(req).await
}

/// Middleware that resolves `x-api-key` / `x-api-secret` to an active client.
pub async fn client_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let client_id = match state.credentials.authenticate(
        header_str(&req, API_KEY_HEADER),
        header_str(&req, API_SECRET_HEADER),
    ) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    req.extensions_mut().insert(ClientIdentity { client_id });
    next.run(req).await
}
