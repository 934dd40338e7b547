pub mod admin;
pub mod capability;

use std::sync::Arc;

use axum::{middleware as axum_mw, Router};

use crate::middleware::auth;
use crate::state::AppState;

/// All gateway routes with their auth layers, without transport layers.
pub fn app(state: Arc<AppState>) -> Router {
    let admin_routes = admin::router().route_layer(axum_mw::from_fn_with_state(
        state.clone(),
        auth::admin_auth,
    ));

    let capability_routes = capability::router().route_layer(axum_mw::from_fn_with_state(
        state.clone(),
        auth::client_auth,
    ));

    Router::new()
        .nest("/admin", admin_routes)
        .merge(capability_routes)
        .with_state(state)
}
