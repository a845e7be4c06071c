// REST endpoints that sit next to the GraphQL API
// POST /command hands a single command to the next job worker

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::{routing::post, Router};

use crate::engine::dispatcher::Dispatcher;

pub use handlers::run_command;
pub use types::{ErrorDetail, ErrorResponse};

/// Routes served by this module, ready to merge into the main router
pub fn routes<S>(dispatcher: Arc<Dispatcher>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/command", post(run_command))
        .with_state(dispatcher)
}
