//! The HTTP front of the RPC facade.
//!
//! One POST endpoint; the request body names the method and carries the
//! argument array. Request handling only ever *submits* to the executor -
//! procedure logic never runs on an RPC task beyond waiting for completion.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use herd_types::Error;

use crate::command::CommandRegistry;
use crate::context::NodeContext;
use crate::{RpcRequest, RpcResponse};

#[derive(Clone)]
struct AppState {
    ctx: Arc<NodeContext>,
    registry: Arc<CommandRegistry>,
}

/// Build the RPC router.
pub fn router(ctx: Arc<NodeContext>, registry: Arc<CommandRegistry>) -> Router {
    Router::new()
        .route("/", post(dispatch))
        .with_state(AppState { ctx, registry })
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    let result = state
        .registry
        .dispatch(state.ctx.clone(), &request.method, request.params)
        .await;
    Json(RpcResponse::from_result(
        state.ctx.node_uuid,
        state.ctx.store.version_token(),
        state.ctx.ttl,
        result,
    ))
}

/// Bind `address` and serve until the context's shutdown token fires.
pub async fn serve(
    address: &str,
    ctx: Arc<NodeContext>,
    registry: Arc<CommandRegistry>,
) -> Result<(), Error> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| Error::Config(format!("cannot bind RPC address ({address}): {e}")))?;
    info!(address, "RPC server listening");
    let shutdown = ctx.shutdown.clone();
    axum::serve(listener, router(ctx, registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Procedure(format!("RPC server failed: {e}")))
}
