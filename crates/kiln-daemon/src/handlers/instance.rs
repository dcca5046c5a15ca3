use kiln_rpc::protocol::{CreateInstanceResult, InstanceParams, StatusResult};
use kiln_rpc::parse_params;
use serde_json::{Value, json};
use tracing::info;

use super::{HandlerContext, Reply};
use crate::error::Result;

pub async fn handle_create(ctx: &HandlerContext) -> Result<Reply> {
    let instance = ctx.state.core.create_instance().await;
    info!("[{}] Created instance {}", ctx.conn.id, instance);
    Ok(Reply::Value(serde_json::to_value(CreateInstanceResult {
        instance,
    })?))
}

pub async fn handle_destroy(ctx: &HandlerContext, params: Option<&Value>) -> Result<Reply> {
    let params: InstanceParams = parse_params(params)?;
    ctx.state.core.destroy_instance(params.instance).await?;
    info!("[{}] Destroyed instance {}", ctx.conn.id, params.instance);
    Ok(Reply::Value(json!({})))
}

pub async fn handle_status(ctx: &HandlerContext) -> Result<Reply> {
    let status = StatusResult {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instances: ctx.state.core.instances().await,
        connections: ctx.state.connection_count(),
    };
    Ok(Reply::Value(serde_json::to_value(status)?))
}

pub fn handle_shutdown(ctx: &HandlerContext) -> Reply {
    info!("[{}] Shutdown requested", ctx.conn.id);
    ctx.state.request_shutdown();
    Reply::Value(json!({}))
}
