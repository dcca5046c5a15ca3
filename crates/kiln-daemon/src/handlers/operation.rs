//! `init`, `platform_install` and `compile`: one progress stream each.

use kiln_core::operation::{
    CompileRequest, InitRequest, Operation, OperationDescriptor, OperationEnd, OperationHandle,
    PlatformInstallRequest,
};
use kiln_rpc::parse_params;
use kiln_rpc::protocol::{
    CompileParams, InitParams, PlatformInstallParams, RequestId, RpcError,
};
use serde_json::Value;
use tracing::debug;

use super::{HandlerContext, Reply};
use crate::error::Result;
use crate::session::{Connection, StreamEntry, StreamInput};

pub async fn handle_init(
    ctx: &HandlerContext,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<Reply> {
    let params: InitParams = parse_params(params)?;
    start(
        ctx,
        id,
        OperationDescriptor {
            instance: params.instance,
            operation: Operation::Init(InitRequest {
                sketch_path: params.sketch_path,
                profile: params.profile,
            }),
        },
    )
    .await
}

pub async fn handle_platform_install(
    ctx: &HandlerContext,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<Reply> {
    let params: PlatformInstallParams = parse_params(params)?;
    start(
        ctx,
        id,
        OperationDescriptor {
            instance: params.instance,
            operation: Operation::PlatformInstall(PlatformInstallRequest {
                packager: params.platform_package,
                architecture: params.architecture,
                version: params.version,
                skip_post_install: params.skip_post_install,
            }),
        },
    )
    .await
}

pub async fn handle_compile(
    ctx: &HandlerContext,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<Reply> {
    let params: CompileParams = parse_params(params)?;
    start(
        ctx,
        id,
        OperationDescriptor {
            instance: params.instance,
            operation: Operation::Compile(CompileRequest {
                fqbn: params.fqbn,
                sketch_path: params.sketch_path,
                build_path: params.build_path,
                verbose: params.verbose,
            }),
        },
    )
    .await
}

async fn start(
    ctx: &HandlerContext,
    stream: &RequestId,
    descriptor: OperationDescriptor,
) -> Result<Reply> {
    let handle = ctx.state.core.start_operation(descriptor).await?;
    let entry = StreamEntry::new(handle.cancel_token(), StreamInput::None);
    if let Err(e) = ctx.conn.open_stream(stream.clone(), entry).await {
        handle.cancel();
        return Err(e);
    }

    ctx.confirm_stream(stream)?;
    tokio::spawn(forward_events(ctx.conn.clone(), stream.clone(), handle));
    Ok(Reply::Sent)
}

/// Forward progress events as stream items, then end the stream.
///
/// An operation that stopped without a terminal event ends its stream with
/// `TRANSPORT_CLOSED`, so clients never mistake it for success.
async fn forward_events(conn: Connection, stream: RequestId, mut handle: OperationHandle) {
    while let Some(event) = handle.events.recv().await {
        if !conn.send_item(&stream, &event) {
            handle.cancel();
            break;
        }
    }

    let error = match handle.finish().await {
        OperationEnd::Completed | OperationEnd::Failed(_) => None,
        OperationEnd::Cancelled => Some(RpcError::transport_closed("Operation cancelled")),
        OperationEnd::Aborted(reason) => Some(RpcError::transport_closed(reason)),
    };
    debug!("[{}] Operation stream {} finished", conn.id, stream);
    conn.end_stream(&stream, error).await;
}
