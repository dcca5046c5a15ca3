use kiln_rpc::parse_params;
use kiln_rpc::protocol::{BoardListParams, BoardListResult, InstanceParams, RequestId, Response};
use kiln_types::BoardDelta;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{HandlerContext, Reply};
use crate::error::{DaemonError, Result};
use crate::session::{Connection, StreamEntry, StreamInput};

/// One-shot listing. Enumeration runs off the connection's read loop so a
/// slow scan does not hold up frames for other streams.
pub fn handle_board_list(
    ctx: &HandlerContext,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<Reply> {
    let params: BoardListParams = parse_params(params)?;
    let state = ctx.state.clone();
    let conn = ctx.conn.clone();
    let id = id.clone();

    tokio::spawn(async move {
        let response = match state
            .core
            .board_list(params.instance, params.timeout_ms)
            .await
        {
            Ok(ports) => match serde_json::to_value(BoardListResult { ports }) {
                Ok(result) => Response::success(id, result),
                Err(e) => Response::error(id, DaemonError::from(e).into()),
            },
            Err(e) => {
                debug!("[{}] board_list failed: {}", conn.id, e);
                Response::error(id, DaemonError::from(e).into())
            }
        };
        conn.respond(response);
    });
    Ok(Reply::Sent)
}

pub async fn handle_board_list_watch(
    ctx: &HandlerContext,
    id: &RequestId,
    params: Option<&Value>,
) -> Result<Reply> {
    let params: InstanceParams = parse_params(params)?;
    let deltas = ctx.state.core.board_list_watch(params.instance).await?;
    let stop = CancellationToken::new();
    ctx.conn
        .open_stream(id.clone(), StreamEntry::new(stop.clone(), StreamInput::Watch))
        .await?;

    ctx.confirm_stream(id)?;
    tokio::spawn(forward_deltas(ctx.conn.clone(), id.clone(), deltas, stop));
    Ok(Reply::Sent)
}

/// Dropping `deltas` on the way out stops the core's poller.
async fn forward_deltas(
    conn: Connection,
    stream: RequestId,
    mut deltas: mpsc::Receiver<BoardDelta>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => {
                debug!("[{}] Watch {} stopped", conn.id, stream);
                break;
            }
            delta = deltas.recv() => match delta {
                Some(delta) => {
                    if !conn.send_item(&stream, &delta) {
                        break;
                    }
                }
                None => {
                    debug!("[{}] Watch {} ended with its instance", conn.id, stream);
                    break;
                }
            }
        }
    }
    drop(deltas);
    conn.end_stream(&stream, None).await;
}
