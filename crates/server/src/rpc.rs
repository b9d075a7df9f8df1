// crates/server/src/rpc.rs
//! Line-framed JSON-RPC 2.0 over standard streams.
//!
//! One request per line in, one response per line out. Requests dispatch
//! onto a bounded worker pool so a slow git call cannot stall the read
//! loop; responses are funneled through a single writer task so lines
//! never interleave. The `id` round-trips verbatim.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use crate::handlers::{self, RpcFault, PARSE_ERROR};
use crate::state::AppState;

/// Concurrent in-flight handlers.
const POOL_SIZE: usize = 8;
/// Requests admitted beyond the pool before `resource-limit` faults.
const PENDING_CEILING: usize = 128;

#[derive(Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn success_response(id: Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn error_response(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
    .to_string()
}

/// Handle one raw request line and produce one response line.
pub async fn handle_line(state: &AppState, line: &str) -> String {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(_) => return error_response(Value::Null, PARSE_ERROR, "parse error"),
    };

    let id = request.id.unwrap_or(Value::Null);
    let start = Instant::now();
    let result = handlers::dispatch(state, &request.method, request.params).await;
    state
        .metrics
        .record(&request.method, start.elapsed(), result.is_ok());

    match result {
        Ok(value) => success_response(id, value),
        Err(RpcFault { code, message }) => error_response(id, code, &message),
    }
}

/// Serve requests from `reader` until EOF, writing responses to `writer`.
pub async fn serve<R, W>(state: AppState, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(PENDING_CEILING);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let pool = Arc::new(Semaphore::new(POOL_SIZE));
    let pending = Arc::new(Semaphore::new(PENDING_CEILING));

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        // Back-pressure: a burst past the pending ceiling gets a fault
        // instead of unbounded queueing.
        let Ok(admission) = pending.clone().try_acquire_owned() else {
            let id = serde_json::from_str::<RpcRequest>(&line)
                .ok()
                .and_then(|r| r.id)
                .unwrap_or(Value::Null);
            let fault = RpcFault::resource_limit();
            let _ = tx.send(error_response(id, fault.code, &fault.message)).await;
            continue;
        };

        let state = state.clone();
        let tx = tx.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let _admission = admission;
            let Ok(_slot) = pool.acquire().await else {
                return;
            };
            let response = handle_line(&state, &line).await;
            debug!(bytes = response.len(), "rpc response");
            let _ = tx.send(response).await;
        });
    }

    drop(tx);
    let _ = writer_task.await;
    info!("rpc stream closed");
    Ok(())
}
