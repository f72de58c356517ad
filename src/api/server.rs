use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ApiError, ApiRequest, ApiResponse, FurnaceApi};

/// One request line. `id` is echoed back so callers can match replies,
/// which may arrive out of order.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: ApiRequest,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(flatten)]
    response: ApiResponse,
}

impl FurnaceApi {
    /// Handles one JSON request line and returns the JSON reply line.
    pub async fn handle_line(&self, line: &str) -> String {
        let reply = match serde_json::from_str::<RequestEnvelope>(line) {
            Ok(envelope) => ResponseEnvelope {
                id: envelope.id,
                response: self.handle(envelope.request).await,
            },
            Err(e) => ResponseEnvelope {
                id: serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned()),
                response: ApiResponse::Error {
                    error: ApiError::invalid_request(e.to_string()),
                },
            },
        };

        serde_json::to_string(&reply).unwrap_or_else(|e| {
            serde_json::json!({
                "type": "error",
                "error": {"kind": "internal", "message": e.to_string()}
            })
            .to_string()
        })
    }
}

/// Serves newline-delimited JSON requests until `reader` is exhausted and
/// every reply is written. Requests run concurrently, so a
/// `recipe_cancel` can reach a `recipe_start` that is still waiting.
pub async fn serve_lines<R, W>(api: FurnaceApi, reader: R, mut writer: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (replies_tx, mut replies) = mpsc::unbounded_channel::<String>();
    let mut lines = reader.lines();
    let mut input_open = true;
    let mut in_flight = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    in_flight += 1;
                    let api = api.clone();
                    let replies_tx = replies_tx.clone();
                    tokio::spawn(async move {
                        let reply = api.handle_line(&line).await;
                        let _ = replies_tx.send(reply);
                    });
                }
                None => {
                    debug!("API input closed, {} request(s) still running", in_flight);
                    input_open = false;
                }
            },
            Some(reply) = replies.recv(), if in_flight > 0 => {
                in_flight -= 1;
                writer.write_all(reply.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            },
            else => break,
        }
    }

    Ok(())
}

pub async fn serve_stdio(api: FurnaceApi) -> io::Result<()> {
    info!("Serving the furnace API on stdin/stdout");
    serve_lines(api, BufReader::new(io::stdin()), io::stdout()).await
}
