//! JSON Lines transport over a byte stream pair, usually stdin/stdout.
//!
//! Requests are read one line at a time and dispatched in arrival order.
//! Responses go through a channel to a dedicated writer task, so a slow
//! consumer never stalls request parsing.

use session_broker_core::SessionStorage;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    dispatch::ToolDispatcher,
    protocol::{ProtocolError, ToolResponse},
};

/// Serve requests from `reader` until end of input, writing responses to
/// `writer`.
///
/// # Errors
/// Returns error if reading requests or writing responses fails.
pub async fn serve<S, R, W>(
    dispatcher: ToolDispatcher<S>,
    reader: R,
    mut writer: W,
) -> Result<(), ProtocolError>
where
    S: SessionStorage + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ToolResponse>();

    let send_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_vec(&response) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to serialize response: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    let mut handled = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatcher.handle_line(&line).await;
        handled += 1;
        if tx.send(response).is_err() {
            tracing::warn!("Response writer closed, stopping");
            break;
        }
    }
    drop(tx);

    tracing::info!(requests = handled, "Input closed");
    send_task
        .await
        .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))??;
    Ok(())
}
