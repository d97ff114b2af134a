//! JSONL framing over the byte stream.
//!
//! One compact JSON object per newline-terminated line, in both directions.
//! Reading yields raw lines; `ClientFrame::from_line` does the typed parse
//! so the dispatcher can distinguish malformed JSON from unknown types.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::DaemonError;

/// Read one line from the stream. `Ok(None)` on EOF.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, DaemonError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

/// Write one frame as compact JSON followed by a newline, then flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(frame)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
