//! Per-client connection task.
//!
//! Reads newline-delimited JSON frames, enforces the rate limit, and forwards
//! decoded frames to the game loop as intents. Outbound lines arrive on the
//! session's bounded write queue and are written here in order.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::session::Session;
use crate::error::ProtocolError;
use crate::game::Intent;
use crate::protocol::{decode_frame, error_envelope};
use crate::services::Services;

/// Handle one client from accept to close.
pub async fn handle(stream: TcpStream, services: Arc<Services>) -> Result<()> {
    let remote = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();

    let (session, mut outbound) = match services.sessions.create(remote) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!("Rejected connection from {}: {}", remote, e);
            let mut line = serde_json::to_string(&error_envelope(&e))?;
            line.push('\n');
            write.write_all(line.as_bytes()).await?;
            write.shutdown().await?;
            return Ok(());
        }
    };
    let id = session.id();
    tracing::info!("Session {} opened from {}", id, remote);

    let result = pump(&session, &services, read, &mut write, &mut outbound).await;

    services.sessions.remove(id);
    let _ = services.intents.send(Intent::Disconnected { session_id: id }).await;
    let _ = write.shutdown().await;
    tracing::info!(
        "Session {} closed ({})",
        id,
        session.close_reason().unwrap_or_else(|| "peer disconnected".into())
    );
    result
}

async fn pump(
    session: &Arc<Session>,
    services: &Services,
    read: tokio::net::tcp::OwnedReadHalf,
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    outbound: &mut mpsc::Receiver<String>,
) -> Result<()> {
    let mut frames = FrameReader::new(read, services.config.server.max_frame_bytes);
    loop {
        tokio::select! {
            frame = frames.next_frame() => {
                match frame? {
                    ReadFrame::Line(line) => inbound(session, services, &line).await,
                    ReadFrame::Oversized => oversized(session, services),
                    ReadFrame::Eof => break,
                }
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                write_line(session, services, write, &msg).await?;
            }
            _ = session.closed() => {
                // Whatever was queued before the close (error, notice) still goes out.
                while let Ok(msg) = outbound.try_recv() {
                    write_line(session, services, write, &msg).await?;
                }
                write.flush().await?;
                break;
            }
        }
    }
    Ok(())
}

// ── Framing ─────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum ReadFrame {
    Line(String),
    /// A line longer than the limit; its bytes are skipped up to the next newline.
    Oversized,
    Eof,
}

/// Newline framing with a hard cap on line length.
///
/// Partial reads stay in `buf`, so `next_frame` can be raced in `select!`.
struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(read: R, max: usize) -> Self {
        Self { inner: BufReader::new(read), buf: Vec::new(), max: max.max(1), discarding: false }
    }

    async fn next_frame(&mut self) -> std::io::Result<ReadFrame> {
        loop {
            let room = (self.max + 1).saturating_sub(self.buf.len());
            let n = if room == 0 {
                0
            } else {
                (&mut self.inner).take(room as u64).read_until(b'\n', &mut self.buf).await?
            };

            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                let line = std::mem::take(&mut self.buf);
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                return Ok(ReadFrame::Line(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.buf.len() > self.max {
                self.buf.clear();
                if !self.discarding {
                    self.discarding = true;
                    return Ok(ReadFrame::Oversized);
                }
                continue;
            }
            if n == 0 {
                return Ok(ReadFrame::Eof);
            }
        }
    }
}

fn oversized(session: &Session, services: &Services) {
    tracing::debug!("Session {} sent a frame over {} bytes", session.id(), services.config.server.max_frame_bytes);
    session.touch();
    services.metrics.protocol_error();
    session.send(&error_envelope(&ProtocolError::bad_request("Frame too large")));
    session.record_violation();
}

async fn write_line(
    session: &Session,
    services: &Services,
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    msg: &str,
) -> Result<()> {
    write.write_all(msg.as_bytes()).await?;
    session.note_sent(msg.len());
    services.metrics.frame_out(msg.len());
    Ok(())
}

async fn inbound(session: &Arc<Session>, services: &Services, line: &str) {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return;
    }
    session.touch();
    session.note_received(line.len() + 1);
    services.metrics.frame_in(line.len() + 1);

    if !session.try_consume() {
        services.metrics.rate_limited();
        session.send(&error_envelope(&ProtocolError::rate_limited()));
        session.record_violation();
        return;
    }
    match decode_frame(line) {
        Ok(frame) => {
            if services.intents.send(Intent::Frame { session_id: session.id(), frame }).await.is_err() {
                session.close("server stopping");
            }
        }
        Err(e) => {
            services.metrics.protocol_error();
            session.send(&error_envelope(&e));
            session.record_violation();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &'static [u8], max: usize) -> Vec<ReadFrame> {
        let mut reader = FrameReader::new(input, max);
        let mut out = Vec::new();
        loop {
            let frame = reader.next_frame().await.unwrap();
            if frame == ReadFrame::Eof {
                return out;
            }
            out.push(frame);
        }
    }

    #[tokio::test]
    async fn splits_lines_up_to_the_limit() {
        let frames = collect(b"{\"a\":1}\n\nabcdefgh\n", 8).await;
        assert_eq!(
            frames,
            vec![ReadFrame::Line("{\"a\":1}".into()), ReadFrame::Line(String::new()), ReadFrame::Line("abcdefgh".into())]
        );
    }

    #[tokio::test]
    async fn long_line_is_reported_once_then_skipped() {
        let frames = collect(b"0123456789012345678901234567890123456789\nok\n", 8).await;
        assert_eq!(frames, vec![ReadFrame::Oversized, ReadFrame::Line("ok".into())]);
    }

    #[tokio::test]
    async fn unterminated_long_line_never_buffers_past_the_limit() {
        let frames = collect(b"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx", 8).await;
        assert_eq!(frames, vec![ReadFrame::Oversized]);
    }

    #[tokio::test]
    async fn trailing_partial_line_is_dropped_at_eof() {
        let frames = collect(b"one\ntw", 8).await;
        assert_eq!(frames, vec![ReadFrame::Line("one".into())]);
    }
}
