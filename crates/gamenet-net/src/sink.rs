//! Serialized outbound half of a connection.
//!
//! Every frame leaving a connection goes through one [`FramedSink`]. The
//! writer sits behind an async mutex held for a whole header+payload pair,
//! so frames from concurrent senders (heartbeat, replies, application
//! sends) never interleave on the wire. Sequence numbers are assigned under
//! the same lock and therefore appear on the wire in increasing order.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};

use crate::error::ConnectionError;
use crate::fragment::{MAX_FRAGMENT_DATA, TransferId, build_fragment_payload};
use crate::framing::{FrameError, FrameFlags, MAX_MESSAGE_SIZE, MessageType, write_frame};

/// Chunk size used when a payload is too large for one frame.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// How long `shutdown` waits for an in-flight write before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Frame writer shared by everything that sends on one connection.
pub struct FramedSink {
    writer: Mutex<BoxedWriter>,
    next_seq: AtomicI32,
    closed: AtomicBool,
}

impl FramedSink {
    /// Wrap the write half of a stream. The first frame sent gets sequence number 1.
    pub fn new(writer: BoxedWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
            next_seq: AtomicI32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Send one frame.
    pub async fn send(
        &self,
        message_type: MessageType,
        payload: &[u8],
        flags: FrameFlags,
    ) -> Result<(), FrameError> {
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        write_frame(&mut *writer, message_type, payload, seq, flags).await
    }

    /// Send a payload of any size: directly when it fits one frame,
    /// otherwise as a fragmented transfer with [`DEFAULT_CHUNK_SIZE`] chunks.
    pub async fn send_data(
        &self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        if payload.len() <= MAX_MESSAGE_SIZE {
            self.send(message_type, payload, FrameFlags::NONE).await?;
        } else {
            self.send_large(message_type, payload, payload.len() as u64, DEFAULT_CHUNK_SIZE)
                .await?;
        }
        Ok(())
    }

    /// Stream `total_length` bytes from `source` as one fragmented transfer.
    ///
    /// Chunks are at most `min(chunk_size, MAX_FRAGMENT_DATA)` bytes; a
    /// `chunk_size` of zero selects [`DEFAULT_CHUNK_SIZE`]. The last chunk
    /// carries `FRAGMENT_LAST`. A source that runs dry early ends the
    /// transfer without error; the return value is the number of bytes sent.
    pub async fn send_large<R>(
        &self,
        message_type: MessageType,
        mut source: R,
        total_length: u64,
        chunk_size: usize,
    ) -> Result<u64, ConnectionError>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = match chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            n => n.min(MAX_FRAGMENT_DATA),
        };
        let transfer_id = TransferId::new_random();
        let mut buf = vec![0u8; chunk_size];
        let mut offset = 0u64;

        while offset < total_length {
            let want = (total_length - offset).min(chunk_size as u64) as usize;
            let n = source.read(&mut buf[..want]).await?;
            if n == 0 {
                tracing::debug!(
                    "Transfer {transfer_id} source ended at {offset} of {total_length} bytes"
                );
                break;
            }

            let mut flags = FrameFlags::FRAGMENT;
            if offset + n as u64 >= total_length {
                flags |= FrameFlags::FRAGMENT_LAST;
            }

            let payload = build_fragment_payload(transfer_id, offset, total_length, &buf[..n])?;
            self.send(message_type, &payload, flags).await?;
            offset += n as u64;
        }

        tracing::trace!("Transfer {transfer_id} sent {offset} bytes");
        Ok(offset)
    }

    /// Whether [`FramedSink::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further frames and shut the write direction down.
    /// Best-effort: failures and a stalled writer are ignored.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let close = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        };
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, close).await;
    }
}

/// Resolves once the connection's shutdown flag is raised, or its sender is gone.
///
/// Used as a `select!` branch; the borrowed value never outlives this future,
/// so the enclosing task stays `Send`.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
