//! Write queue
//!
//! All outgoing frames funnel through one writer task fed by an mpsc
//! channel: no lock contention on the hot path, and frames that queue up
//! while a write is in flight coalesce into a single write call. The task
//! also tracks write-side idle time for the keepalive probe and performs
//! the graceful write-side shutdown that ends the close barrier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use braid_core::{ConnectionError, FrameTransform};
use braid_protocol::{Frame, LengthCodec};

use crate::pool::BufferPool;

/// Outgoing frame queue depth
const CHANNEL_CAPACITY: usize = 256;

/// Maximum frames coalesced into a single write
const MAX_BATCH_SIZE: usize = 64;

/// Tracks when the write side last touched the wire.
#[derive(Debug)]
pub(crate) struct IdleTracker {
    start: Instant,
    last_write_ms: AtomicU64,
}

impl IdleTracker {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_write_ms.store(elapsed, Ordering::Release);
    }

    fn idle(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_write_ms.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Handle for queueing frames onto the writer task.
///
/// Cheaply cloneable; every producer on the connection shares one.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Frame>,
    idle: Arc<IdleTracker>,
    write_close: CancellationToken,
}

impl WriterHandle {
    /// Queue a frame, waiting for queue space.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queue a frame without waiting. Best effort: a full or closed queue
    /// drops the frame and reports `false`.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Ask the writer to flush everything queued so far and shut the write
    /// side of the stream down. Safe to call from any context, repeatedly.
    pub fn request_shutdown(&self) {
        self.write_close.cancel();
    }

    /// How long the write side has been silent
    pub fn idle_time(&self) -> Duration {
        self.idle.idle()
    }
}

/// Spawn the writer task over the write half of the connection.
pub(crate) fn spawn_writer<W>(
    io: W,
    transform: Option<Arc<dyn FrameTransform>>,
    pool: BufferPool,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let idle = Arc::new(IdleTracker::new());
    let write_close = CancellationToken::new();

    let handle = WriterHandle {
        tx,
        idle: Arc::clone(&idle),
        write_close: write_close.clone(),
    };

    let task = tokio::spawn(async move {
        if let Err(e) = writer_loop(rx, io, transform, pool, idle, write_close).await {
            tracing::warn!("Writer task failed: {}", e);
            // A dead write path is fatal to the connection
            shutdown.cancel();
        }
    });

    (handle, task)
}

/// Encode one frame (type byte + body), apply the wrap transform if one is
/// installed, and append the length-prefixed result to `dst`.
fn encode_frame(
    codec: &mut LengthCodec,
    frame: &Frame,
    transform: Option<&Arc<dyn FrameTransform>>,
    dst: &mut BytesMut,
) -> Result<(), ConnectionError> {
    let mut body = BytesMut::new();
    frame.encode(&mut body)?;
    let body = match transform {
        Some(t) => Bytes::from(t.wrap(&body)),
        None => body.freeze(),
    };
    codec.encode(body, dst)?;
    Ok(())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Frame>,
    mut io: W,
    transform: Option<Arc<dyn FrameTransform>>,
    pool: BufferPool,
    idle: Arc<IdleTracker>,
    write_close: CancellationToken,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let mut codec = LengthCodec::new();

    loop {
        let first = tokio::select! {
            _ = write_close.cancelled() => {
                // Graceful shutdown: flush what is already queued, then
                // shut the write side down.
                let mut buf = pool.acquire();
                while let Ok(frame) = rx.try_recv() {
                    encode_frame(&mut codec, &frame, transform.as_ref(), &mut buf)?;
                }
                if !buf.is_empty() {
                    io.write_all(&buf).await?;
                }
                io.flush().await?;
                io.shutdown().await?;
                idle.touch();
                tracing::debug!("Write side shut down");
                return Ok(());
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    // All handles dropped; flush and stop
                    io.flush().await?;
                    return Ok(());
                }
            },
        };

        // Coalesce whatever else is already queued into this write
        let mut buf = pool.acquire();
        encode_frame(&mut codec, &first, transform.as_ref(), &mut buf)?;
        let mut batched = 1;
        while batched < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => {
                    encode_frame(&mut codec, &frame, transform.as_ref(), &mut buf)?;
                    batched += 1;
                }
                Err(_) => break,
            }
        }

        io.write_all(&buf).await?;
        io.flush().await?;
        idle.touch();
        tracing::trace!("Wrote {} frame(s), {} bytes", batched, buf.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_protocol::Frame;
    use bytes::Buf;
    use tokio::io::{duplex, AsyncReadExt};

    fn handle_pair() -> (WriterHandle, JoinHandle<()>, tokio::io::DuplexStream) {
        let (client, server) = duplex(64 * 1024);
        let (handle, task) = spawn_writer(
            client,
            None,
            BufferPool::new(),
            CancellationToken::new(),
        );
        (handle, task, server)
    }

    #[tokio::test]
    async fn test_frames_reach_the_wire() {
        let (handle, _task, mut server) = handle_pair();

        handle.send(Frame::ConnectionAlive).await.unwrap();

        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        // length prefix (1) + type byte
        assert_eq!(&buf[..n], &[0, 0, 0, 1, 0x40]);
    }

    #[tokio::test]
    async fn test_coalesced_frames_stay_parseable() {
        let (handle, _task, mut server) = handle_pair();

        for _ in 0..10 {
            handle.send(Frame::ConnectionAlive).await.unwrap();
        }

        let mut wire = Vec::new();
        while wire.len() < 50 {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            wire.extend_from_slice(&buf[..n]);
        }

        let mut bytes = bytes::Bytes::from(wire);
        for _ in 0..10 {
            assert_eq!(bytes.get_u32(), 1);
            assert_eq!(bytes.get_u8(), 0x40);
        }
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue_first() {
        let (handle, task, mut server) = handle_pair();

        handle.send(Frame::ConnectionClose).await.unwrap();
        handle.request_shutdown();

        let mut wire = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match server.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => wire.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        assert_eq!(&wire, &[0, 0, 0, 1, 0x42]);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails_eventually() {
        let (handle, task, mut server) = handle_pair();
        handle.request_shutdown();

        // Drain until the write side closes
        let mut buf = [0u8; 16];
        while server.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
        task.await.unwrap();

        // The queue receiver is gone now
        assert!(handle.send(Frame::ConnectionAlive).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_tracker_resets_on_write() {
        let (handle, _task, mut server) = handle_pair();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.idle_time() >= Duration::from_millis(20));

        handle.send(Frame::ConnectionAlive).await.unwrap();
        let mut buf = [0u8; 16];
        let _ = server.read(&mut buf).await.unwrap();

        assert!(handle.idle_time() < Duration::from_millis(20));
    }
}
