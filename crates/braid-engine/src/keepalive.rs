//! Connection keepalive
//!
//! A low-priority periodic task watches the write side's idle time and
//! sends an alive probe once nothing has gone out for the configured
//! interval. The probe carries no payload semantics; receipt triggers an
//! immediate alive-ack from the peer (handled in the read path).

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use braid_protocol::Frame;

use crate::writer::WriterHandle;

pub(crate) fn spawn(
    writer: WriterHandle,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (interval / 2).max(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(period) => {
                    if writer.idle_time() >= interval {
                        tracing::trace!("Write side idle; sending alive probe");
                        if writer.send(Frame::ConnectionAlive).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::writer::spawn_writer;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_probe_sent_after_idle_interval() {
        let (client, mut server) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let (writer, _write_task) =
            spawn_writer(client, None, BufferPool::new(), shutdown.clone());

        let _task = spawn(writer, Duration::from_millis(50), shutdown.clone());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf))
            .await
            .expect("probe should arrive")
            .unwrap();
        // connection-alive frame
        assert_eq!(&buf[..n], &[0, 0, 0, 1, 0x40]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_no_probe_while_traffic_flows() {
        let (client, mut server) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let (writer, _write_task) =
            spawn_writer(client, None, BufferPool::new(), shutdown.clone());

        let _task = spawn(writer.clone(), Duration::from_millis(200), shutdown.clone());

        // Keep the write side busy for a while
        let mut wire = Vec::new();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.send(Frame::ConnectionAliveAck).await.unwrap();
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).await.unwrap();
            wire.extend_from_slice(&buf[..n]);
        }

        // Only the acks we sent ourselves; no 0x40 probe interleaved
        for chunk in wire.chunks(5) {
            assert_eq!(chunk, &[0, 0, 0, 1, 0x41]);
        }
        shutdown.cancel();
    }
}
