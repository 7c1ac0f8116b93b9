//! Per-message flow control
//!
//! Every message has its own sliding window: each data frame the sender
//! emits burns window, and window-open acknowledgements from the receiver
//! refill it. A sender that runs out of window parks on the message's
//! notifier with a deadline; credit, cancellation, or a remote close wakes
//! it, and deadline expiry cancels the message (never the channel). EOF
//! and cancellation ride as flag bits on the final data frame.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Notify};

use braid_core::MessageError;
use braid_protocol::{ChannelId, Frame, MessageFlags, MessageId};

use crate::channel::ChannelInner;
use crate::writer::WriterHandle;

/// Sender-side state for one in-flight message.
pub(crate) struct OutboundMessage {
    pub(crate) id: MessageId,
    window: AtomicU32,
    notify: Notify,
    cancelled: AtomicBool,
    peer_closed: AtomicBool,
}

impl OutboundMessage {
    pub(crate) fn new(id: MessageId, window: u32) -> Self {
        Self {
            id,
            window: AtomicU32::new(window),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
        }
    }

    /// Window credit from a window-open acknowledgement.
    pub(crate) fn add_credit(&self, credit: u32) {
        self.window.fetch_add(credit, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Flag the message cancelled and wake any blocked writer.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// The remote side retired the message; wake any blocked writer.
    pub(crate) fn peer_close(&self) {
        self.peer_closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Take up to `want` bytes of window, waiting for credit with a
    /// deadline. The window never goes negative: only what was observed
    /// gets claimed, through a compare-and-swap.
    pub(crate) async fn reserve(
        &self,
        want: usize,
        timeout: Duration,
    ) -> Result<usize, MessageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.cancelled.load(Ordering::Acquire)
                || self.peer_closed.load(Ordering::Acquire)
            {
                return Err(MessageError::Cancelled);
            }

            // Arm the notifier before the window check so a concurrent
            // credit arrival cannot slip between them
            let notified = self.notify.notified();

            let current = self.window.load(Ordering::Acquire);
            if current > 0 {
                let take = current.min(want.min(u32::MAX as usize) as u32);
                if self
                    .window
                    .compare_exchange(current, current - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(take as usize);
                }
                continue;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.cancel();
                return Err(MessageError::AckTimeout);
            }
        }
    }
}

/// Writer handle for one outbound message.
///
/// Obtained from [`crate::Channel::send_message`]. Dropping it without
/// calling [`finish`](MessageWriter::finish) cancels the message.
pub struct MessageWriter {
    channel: Arc<ChannelInner>,
    msg: Arc<OutboundMessage>,
    remaining: u64,
    first: bool,
    done: bool,
}

impl MessageWriter {
    pub(crate) fn new(channel: Arc<ChannelInner>, msg: Arc<OutboundMessage>) -> Self {
        let remaining = channel.params().outbound_message_size;
        Self {
            channel,
            msg,
            remaining,
            first: true,
            done: false,
        }
    }

    /// The message's ID within its channel
    pub fn id(&self) -> MessageId {
        self.msg.id
    }

    fn next_flags(&mut self) -> MessageFlags {
        let mut flags = MessageFlags::empty();
        if self.first {
            flags = flags.with_new();
            self.first = false;
        }
        flags
    }

    /// Write message bytes, blocking on window credit as needed.
    ///
    /// Exceeding the negotiated total message size or the ack timeout
    /// cancels this message; the channel keeps running.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<(), MessageError> {
        let mut data: Bytes = data.into();
        if self.done {
            return Err(MessageError::Cancelled);
        }
        if (data.len() as u64) > self.remaining {
            let limit = self.channel.params().outbound_message_size;
            self.abort(true).await;
            return Err(MessageError::SizeExceeded { limit });
        }
        self.remaining -= data.len() as u64;

        while !data.is_empty() {
            let take = match self
                .msg
                .reserve(data.len(), self.channel.ack_timeout())
                .await
            {
                Ok(take) => take,
                Err(e) => {
                    // Announce the cancellation on timeout; on a remote
                    // close or local cancel the peer already knows
                    self.abort(matches!(e, MessageError::AckTimeout)).await;
                    return Err(e);
                }
            };
            let chunk = data.split_to(take);
            let flags = self.next_flags();
            let frame = Frame::MessageData {
                channel: self.channel.id(),
                message: self.msg.id,
                flags,
                payload: chunk,
            };
            if self.channel.writer().send(frame).await.is_err() {
                self.done = true;
                self.msg.cancel();
                self.channel.retire_outbound(self.msg.id);
                return Err(MessageError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Mark end of message. The EOF rides on a final data frame.
    pub async fn finish(mut self) -> Result<(), MessageError> {
        if self.done {
            return Err(MessageError::Cancelled);
        }
        let flags = self.next_flags().with_eof();
        let frame = Frame::MessageData {
            channel: self.channel.id(),
            message: self.msg.id,
            flags,
            payload: Bytes::new(),
        };
        self.done = true;
        if self.channel.writer().send(frame).await.is_err() {
            self.msg.cancel();
            self.channel.retire_outbound(self.msg.id);
            return Err(MessageError::ConnectionClosed);
        }
        // On the compatibility path the ID stays reserved until the peer
        // acknowledges with an explicit message-close frame
        if self.channel.peer_message_close() {
            self.channel.retire_outbound(self.msg.id);
        }
        Ok(())
    }

    /// Cancel the message explicitly.
    pub async fn cancel(mut self) -> Result<(), MessageError> {
        self.abort(true).await;
        Ok(())
    }

    async fn abort(&mut self, announce: bool) {
        if self.done {
            return;
        }
        self.done = true;
        self.msg.cancel();
        if announce {
            let flags = self.next_flags().with_cancelled().with_eof();
            let frame = Frame::MessageData {
                channel: self.channel.id(),
                message: self.msg.id,
                flags,
                payload: Bytes::new(),
            };
            let _ = self.channel.writer().send(frame).await;
        }
        self.channel.retire_outbound(self.msg.id);
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.msg.cancel();
        let flags = self.next_flags().with_cancelled().with_eof();
        let frame = Frame::MessageData {
            channel: self.channel.id(),
            message: self.msg.id,
            flags,
            payload: Bytes::new(),
        };
        self.channel.writer().try_send(frame);
        self.channel.retire_outbound(self.msg.id);
    }
}

/// One message arriving from the peer, as a stream of chunks.
///
/// Window credit flows back to the sender as chunks are consumed, so an
/// application that reads slowly applies backpressure automatically.
/// Dropping the handle before end of message discards the rest; the
/// engine keeps draining the ID silently until the sender's EOF arrives.
pub struct IncomingMessage {
    channel_id: ChannelId,
    id: MessageId,
    rx: mpsc::UnboundedReceiver<Result<Bytes, MessageError>>,
    writer: WriterHandle,
    pending_credit: Arc<AtomicUsize>,
    finished: bool,
}

impl IncomingMessage {
    pub(crate) fn new(
        channel_id: ChannelId,
        id: MessageId,
        rx: mpsc::UnboundedReceiver<Result<Bytes, MessageError>>,
        writer: WriterHandle,
        pending_credit: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            channel_id,
            id,
            rx,
            writer,
            pending_credit,
            finished: false,
        }
    }

    /// The message's ID within its channel
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Receive the next chunk. `Ok(None)` is end of message.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, MessageError> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                self.pending_credit.fetch_sub(chunk.len(), Ordering::AcqRel);
                let _ = self
                    .writer
                    .send(Frame::MessageWindowOpen {
                        channel: self.channel_id,
                        message: self.id,
                        credit: chunk.len() as u32,
                    })
                    .await;
                Ok(Some(chunk))
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Collect the whole message into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Bytes, MessageError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.recv().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

impl Drop for IncomingMessage {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Hand back whatever credit the unread chunks were holding so the
        // sender can keep draining toward its EOF
        let credit = self.pending_credit.swap(0, Ordering::AcqRel);
        if credit > 0 {
            self.writer.try_send(Frame::MessageWindowOpen {
                channel: self.channel_id,
                message: self.id,
                credit: credit as u32,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_takes_available_window() {
        let msg = OutboundMessage::new(MessageId::new(1), 100);
        let n = msg.reserve(60, Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 60);
        let n = msg.reserve(60, Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 40);
    }

    #[tokio::test]
    async fn test_reserve_blocks_until_credit() {
        let msg = Arc::new(OutboundMessage::new(MessageId::new(1), 0));

        let waiter = Arc::clone(&msg);
        let task = tokio::spawn(async move { waiter.reserve(10, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        msg.add_credit(10);
        assert_eq!(task.await.unwrap().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reserve_timeout_cancels_message() {
        let msg = OutboundMessage::new(MessageId::new(1), 0);
        let result = msg.reserve(10, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(MessageError::AckTimeout)));

        // The timeout converted into cancellation of this message
        let result = msg.reserve(10, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(MessageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_writer() {
        let msg = Arc::new(OutboundMessage::new(MessageId::new(1), 0));

        let waiter = Arc::clone(&msg);
        let task = tokio::spawn(async move { waiter.reserve(10, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        msg.cancel();
        assert!(matches!(task.await.unwrap(), Err(MessageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_peer_close_wakes_blocked_writer() {
        let msg = Arc::new(OutboundMessage::new(MessageId::new(1), 0));

        let waiter = Arc::clone(&msg);
        let task = tokio::spawn(async move { waiter.reserve(10, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        msg.peer_close();
        assert!(matches!(task.await.unwrap(), Err(MessageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_window_never_negative() {
        let msg = OutboundMessage::new(MessageId::new(1), 10);
        let n = msg.reserve(1000, Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(msg.window.load(Ordering::Acquire), 0);
    }
}
