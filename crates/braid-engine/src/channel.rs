//! Channel state and the public channel handle
//!
//! A channel is one bidirectional multiplexed stream within a connection,
//! holding independent inbound and outbound message tables. Channels are
//! created by a successful open exchange and retired exactly once, on
//! local close, remote close notification, or connection teardown;
//! retirement decrements the parent connection's channel count, which is
//! what ultimately releases the close barrier.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use braid_core::{ConnectionError, MessageError};
use braid_protocol::{ChannelId, ChannelParams, Frame, MessageFlags, MessageId};

use crate::handler::Shared;
use crate::message::{IncomingMessage, MessageWriter, OutboundMessage};
use crate::writer::WriterHandle;

/// Receiver-side state for one in-flight message.
struct InboundEntry {
    /// Chunk sink toward the application; `None` once the message is
    /// being drained without delivery
    tx: Option<mpsc::UnboundedSender<Result<Bytes, MessageError>>>,
    /// Remaining total-size budget
    remaining: u64,
    /// Bytes delivered to the application but not yet acknowledged
    pending_credit: Arc<AtomicUsize>,
}

/// What to do with an inbound entry after the borrow on it ends.
enum EntryAction {
    Keep,
    Remove,
    /// Remove and acknowledge with an explicit message-close frame
    /// (compatibility path for peers without async close)
    RemoveAndAck,
}

pub(crate) struct ChannelInner {
    id: ChannelId,
    /// Local view: `outbound_*` governs data this side sends
    params: ChannelParams,
    shared: Arc<Shared>,
    outbound: DashMap<u16, Arc<OutboundMessage>>,
    next_out_id: AtomicU16,
    inbound: DashMap<u16, InboundEntry>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<IncomingMessage>>>,
    write_shutdown: AtomicBool,
    peer_write_shutdown: AtomicBool,
    retired: AtomicBool,
}

impl ChannelInner {
    /// Build the shared state and the application-facing handle for a
    /// freshly opened channel.
    pub(crate) fn create(
        shared: Arc<Shared>,
        id: ChannelId,
        params: ChannelParams,
    ) -> (Arc<ChannelInner>, Channel) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            id,
            params,
            shared,
            outbound: DashMap::new(),
            next_out_id: AtomicU16::new(0),
            inbound: DashMap::new(),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            write_shutdown: AtomicBool::new(false),
            peer_write_shutdown: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        });
        let channel = Channel {
            inner: Arc::clone(&inner),
            incoming_rx,
        };
        (inner, channel)
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn params(&self) -> ChannelParams {
        self.params
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.shared.writer
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        self.shared.config.ack_timeout
    }

    /// Whether the peer handles asynchronous message close
    pub(crate) fn peer_message_close(&self) -> bool {
        self.shared.flags.message_close
    }

    fn locally_opened(&self) -> bool {
        self.id.as_u32() & ChannelId::ORIGIN_BIT == self.shared.origin_mask
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Allocate a message ID and register a new outbound message.
    pub(crate) fn open_outbound(self: Arc<Self>) -> Result<MessageWriter, MessageError> {
        if self.is_retired() || self.write_shutdown.load(Ordering::Acquire) {
            return Err(MessageError::ChannelClosed);
        }
        if self.outbound.len() >= self.params.outbound_messages as usize {
            return Err(MessageError::TooManyMessages);
        }
        // Sequential allocation with wraparound, skipping IDs still in
        // flight; an ID frees up only when both sides retire it
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_out_id.fetch_add(1, Ordering::AcqRel);
            let msg = match self.outbound.entry(candidate) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let msg = Arc::new(OutboundMessage::new(
                        MessageId::new(candidate),
                        self.params.outbound_window,
                    ));
                    vacant.insert(Arc::clone(&msg));
                    msg
                }
            };
            return Ok(MessageWriter::new(self, msg));
        }
        Err(MessageError::TooManyMessages)
    }

    /// Drop an outbound message from the table.
    pub(crate) fn retire_outbound(&self, id: MessageId) {
        self.outbound.remove(&id.as_u16());
    }

    /// Number of outbound messages still tracked (diagnostics and tests)
    pub(crate) fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Window credit arrived for one of our outbound messages.
    pub(crate) fn handle_window_open(&self, message: MessageId, credit: u32) {
        match self.outbound.get(&message.as_u16()) {
            Some(entry) => entry.value().add_credit(credit),
            None => {
                tracing::trace!("{}: window credit for unknown {}", self.id, message);
            }
        }
    }

    /// The peer retired one of our outbound messages (explicit close
    /// acknowledgement on the compatibility path).
    pub(crate) fn handle_message_close(&self, message: MessageId) {
        if let Some((_, msg)) = self.outbound.remove(&message.as_u16()) {
            msg.peer_close();
            tracing::trace!("{}: {} closed by peer", self.id, message);
        }
    }

    /// Inbound message data from the read path.
    pub(crate) async fn handle_message_data(
        &self,
        message: MessageId,
        flags: MessageFlags,
        payload: Bytes,
    ) {
        let mid = message.as_u16();
        let mut frames: Vec<Frame> = Vec::new();
        let mut deliver: Option<IncomingMessage> = None;

        if flags.is_new() {
            // Duplicate-ID recovery: a NEW for an ID already in the table
            // means the old entry is stale; cancel it and start over
            if let Some((_, old)) = self.inbound.remove(&mid) {
                tracing::warn!(
                    "{}: duplicate message id {}, cancelling the stale entry",
                    self.id,
                    message
                );
                if let Some(tx) = old.tx {
                    let _ = tx.send(Err(MessageError::Cancelled));
                }
            }

            let pending_credit = Arc::new(AtomicUsize::new(0));
            if self.inbound.len() >= self.params.inbound_messages as usize {
                tracing::warn!(
                    "{}: inbound message limit reached, discarding {}",
                    self.id,
                    message
                );
                self.inbound.insert(
                    mid,
                    InboundEntry {
                        tx: None,
                        remaining: self.params.inbound_message_size,
                        pending_credit,
                    },
                );
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                self.inbound.insert(
                    mid,
                    InboundEntry {
                        tx: Some(tx),
                        remaining: self.params.inbound_message_size,
                        pending_credit: Arc::clone(&pending_credit),
                    },
                );
                deliver = Some(IncomingMessage::new(
                    self.id,
                    message,
                    rx,
                    self.writer().clone(),
                    pending_credit,
                ));
            }
        }

        let action = {
            let Some(mut entry) = self.inbound.get_mut(&mid) else {
                // Either never existed or already retired; a peer still
                // flushing after our cancel lands here harmlessly
                tracing::trace!("{}: data for unknown {}", self.id, message);
                return;
            };

            let len = payload.len();
            if (len as u64) > entry.remaining {
                tracing::warn!(
                    "{}: {} exceeded its {} byte budget, cancelling",
                    self.id,
                    message,
                    self.params.inbound_message_size
                );
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(Err(MessageError::SizeExceeded {
                        limit: self.params.inbound_message_size,
                    }));
                }
                entry.remaining = 0;
            } else {
                entry.remaining -= len as u64;
            }

            if flags.cancelled() {
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(Err(MessageError::Cancelled));
                }
                EntryAction::Remove
            } else {
                let mut credit = 0usize;
                match &entry.tx {
                    Some(tx) if len > 0 => {
                        entry.pending_credit.fetch_add(len, Ordering::AcqRel);
                        if tx.send(Ok(payload)).is_err() {
                            // Receiver discarded the message; keep
                            // accepting and acknowledging until its EOF
                            credit = entry.pending_credit.swap(0, Ordering::AcqRel);
                            entry.tx = None;
                        }
                    }
                    Some(_) => {}
                    None => credit = len,
                }
                if credit > 0 {
                    frames.push(Frame::MessageWindowOpen {
                        channel: self.id,
                        message,
                        credit: credit as u32,
                    });
                }
                if flags.eof() {
                    entry.tx = None;
                    if self.peer_message_close() {
                        EntryAction::Remove
                    } else {
                        EntryAction::RemoveAndAck
                    }
                } else {
                    EntryAction::Keep
                }
            }
        };

        match action {
            EntryAction::Keep => {}
            EntryAction::Remove => {
                self.inbound.remove(&mid);
            }
            EntryAction::RemoveAndAck => {
                self.inbound.remove(&mid);
                frames.push(Frame::MessageClose {
                    channel: self.id,
                    message,
                });
            }
        }

        if let Some(incoming) = deliver {
            self.push_incoming(incoming);
        }
        for frame in frames {
            let _ = self.writer().send(frame).await;
        }
    }

    fn push_incoming(&self, incoming: IncomingMessage) {
        if let Ok(guard) = self.incoming_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                if tx.send(incoming).is_err() {
                    tracing::trace!("{}: incoming queue dropped", self.id);
                }
            }
        }
    }

    /// The peer will send no more messages on this channel.
    pub(crate) fn handle_shutdown_write(&self) {
        tracing::debug!("{}: peer shut its write side down", self.id);
        self.peer_write_shutdown.store(true, Ordering::Release);
        if let Ok(mut guard) = self.incoming_tx.lock() {
            guard.take();
        }
    }

    /// Retire the channel: cancel every message, leave the connection's
    /// channel table, and release this channel's count toward the close
    /// barrier. Runs at most once no matter how many paths race into it.
    pub(crate) fn retire(&self) {
        if self.retired.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("{} retired", self.id);

        if let Ok(mut guard) = self.incoming_tx.lock() {
            guard.take();
        }
        for entry in self.outbound.iter() {
            entry.value().cancel();
        }
        self.outbound.clear();

        let stale: Vec<u16> = self.inbound.iter().map(|e| *e.key()).collect();
        for key in stale {
            if let Some((_, entry)) = self.inbound.remove(&key) {
                if let Some(tx) = entry.tx {
                    let _ = tx.send(Err(MessageError::ChannelClosed));
                }
            }
        }

        self.shared.channels.remove(&self.id.as_u32());
        if self.locally_opened() {
            self.shared.close.dec_outbound();
        } else {
            self.shared.close.dec_inbound();
        }
        self.shared.check_close_barrier();
    }
}

/// A bidirectional multiplexed stream within one connection.
///
/// Raw byte pipe: the engine never interprets what the messages carry.
pub struct Channel {
    inner: Arc<ChannelInner>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingMessage>,
}

impl Channel {
    /// The channel's connection-unique ID
    pub fn id(&self) -> ChannelId {
        self.inner.id()
    }

    /// The limits agreed at open time, from this side's point of view
    pub fn params(&self) -> ChannelParams {
        self.inner.params()
    }

    /// Start a new outbound message.
    pub fn send_message(&self) -> Result<MessageWriter, MessageError> {
        Arc::clone(&self.inner).open_outbound()
    }

    /// The next message the peer opened toward this side. `None` once the
    /// peer shut its write side down or the channel closed.
    pub async fn next_message(&mut self) -> Option<IncomingMessage> {
        self.incoming_rx.recv().await
    }

    /// Announce that this side will send no more messages.
    pub async fn shutdown_write(&self) -> Result<(), ConnectionError> {
        if self.inner.write_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner
            .writer()
            .send(Frame::ChannelShutdownWrite { id: self.id() })
            .await
    }

    /// Close the channel. In-flight messages in both directions are
    /// cancelled and the channel leaves the connection's table.
    pub async fn close(self) -> Result<(), ConnectionError> {
        let result = self
            .inner
            .writer()
            .send(Frame::ChannelClosed { id: self.id() })
            .await;
        self.inner.retire();
        result
    }

    /// Whether the channel has been retired
    pub fn is_closed(&self) -> bool {
        self.inner.is_retired()
    }

    /// Outbound messages still tracked in the channel table
    pub fn outbound_messages(&self) -> usize {
        self.inner.outbound_len()
    }

    /// Inbound messages still tracked in the channel table
    pub fn inbound_messages(&self) -> usize {
        self.inner.inbound_len()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.inner.is_retired() {
            self.inner
                .writer()
                .try_send(Frame::ChannelClosed { id: self.inner.id() });
            self.inner.retire();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
