//! Connection handler: frame dispatch, channel multiplexing, close barrier
//!
//! The read loop is the single consumer of inbound frames; everything it
//! routes to shares the per-connection [`Shared`] state. Channel-level
//! failures refuse the one channel and keep the connection running;
//! framing and transport failures tear the whole connection down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use braid_core::{
    BoxTransport, ChannelAcceptor, ConnectionError, EngineConfig, FrameTransform, OpenDecision,
    OpenError,
};
use braid_protocol::{ChannelId, ChannelParams, Frame, LengthCodec};

use crate::channel::{Channel, ChannelInner};
use crate::close::{AtomicCloseState, CountRefused};
use crate::handshake::PeerFlags;
use crate::writer::WriterHandle;

/// Events surfaced to the connection's host.
pub enum ConnectionEvent {
    /// The peer opened a channel toward this side
    ChannelOpened(Channel),
    /// The connection is gone; no further events follow
    Closed {
        /// The failure that ended it, if it was not a clean close
        reason: Option<String>,
    },
}

/// An outbound channel-open awaiting the peer's answer.
pub(crate) struct PendingChannel {
    pub service: String,
    pub requested: ChannelParams,
    pub reply: oneshot::Sender<Result<Channel, OpenError>>,
}

/// Per-connection state shared between the read path, the write path, and
/// every channel and application handle.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub writer: WriterHandle,
    pub close: AtomicCloseState,
    pub channels: DashMap<u32, Arc<ChannelInner>>,
    pub pending: DashMap<u32, PendingChannel>,
    /// Origin-bit value for locally allocated channel IDs
    pub origin_mask: u32,
    pub flags: PeerFlags,
    pub acceptor: Arc<dyn ChannelAcceptor>,
    pub events_tx: mpsc::Sender<ConnectionEvent>,
    pub shutdown: CancellationToken,
    write_closed: AtomicBool,
    torn_down: AtomicBool,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        writer: WriterHandle,
        origin_mask: u32,
        flags: PeerFlags,
        acceptor: Arc<dyn ChannelAcceptor>,
        events_tx: mpsc::Sender<ConnectionEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            writer,
            close: AtomicCloseState::new(),
            channels: DashMap::new(),
            pending: DashMap::new(),
            origin_mask,
            flags,
            acceptor,
            events_tx,
            shutdown,
            write_closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Open a channel to a named service on the peer.
    pub(crate) async fn open_channel(
        &self,
        service: &str,
        requested: ChannelParams,
    ) -> Result<Channel, OpenError> {
        match self.close.try_inc_outbound(self.config.max_outbound_channels) {
            Ok(_) => {}
            Err(CountRefused::Closing) => return Err(OpenError::ConnectionClosed),
            Err(CountRefused::AtLimit) => return Err(OpenError::TooManyChannels),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let id = match self.register_pending(PendingChannel {
            service: service.to_string(),
            requested,
            reply: reply_tx,
        }) {
            Ok(id) => id,
            Err(e) => {
                self.close.dec_outbound();
                self.check_close_barrier();
                return Err(e);
            }
        };

        tracing::debug!("Requesting channel {:#010x} to service {}", id, service);
        let frame = Frame::ChannelOpenRequest {
            id: ChannelId::new(id),
            service: service.to_string(),
            params: requested,
        };
        if self.writer.send(frame).await.is_err() {
            if self.pending.remove(&id).is_some() {
                self.close.dec_outbound();
                self.check_close_barrier();
            }
            return Err(OpenError::ConnectionClosed);
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(OpenError::ConnectionClosed),
        }
    }

    /// Pick a random unused channel ID with the local origin bit and
    /// register the pending open under it. Bounded retry; collisions are
    /// vanishingly rare at sane channel counts.
    fn register_pending(&self, pending: PendingChannel) -> Result<u32, OpenError> {
        let mut pending = Some(pending);
        for _ in 0..64 {
            let id = (rand::random::<u32>() & !ChannelId::ORIGIN_BIT) | self.origin_mask;
            if self.channels.contains_key(&id) {
                continue;
            }
            match self.pending.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    if let Some(p) = pending.take() {
                        vacant.insert(p);
                        return Ok(id);
                    }
                }
            }
        }
        Err(OpenError::IdsExhausted)
    }

    /// Shut the write side down once both close bits are set and the last
    /// channel is gone. Idempotent.
    pub(crate) fn check_close_barrier(&self) {
        if self.close.load().barrier_reached() && !self.write_closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Close barrier released; shutting down write side");
            self.writer.request_shutdown();
        }
    }

    /// This side requests connection close.
    pub(crate) async fn send_close_request(&self) {
        let (newly, state) = self.close.request_close();
        if newly {
            tracing::debug!(
                "Close requested locally ({} channels still open)",
                state.inbound as u32 + state.outbound as u32
            );
            let _ = self.writer.send(Frame::ConnectionClose).await;
        }
        self.check_close_barrier();
    }

    /// The peer requested connection close: both bits go up, pending
    /// channel opens are cancelled, and a close reply goes out if this
    /// side had not requested yet.
    pub(crate) async fn receive_close(&self) {
        let (reply_owed, _) = self.close.receive_close();
        tracing::debug!("Peer requested connection close");
        if reply_owed {
            let _ = self.writer.send(Frame::ConnectionClose).await;
        }
        self.fail_pending();
        self.check_close_barrier();
    }

    /// Cancel every pending channel open.
    fn fail_pending(&self) {
        let keys: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.reply.send(Err(OpenError::ConnectionClosed));
                self.close.dec_outbound();
            }
        }
        self.check_close_barrier();
    }

    /// Full connection teardown: transport failure, framing error, or
    /// peer disconnect. Cancels everything and emits the closed event.
    /// Runs at most once.
    pub(crate) async fn teardown(&self, reason: Option<String>) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        match &reason {
            Some(reason) => tracing::warn!("Connection failed: {}", reason),
            None => tracing::debug!("Connection closed"),
        }
        self.shutdown.cancel();
        self.writer.request_shutdown();
        self.fail_pending();

        let channels: Vec<Arc<ChannelInner>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in channels {
            channel.retire();
        }
        self.channels.clear();

        let _ = self.events_tx.send(ConnectionEvent::Closed { reason }).await;
    }
}

/// The connection's single serialized read path.
pub(crate) async fn read_loop(
    mut stream: FramedRead<ReadHalf<BoxTransport>, LengthCodec>,
    shared: Arc<Shared>,
    transform: Option<Arc<dyn FrameTransform>>,
    pending: Option<Frame>,
) {
    if let Some(frame) = pending {
        if let Err(e) = dispatch(&shared, frame).await {
            shared.teardown(Some(e.to_string())).await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.teardown(None).await;
                return;
            }
            item = stream.next() => {
                let body = match item {
                    Some(Ok(body)) => body,
                    Some(Err(e)) => {
                        shared.teardown(Some(e.to_string())).await;
                        return;
                    }
                    None => {
                        tracing::debug!("Peer closed the stream");
                        shared.teardown(None).await;
                        return;
                    }
                };

                let body = match &transform {
                    Some(t) => match t.unwrap(&body) {
                        Ok(inner) => Bytes::from(inner),
                        Err(e) => {
                            shared.teardown(Some(e.to_string())).await;
                            return;
                        }
                    },
                    None => body,
                };

                match braid_protocol::Frame::parse(body) {
                    Ok(frame) => {
                        if let Err(e) = dispatch(&shared, frame).await {
                            shared.teardown(Some(e.to_string())).await;
                            return;
                        }
                    }
                    Err(e) => {
                        shared.teardown(Some(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}

fn channel_for(shared: &Arc<Shared>, id: ChannelId) -> Option<Arc<ChannelInner>> {
    shared
        .channels
        .get(&id.as_u32())
        .map(|entry| Arc::clone(entry.value()))
}

/// Route one frame. `Err` is fatal to the connection.
async fn dispatch(shared: &Arc<Shared>, frame: Frame) -> Result<(), ConnectionError> {
    match frame {
        Frame::ChannelOpenRequest {
            id,
            service,
            params,
        } => {
            handle_open_request(shared, id, service, params).await;
        }
        Frame::ChannelOpenAck { id, params } => {
            handle_open_ack(shared, id, params);
        }
        Frame::ServiceNotFound { id, reason } => {
            handle_refusal(shared, id, OpenError::ServiceNotFound(reason));
        }
        Frame::ServiceError { id, reason } => {
            handle_refusal(shared, id, OpenError::ServiceError(reason));
        }
        Frame::ChannelShutdownWrite { id } => match channel_for(shared, id) {
            Some(channel) => channel.handle_shutdown_write(),
            None => tracing::trace!("Shutdown-write for unknown {}", id),
        },
        Frame::ChannelClosed { id } => match channel_for(shared, id) {
            Some(channel) => channel.retire(),
            None => tracing::trace!("Close for unknown {}", id),
        },
        Frame::MessageData {
            channel,
            message,
            flags,
            payload,
        } => match channel_for(shared, channel) {
            Some(inner) => inner.handle_message_data(message, flags, payload).await,
            None => tracing::trace!("Data for unknown {}", channel),
        },
        Frame::MessageWindowOpen {
            channel,
            message,
            credit,
        } => match channel_for(shared, channel) {
            Some(inner) => inner.handle_window_open(message, credit),
            None => tracing::trace!("Window credit for unknown {}", channel),
        },
        Frame::MessageClose { channel, message } => match channel_for(shared, channel) {
            Some(inner) => inner.handle_message_close(message),
            None => tracing::trace!("Message close for unknown {}", channel),
        },
        Frame::ConnectionAlive => {
            let _ = shared.writer.send(Frame::ConnectionAliveAck).await;
        }
        Frame::ConnectionAliveAck => {
            tracing::trace!("Keepalive acknowledged");
        }
        Frame::ConnectionClose => {
            shared.receive_close().await;
        }
        Frame::Unknown { kind } => {
            tracing::trace!("Skipping unknown frame type {:#04x}", kind);
        }
        other => {
            // Handshake or auth frame after establishment; skip it rather
            // than kill a working connection
            tracing::warn!(
                "Unexpected frame type {:#04x} on established connection",
                other.kind_byte()
            );
        }
    }
    Ok(())
}

/// The peer granted one of our channel-open requests.
fn handle_open_ack(shared: &Arc<Shared>, id: ChannelId, params: ChannelParams) {
    let Some((_, pending)) = shared.pending.remove(&id.as_u32()) else {
        tracing::trace!("Open ack for unknown pending {}", id);
        return;
    };
    let (inner, channel) = ChannelInner::create(Arc::clone(shared), id, params);
    shared.channels.insert(id.as_u32(), inner);
    tracing::debug!("{} open to service {}", id, pending.service);
    if pending.reply.send(Ok(channel)).is_err() {
        // The requester gave up waiting; the dropped handle closes the
        // channel again on its way out
        tracing::debug!("Requester abandoned {}", id);
    }
}

/// The peer refused one of our channel-open requests. Channel-level
/// failure only: reported to the requester, the connection keeps going.
fn handle_refusal(shared: &Arc<Shared>, id: ChannelId, error: OpenError) {
    let Some((_, pending)) = shared.pending.remove(&id.as_u32()) else {
        tracing::trace!("Refusal for unknown pending {}", id);
        return;
    };
    tracing::debug!("Open of {} for service {} refused: {}", id, pending.service, error);
    let _ = pending.reply.send(Err(error));
    shared.close.dec_outbound();
    shared.check_close_barrier();
}

/// The peer asks to open a channel toward this side.
async fn handle_open_request(
    shared: &Arc<Shared>,
    id: ChannelId,
    service: String,
    requested: ChannelParams,
) {
    // Duplicate ID: the peer is confused. Tear the existing channel down
    // best-effort and refuse the request; its state must not be touched
    // by the new open.
    if let Some((_, existing)) = shared.channels.remove(&id.as_u32()) {
        tracing::warn!("Duplicate open for {}; tearing down the existing channel", id);
        existing.retire();
        let _ = shared
            .writer
            .send(Frame::ServiceError {
                id,
                reason: "duplicate channel id".to_string(),
            })
            .await;
        return;
    }

    match shared.close.try_inc_inbound(shared.config.max_inbound_channels) {
        Ok(_) => {}
        Err(CountRefused::Closing) => {
            let _ = shared
                .writer
                .send(Frame::ServiceError {
                    id,
                    reason: "connection closing".to_string(),
                })
                .await;
            return;
        }
        Err(CountRefused::AtLimit) => {
            let _ = shared
                .writer
                .send(Frame::ServiceError {
                    id,
                    reason: "too many channels".to_string(),
                })
                .await;
            return;
        }
    }

    // Host code decides; a panic in it must not reach the read loop
    let acceptor = Arc::clone(&shared.acceptor);
    let decision = catch_unwind(AssertUnwindSafe(|| acceptor.decide(&service, &requested)))
        .unwrap_or_else(|_| {
            tracing::error!("Channel acceptor panicked for service {}", service);
            OpenDecision::Error("internal service error".to_string())
        });

    match decision {
        OpenDecision::Accept(configured) => {
            let agreed = requested.agree(&configured);
            let (inner, channel) =
                ChannelInner::create(Arc::clone(shared), id, agreed.flipped());
            shared.channels.insert(id.as_u32(), inner);
            let _ = shared
                .writer
                .send(Frame::ChannelOpenAck { id, params: agreed })
                .await;
            tracing::debug!("Accepted {} for service {}", id, service);
            if shared
                .events_tx
                .send(ConnectionEvent::ChannelOpened(channel))
                .await
                .is_err()
            {
                tracing::warn!("Event receiver gone; {} closes again", id);
            }
        }
        OpenDecision::NotFound(reason) => {
            shared.close.dec_inbound();
            shared.check_close_barrier();
            tracing::debug!("No service {} for {}: {}", service, id, reason);
            let _ = shared
                .writer
                .send(Frame::ServiceNotFound { id, reason })
                .await;
        }
        OpenDecision::Error(reason) => {
            shared.close.dec_inbound();
            shared.check_close_barrier();
            tracing::debug!("Service {} refused {}: {}", service, id, reason);
            let _ = shared
                .writer
                .send(Frame::ServiceError { id, reason })
                .await;
        }
    }
}
