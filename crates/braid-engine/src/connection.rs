//! Connection lifecycle
//!
//! [`Endpoint`] holds everything one side of the protocol is configured
//! with; `connect` and `accept` run the handshake and authentication
//! phases sequentially on the caller's task, then hand the stream to the
//! engine's read and write tasks and return the [`Connection`] handle.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use braid_core::{
    AuthError, BoxTransport, ChannelAcceptor, ConnectionError, EngineConfig, FrameTransform,
    Identity, MechanismCatalog, MechanismSelector, OpenError, ServiceMap, TlsUpgrader, Transport,
};
use braid_protocol::{ChannelId, ChannelParams, Frame, LengthCodec};

use crate::auth;
use crate::channel::Channel;
use crate::handler::{self, ConnectionEvent, Shared};
use crate::handshake::{self, PeerFlags};
use crate::keepalive;
use crate::pool::BufferPool;
use crate::writer::spawn_writer;

/// Queue depth for events toward the host
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One side's configuration: limits, mechanisms, services, TLS.
///
/// An endpoint is reusable; every `connect`/`accept` call produces an
/// independent connection.
pub struct Endpoint {
    config: EngineConfig,
    catalog: MechanismCatalog,
    acceptor: Arc<dyn ChannelAcceptor>,
    tls: Option<Arc<dyn TlsUpgrader>>,
    selector: Option<MechanismSelector>,
}

impl Endpoint {
    /// Create an endpoint with no mechanisms, no registered services and
    /// no TLS.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            catalog: MechanismCatalog::new(),
            acceptor: Arc::new(ServiceMap::new()),
            tls: None,
            selector: None,
        }
    }

    /// Use the given mechanism catalog
    pub fn with_catalog(mut self, catalog: MechanismCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Route inbound channel opens through the given acceptor
    pub fn with_acceptor(mut self, acceptor: Arc<dyn ChannelAcceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    /// Enable the mid-stream TLS upgrade
    pub fn with_tls(mut self, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        self.tls = Some(upgrader);
        self
    }

    /// Install a mechanism selection policy for the client side
    pub fn with_selector(mut self, selector: MechanismSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Connect over an established stream (initiator side).
    pub async fn connect<S>(&self, stream: S) -> Result<Connection, ConnectionError>
    where
        S: Transport + 'static,
    {
        let outcome =
            handshake::initiate(Box::new(stream), &self.config, self.tls.as_ref()).await?;
        let handshake::HandshakeOutcome {
            mut framed,
            version,
            peer_name,
            peer_caps,
            flags,
            pending,
        } = outcome;

        let mut mechanism = None;
        let mut transform: Option<Box<dyn FrameTransform>> = None;
        if flags.authentication {
            if peer_caps.mechanisms.is_empty() {
                return Err(AuthError::NoMechanisms.into());
            }
            let auth = auth::authenticate_client(
                &mut framed,
                &self.catalog,
                self.selector.as_ref(),
                &peer_caps.mechanisms,
            )
            .await?;
            mechanism = Some(auth.mechanism);
            transform = auth.transform;
        }

        Ok(spawn_connection(SpawnArgs {
            framed,
            pending,
            origin_mask: ChannelId::ORIGIN_BIT,
            version,
            peer_name,
            flags,
            identity: None,
            mechanism,
            transform,
            config: self.config.clone(),
            acceptor: Arc::clone(&self.acceptor),
        }))
    }

    /// Accept a connection over an established stream (responder side).
    pub async fn accept<S>(&self, stream: S) -> Result<Connection, ConnectionError>
    where
        S: Transport + 'static,
    {
        let offered = self.catalog.offered();
        let outcome =
            handshake::accept(Box::new(stream), &self.config, &offered, self.tls.as_ref())
                .await?;
        let handshake::HandshakeOutcome {
            mut framed,
            version,
            peer_name,
            peer_caps: _,
            flags,
            mut pending,
        } = outcome;

        let mut identity = None;
        let mut mechanism = None;
        let mut transform: Option<Box<dyn FrameTransform>> = None;
        if !offered.is_empty() {
            let auth = auth::authenticate_server(
                &mut framed,
                &self.catalog,
                self.config.auth_max_retries,
                pending.take(),
            )
            .await?;
            identity = auth.identity;
            mechanism = Some(auth.mechanism);
            transform = auth.transform;
        }

        Ok(spawn_connection(SpawnArgs {
            framed,
            pending,
            origin_mask: 0,
            version,
            peer_name,
            flags,
            identity,
            mechanism,
            transform,
            config: self.config.clone(),
            acceptor: Arc::clone(&self.acceptor),
        }))
    }
}

struct SpawnArgs {
    framed: tokio_util::codec::Framed<BoxTransport, LengthCodec>,
    pending: Option<Frame>,
    origin_mask: u32,
    version: u8,
    peer_name: Option<String>,
    flags: PeerFlags,
    identity: Option<Identity>,
    mechanism: Option<String>,
    transform: Option<Box<dyn FrameTransform>>,
    config: EngineConfig,
    acceptor: Arc<dyn ChannelAcceptor>,
}

fn spawn_connection(args: SpawnArgs) -> Connection {
    let parts = args.framed.into_parts();
    let (read_half, write_half) = tokio::io::split(parts.io);

    let shutdown = CancellationToken::new();
    let transform: Option<Arc<dyn FrameTransform>> = args.transform.map(Arc::from);

    let (writer, write_task) = spawn_writer(
        write_half,
        transform.clone(),
        BufferPool::new(),
        shutdown.clone(),
    );
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let shared = Arc::new(Shared::new(
        args.config.clone(),
        writer.clone(),
        args.origin_mask,
        args.flags,
        args.acceptor,
        events_tx,
        shutdown.clone(),
    ));

    let mut framed_read = FramedRead::new(read_half, LengthCodec::new());
    framed_read
        .read_buffer_mut()
        .extend_from_slice(&parts.read_buf);

    let read_task = tokio::spawn(handler::read_loop(
        framed_read,
        Arc::clone(&shared),
        transform,
        args.pending,
    ));
    let keepalive_task = keepalive::spawn(writer, args.config.heartbeat_interval, shutdown);

    tracing::info!(
        "Connection established (peer {:?}, version {})",
        args.peer_name,
        args.version
    );

    Connection {
        shared,
        events_rx,
        identity: args.identity,
        mechanism: args.mechanism,
        peer_name: args.peer_name,
        version: args.version,
        read_task,
        write_task,
        keepalive_task,
    }
}

fn default_params(config: &EngineConfig) -> ChannelParams {
    ChannelParams {
        inbound_window: config.window_size,
        inbound_messages: config.max_messages,
        outbound_window: config.window_size,
        outbound_messages: config.max_messages,
        inbound_message_size: config.max_message_size,
        outbound_message_size: config.max_message_size,
    }
}

/// An established, authenticated connection.
pub struct Connection {
    shared: Arc<Shared>,
    events_rx: mpsc::Receiver<ConnectionEvent>,
    identity: Option<Identity>,
    mechanism: Option<String>,
    peer_name: Option<String>,
    version: u8,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl Connection {
    /// Open a channel to a named service with the configured default
    /// limits.
    pub async fn open_channel(&self, service: &str) -> Result<Channel, OpenError> {
        self.open_channel_with(service, default_params(&self.shared.config))
            .await
    }

    /// Open a channel requesting specific limits; the peer negotiates
    /// every field down to the minimum of requested and configured.
    pub async fn open_channel_with(
        &self,
        service: &str,
        requested: ChannelParams,
    ) -> Result<Channel, OpenError> {
        self.shared.open_channel(service, requested).await
    }

    /// The next lifecycle event: peer-opened channels, connection close.
    pub async fn recv_event(&mut self) -> Option<ConnectionEvent> {
        self.events_rx.recv().await
    }

    /// Request connection close. The socket's write side shuts down once
    /// the peer agrees and the last channel is gone.
    pub async fn close(&self) {
        self.shared.send_close_request().await;
    }

    /// Resolves when the connection is fully torn down.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    /// Whether the connection is fully torn down
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// The peer identity authentication established (responder side)
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The mechanism that authenticated this connection
    pub fn auth_mechanism(&self) -> Option<&str> {
        self.mechanism.as_deref()
    }

    /// The peer's advertised endpoint name
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// The negotiated protocol version
    pub fn protocol_version(&self) -> u8 {
        self.version
    }

    /// Open channels (both directions) still counted toward the close
    /// barrier
    pub fn open_channels(&self) -> u32 {
        let state = self.shared.close.load();
        state.inbound as u32 + state.outbound as u32
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.read_task.abort();
        self.write_task.abort();
        self.keepalive_task.abort();
    }
}
