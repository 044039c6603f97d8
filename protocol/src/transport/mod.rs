//! # Transport Abstraction
//!
//! Everything above this module talks to peers through the [`Host`] trait:
//! open a stream to a peer on a protocol, accept streams for registered
//! protocols, and hear about peers connecting and disconnecting.
//!
//! ## Architecture
//!
//! ```text
//! mod.rs     — Host trait, Stream, handler/notifiee types, HostCore
//! memory.rs  — in-process network of hosts joined by duplex pipes
//! tcp.rs     — libp2p swarm over TCP (noise + yamux), streams via libp2p-stream
//! ```
//!
//! ## Design Decisions
//!
//! - A [`Stream`] is a plain `AsyncRead + AsyncWrite` tagged with the remote
//!   peer and protocol. Protocols frame their own records (see `codec`).
//! - Inbound streams are dispatched to their handler on a fresh tokio task,
//!   so a slow handler for one peer never delays another peer.
//! - Connection notifications are synchronous callbacks. Notifiees must
//!   return quickly and spawn if they have real work to do.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

pub use memory::{MemoryHost, MemoryNetwork};
pub use tcp::TcpHost;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a [`Host`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live connection to the peer.
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// The remote side has no handler for the requested protocol.
    #[error("peer {peer} does not support protocol {protocol}")]
    ProtocolNotSupported { peer: PeerId, protocol: String },

    /// The address cannot be dialed by this transport.
    #[error("unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Dialing did not complete in time.
    #[error("dial to {0} timed out")]
    DialTimeout(String),

    /// The dial was attempted and failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Protocol negotiation on a new stream did not finish in time.
    #[error("opening {protocol} to {peer} timed out")]
    OpenTimeout { peer: PeerId, protocol: String },

    /// Stream negotiation failed for a reason other than an unknown protocol.
    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    /// The host could not be built or started.
    #[error("host setup failed: {0}")]
    Setup(String),

    /// The host's event loop has stopped.
    #[error("host is shut down")]
    HostClosed,

    /// Socket-level failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Object-safe bundle of the traits a stream transport must provide.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A bidirectional byte stream to one peer on one protocol.
///
/// Dropping the stream releases it; the remote side observes EOF.
pub struct Stream {
    peer: PeerId,
    protocol: String,
    io: Box<dyn StreamIo>,
}

impl Stream {
    pub fn new(peer: PeerId, protocol: impl Into<String>, io: impl StreamIo + 'static) -> Self {
        Self {
            peer,
            protocol: protocol.into(),
            io: Box::new(io),
        }
    }

    /// The peer on the other end.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The protocol this stream was opened for.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Handlers & Notifiees
// ---------------------------------------------------------------------------

/// Handler invoked for every inbound stream on a registered protocol.
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async function into a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream| f(stream).boxed())
}

/// Receives connection lifecycle notifications from a [`Host`].
///
/// Called inline on the transport's task: do not block.
pub trait ConnectionNotifiee: Send + Sync {
    fn connected(&self, peer: PeerId);
    fn disconnected(&self, peer: PeerId);
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// An addressable peer-to-peer host.
#[async_trait]
pub trait Host: Send + Sync {
    /// This host's stable identity.
    fn local_peer_id(&self) -> PeerId;

    /// Addresses other hosts can dial to reach this one.
    fn local_addresses(&self) -> Vec<Multiaddr>;

    /// Dials `addr` and returns the identity of the host behind it. Both
    /// sides raise a `connected` notification on success.
    async fn connect(&self, addr: &Multiaddr) -> Result<PeerId, TransportError>;

    /// Opens a new stream to a connected peer.
    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream, TransportError>;

    /// Registers (or replaces) the handler for inbound streams on `protocol`.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    /// Adds a connection lifecycle listener.
    fn register_notifiee(&self, notifiee: Arc<dyn ConnectionNotifiee>);

    /// Drops the connection to `peer`. Both sides raise `disconnected`.
    async fn disconnect(&self, peer: PeerId) -> Result<(), TransportError>;

    /// Peers with a live connection.
    fn connected_peers(&self) -> Vec<PeerId>;
}

// ---------------------------------------------------------------------------
// Host Core
// ---------------------------------------------------------------------------

/// Handler and notifiee bookkeeping shared by the concrete hosts.
#[derive(Default)]
pub(crate) struct HostCore {
    handlers: DashMap<String, StreamHandler>,
    notifiees: RwLock<Vec<Arc<dyn ConnectionNotifiee>>>,
}

impl HostCore {
    pub(crate) fn set_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.insert(protocol.to_string(), handler);
    }

    pub(crate) fn supports(&self, protocol: &str) -> bool {
        self.handlers.contains_key(protocol)
    }

    pub(crate) fn add_notifiee(&self, notifiee: Arc<dyn ConnectionNotifiee>) {
        self.notifiees.write().push(notifiee);
    }

    /// Hands `stream` to its protocol handler on a new task. Returns the
    /// stream back if no handler is registered.
    pub(crate) fn dispatch(&self, stream: Stream) -> Result<(), Stream> {
        let handler = match self.handlers.get(stream.protocol()) {
            Some(h) => Arc::clone(h.value()),
            None => return Err(stream),
        };
        trace!(peer = %stream.peer(), protocol = stream.protocol(), "dispatching inbound stream");
        tokio::spawn(handler(stream));
        Ok(())
    }

    pub(crate) fn notify_connected(&self, peer: PeerId) {
        debug!(%peer, "peer connected");
        let notifiees = self.notifiees.read().clone();
        for n in notifiees {
            n.connected(peer);
        }
    }

    pub(crate) fn notify_disconnected(&self, peer: PeerId) {
        debug!(%peer, "peer disconnected");
        let notifiees = self.notifiees.read().clone();
        for n in notifiees {
            n.disconnected(peer);
        }
    }
}
