//! # Hello Protocol
//!
//! Every time two nodes connect, each side sends the other one
//! [`HelloMessage`] describing its chain: the heaviest tip set, its height
//! and the genesis block. The receiver checks the genesis matches its own
//! and, if so, tells the sync layer where the peer claims to be.
//!
//! ```text
//!   Node A                                   Node B
//!     │ ── connected ──────────────────────────► │
//!     │                                          │
//!     │ ── open /fil/hello/1.0.0, Hello(A), close ► │  genesis ok? → sync(A.tip)
//!     │ ◄─ open /fil/hello/1.0.0, Hello(B), close ─ │
//!   sync(B.tip) ← genesis ok?                    │
//! ```
//!
//! ## Failure Semantics
//!
//! Nothing here is fatal to the connection or to other peers. Outbound
//! greetings that fail or exceed [`HelloConfig::handshake_timeout`] are
//! logged and abandoned; no retry happens until the peer reconnects. An
//! inbound message that fails to decode is dropped with the stream. A
//! genesis mismatch is logged at error level and, by default, nothing else
//! happens; [`BadGenesisPolicy::Disconnect`] drops the peer instead.

use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainReader, Cid};
use crate::codec::{read_frame, write_frame, CodecError};
use crate::config::{HELLO_PROTOCOL_ID, HELLO_TIMEOUT};
use crate::shutdown::ShutdownSignal;
use crate::transport::{stream_handler, ConnectionNotifiee, Host, Stream, TransportError};

// ---------------------------------------------------------------------------
// Wire Message
// ---------------------------------------------------------------------------

/// The one message each side sends per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMessage {
    /// Free-form description of the sender, usually its first listen address.
    pub sender_addr: String,
    /// Blocks of the sender's heaviest tip set, in canonical order.
    pub heaviest_tip_set_cids: Vec<Cid>,
    /// Height of that tip set.
    pub heaviest_tip_set_height: u64,
    /// The sender's genesis block.
    pub genesis_hash: Cid,
}

// ---------------------------------------------------------------------------
// Sync Trigger
// ---------------------------------------------------------------------------

/// Receives the tip a compatible peer claims to have.
///
/// Fire-and-forget: the handshake does not care what the sync layer does
/// with it. Called concurrently from many handshake tasks.
pub trait SyncTrigger: Send + Sync {
    fn notify_peer_tip(&self, peer: PeerId, cids: Vec<Cid>, height: u64);
}

impl<F> SyncTrigger for F
where
    F: Fn(PeerId, Vec<Cid>, u64) + Send + Sync,
{
    fn notify_peer_tip(&self, peer: PeerId, cids: Vec<Cid>, height: u64) {
        self(peer, cids, height)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do with a peer whose genesis block differs from ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BadGenesisPolicy {
    /// Log and ignore the peer's tip. The connection stays up.
    #[default]
    LogOnly,
    /// Log, ignore the tip and drop the connection.
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct HelloConfig {
    /// Bound on one outbound greeting: open, write, close.
    pub handshake_timeout: Duration,
    pub bad_genesis: BadGenesisPolicy,
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HELLO_TIMEOUT,
            bad_genesis: BadGenesisPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HelloError {
    /// Opening or writing the stream failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The stream closed before a message arrived.
    #[error("stream closed before hello was received")]
    Closed,

    /// The outbound greeting did not finish in time.
    #[error("hello timed out after {0:?}")]
    Timeout(Duration),

    /// The peer runs a different chain.
    #[error("bad genesis: local {local}, remote {remote}")]
    BadGenesis { local: Cid, remote: Cid },

    /// We have no tip to announce. Only the current attempt fails.
    #[error("local chain has no heaviest tip set")]
    EmptyLocalTip,
}

impl HelloError {
    /// The peer does not speak hello at all (an aggregator, for one).
    pub fn is_protocol_not_supported(&self) -> bool {
        matches!(
            self,
            HelloError::Transport(TransportError::ProtocolNotSupported { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Hello Protocol
// ---------------------------------------------------------------------------

struct HelloInner {
    host: Arc<dyn Host>,
    chain: Arc<dyn ChainReader>,
    sync: Arc<dyn SyncTrigger>,
    config: HelloConfig,
    shutdown: ShutdownSignal,
}

/// The hello handshake, attached to one host. Cheap to clone.
#[derive(Clone)]
pub struct HelloProtocol {
    inner: Arc<HelloInner>,
}

impl HelloProtocol {
    pub fn new(
        host: Arc<dyn Host>,
        chain: Arc<dyn ChainReader>,
        sync: Arc<dyn SyncTrigger>,
        config: HelloConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            inner: Arc::new(HelloInner {
                host,
                chain,
                sync,
                config,
                shutdown,
            }),
        }
    }

    /// Registers the inbound handler and the connection notifiee. Call once.
    pub fn start(&self) {
        let proto = self.clone();
        self.inner.host.set_stream_handler(
            HELLO_PROTOCOL_ID,
            stream_handler(move |stream| {
                let proto = proto.clone();
                async move { proto.serve_inbound(stream).await }
            }),
        );
        self.inner
            .host
            .register_notifiee(Arc::new(HelloNotifiee { proto: self.clone() }));
        info!(protocol = HELLO_PROTOCOL_ID, "hello protocol started");
    }

    /// Builds the message describing our own chain.
    pub fn local_hello(&self) -> Result<HelloMessage, HelloError> {
        let tip = self
            .inner
            .chain
            .heaviest_tip_set()
            .filter(|t| !t.is_empty())
            .ok_or(HelloError::EmptyLocalTip)?;

        let sender_addr = self
            .inner
            .host
            .local_addresses()
            .first()
            .map(|a| a.to_string())
            .unwrap_or_else(|| self.inner.host.local_peer_id().to_string());

        Ok(HelloMessage {
            sender_addr,
            heaviest_tip_set_cids: tip.cids,
            heaviest_tip_set_height: tip.height,
            genesis_hash: self.inner.chain.genesis(),
        })
    }

    /// Sends our hello to `peer`, bounded by the handshake timeout. The
    /// stream is dropped (released) whichever way this ends.
    pub async fn say_hello(&self, peer: PeerId) -> Result<(), HelloError> {
        let msg = self.local_hello()?;
        let timeout = self.inner.config.handshake_timeout;

        let attempt = async {
            let mut stream = self.inner.host.open_stream(peer, HELLO_PROTOCOL_ID).await?;
            write_frame(&mut stream, &msg).await?;
            stream.shutdown().await.map_err(CodecError::from)?;
            Ok::<_, HelloError>(())
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(res) => res,
            Err(_) => Err(HelloError::Timeout(timeout)),
        }
    }

    /// Reads one hello from an inbound stream and acts on it.
    ///
    /// Returns the peer's message when it was handed to the sync trigger.
    pub async fn handle_stream(&self, mut stream: Stream) -> Result<HelloMessage, HelloError> {
        let peer = stream.peer();
        let read = read_frame::<_, HelloMessage>(&mut stream).await;
        drop(stream);

        let msg = read?.ok_or(HelloError::Closed)?;

        let local = self.inner.chain.genesis();
        if msg.genesis_hash != local {
            return Err(HelloError::BadGenesis {
                local,
                remote: msg.genesis_hash,
            });
        }

        debug!(
            %peer,
            height = msg.heaviest_tip_set_height,
            tip_size = msg.heaviest_tip_set_cids.len(),
            "hello accepted"
        );
        self.inner.sync.notify_peer_tip(
            peer,
            msg.heaviest_tip_set_cids.clone(),
            msg.heaviest_tip_set_height,
        );
        Ok(msg)
    }

    /// Inbound handler body: handle, log, apply the bad-genesis policy.
    async fn serve_inbound(&self, stream: Stream) {
        let peer = stream.peer();
        let mut shutdown = self.inner.shutdown.clone();

        let res = tokio::select! {
            res = self.handle_stream(stream) => res,
            _ = shutdown.wait() => return,
        };

        match res {
            Ok(_) => {}
            Err(HelloError::BadGenesis { local, remote }) => {
                error!(%peer, %local, %remote, "bad genesis, ignoring peer tip");
                if self.inner.config.bad_genesis == BadGenesisPolicy::Disconnect {
                    if let Err(e) = self.inner.host.disconnect(peer).await {
                        debug!(%peer, error = %e, "disconnect after bad genesis failed");
                    }
                }
            }
            Err(e) => warn!(%peer, error = %e, "failed to read hello"),
        }
    }

    /// Spawns the outbound greeting for a freshly connected peer.
    fn spawn_greeting(&self, peer: PeerId) {
        let proto = self.clone();
        let mut shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = proto.say_hello(peer) => match res {
                    Ok(()) => {}
                    Err(e) if e.is_protocol_not_supported() => {
                        debug!(%peer, "peer does not speak hello");
                    }
                    Err(e) => warn!(%peer, error = %e, "failed to send hello"),
                },
                _ = shutdown.wait() => {}
            }
        });
    }
}

struct HelloNotifiee {
    proto: HelloProtocol,
}

impl ConnectionNotifiee for HelloNotifiee {
    fn connected(&self, peer: PeerId) {
        self.proto.spawn_greeting(peer);
    }

    fn disconnected(&self, _peer: PeerId) {}
}
