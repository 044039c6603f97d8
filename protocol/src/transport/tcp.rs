//! # TCP Transport
//!
//! A [`Host`] backed by a libp2p [`Swarm`] over TCP, secured with noise and
//! multiplexed with yamux. Logical streams are yamux substreams negotiated
//! through `libp2p-stream`, so every stream carries the remote identity that
//! noise authenticated during the connection handshake.
//!
//! ## Task Layout
//!
//! ```text
//! TcpHost ──Command──► driver task (owns the Swarm)
//!                        ├─ ConnectionEstablished → notify connected
//!                        └─ ConnectionClosed      → notify disconnected
//!
//! set_stream_handler ──► accept task per protocol → HostCore::dispatch
//! open_stream        ──► libp2p_stream::Control (no driver round trip)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream::{Control, IncomingStreams, OpenStreamError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

use super::{ConnectionNotifiee, Host, HostCore, Stream, StreamHandler, TransportError};
use crate::config::{DIAL_TIMEOUT, IDLE_CONNECTION_TIMEOUT};
use crate::shutdown::ShutdownSignal;

type DialReply = oneshot::Sender<Result<PeerId, TransportError>>;

/// Requests handled by the driver task.
enum Command {
    Dial { addr: Multiaddr, reply: DialReply },
    Disconnect { peer: PeerId },
}

/// State shared between the host handle, the driver and the accept tasks.
struct Shared {
    id: PeerId,
    core: HostCore,
    /// Connected peers and the address we reached them on.
    peers: DashMap<PeerId, Multiaddr>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    /// Protocols with a running accept task.
    accepting: DashMap<String, ()>,
}

struct TcpInner {
    shared: Arc<Shared>,
    control: Mutex<Control>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: ShutdownSignal,
}

/// libp2p-backed host. Cheap to clone.
#[derive(Clone)]
pub struct TcpHost {
    inner: Arc<TcpInner>,
}

impl TcpHost {
    /// Binds a listener on `addr` with a fresh ed25519 identity and drives
    /// the swarm until `shutdown` fires. Use port 0 to let the OS pick.
    pub async fn bind(addr: SocketAddr, shutdown: ShutdownSignal) -> Result<Self, TransportError> {
        Self::bind_with_keypair(addr, Keypair::generate_ed25519(), shutdown).await
    }

    /// Like [`bind`](Self::bind) with a caller-supplied identity key.
    ///
    /// Returns once the listener has reported its first address.
    pub async fn bind_with_keypair(
        addr: SocketAddr,
        keypair: Keypair,
        shutdown: ShutdownSignal,
    ) -> Result<Self, TransportError> {
        let id = keypair.public().to_peer_id();
        let behaviour = libp2p_stream::Behaviour::new();
        let control = behaviour.new_control();

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_behaviour(|_| Ok(behaviour))
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        swarm
            .listen_on(multiaddr_of(addr))
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let first = tokio::time::timeout(DIAL_TIMEOUT, first_listen_addr(&mut swarm))
            .await
            .map_err(|_| TransportError::Setup(format!("listener on {addr} never came up")))??;

        let shared = Arc::new(Shared {
            id,
            core: HostCore::default(),
            peers: DashMap::new(),
            listen_addrs: RwLock::new(vec![first.clone()]),
            accepting: DashMap::new(),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        info!(peer_id = %id, listen = %first, "tcp host listening");
        tokio::spawn(drive(
            swarm,
            Arc::clone(&shared),
            command_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            inner: Arc::new(TcpInner {
                shared,
                control: Mutex::new(control),
                commands,
                shutdown,
            }),
        })
    }
}

/// Renders a socket address as `/ip4/.../tcp/...`.
pub fn multiaddr_of(addr: SocketAddr) -> Multiaddr {
    Multiaddr::from(addr.ip()).with(Protocol::Tcp(addr.port()))
}

async fn first_listen_addr(
    swarm: &mut Swarm<libp2p_stream::Behaviour>,
) -> Result<Multiaddr, TransportError> {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
            SwarmEvent::ListenerError { error, .. } => {
                return Err(TransportError::Setup(error.to_string()))
            }
            SwarmEvent::ListenerClosed { reason, .. } => {
                return Err(TransportError::Setup(format!("listener closed: {reason:?}")))
            }
            _ => {}
        }
    }
}

/// Owns the swarm. Ends on shutdown or once every host handle is gone.
async fn drive(
    mut swarm: Swarm<libp2p_stream::Behaviour>,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: ShutdownSignal,
) {
    let mut pending: HashMap<ConnectionId, DialReply> = HashMap::new();

    loop {
        tokio::select! {
            event = swarm.select_next_some() => on_swarm_event(&shared, &mut pending, event),
            cmd = commands.recv() => match cmd {
                Some(Command::Dial { addr, reply }) => {
                    let opts = DialOpts::unknown_peer_id().address(addr).build();
                    let conn = opts.connection_id();
                    match swarm.dial(opts) {
                        Ok(()) => {
                            pending.insert(conn, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(TransportError::Dial(e.to_string())));
                        }
                    }
                }
                Some(Command::Disconnect { peer }) => {
                    let _ = swarm.disconnect_peer_id(peer);
                }
                None => break,
            },
            _ = shutdown.wait() => break,
        }
    }

    debug!(peer_id = %shared.id, "tcp host stopping");
    let peers: Vec<PeerId> = shared.peers.iter().map(|e| *e.key()).collect();
    for peer in peers {
        let _ = swarm.disconnect_peer_id(peer);
        if shared.peers.remove(&peer).is_some() {
            shared.core.notify_disconnected(peer);
        }
    }
}

fn on_swarm_event(
    shared: &Shared,
    pending: &mut HashMap<ConnectionId, DialReply>,
    event: SwarmEvent<()>,
) {
    match event {
        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            endpoint,
            num_established,
            ..
        } => {
            if num_established.get() == 1 {
                shared
                    .peers
                    .insert(peer_id, endpoint.get_remote_address().clone());
                shared.core.notify_connected(peer_id);
            }
            if let Some(reply) = pending.remove(&connection_id) {
                let _ = reply.send(Ok(peer_id));
            }
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            cause,
            ..
        } => {
            debug!(peer = %peer_id, ?cause, "connection closed");
            if num_established == 0 && shared.peers.remove(&peer_id).is_some() {
                shared.core.notify_disconnected(peer_id);
            }
        }
        SwarmEvent::OutgoingConnectionError {
            connection_id,
            error,
            ..
        } => {
            if let Some(reply) = pending.remove(&connection_id) {
                let _ = reply.send(Err(TransportError::Dial(error.to_string())));
            }
        }
        SwarmEvent::IncomingConnectionError {
            send_back_addr,
            error,
            ..
        } => {
            debug!(remote = %send_back_addr, %error, "inbound connection failed");
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            let mut addrs = shared.listen_addrs.write();
            if !addrs.contains(&address) {
                addrs.push(address);
            }
        }
        SwarmEvent::ExpiredListenAddr { address, .. } => {
            shared.listen_addrs.write().retain(|a| a != &address);
        }
        _ => {}
    }
}

/// Hands every inbound substream on `protocol` to the registered handler.
async fn accept_streams(
    shared: Arc<Shared>,
    protocol: String,
    mut incoming: IncomingStreams,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            next = incoming.next() => match next {
                Some((peer, raw)) => {
                    let stream = Stream::new(peer, protocol.clone(), raw.compat());
                    if let Err(stream) = shared.core.dispatch(stream) {
                        debug!(%peer, protocol = stream.protocol(), "no handler, dropping stream");
                    }
                }
                None => return,
            },
            _ = shutdown.wait() => return,
        }
    }
}

fn stream_protocol(protocol: &str) -> Result<StreamProtocol, TransportError> {
    StreamProtocol::try_from_owned(protocol.to_string())
        .map_err(|e| TransportError::Negotiation(format!("{protocol}: {e}")))
}

#[async_trait]
impl Host for TcpHost {
    fn local_peer_id(&self) -> PeerId {
        self.inner.shared.id
    }

    fn local_addresses(&self) -> Vec<Multiaddr> {
        self.inner.shared.listen_addrs.read().clone()
    }

    async fn connect(&self, addr: &Multiaddr) -> Result<PeerId, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Dial {
                addr: addr.clone(),
                reply,
            })
            .map_err(|_| TransportError::HostClosed)?;

        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(TransportError::HostClosed),
            Err(_) => Err(TransportError::DialTimeout(addr.to_string())),
        }
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream, TransportError> {
        if !self.inner.shared.peers.contains_key(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        let proto = stream_protocol(protocol)?;
        let mut control = self.inner.control.lock().clone();

        let raw = match tokio::time::timeout(DIAL_TIMEOUT, control.open_stream(peer, proto)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(OpenStreamError::UnsupportedProtocol(_))) => {
                return Err(TransportError::ProtocolNotSupported {
                    peer,
                    protocol: protocol.to_string(),
                })
            }
            Ok(Err(OpenStreamError::Io(e))) => return Err(TransportError::Io(e)),
            Ok(Err(e)) => return Err(TransportError::Negotiation(e.to_string())),
            Err(_) => {
                return Err(TransportError::OpenTimeout {
                    peer,
                    protocol: protocol.to_string(),
                })
            }
        };
        Ok(Stream::new(peer, protocol, raw.compat()))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        let shared = &self.inner.shared;
        shared.core.set_handler(protocol, handler);
        if shared.accepting.insert(protocol.to_string(), ()).is_some() {
            return;
        }

        let incoming = match stream_protocol(protocol)
            .and_then(|p| {
                self.inner
                    .control
                    .lock()
                    .accept(p)
                    .map_err(|e| TransportError::Negotiation(e.to_string()))
            }) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(protocol, error = %e, "cannot accept streams");
                shared.accepting.remove(protocol);
                return;
            }
        };
        tokio::spawn(accept_streams(
            Arc::clone(shared),
            protocol.to_string(),
            incoming,
            self.inner.shutdown.clone(),
        ));
    }

    fn register_notifiee(&self, notifiee: Arc<dyn ConnectionNotifiee>) {
        self.inner.shared.core.add_notifiee(notifiee);
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), TransportError> {
        if self.inner.shared.peers.remove(&peer).is_none() {
            return Err(TransportError::NotConnected(peer));
        }
        self.inner.shared.core.notify_disconnected(peer);
        self.inner
            .commands
            .send(Command::Disconnect { peer })
            .map_err(|_| TransportError::HostClosed)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.shared.peers.iter().map(|e| *e.key()).collect()
    }
}
