//! # In-Memory Transport
//!
//! A whole network of hosts inside one process. Hosts are addressed as
//! `/memory/<port>`, connections are entries in a link table, and every
//! stream is a `tokio::io::duplex` pipe. Used by the test suites and by
//! simulations that want real concurrency without sockets.
//!
//! The duplex buffer size is configurable: shrink it to make writers block
//! on a peer that never reads, which is how the timeout paths get tested.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use tracing::debug;

use super::{ConnectionNotifiee, Host, HostCore, Stream, StreamHandler, TransportError};
use crate::config::MEMORY_STREAM_BUFFER;

/// The shared fabric every [`MemoryHost`] is attached to.
pub struct MemoryNetwork {
    hosts: DashMap<PeerId, Arc<MemoryHost>>,
    ports: DashMap<u64, PeerId>,
    links: RwLock<HashSet<(PeerId, PeerId)>>,
    next_port: AtomicU64,
    buffer_size: usize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_buffer_size(MEMORY_STREAM_BUFFER)
    }

    /// Creates a network whose streams buffer at most `buffer_size` bytes
    /// in each direction.
    pub fn with_buffer_size(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            hosts: DashMap::new(),
            ports: DashMap::new(),
            links: RwLock::new(HashSet::new()),
            next_port: AtomicU64::new(1),
            buffer_size,
        })
    }

    /// Attaches a new host with a random identity.
    pub fn add_host(self: &Arc<Self>) -> Arc<MemoryHost> {
        let id = PeerId::random();
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let host = Arc::new(MemoryHost {
            id,
            addr: Multiaddr::empty().with(Protocol::Memory(port)),
            network: Arc::downgrade(self),
            core: HostCore::default(),
        });
        self.hosts.insert(id, Arc::clone(&host));
        self.ports.insert(port, id);
        host
    }

    /// Connects two hosts. Returns `false` if they were already connected.
    pub fn link(&self, a: PeerId, b: PeerId) -> Result<bool, TransportError> {
        let host_a = self.host(a).ok_or(TransportError::NotConnected(a))?;
        let host_b = self.host(b).ok_or(TransportError::NotConnected(b))?;

        if !self.links.write().insert(link_key(a, b)) {
            return Ok(false);
        }
        host_a.core.notify_connected(b);
        host_b.core.notify_connected(a);
        Ok(true)
    }

    /// Disconnects two hosts. Streams already open keep working until
    /// their owners drop them.
    pub fn unlink(&self, a: PeerId, b: PeerId) -> bool {
        if !self.links.write().remove(&link_key(a, b)) {
            return false;
        }
        if let Some(host) = self.host(a) {
            host.core.notify_disconnected(b);
        }
        if let Some(host) = self.host(b) {
            host.core.notify_disconnected(a);
        }
        true
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.read().contains(&link_key(a, b))
    }

    fn host(&self, id: PeerId) -> Option<Arc<MemoryHost>> {
        self.hosts.get(&id).map(|h| Arc::clone(h.value()))
    }

    fn resolve(&self, addr: &Multiaddr) -> Option<PeerId> {
        addr.iter().find_map(|p| match p {
            Protocol::Memory(port) => self.ports.get(&port).map(|id| *id.value()),
            _ => None,
        })
    }

    fn peers_of(&self, id: PeerId) -> Vec<PeerId> {
        self.links
            .read()
            .iter()
            .filter_map(|&(a, b)| match (a == id, b == id) {
                (true, _) => Some(b),
                (_, true) => Some(a),
                _ => None,
            })
            .collect()
    }
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A host living on a [`MemoryNetwork`].
pub struct MemoryHost {
    id: PeerId,
    addr: Multiaddr,
    network: Weak<MemoryNetwork>,
    core: HostCore,
}

impl MemoryHost {
    fn network(&self) -> Result<Arc<MemoryNetwork>, TransportError> {
        self.network
            .upgrade()
            .ok_or_else(|| TransportError::UnsupportedAddress("memory network is gone".into()))
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    fn local_addresses(&self) -> Vec<Multiaddr> {
        vec![self.addr.clone()]
    }

    async fn connect(&self, addr: &Multiaddr) -> Result<PeerId, TransportError> {
        let network = self.network()?;
        let peer = network
            .resolve(addr)
            .ok_or_else(|| TransportError::UnsupportedAddress(addr.to_string()))?;
        if peer == self.id {
            return Err(TransportError::UnsupportedAddress(format!(
                "{addr} is this host"
            )));
        }
        network.link(self.id, peer)?;
        Ok(peer)
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<Stream, TransportError> {
        let network = self.network()?;
        if !network.is_linked(self.id, peer) {
            return Err(TransportError::NotConnected(peer));
        }
        let remote = network.host(peer).ok_or(TransportError::NotConnected(peer))?;

        let (near, far) = tokio::io::duplex(network.buffer_size);
        remote
            .core
            .dispatch(Stream::new(self.id, protocol, far))
            .map_err(|_| TransportError::ProtocolNotSupported {
                peer,
                protocol: protocol.to_string(),
            })?;

        debug!(%peer, protocol, "opened memory stream");
        Ok(Stream::new(peer, protocol, near))
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.core.set_handler(protocol, handler);
    }

    fn register_notifiee(&self, notifiee: Arc<dyn ConnectionNotifiee>) {
        self.core.add_notifiee(notifiee);
    }

    async fn disconnect(&self, peer: PeerId) -> Result<(), TransportError> {
        let network = self.network()?;
        if network.unlink(self.id, peer) {
            Ok(())
        } else {
            Err(TransportError::NotConnected(peer))
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.network()
            .map(|n| n.peers_of(self.id))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stream_handler;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_by_address_links_both_sides() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();

        let addr = b.local_addresses()[0].clone();
        let peer = a.connect(&addr).await.unwrap();

        assert_eq!(peer, b.local_peer_id());
        assert_eq!(a.connected_peers(), vec![b.local_peer_id()]);
        assert_eq!(b.connected_peers(), vec![a.local_peer_id()]);
    }

    #[tokio::test]
    async fn relinking_is_not_a_new_connection() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();

        assert!(net.link(a.local_peer_id(), b.local_peer_id()).unwrap());
        assert!(!net.link(b.local_peer_id(), a.local_peer_id()).unwrap());
    }

    #[tokio::test]
    async fn open_stream_requires_connection_and_handler() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();

        let err = a
            .open_stream(b.local_peer_id(), "/x/1.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected(_)));

        net.link(a.local_peer_id(), b.local_peer_id()).unwrap();
        let err = a
            .open_stream(b.local_peer_id(), "/x/1.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ProtocolNotSupported { .. }));
    }

    #[tokio::test]
    async fn inbound_stream_carries_dialer_identity() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        net.link(a.local_peer_id(), b.local_peer_id()).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        b.set_stream_handler(
            "/x/1.0.0",
            stream_handler(move |mut s: Stream| {
                let tx = tx.lock().take();
                async move {
                    let mut buf = Vec::new();
                    s.read_to_end(&mut buf).await.unwrap();
                    if let Some(tx) = tx {
                        let _ = tx.send((s.peer(), buf));
                    }
                }
            }),
        );

        let mut s = a.open_stream(b.local_peer_id(), "/x/1.0.0").await.unwrap();
        s.write_all(b"hi").await.unwrap();
        drop(s);

        let (from, body) = rx.await.unwrap();
        assert_eq!(from, a.local_peer_id());
        assert_eq!(body, b"hi");
    }

    #[tokio::test]
    async fn disconnect_clears_link() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        net.link(a.local_peer_id(), b.local_peer_id()).unwrap();

        a.disconnect(b.local_peer_id()).await.unwrap();
        assert!(a.connected_peers().is_empty());
        assert!(a.disconnect(b.local_peer_id()).await.is_err());
    }
}
