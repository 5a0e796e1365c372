// src/transport.rs
// Port layer (spec section 6): the libp2p-compatible stack named by the
// spec as an external collaborator is modeled as three port traits rather
// than linked in directly, exactly the way `Storage` and `DirectoryScanner`
// are ports elsewhere in this crate (see SPEC_FULL.md, "Relationship to the
// teacher"). One concrete implementation, `LanTransport`, ships: UDP
// broadcast advertise/discover (grounded in the teacher's `discovery.rs`,
// rewritten on tokio) plus newline-delimited JSON framing over
// `tokio::net::TcpStream` for both RPC and gossip (the pattern
// `MegalithOfficial-vocalix-v2`'s `services/p2p.rs` uses for its encrypted
// handshake).

use crate::error::TransportError;
use crate::model::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

pub const DISCOVERY_PORT: u16 = 47015;
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Advertise/discover providers of a mnemonic on the DHT (spec 4.7 step 1-2).
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    fn self_id(&self) -> PeerId;
    async fn advertise(&self, mnemonic: &str, ttl: Duration) -> Result<(), TransportError>;
    async fn find_providers(&self, mnemonic: &str) -> Result<Vec<PeerId>, TransportError>;
    /// Resolve a known peer id to a dialable address, for RPC/gossip.
    async fn resolve(&self, peer: &PeerId) -> Option<SocketAddr>;
}

/// A joined gossip topic: publish, and receive the next inbound message.
#[async_trait]
pub trait GossipTopic: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn next_message(&mut self) -> Result<(PeerId, Vec<u8>), TransportError>;
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Handles one RPC protocol id's inbound requests on the server side.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, caller: PeerId, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Single-request/single-response RPC plus registration of server handlers,
/// addressed by protocol id string (spec 6's "arbitrary protocol streams").
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, peer: &PeerId, protocol_id: &str, request: Vec<u8>) -> Result<Vec<u8>, TransportError>;
    async fn register_handler(&self, protocol_id: &str, handler: Arc<dyn RpcHandler>);
}

/// Bundles the three ports plus topic-join, the shape `WorkspaceManager`
/// actually depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    fn discovery(&self) -> Arc<dyn PeerDiscovery>;
    fn rpc(&self) -> Arc<dyn RpcTransport>;
    async fn join_topic(&self, topic_name: &str) -> Result<Box<dyn GossipTopic>, TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Advertisement {
    peer_id: String,
    mnemonic: String,
    rpc_addr: SocketAddr,
}

struct ProviderRecord {
    addr: SocketAddr,
    last_seen: Instant,
}

/// LAN discovery + RPC/gossip over a bound TCP listener, grounded in the
/// teacher's UDP-broadcast `DiscoveryManager` and a newline-delimited JSON
/// wire format for streams.
pub struct LanTransport {
    self_peer: PeerId,
    rpc_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    extra_broadcasts: Vec<SocketAddr>,
    providers: Arc<RwLock<HashMap<String, HashMap<String, ProviderRecord>>>>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn RpcHandler>>>>,
    gossip_senders: Arc<RwLock<HashMap<String, mpsc::Sender<(PeerId, Vec<u8>)>>>>,
}

/// Per-subnet broadcast addresses for every non-loopback local NIC, so
/// `advertise` reaches peers on interfaces whose subnet isn't the
/// directed-global address (multi-NIC hosts, VMs, containers). Mirrors the
/// teacher's `discovery.rs::get_local_broadcast_addresses`.
fn local_subnet_broadcasts() -> Vec<std::net::Ipv4Addr> {
    use std::net::Ipv4Addr;

    let mut addresses = Vec::new();
    let Ok(interfaces) = network_interface::NetworkInterface::show() else {
        return addresses;
    };
    for iface in &interfaces {
        for addr in &iface.addr {
            let network_interface::Addr::V4(v4) = addr else {
                continue;
            };
            let ip = v4.ip;
            if ip.is_loopback() {
                continue;
            }
            let bcast = match v4.broadcast {
                Some(bcast) => bcast,
                None => {
                    let octets = ip.octets();
                    match v4.netmask {
                        Some(netmask) => {
                            let mask = netmask.octets();
                            Ipv4Addr::new(
                                octets[0] | !mask[0],
                                octets[1] | !mask[1],
                                octets[2] | !mask[2],
                                octets[3] | !mask[3],
                            )
                        }
                        None => Ipv4Addr::new(octets[0], octets[1], octets[2], 255),
                    }
                }
            };
            if bcast != Ipv4Addr::BROADCAST && !addresses.contains(&bcast) {
                addresses.push(bcast);
            }
        }
    }
    addresses
}

impl LanTransport {
    pub async fn bind(self_peer: PeerId, bind_host: &str, port: u16) -> Result<Arc<Self>, TransportError> {
        let udp = UdpSocket::bind((bind_host, DISCOVERY_PORT))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        udp.set_broadcast(true)
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let listener = TcpListener::bind((bind_host, port))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let rpc_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let extra_broadcasts = local_subnet_broadcasts()
            .into_iter()
            .map(|ip| SocketAddr::from((ip, DISCOVERY_PORT)))
            .collect();

        let transport = Arc::new(LanTransport {
            self_peer,
            rpc_addr,
            udp: Arc::new(udp),
            extra_broadcasts,
            providers: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            gossip_senders: Arc::new(RwLock::new(HashMap::new())),
        });

        transport.clone().spawn_udp_listener();
        transport.clone().spawn_tcp_listener(listener);
        Ok(transport)
    }

    fn spawn_udp_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (n, _src) = match self.udp.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "discovery socket read failed");
                        continue;
                    }
                };
                let Ok(ad) = serde_json::from_slice::<Advertisement>(&buf[..n]) else {
                    continue;
                };
                if ad.peer_id == self.self_peer.0 {
                    continue;
                }
                let mut providers = self.providers.write().await;
                let by_peer = providers.entry(ad.mnemonic.clone()).or_default();
                by_peer.insert(
                    ad.peer_id.clone(),
                    ProviderRecord {
                        addr: ad.rpc_addr,
                        last_seen: Instant::now(),
                    },
                );
            }
        });
    }

    fn spawn_tcp_listener(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                let (stream, _addr) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "rpc listener accept failed");
                        continue;
                    }
                };
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.serve_connection(stream).await {
                        debug!(error = %e, "rpc connection ended with error");
                    }
                });
            }
        });
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let envelope: WireEnvelope = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(_) => continue,
            };
            match envelope {
                WireEnvelope::Rpc {
                    protocol_id,
                    caller,
                    payload,
                } => {
                    let handler = self.handlers.read().await.get(&protocol_id).cloned();
                    let response = match handler {
                        Some(h) => h.handle(PeerId(caller), payload).await,
                        None => Err(TransportError::Stream(format!("no handler for {protocol_id}"))),
                    };
                    let reply = match response {
                        Ok(payload) => WireEnvelope::RpcResponse { ok: true, payload },
                        Err(e) => WireEnvelope::RpcResponse {
                            ok: false,
                            payload: e.to_string().into_bytes(),
                        },
                    };
                    let mut line = serde_json::to_vec(&reply).unwrap_or_default();
                    line.push(b'\n');
                    let _ = write_half.write_all(&line).await;
                }
                WireEnvelope::Gossip { topic, sender, payload } => {
                    if let Some(tx) = self.gossip_senders.read().await.get(&topic) {
                        let _ = tx.send((PeerId(sender), payload)).await;
                    }
                }
                WireEnvelope::RpcResponse { .. } => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum WireEnvelope {
    Rpc {
        protocol_id: String,
        caller: String,
        payload: Vec<u8>,
    },
    RpcResponse {
        ok: bool,
        payload: Vec<u8>,
    },
    Gossip {
        topic: String,
        sender: String,
        payload: Vec<u8>,
    },
}

#[async_trait]
impl PeerDiscovery for LanTransport {
    fn self_id(&self) -> PeerId {
        self.self_peer.clone()
    }

    async fn advertise(&self, mnemonic: &str, _ttl: Duration) -> Result<(), TransportError> {
        let ad = Advertisement {
            peer_id: self.self_peer.0.clone(),
            mnemonic: mnemonic.to_string(),
            rpc_addr: self.rpc_addr,
        };
        let payload = serde_json::to_vec(&ad).map_err(|e| TransportError::Stream(e.to_string()))?;
        let broadcast = SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT));
        self.udp
            .send_to(&payload, broadcast)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        for addr in &self.extra_broadcasts {
            // Best-effort: a subnet with no listener shouldn't fail the advertise.
            let _ = self.udp.send_to(&payload, addr).await;
        }
        Ok(())
    }

    async fn find_providers(&self, mnemonic: &str) -> Result<Vec<PeerId>, TransportError> {
        let mut providers = self.providers.write().await;
        let Some(by_peer) = providers.get_mut(mnemonic) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        by_peer.retain(|_, record| now.duration_since(record.last_seen) < PEER_TIMEOUT);
        Ok(by_peer.keys().map(|id| PeerId(id.clone())).collect())
    }

    async fn resolve(&self, peer: &PeerId) -> Option<SocketAddr> {
        let providers = self.providers.read().await;
        providers
            .values()
            .find_map(|by_peer| by_peer.get(&peer.0).map(|r| r.addr))
    }
}

#[async_trait]
impl RpcTransport for LanTransport {
    async fn call(&self, peer: &PeerId, protocol_id: &str, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let addr = PeerDiscovery::resolve(self, peer)
            .await
            .ok_or_else(|| TransportError::Stream(format!("unknown peer {peer}")))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();
        let envelope = WireEnvelope::Rpc {
            protocol_id: protocol_id.to_string(),
            caller: self.self_peer.0.clone(),
            payload: request,
        };
        let mut line = serde_json::to_vec(&envelope).map_err(|e| TransportError::Stream(e.to_string()))?;
        line.push(b'\n');
        write_half
            .write_all(&line)
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        let mut lines = BufReader::new(read_half).lines();
        let reply_line = tokio::time::timeout(Duration::from_secs(30), lines.next_line())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Stream(e.to_string()))?
            .ok_or_else(|| TransportError::Stream("connection closed before reply".to_string()))?;
        match serde_json::from_str::<WireEnvelope>(&reply_line) {
            Ok(WireEnvelope::RpcResponse { ok: true, payload }) => Ok(payload),
            Ok(WireEnvelope::RpcResponse { ok: false, payload }) => {
                Err(TransportError::Stream(String::from_utf8_lossy(&payload).to_string()))
            }
            _ => Err(TransportError::Stream("malformed rpc reply".to_string())),
        }
    }

    async fn register_handler(&self, protocol_id: &str, handler: Arc<dyn RpcHandler>) {
        self.handlers.write().await.insert(protocol_id.to_string(), handler);
    }
}

impl LanTransport {
    async fn do_join_topic(&self, topic_name: &str) -> Result<Box<dyn GossipTopic>, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        self.gossip_senders.write().await.insert(topic_name.to_string(), tx);
        Ok(Box::new(LanGossipTopic {
            topic_name: topic_name.to_string(),
            self_peer: self.self_peer.clone(),
            providers: self.providers.clone(),
            gossip_senders: self.gossip_senders.clone(),
            receiver: rx,
        }))
    }
}

/// `Transport` is implemented on `Arc<LanTransport>` rather than bare
/// `LanTransport`: `discovery()`/`rpc()` hand out `Arc<dyn ..>` clones of the
/// same underlying socket state, which requires the transport to already be
/// behind a reference-counted handle (exactly what `LanTransport::bind`
/// returns).
#[async_trait]
impl Transport for Arc<LanTransport> {
    fn discovery(&self) -> Arc<dyn PeerDiscovery> {
        self.clone()
    }

    fn rpc(&self) -> Arc<dyn RpcTransport> {
        self.clone()
    }

    async fn join_topic(&self, topic_name: &str) -> Result<Box<dyn GossipTopic>, TransportError> {
        self.do_join_topic(topic_name).await
    }
}

/// A joined LAN gossip topic. Publishing fans the payload out to every known
/// provider of the topic's mnemonic over its RPC connection; subscribing
/// reads from the channel `LanTransport::serve_connection` feeds.
struct LanGossipTopic {
    topic_name: String,
    self_peer: PeerId,
    providers: Arc<RwLock<HashMap<String, HashMap<String, ProviderRecord>>>>,
    gossip_senders: Arc<RwLock<HashMap<String, mpsc::Sender<(PeerId, Vec<u8>)>>>>,
    receiver: mpsc::Receiver<(PeerId, Vec<u8>)>,
}

#[async_trait]
impl GossipTopic for LanGossipTopic {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let providers = self.providers.read().await;
        let Some(by_peer) = providers.get(&self.topic_name) else {
            return Ok(());
        };
        let envelope = WireEnvelope::Gossip {
            topic: self.topic_name.clone(),
            sender: self.self_peer.0.clone(),
            payload,
        };
        let mut line = serde_json::to_vec(&envelope).map_err(|e| TransportError::Stream(e.to_string()))?;
        line.push(b'\n');
        for record in by_peer.values() {
            if let Ok(mut stream) = TcpStream::connect(record.addr).await {
                let _ = stream.write_all(&line).await;
            }
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<(PeerId, Vec<u8>), TransportError> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| TransportError::Stream("topic closed".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.gossip_senders.write().await.remove(&self.topic_name);
        Ok(())
    }
}

// In-memory transport used by tests (tests/scenarios.rs), wiring two or
// more peers through channels instead of real sockets.
pub mod loopback {
    use super::*;
    use std::collections::HashSet;

    struct Shared {
        discovery: RwLock<HashMap<String, HashSet<PeerId>>>,
        handlers: RwLock<HashMap<(PeerId, String), Arc<dyn RpcHandler>>>,
        topics: RwLock<HashMap<String, Vec<mpsc::Sender<(PeerId, Vec<u8>)>>>>,
    }

    /// A shared in-process fabric connecting every `LoopbackTransport` built
    /// from the same `LoopbackNetwork`.
    #[derive(Clone)]
    pub struct LoopbackNetwork(Arc<Shared>);

    impl LoopbackNetwork {
        pub fn new() -> Self {
            LoopbackNetwork(Arc::new(Shared {
                discovery: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
            }))
        }

        pub fn peer(&self, peer: PeerId) -> Arc<LoopbackTransport> {
            Arc::new(LoopbackTransport {
                self_peer: peer,
                network: self.clone(),
            })
        }
    }

    impl Default for LoopbackNetwork {
        fn default() -> Self {
            Self::new()
        }
    }

    /// One peer's view of a `LoopbackNetwork`: implements all three ports
    /// directly (no serialization, no sockets) for deterministic tests.
    #[derive(Clone)]
    pub struct LoopbackTransport {
        self_peer: PeerId,
        network: LoopbackNetwork,
    }

    #[async_trait]
    impl PeerDiscovery for LoopbackTransport {
        fn self_id(&self) -> PeerId {
            self.self_peer.clone()
        }

        async fn advertise(&self, mnemonic: &str, _ttl: Duration) -> Result<(), TransportError> {
            self.network
                .0
                .discovery
                .write()
                .await
                .entry(mnemonic.to_string())
                .or_default()
                .insert(self.self_peer.clone());
            Ok(())
        }

        async fn find_providers(&self, mnemonic: &str) -> Result<Vec<PeerId>, TransportError> {
            Ok(self
                .network
                .0
                .discovery
                .read()
                .await
                .get(mnemonic)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn resolve(&self, _peer: &PeerId) -> Option<SocketAddr> {
            None
        }
    }

    #[async_trait]
    impl RpcTransport for LoopbackTransport {
        async fn call(&self, peer: &PeerId, protocol_id: &str, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            let handler = self
                .network
                .0
                .handlers
                .read()
                .await
                .get(&(peer.clone(), protocol_id.to_string()))
                .cloned()
                .ok_or_else(|| TransportError::Stream(format!("no handler for {protocol_id} on {peer}")))?;
            handler.handle(self.self_peer.clone(), request).await
        }

        async fn register_handler(&self, protocol_id: &str, handler: Arc<dyn RpcHandler>) {
            self.network
                .0
                .handlers
                .write()
                .await
                .insert((self.self_peer.clone(), protocol_id.to_string()), handler);
        }
    }

    pub struct LoopbackGossipTopic {
        topic_name: String,
        network: LoopbackNetwork,
        self_peer: PeerId,
        receiver: mpsc::Receiver<(PeerId, Vec<u8>)>,
    }

    #[async_trait]
    impl GossipTopic for LoopbackGossipTopic {
        async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
            let topics = self.network.0.topics.read().await;
            if let Some(subscribers) = topics.get(&self.topic_name) {
                for tx in subscribers {
                    let _ = tx.send((self.self_peer.clone(), payload.clone())).await;
                }
            }
            Ok(())
        }

        async fn next_message(&mut self) -> Result<(PeerId, Vec<u8>), TransportError> {
            self.receiver
                .recv()
                .await
                .ok_or_else(|| TransportError::Stream("topic closed".to_string()))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    impl LoopbackTransport {
        async fn do_join_topic(&self, topic_name: &str) -> Result<Box<dyn GossipTopic>, TransportError> {
            let (tx, rx) = mpsc::channel(256);
            self.network
                .0
                .topics
                .write()
                .await
                .entry(topic_name.to_string())
                .or_default()
                .push(tx);
            Ok(Box::new(LoopbackGossipTopic {
                topic_name: topic_name.to_string(),
                network: self.network.clone(),
                self_peer: self.self_peer.clone(),
                receiver: rx,
            }))
        }
    }

    #[async_trait]
    impl Transport for Arc<LoopbackTransport> {
        fn discovery(&self) -> Arc<dyn PeerDiscovery> {
            self.clone()
        }

        fn rpc(&self) -> Arc<dyn RpcTransport> {
            self.clone()
        }

        async fn join_topic(&self, topic_name: &str) -> Result<Box<dyn GossipTopic>, TransportError> {
            self.do_join_topic(topic_name).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackNetwork;
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(&self, _caller: PeerId, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            Ok(request)
        }
    }

    #[tokio::test]
    async fn loopback_rpc_roundtrip() {
        let network = LoopbackNetwork::new();
        let a = network.peer(PeerId::from("a"));
        let b = network.peer(PeerId::from("b"));
        b.register_handler("/echo/0.1", Arc::new(EchoHandler)).await;
        let reply = a.call(&PeerId::from("b"), "/echo/0.1", b"hello".to_vec()).await.unwrap();
        assert_eq!(reply, b"hello");
    }

    #[tokio::test]
    async fn loopback_discovery_and_gossip() {
        let network = LoopbackNetwork::new();
        let a = network.peer(PeerId::from("a"));
        let b = network.peer(PeerId::from("b"));
        b.advertise("alpha bravo", Duration::from_secs(5)).await.unwrap();
        let providers = a.find_providers("alpha bravo").await.unwrap();
        assert_eq!(providers, vec![PeerId::from("b")]);

        let mut topic_a = Transport::join_topic(&a, "alpha bravo").await.unwrap();
        let mut topic_b = Transport::join_topic(&b, "alpha bravo").await.unwrap();
        topic_a.publish(b"inventory".to_vec()).await.unwrap();
        let (sender, payload) = topic_b.next_message().await.unwrap();
        assert_eq!(sender, PeerId::from("a"));
        assert_eq!(payload, b"inventory");
    }
}
