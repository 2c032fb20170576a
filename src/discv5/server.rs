use crate::discv5::codec::{
    self, AuthTag, Discv5Codec, HandshakePacket, ID_NONCE_LENGTH, IdNonce, InboundPacket,
    OrdinaryPacket, PacketError, RANDOM_PACKET_PAYLOAD_LENGTH, WhoAreYouPacket, compute_tag,
};
use crate::discv5::lookup;
use crate::discv5::messages::{
    FindNodeMessage, Message, MessageDecodeError, NodesMessage, PingMessage, PongMessage,
    REQUEST_ID_LENGTH,
};
use crate::discv5::session::{
    CryptographyError, Session, SessionStore, create_id_signature, decrypt_message,
    derive_session_keys, encrypt_message, open_auth_response, seal_auth_response,
    verify_id_signature,
};
use crate::kademlia::{BUCKET_SIZE, KademliaTable};
use crate::types::{Node, NodeRecord, NodeRecordError};
use crate::utils::{
    compress_pubkey, is_private_ip, is_valid_neighbour_ip, log_distance, public_key_from_secret,
};
use bytes::Bytes;
use ethereum_types::H256;
use futures::StreamExt;
use rand::RngCore;
use rand::rngs::OsRng;
use rustc_hash::{FxHashMap, FxHashSet};
use secp256k1::{PublicKey, SecretKey};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, error, info, trace};

/// Kademlia concurrency factor: queries in flight during a lookup.
pub(crate) const ALPHA: usize = 3;
/// Distances queried per peer during one lookup step.
pub(crate) const LOOKUP_REQUEST_LIMIT: usize = 3;
/// Cap on the nodes served (and accepted) for a single FINDNODE.
pub(crate) const FIND_NODE_RESULT_LIMIT: usize = 15;
/// Maximum number of ENRs per NODES message (limited by UDP packet size).
const MAX_NODES_PER_PACKET: usize = 3;
/// Upper bound on the NODES packets awaited for one request, whatever the
/// remote claims in `total`.
const MAX_NODES_RESPONSE_PACKETS: u64 = (FIND_NODE_RESULT_LIMIT / MAX_NODES_PER_PACKET) as u64;
/// How long a response slot and its pending-request entry stay armed.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a WHOAREYOU challenge waits for the matching handshake message.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between rounds of the periodic lookup loop.
pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound of the random sleep between revalidation probes.
const REVALIDATION_INTERVAL: Duration = Duration::from_secs(10);
/// Minimum interval between WHOAREYOU packets to the same IP address.
/// Prevents amplification attacks where attackers spoof source IPs.
const WHOAREYOU_RATE_LIMIT: Duration = Duration::from_secs(1);
/// How often stale cache entries are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);
/// Time window for collecting external-address votes from PONGs.
const IP_VOTE_WINDOW: Duration = Duration::from_secs(300);
/// Minimum number of agreeing votes required to update the external IP.
const IP_VOTE_THRESHOLD: usize = 3;
/// Consecutive failed revalidation probes before a node is dropped.
const DEFAULT_REVALIDATION_FAILURE_THRESHOLD: u8 = 3;
const COMMAND_BUFFER: usize = 64;
/// Response slots hold at most one full multi-packet NODES response.
const RESPONSE_SLOT_CAPACITY: usize = MAX_NODES_RESPONSE_PACKETS as usize + 1;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to decode packet")]
    Decode(#[from] PacketError),
    #[error(transparent)]
    Crypto(#[from] CryptographyError),
    #[error("randomness source failed: {0}")]
    Randomness(#[from] rand::Error),
    #[error(transparent)]
    Record(#[from] NodeRecordError),
    #[error("cannot reply without an established session")]
    NoSession,
    #[error("the discovery engine is closed")]
    Closed,
}

/// Data carried by a timely PONG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub enr_seq: u64,
    /// Our own address as observed by the remote peer.
    pub observed_addr: SocketAddr,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub table_nodes: usize,
    /// Requests with a live response slot.
    pub outstanding_requests: usize,
    /// Sent messages retained for WHOAREYOU re-encryption.
    pub pending_messages: usize,
    /// WHOAREYOU challenges awaiting a handshake.
    pub pending_challenges: usize,
}

pub struct DiscoveryConfig {
    pub private_key: SecretKey,
    /// Address advertised in the local record. The socket binds to the
    /// unspecified address of the same family unless this is loopback.
    pub local_ip: IpAddr,
    /// UDP port to bind and advertise; 0 picks an ephemeral port.
    pub udp_port: u16,
    /// TCP port advertised in the local record; 0 mirrors the UDP port.
    pub tcp_port: u16,
    /// Extra key/value pairs merged into the local record.
    pub extra_enr_pairs: Vec<(String, Bytes)>,
    /// Operator-trusted entry points, admitted to the table at startup and
    /// never removed by revalidation.
    pub bootstrap: Vec<NodeRecord>,
    pub session_store: Box<dyn SessionStore>,
    pub revalidation_failure_threshold: u8,
    pub revalidation_interval: Duration,
    pub lookup_interval: Duration,
    pub whoareyou_rate_limit: Duration,
    /// Disable to run without the revalidation and lookup loops.
    pub enable_maintenance: bool,
}

impl DiscoveryConfig {
    pub fn new(private_key: SecretKey, session_store: Box<dyn SessionStore>) -> Self {
        Self {
            private_key,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 0,
            tcp_port: 0,
            extra_enr_pairs: Vec::new(),
            bootstrap: Vec::new(),
            session_store,
            revalidation_failure_threshold: DEFAULT_REVALIDATION_FAILURE_THRESHOLD,
            revalidation_interval: REVALIDATION_INTERVAL,
            lookup_interval: LOOKUP_INTERVAL,
            whoareyou_rate_limit: WHOAREYOU_RATE_LIMIT,
            enable_maintenance: true,
        }
    }
}

/// Cloneable front of the discovery engine. All state lives in the server
/// task; the handle turns calls into commands and awaits their completion
/// slots.
#[derive(Debug, Clone)]
pub struct Discovery {
    commands: mpsc::Sender<Command>,
    local_node: Node,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

enum Command {
    Ping {
        node: Node,
        reply: oneshot::Sender<Option<Pong>>,
    },
    FindNode {
        node: Node,
        distance: u64,
        reply: oneshot::Sender<Vec<NodeRecord>>,
    },
    Lookup {
        target: H256,
        reply: oneshot::Sender<Vec<Node>>,
    },
    AddRecord {
        record: NodeRecord,
        reply: oneshot::Sender<bool>,
    },
    OfferRecords {
        records: Vec<NodeRecord>,
    },
    GetNode {
        node_id: H256,
        reply: oneshot::Sender<Option<Node>>,
    },
    RandomNodes {
        count: usize,
        reply: oneshot::Sender<Vec<Node>>,
    },
    Neighbours {
        target: H256,
        count: usize,
        reply: oneshot::Sender<Vec<Node>>,
    },
    NodeToRevalidate {
        reply: oneshot::Sender<Option<Node>>,
    },
    RevalidationFailed {
        node_id: H256,
    },
    EndRequest {
        node_id: H256,
        request_id: Bytes,
    },
    LocalRecord {
        reply: oneshot::Sender<NodeRecord>,
    },
    Stats {
        reply: oneshot::Sender<DiscoveryStats>,
    },
}

impl Discovery {
    /// Binds the UDP socket, seeds the table with the bootstrap set, and
    /// starts the engine task plus (unless disabled) the maintenance loops.
    pub async fn spawn(config: DiscoveryConfig) -> Result<Discovery, DiscoveryServerError> {
        let DiscoveryConfig {
            private_key,
            local_ip,
            udp_port,
            tcp_port,
            extra_enr_pairs,
            bootstrap,
            session_store,
            revalidation_failure_threshold,
            revalidation_interval,
            lookup_interval,
            whoareyou_rate_limit,
            enable_maintenance,
        } = config;

        let bind_ip = if local_ip.is_loopback() {
            local_ip
        } else {
            match local_ip {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            }
        };
        let udp_socket = UdpSocket::bind((bind_ip, udp_port)).await?;
        let udp_port = udp_socket.local_addr()?.port();
        let tcp_port = if tcp_port == 0 { udp_port } else { tcp_port };

        let local_node = Node::new(local_ip, udp_port, tcp_port, public_key_from_secret(&private_key));
        let local_node_record =
            NodeRecord::from_node_with_pairs(&local_node, 1, &private_key, &extra_enr_pairs)?;
        info!(node = %local_node, "starting discovery server");

        let (commands, command_receiver) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let (closed_sender, closed) = watch::channel(false);
        let handle = Discovery {
            commands,
            local_node: local_node.clone(),
            cancel: cancel.clone(),
            closed,
        };

        let mut table = KademliaTable::new(local_node.node_id());
        let mut bootstrap_ids = FxHashSet::default();
        for record in &bootstrap {
            if !record.verify_signature() {
                debug!("skipping bootstrap record with an invalid signature");
                continue;
            }
            match Node::from_enr(record) {
                Ok(node) => {
                    bootstrap_ids.insert(node.node_id());
                    table.add(node, Some(record.clone()));
                }
                Err(err) => debug!(err = %err, "skipping malformed bootstrap record"),
            }
        }
        info!(count = bootstrap_ids.len(), "added bootstrap nodes");

        let server = DiscoveryServer {
            local_node,
            local_node_record,
            signer: private_key,
            extra_enr_pairs,
            udp_socket: Arc::new(udp_socket),
            table,
            sessions: session_store,
            handle: handle.clone(),
            counter: 0,
            pending_by_nonce: Default::default(),
            pending_challenges: Default::default(),
            awaited: Default::default(),
            whoareyou_rate_limit: Default::default(),
            whoareyou_rate_limit_window: whoareyou_rate_limit,
            revalidation_failures: Default::default(),
            revalidation_failure_threshold,
            bootstrap_ids,
            ip_votes: Default::default(),
            ip_vote_period_start: None,
            first_ip_vote_round_completed: false,
        };
        tokio::spawn(server.run(command_receiver, cancel.clone(), closed_sender));

        if enable_maintenance {
            tokio::spawn(revalidation_loop(
                handle.clone(),
                cancel.clone(),
                revalidation_interval,
            ));
            tokio::spawn(lookup_loop(handle.clone(), cancel, lookup_interval));
        }
        Ok(handle)
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    pub fn local_node_id(&self) -> H256 {
        self.local_node.node_id()
    }

    /// The current local record; its sequence number advances when the
    /// engine learns a new external address.
    pub async fn local_record(&self) -> Option<NodeRecord> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::LocalRecord { reply })
            .await
            .ok()?;
        response.await.ok()
    }

    /// Pings a node; `None` means no PONG arrived in time.
    pub async fn ping(&self, node: &Node) -> Option<Pong> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Ping {
                node: node.clone(),
                reply,
            })
            .await
            .ok()?;
        response.await.ok().flatten()
    }

    /// Asks a peer for the nodes in one of its buckets. Partial results are
    /// returned as-is when packets of the response go missing.
    pub async fn find_node(&self, node: &Node, distance: u64) -> Vec<Node> {
        self.find_node_records(node, distance)
            .await
            .iter()
            .filter_map(|record| Node::from_enr(record).ok())
            .collect()
    }

    pub(crate) async fn find_node_records(&self, node: &Node, distance: u64) -> Vec<NodeRecord> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::FindNode {
                node: node.clone(),
                distance,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Iterative lookup of the closest nodes to `target`.
    pub async fn lookup(&self, target: H256) -> Vec<Node> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Lookup { target, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Lookup of a uniformly random target.
    pub async fn lookup_random(&self) -> Result<Vec<Node>, DiscoveryServerError> {
        let mut target = [0u8; 32];
        OsRng.try_fill_bytes(&mut target)?;
        Ok(self.lookup(H256::from(target)).await)
    }

    /// Finds the current record of a specific node: refreshes it directly
    /// when known, otherwise walks the network toward it.
    pub async fn resolve(&self, node_id: H256) -> Option<Node> {
        if let Some(node) = self.get_node(node_id).await {
            let refreshed = self.find_node(&node, 0).await;
            return refreshed
                .into_iter()
                .find(|n| n.node_id() == node_id)
                .or(Some(node));
        }
        self.lookup(node_id)
            .await
            .into_iter()
            .find(|n| n.node_id() == node_id)
    }

    /// Offers a signed record to the routing table. Returns true if the node
    /// ended up resident in a bucket.
    pub async fn add_node(&self, record: NodeRecord) -> bool {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::AddRecord { record, reply })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Parses an `enr:` URI and offers it to the routing table.
    pub async fn add_node_uri(&self, uri: &str) -> Result<bool, NodeRecordError> {
        let record = NodeRecord::from_uri(uri)?;
        Ok(self.add_node(record).await)
    }

    pub async fn get_node(&self, node_id: H256) -> Option<Node> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::GetNode { node_id, reply })
            .await
            .ok()?;
        response.await.ok().flatten()
    }

    pub async fn random_nodes(&self, count: usize) -> Vec<Node> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::RandomNodes { count, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    pub async fn neighbours(&self, target: H256, count: usize) -> Vec<Node> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Neighbours {
                target,
                count,
                reply,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    pub async fn stats(&self) -> DiscoveryStats {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).await.is_err() {
            return DiscoveryStats::default();
        }
        response.await.unwrap_or_default()
    }

    /// Requests shutdown: stops the engine task and the maintenance loops,
    /// cancelling every outstanding request slot.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// [`Discovery::close`], then wait for the engine task to finish.
    pub async fn close_wait(&self) {
        self.cancel.cancel();
        let mut closed = self.closed.clone();
        while closed.changed().await.is_ok() {}
    }

    pub(crate) async fn offer_records(&self, records: Vec<NodeRecord>) {
        let _ = self.commands.send(Command::OfferRecords { records }).await;
    }

    pub(crate) async fn node_to_revalidate(&self) -> Option<Node> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::NodeToRevalidate { reply })
            .await
            .ok()?;
        response.await.ok().flatten()
    }

    pub(crate) async fn revalidation_failed(&self, node_id: H256) {
        let _ = self
            .commands
            .send(Command::RevalidationFailed { node_id })
            .await;
    }

    async fn end_request(&self, node_id: H256, request_id: Bytes) {
        let _ = self
            .commands
            .send(Command::EndRequest {
                node_id,
                request_id,
            })
            .await;
    }
}

/// A sent message retained until the remote answers or the entry expires,
/// so a WHOAREYOU referencing its auth-tag can be answered by re-encrypting
/// the same plaintext inside a handshake.
struct PendingRequest {
    node: Node,
    message: Message,
    sent_at: Instant,
}

/// An issued WHOAREYOU challenge, unique per `(node, address)`.
struct Challenge {
    id_nonce: IdNonce,
    sent_at: Instant,
}

struct DiscoveryServer {
    local_node: Node,
    local_node_record: NodeRecord,
    signer: SecretKey,
    extra_enr_pairs: Vec<(String, Bytes)>,
    udp_socket: Arc<UdpSocket>,
    table: KademliaTable,
    sessions: Box<dyn SessionStore>,
    handle: Discovery,
    /// Outgoing message count, encoded into the first nonce bytes.
    counter: u32,
    /// Sent messages awaiting a possible WHOAREYOU, keyed by nonce.
    pending_by_nonce: FxHashMap<AuthTag, PendingRequest>,
    /// Outstanding WHOAREYOU challenges keyed by `(node_id, address)`.
    pending_challenges: FxHashMap<(H256, SocketAddr), Challenge>,
    /// Response slots keyed by `(node_id, request_id)`.
    awaited: FxHashMap<(H256, Bytes), mpsc::Sender<Message>>,
    /// Tracks last WHOAREYOU send time per source IP.
    whoareyou_rate_limit: FxHashMap<IpAddr, Instant>,
    whoareyou_rate_limit_window: Duration,
    /// Consecutive failed revalidation probes per node.
    revalidation_failures: FxHashMap<H256, u8>,
    revalidation_failure_threshold: u8,
    bootstrap_ids: FxHashSet<H256>,
    /// External-address votes from PONGs: reported IP -> voter node ids.
    ip_votes: FxHashMap<IpAddr, FxHashSet<H256>>,
    ip_vote_period_start: Option<Instant>,
    first_ip_vote_round_completed: bool,
}

impl DiscoveryServer {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
        closed: watch::Sender<bool>,
    ) {
        let mut stream = UdpFramed::new(
            self.udp_socket.clone(),
            Discv5Codec::new(self.local_node.node_id()),
        );
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                packet = stream.next() => match packet {
                    Some(Ok((packet, from))) => {
                        let _ = self
                            .handle_packet(packet, from)
                            .await
                            .inspect_err(|err| trace!(err = %err, "error handling discovery packet"));
                    }
                    Some(Err(err)) => debug!(err = %err, "dropping malformed datagram"),
                    None => break,
                },
                _ = cleanup.tick() => self.cleanup_stale_entries(),
            }
        }
        let _ = closed.send(true);
        debug!("discovery server stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Ping { node, reply } => self.send_ping(node, reply).await,
            Command::FindNode {
                node,
                distance,
                reply,
            } => self.send_find_node(node, distance, reply).await,
            Command::Lookup { target, reply } => {
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    let _ = reply.send(lookup::run(handle, target, BUCKET_SIZE).await);
                });
            }
            Command::AddRecord { record, reply } => {
                let _ = reply.send(self.add_record(record));
            }
            Command::OfferRecords { records } => {
                for record in records {
                    self.add_record(record);
                }
            }
            Command::GetNode { node_id, reply } => {
                let _ = reply.send(self.table.get(&node_id).map(|c| c.node.clone()));
            }
            Command::RandomNodes { count, reply } => {
                let _ = reply.send(self.random_nodes(count));
            }
            Command::Neighbours {
                target,
                count,
                reply,
            } => {
                let _ = reply.send(self.table.neighbours(&target, count));
            }
            Command::NodeToRevalidate { reply } => {
                let _ = reply.send(self.table.node_to_revalidate());
            }
            Command::RevalidationFailed { node_id } => self.record_revalidation_failure(node_id),
            Command::EndRequest {
                node_id,
                request_id,
            } => {
                self.awaited.remove(&(node_id, request_id));
            }
            Command::LocalRecord { reply } => {
                let _ = reply.send(self.local_node_record.clone());
            }
            Command::Stats { reply } => {
                let _ = reply.send(DiscoveryStats {
                    table_nodes: self.table.len(),
                    outstanding_requests: self.awaited.len(),
                    pending_messages: self.pending_by_nonce.len(),
                    pending_challenges: self.pending_challenges.len(),
                });
            }
        }
    }

    async fn handle_packet(
        &mut self,
        packet: InboundPacket,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        match packet {
            InboundPacket::WhoAreYou(packet) => self.handle_whoareyou(packet, from).await,
            InboundPacket::Handshake(packet) => self.handle_handshake(packet, from).await,
            InboundPacket::Ordinary(packet) => self.handle_ordinary(packet, from).await,
        }
    }

    async fn handle_ordinary(
        &mut self,
        packet: OrdinaryPacket,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        let OrdinaryPacket {
            src_id,
            tag,
            auth_tag,
            ciphertext,
        } = packet;

        let Some(session) = self.load_session(&src_id, &from) else {
            trace!(from = %src_id, %from, "no session, sending WHOAREYOU");
            return self.send_whoareyou(auth_tag, src_id, from).await;
        };
        let plaintext = match decrypt_message(&session.read_key, &auth_tag, tag.as_bytes(), &ciphertext)
        {
            Ok(plaintext) => plaintext,
            Err(_) => {
                // stale or foreign keys; also the random-packet path
                trace!(from = %src_id, %from, "decryption failed, sending WHOAREYOU");
                return self.send_whoareyou(auth_tag, src_id, from).await;
            }
        };

        match Message::decode(&plaintext) {
            Ok(message) => {
                self.note_sender(&src_id, from);
                self.dispatch_message(src_id, message, from).await
            }
            Err(MessageDecodeError::UnknownKind(kind)) => {
                self.note_sender(&src_id, from);
                trace!(from = %src_id, kind, "ignoring unsupported message kind");
                Ok(())
            }
            Err(err) => {
                debug!(from = %src_id, err = %err, "dropping malformed message");
                Ok(())
            }
        }
    }

    /// A remote could not authenticate one of our packets and challenged us:
    /// answer by re-encrypting the pending plaintext inside a handshake under
    /// freshly derived keys.
    async fn handle_whoareyou(
        &mut self,
        packet: WhoAreYouPacket,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        let Some(pending) = self.pending_by_nonce.remove(&packet.auth_tag) else {
            trace!(%from, "unexpected WHOAREYOU, ignoring");
            return Ok(());
        };
        let PendingRequest { node, message, .. } = pending;
        trace!(received = "WHOAREYOU", from = %node, "performing handshake");

        let ephemeral_secret = generate_secret_key(&mut OsRng)?;
        let ephemeral_pubkey = ephemeral_secret
            .public_key(secp256k1::SECP256K1)
            .serialize();
        let Some(remote_public) = compress_pubkey(node.public_key) else {
            return Err(CryptographyError::InvalidKey.into());
        };

        let local_id = self.local_node.node_id();
        let remote_id = node.node_id();
        let keys = derive_session_keys(
            &ephemeral_secret,
            &remote_public,
            &local_id,
            &remote_id,
            &packet.id_nonce,
        )?;
        let id_signature = create_id_signature(&self.signer, &packet.id_nonce, &ephemeral_pubkey);
        // send our record along when the challenger's copy is outdated
        let record = (packet.enr_seq < self.local_node_record.seq)
            .then(|| self.local_node_record.clone());
        let auth_response = seal_auth_response(&keys.auth_resp_key, &id_signature, record.as_ref())?;

        let session = Session {
            write_key: keys.initiator_key,
            read_key: keys.recipient_key,
        };
        self.store_session(remote_id, from, &session);
        if node.udp_addr() != from {
            self.store_session(remote_id, node.udp_addr(), &session);
        }

        let tag = compute_tag(&local_id, &remote_id);
        let nonce = self.next_nonce(&mut OsRng)?;
        let ciphertext = encrypt_message(&session.write_key, &nonce, tag.as_bytes(), &message.encode())?;
        let buf = codec::encode_handshake(
            &tag,
            &nonce,
            &packet.id_nonce,
            &ephemeral_pubkey,
            &auth_response,
            &ciphertext,
        );
        self.udp_socket.send_to(&buf, from).await?;
        trace!(sent = %message, to = %node, "handshake message");
        self.pending_by_nonce.insert(
            nonce,
            PendingRequest {
                node,
                message,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// A remote answered one of our WHOAREYOU challenges.
    async fn handle_handshake(
        &mut self,
        packet: HandshakePacket,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        let HandshakePacket {
            src_id,
            tag,
            auth_tag,
            id_nonce,
            ephemeral_pubkey,
            auth_response,
            ciphertext,
        } = packet;

        let Some(challenge) = self.pending_challenges.remove(&(src_id, from)) else {
            trace!(from = %src_id, %from, "unexpected handshake message, ignoring");
            return Ok(());
        };
        if challenge.id_nonce != id_nonce {
            trace!(from = %src_id, "handshake does not echo the challenge nonce");
            return Ok(());
        }
        let Ok(ephemeral) = PublicKey::from_slice(&ephemeral_pubkey) else {
            trace!(from = %src_id, "invalid ephemeral public key");
            return Ok(());
        };

        let local_id = self.local_node.node_id();
        let keys =
            derive_session_keys(&self.signer, &ephemeral, &src_id, &local_id, &challenge.id_nonce)?;
        let Ok((id_signature, record)) = open_auth_response(&keys.auth_resp_key, &auth_response)
        else {
            trace!(from = %src_id, "auth response did not open");
            return Ok(());
        };

        // Resolve the sender's identity from the record it sent, or from what
        // we already know about it.
        let (node, record) = match record {
            Some(record) => {
                if !record.verify_signature() {
                    trace!(from = %src_id, "handshake record signature verification failed");
                    return Ok(());
                }
                if record.node_id() != Some(src_id) {
                    trace!(from = %src_id, "handshake record node id mismatch");
                    return Ok(());
                }
                match Node::from_enr(&record) {
                    Ok(node) => (node, Some(record)),
                    Err(err) => {
                        trace!(from = %src_id, err = %err, "handshake record is unusable");
                        return Ok(());
                    }
                }
            }
            None => match self.table.get(&src_id) {
                Some(contact) => (contact.node.clone(), contact.record.clone()),
                None => {
                    trace!(from = %src_id, "cannot verify handshake from unknown sender");
                    return Ok(());
                }
            },
        };
        let Some(sender_public) = compress_pubkey(node.public_key) else {
            trace!(from = %src_id, "sender public key is invalid");
            return Ok(());
        };
        if !verify_id_signature(
            &sender_public,
            &challenge.id_nonce,
            &ephemeral_pubkey,
            &id_signature,
        ) {
            trace!(from = %src_id, "handshake signature verification failed");
            return Ok(());
        }

        let session = Session {
            write_key: keys.recipient_key,
            read_key: keys.initiator_key,
        };
        let Ok(plaintext) =
            decrypt_message(&session.read_key, &auth_tag, tag.as_bytes(), &ciphertext)
        else {
            trace!(from = %src_id, "handshake payload did not decrypt");
            return Ok(());
        };
        self.store_session(src_id, from, &session);
        trace!(from = %src_id, %from, "handshake completed");

        // admission: the advertised address must match the packet source
        if node.ip == from.ip() {
            self.table.add(node, record);
            self.revalidation_failures.remove(&src_id);
        } else {
            trace!(from = %src_id, advertised = %node.ip, observed = %from.ip(), "not admitting node, address mismatch");
        }

        match Message::decode(&plaintext) {
            Ok(message) => self.dispatch_message(src_id, message, from).await,
            Err(MessageDecodeError::UnknownKind(kind)) => {
                trace!(from = %src_id, kind, "ignoring unsupported message kind");
                Ok(())
            }
            Err(err) => {
                debug!(from = %src_id, err = %err, "dropping malformed handshake payload");
                Ok(())
            }
        }
    }

    async fn dispatch_message(
        &mut self,
        sender_id: H256,
        message: Message,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        // Ignore packets sent by ourselves
        if sender_id == self.local_node.node_id() {
            return Ok(());
        }
        trace!(received = %message, from = %sender_id, %from);
        match message {
            Message::Ping(ping) => self.handle_ping(ping, sender_id, from).await,
            Message::FindNode(find_node) => self.handle_find_node(find_node, sender_id, from).await,
            Message::Pong(pong) => {
                self.handle_pong(&pong, sender_id).await;
                self.deliver_response(sender_id, Message::Pong(pong));
                Ok(())
            }
            nodes @ Message::Nodes(_) => {
                self.deliver_response(sender_id, nodes);
                Ok(())
            }
        }
    }

    /// Completes the response slot a request issuer is parked on.
    fn deliver_response(&mut self, sender_id: H256, message: Message) {
        let key = (sender_id, message.req_id().clone());
        match self.awaited.get(&key) {
            Some(slot) => {
                if slot.try_send(message).is_err() {
                    trace!(from = %sender_id, "response slot full or abandoned, dropping");
                }
            }
            None => trace!(from = %sender_id, "response does not match an awaited request"),
        }
    }

    async fn handle_ping(
        &mut self,
        ping: PingMessage,
        sender_id: H256,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        trace!(from = %sender_id, enr_seq = ping.enr_seq, "received PING");
        let pong = Message::Pong(PongMessage {
            req_id: ping.req_id,
            enr_seq: self.local_node_record.seq,
            // echo the observed source so the peer learns its external address
            recipient_addr: from,
        });
        self.send_response(pong, &sender_id, from).await
    }

    async fn handle_pong(&mut self, pong: &PongMessage, sender_id: H256) {
        if let Some(contact) = self.table.get(&sender_id) {
            let cached_seq = contact.record.as_ref().map_or(0, |r| r.seq);
            if pong.enr_seq > cached_seq {
                trace!(
                    from = %sender_id,
                    cached_seq,
                    pong_seq = pong.enr_seq,
                    "record out of date, requesting it with FINDNODE distance 0"
                );
                let node = contact.node.clone();
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    let records = handle.find_node_records(&node, 0).await;
                    handle.offer_records(records).await;
                });
            }
        }
        self.record_ip_vote(pong.recipient_addr.ip(), sender_id);
    }

    async fn handle_find_node(
        &mut self,
        find_node: FindNodeMessage,
        sender_id: H256,
        from: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        // Only answer peers we know, from the address we know them at. A peer
        // with a session could otherwise point its record at a victim address
        // and use us for amplification.
        let Some(contact) = self.table.get(&sender_id) else {
            trace!(from = %sender_id, "rejected FINDNODE from unknown node");
            return Ok(());
        };
        if contact.node.ip != from.ip() {
            trace!(from = %sender_id, "rejected FINDNODE, source address mismatch");
            return Ok(());
        }

        let distance = find_node.distance.min(256);
        let records: Vec<NodeRecord> = if distance == 0 {
            vec![self.local_node_record.clone()]
        } else {
            self.table
                .contacts_at_distance(distance)
                .into_iter()
                .filter_map(|contact| contact.record)
                .take(FIND_NODE_RESULT_LIMIT)
                .collect()
        };

        if records.is_empty() {
            let nodes = Message::Nodes(NodesMessage {
                req_id: find_node.req_id,
                total: 1,
                nodes: Vec::new(),
            });
            return self.send_response(nodes, &sender_id, from).await;
        }
        let chunks: Vec<Vec<NodeRecord>> = records
            .chunks(MAX_NODES_PER_PACKET)
            .map(|chunk| chunk.to_vec())
            .collect();
        let total = chunks.len() as u64;
        for chunk in chunks {
            let nodes = Message::Nodes(NodesMessage {
                req_id: find_node.req_id.clone(),
                total,
                nodes: chunk,
            });
            self.send_response(nodes, &sender_id, from).await?;
        }
        Ok(())
    }

    async fn send_ping(&mut self, node: Node, reply: oneshot::Sender<Option<Pong>>) {
        let request_id = match self.generate_request_id() {
            Ok(request_id) => request_id,
            Err(err) => {
                debug!(err = %err, "could not draw a request id");
                let _ = reply.send(None);
                return;
            }
        };
        let message = Message::Ping(PingMessage {
            req_id: request_id.clone(),
            enr_seq: self.local_node_record.seq,
        });

        let node_id = node.node_id();
        let receiver = self.register_awaited(node_id, request_id.clone());
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let pong = await_pong(receiver).await;
            // release the slot before completing the caller
            handle.end_request(node_id, request_id).await;
            let _ = reply.send(pong);
        });

        if let Err(err) = self.send_message(message, &node).await {
            debug!(to = %node, err = %err, "failed to send PING");
        }
    }

    async fn send_find_node(
        &mut self,
        node: Node,
        distance: u64,
        reply: oneshot::Sender<Vec<NodeRecord>>,
    ) {
        let request_id = match self.generate_request_id() {
            Ok(request_id) => request_id,
            Err(err) => {
                debug!(err = %err, "could not draw a request id");
                let _ = reply.send(Vec::new());
                return;
            }
        };
        let message = Message::FindNode(FindNodeMessage {
            req_id: request_id.clone(),
            distance,
        });

        let node_id = node.node_id();
        let receiver = self.register_awaited(node_id, request_id.clone());
        let handle = self.handle.clone();
        let peer = node.clone();
        tokio::spawn(async move {
            let records = await_nodes(receiver, peer, distance).await;
            handle.end_request(node_id, request_id).await;
            let _ = reply.send(records);
        });

        if let Err(err) = self.send_message(message, &node).await {
            debug!(to = %node, err = %err, "failed to send FINDNODE");
        }
    }

    /// Encrypts and sends a request. Without a session a random packet goes
    /// out instead, provoking a WHOAREYOU that starts a handshake. Either
    /// way, the plaintext is retained under the nonce for re-encryption.
    async fn send_message(
        &mut self,
        message: Message,
        node: &Node,
    ) -> Result<(), DiscoveryServerError> {
        let node_id = node.node_id();
        let addr = node.udp_addr();
        let tag = compute_tag(&self.local_node.node_id(), &node_id);
        let nonce = self.next_nonce(&mut OsRng)?;
        let buf = match self.load_session(&node_id, &addr) {
            Some(session) => {
                let ciphertext =
                    encrypt_message(&session.write_key, &nonce, tag.as_bytes(), &message.encode())?;
                codec::encode_ordinary(&tag, &nonce, &ciphertext)
            }
            None => {
                trace!(to = %node, "no session, sending random packet");
                let mut payload = [0u8; RANDOM_PACKET_PAYLOAD_LENGTH];
                OsRng.try_fill_bytes(&mut payload)?;
                codec::encode_random(&tag, &nonce, &payload)
            }
        };
        self.udp_socket.send_to(&buf, addr).await?;
        trace!(sent = %message, to = %node);
        self.pending_by_nonce.insert(
            nonce,
            PendingRequest {
                node: node.clone(),
                message,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Encrypts and sends a response to the address the request came from.
    /// Responses are not retained: a peer that lost its session will
    /// re-request after a fresh handshake.
    async fn send_response(
        &mut self,
        message: Message,
        dest_id: &H256,
        addr: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        let Some(session) = self.load_session(dest_id, &addr) else {
            return Err(DiscoveryServerError::NoSession);
        };
        let tag = compute_tag(&self.local_node.node_id(), dest_id);
        let nonce = self.next_nonce(&mut OsRng)?;
        let ciphertext =
            encrypt_message(&session.write_key, &nonce, tag.as_bytes(), &message.encode())?;
        let buf = codec::encode_ordinary(&tag, &nonce, &ciphertext);
        self.udp_socket.send_to(&buf, addr).await?;
        trace!(sent = %message, to = %dest_id, %addr);
        Ok(())
    }

    /// Sends a WHOAREYOU challenge in response to an unverified message.
    /// At most one challenge is outstanding per `(node, address)`, and
    /// challenges to one IP are rate limited.
    async fn send_whoareyou(
        &mut self,
        auth_tag: AuthTag,
        src_id: H256,
        addr: SocketAddr,
    ) -> Result<(), DiscoveryServerError> {
        if self.pending_challenges.contains_key(&(src_id, addr)) {
            trace!(to = %src_id, "handshake already pending, dropping duplicate challenge");
            return Ok(());
        }

        let ip = addr.ip();
        let now = Instant::now();
        if let Some(last_sent) = self.whoareyou_rate_limit.get(&ip)
            && now.duration_since(*last_sent) < self.whoareyou_rate_limit_window
        {
            trace!(to_ip = %ip, "rate limiting WHOAREYOU packet");
            return Ok(());
        }
        self.whoareyou_rate_limit.insert(ip, now);

        let mut id_nonce = [0u8; ID_NONCE_LENGTH];
        OsRng.try_fill_bytes(&mut id_nonce)?;
        let remote_enr_seq = self
            .table
            .get(&src_id)
            .and_then(|c| c.record.as_ref())
            .map_or(0, |r| r.seq);

        let buf = codec::encode_whoareyou(&src_id, &auth_tag, &id_nonce, remote_enr_seq);
        // record the challenge before sending to avoid racing a fast responder
        self.pending_challenges
            .insert((src_id, addr), Challenge { id_nonce, sent_at: now });
        self.udp_socket.send_to(&buf, addr).await?;
        trace!(to = %src_id, %addr, "sent WHOAREYOU");
        Ok(())
    }

    fn register_awaited(&mut self, node_id: H256, request_id: Bytes) -> mpsc::Receiver<Message> {
        let (sender, receiver) = mpsc::channel(RESPONSE_SLOT_CAPACITY);
        self.awaited.insert((node_id, request_id), sender);
        receiver
    }

    /// Verifies and offers a record to the routing table.
    fn add_record(&mut self, record: NodeRecord) -> bool {
        if !record.verify_signature() {
            return false;
        }
        let Ok(node) = Node::from_enr(&record) else {
            return false;
        };
        if node.node_id() == self.local_node.node_id() {
            return false;
        }
        self.table.add(node, Some(record))
    }

    /// Marks an authenticated sender as alive in the routing table.
    fn note_sender(&mut self, src_id: &H256, from: SocketAddr) {
        self.revalidation_failures.remove(src_id);
        if let Some(contact) = self.table.get(src_id)
            && contact.node.ip == from.ip()
        {
            self.table.set_just_seen(src_id);
        }
    }

    fn random_nodes(&self, count: usize) -> Vec<Node> {
        use rand::seq::IteratorRandom;
        self.table
            .iter()
            .map(|contact| contact.node.clone())
            .choose_multiple(&mut OsRng, count)
    }

    fn record_revalidation_failure(&mut self, node_id: H256) {
        let failures = self.revalidation_failures.entry(node_id).or_insert(0);
        *failures = failures.saturating_add(1);
        if *failures < self.revalidation_failure_threshold {
            return;
        }
        self.revalidation_failures.remove(&node_id);
        if self.bootstrap_ids.contains(&node_id) {
            debug!(node = %node_id, "bootstrap node unresponsive, keeping it");
            // rotate it to the tail so the rest of its bucket still gets probed
            self.table.set_just_seen(&node_id);
            return;
        }
        if let Some(contact) = self.table.remove(&node_id) {
            let addr = contact.node.udp_addr();
            self.sessions.delete(&node_id, &addr);
            debug!(node = %contact.node, "removed unresponsive node");
        }
    }

    fn load_session(&self, node_id: &H256, addr: &SocketAddr) -> Option<Session> {
        self.sessions
            .get(node_id, addr)
            .and_then(|bytes| Session::from_bytes(&bytes))
    }

    fn store_session(&mut self, node_id: H256, addr: SocketAddr, session: &Session) {
        self.sessions.put(node_id, addr, session.to_bytes());
    }

    fn generate_request_id(&self) -> Result<Bytes, DiscoveryServerError> {
        let mut request_id = [0u8; REQUEST_ID_LENGTH];
        OsRng.try_fill_bytes(&mut request_id)?;
        Ok(Bytes::copy_from_slice(&request_id))
    }

    /// Generates a 96-bit AES-GCM nonce: the outgoing message count in the
    /// first 32 bits, the rest drawn from the random source.
    fn next_nonce<R: RngCore>(&mut self, rng: &mut R) -> Result<AuthTag, DiscoveryServerError> {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&counter.to_be_bytes());
        rng.try_fill_bytes(&mut nonce[4..])?;
        Ok(nonce)
    }

    /// Remove stale entries from caches. Called periodically to prevent
    /// unbounded growth; doubles as the expiry of requests and challenges.
    fn cleanup_stale_entries(&mut self) {
        let now = Instant::now();
        self.pending_by_nonce
            .retain(|_, pending| now.duration_since(pending.sent_at) < RESPONSE_TIMEOUT);
        self.pending_challenges
            .retain(|_, challenge| now.duration_since(challenge.sent_at) < HANDSHAKE_TIMEOUT);
        let window = self.whoareyou_rate_limit_window;
        self.whoareyou_rate_limit
            .retain(|_, last_sent| now.duration_since(*last_sent) < window);

        if let Some(start) = self.ip_vote_period_start
            && now.duration_since(start) >= IP_VOTE_WINDOW
        {
            self.finalize_ip_vote_round();
        }
    }

    /// Records an external-address vote from a PONG. The first round ends
    /// after [`IP_VOTE_THRESHOLD`] votes, later rounds after the window
    /// elapses; the winning IP must carry the threshold to apply.
    fn record_ip_vote(&mut self, reported_ip: IpAddr, voter_id: H256) {
        if is_private_ip(&reported_ip) {
            return;
        }
        let now = Instant::now();
        if self.ip_vote_period_start.is_none() {
            self.ip_vote_period_start = Some(now);
        }
        self.ip_votes
            .entry(reported_ip)
            .or_default()
            .insert(voter_id);

        let total_votes: usize = self.ip_votes.values().map(|voters| voters.len()).sum();
        let round_ended = if !self.first_ip_vote_round_completed {
            total_votes >= IP_VOTE_THRESHOLD
        } else {
            self.ip_vote_period_start
                .is_some_and(|start| now.duration_since(start) >= IP_VOTE_WINDOW)
        };
        if round_ended {
            self.finalize_ip_vote_round();
        }
    }

    fn finalize_ip_vote_round(&mut self) {
        let winner = self
            .ip_votes
            .iter()
            .map(|(ip, voters)| (*ip, voters.len()))
            .max_by_key(|(_, count)| *count);

        if let Some((winning_ip, vote_count)) = winner
            && vote_count >= IP_VOTE_THRESHOLD
            && winning_ip != self.local_node.ip
        {
            info!(
                old_ip = %self.local_node.ip,
                new_ip = %winning_ip,
                votes = vote_count,
                "external address detected via PONG voting, updating local record"
            );
            self.update_local_ip(winning_ip);
        }

        self.ip_votes.clear();
        self.ip_vote_period_start = Some(Instant::now());
        self.first_ip_vote_round_completed = true;
    }

    /// Re-signs the local record with the new address and an advanced
    /// sequence number.
    fn update_local_ip(&mut self, new_ip: IpAddr) {
        let mut updated = self.local_node.clone();
        updated.ip = new_ip;
        let new_seq = self.local_node_record.seq + 1;
        match NodeRecord::from_node_with_pairs(&updated, new_seq, &self.signer, &self.extra_enr_pairs)
        {
            Ok(record) => {
                self.local_node.ip = new_ip;
                self.local_node_record = record;
            }
            Err(err) => error!(%new_ip, err = %err, "failed to re-sign record for new address"),
        }
    }
}

/// Waits out the response slot of a PING.
async fn await_pong(mut receiver: mpsc::Receiver<Message>) -> Option<Pong> {
    let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Some(Message::Pong(pong))) => {
                return Some(Pong {
                    enr_seq: pong.enr_seq,
                    observed_addr: pong.recipient_addr,
                });
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Assembles a multi-packet NODES response: the first packet fixes `total`,
/// the rest accumulate in arrival order until `total`, the deadline, or the
/// result limit is hit. Records that fail the signature, distance, or
/// address-validity checks are discarded.
async fn await_nodes(
    mut receiver: mpsc::Receiver<Message>,
    peer: Node,
    distance: u64,
) -> Vec<NodeRecord> {
    let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
    let mut records: Vec<NodeRecord> = Vec::new();
    let mut total: Option<u64> = None;
    let mut received = 0u64;
    loop {
        let message = match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => break,
        };
        let Message::Nodes(nodes) = message else {
            continue;
        };
        if total.is_none() {
            total = Some(nodes.total.clamp(1, MAX_NODES_RESPONSE_PACKETS));
        }
        received += 1;

        for record in nodes.nodes {
            if records.len() >= FIND_NODE_RESULT_LIMIT {
                break;
            }
            if !record.verify_signature() {
                trace!(from = %peer, "discarding record with invalid signature");
                continue;
            }
            let Ok(node) = Node::from_enr(&record) else {
                continue;
            };
            let matches_distance = if distance == 0 {
                node.node_id() == peer.node_id()
            } else {
                log_distance(&peer.node_id(), &node.node_id()) == distance
            };
            if !matches_distance {
                trace!(from = %peer, "discarding record outside the requested bucket");
                continue;
            }
            if !is_valid_neighbour_ip(&peer.ip, &node.ip) {
                trace!(from = %peer, advertised = %node.ip, "discarding record with implausible address");
                continue;
            }
            records.push(record);
        }

        if received >= total.unwrap_or(1) || records.len() >= FIND_NODE_RESULT_LIMIT {
            break;
        }
    }
    records
}

/// Probes the least-recently-seen node of a round-robin bucket at a random
/// cadence; nodes failing too many consecutive probes are dropped together
/// with their session (bootstrap nodes are only logged).
async fn revalidation_loop(handle: Discovery, cancel: CancellationToken, interval: Duration) {
    loop {
        let wait = Duration::from_millis(random_jitter(interval.as_millis() as u64));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let Some(node) = handle.node_to_revalidate().await else {
            continue;
        };
        trace!(node = %node, "revalidating");
        if handle.ping(&node).await.is_none() {
            handle.revalidation_failed(node.node_id()).await;
        }
    }
}

fn random_jitter(upper_ms: u64) -> u64 {
    if upper_ms == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => u64::from_be_bytes(buf) % upper_ms,
        Err(_) => upper_ms / 2,
    }
}

/// Periodic self-lookup plus a random lookup; fills the table over time.
async fn lookup_loop(handle: Discovery, cancel: CancellationToken, interval: Duration) {
    let local_id = handle.local_node_id();
    loop {
        let _ = handle.lookup(local_id).await;
        if let Err(err) = handle.lookup_random().await {
            debug!(err = %err, "random lookup failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn generate_secret_key<R: RngCore>(rng: &mut R) -> Result<SecretKey, DiscoveryServerError> {
    // rejection-sample until the scalar is valid for the curve
    for _ in 0..8 {
        let mut buf = [0u8; 32];
        rng.try_fill_bytes(&mut buf)?;
        if let Ok(key) = SecretKey::from_slice(&buf) {
            return Ok(key);
        }
    }
    Err(DiscoveryServerError::Crypto(CryptographyError::InvalidKey))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discv5::codec::AUTH_TAG_LENGTH;
    use crate::discv5::session::MemorySessionStore;
    use crate::types::test_support::test_node;
    use rand::{SeedableRng, rngs::StdRng};

    fn test_config(seed: u64) -> DiscoveryConfig {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let mut rng = StdRng::seed_from_u64(seed);
        let private_key = SecretKey::new(&mut rng);
        let mut config = DiscoveryConfig::new(private_key, Box::new(MemorySessionStore::new()));
        config.enable_maintenance = false;
        // every test engine shares the loopback address
        config.whoareyou_rate_limit = Duration::ZERO;
        config
    }

    /// A server whose command channel is not serviced, for driving handler
    /// methods directly.
    async fn raw_server(seed: u64) -> DiscoveryServer {
        let (node, signer) = test_node(seed);
        let local_id = node.node_id();
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let (commands, command_receiver) = mpsc::channel(COMMAND_BUFFER);
        drop(command_receiver);
        raw_server_with(node, signer, record, commands, local_id).await
    }

    async fn raw_server_with(
        node: Node,
        signer: SecretKey,
        record: NodeRecord,
        commands: mpsc::Sender<Command>,
        local_id: H256,
    ) -> DiscoveryServer {
        let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (_closed_sender, closed) = watch::channel(false);
        let handle = Discovery {
            commands,
            local_node: node.clone(),
            cancel: CancellationToken::new(),
            closed,
        };
        DiscoveryServer {
            local_node: node,
            local_node_record: record,
            signer,
            extra_enr_pairs: Vec::new(),
            udp_socket: Arc::new(udp_socket),
            table: KademliaTable::new(local_id),
            sessions: Box::new(MemorySessionStore::new()),
            handle,
            counter: 0,
            pending_by_nonce: Default::default(),
            pending_challenges: Default::default(),
            awaited: Default::default(),
            whoareyou_rate_limit: Default::default(),
            whoareyou_rate_limit_window: WHOAREYOU_RATE_LIMIT,
            revalidation_failures: Default::default(),
            revalidation_failure_threshold: DEFAULT_REVALIDATION_FAILURE_THRESHOLD,
            bootstrap_ids: Default::default(),
            ip_votes: Default::default(),
            ip_vote_period_start: None,
            first_ip_vote_round_completed: false,
        }
    }

    /// Generates a node with its own key whose id falls at `distance` from
    /// `from`, advertised at the given loopback port.
    fn node_at_distance(
        from: &H256,
        distance: u64,
        port: u16,
        rng: &mut StdRng,
    ) -> (Node, SecretKey) {
        loop {
            let secret = SecretKey::new(rng);
            let node = Node::new(
                "127.0.0.1".parse().unwrap(),
                port,
                port,
                public_key_from_secret(&secret),
            );
            if log_distance(from, &node.node_id()) == distance {
                return (node, secret);
            }
        }
    }

    #[tokio::test]
    async fn next_nonce_counts_messages() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut server = raw_server(1).await;

        let n1 = server.next_nonce(&mut rng).unwrap();
        let n2 = server.next_nonce(&mut rng).unwrap();

        assert_eq!(&n1[..4], &[0, 0, 0, 0]);
        assert_eq!(&n2[..4], &[0, 0, 0, 1]);
        assert_ne!(&n1[4..], &n2[4..]);
    }

    #[tokio::test]
    async fn whoareyou_is_rate_limited_per_ip() {
        let mut server = raw_server(2).await;
        let nonce = [0u8; AUTH_TAG_LENGTH];
        let addr: SocketAddr = "192.168.1.1:30303".parse().unwrap();
        let src_id1 = H256::from_low_u64_be(1);
        let src_id2 = H256::from_low_u64_be(2);
        let src_id3 = H256::from_low_u64_be(3);

        assert!(server.whoareyou_rate_limit.is_empty());
        let _ = server.send_whoareyou(nonce, src_id1, addr).await;
        assert!(server.whoareyou_rate_limit.contains_key(&addr.ip()));
        assert!(server.pending_challenges.contains_key(&(src_id1, addr)));

        // same IP inside the window: challenge suppressed
        let _ = server.send_whoareyou(nonce, src_id2, addr).await;
        assert!(!server.pending_challenges.contains_key(&(src_id2, addr)));

        // different IP is unaffected
        let addr2: SocketAddr = "192.168.1.2:30303".parse().unwrap();
        let _ = server.send_whoareyou(nonce, src_id3, addr2).await;
        assert!(server.pending_challenges.contains_key(&(src_id3, addr2)));
        assert_eq!(server.whoareyou_rate_limit.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_challenge_for_same_peer_is_dropped() {
        let mut server = raw_server(3).await;
        let addr: SocketAddr = "192.168.1.1:30303".parse().unwrap();
        let src_id = H256::from_low_u64_be(1);

        let _ = server.send_whoareyou([0u8; 12], src_id, addr).await;
        assert_eq!(server.pending_challenges.len(), 1);
        let first_nonce = server.pending_challenges[&(src_id, addr)].id_nonce;

        // a second offending packet during the handshake window must not
        // produce a second challenge, even with rate limiting out of the way
        server.whoareyou_rate_limit.clear();
        let _ = server.send_whoareyou([1u8; 12], src_id, addr).await;
        assert_eq!(server.pending_challenges.len(), 1);
        assert_eq!(server.pending_challenges[&(src_id, addr)].id_nonce, first_nonce);
    }

    #[tokio::test]
    async fn newer_pong_seq_triggers_record_refresh() {
        let (node, signer) = test_node(4);
        let local_id = node.node_id();
        let record = NodeRecord::from_node(&node, 1, &signer).unwrap();
        let (commands, mut command_receiver) = mpsc::channel(COMMAND_BUFFER);
        let mut server = raw_server_with(node, signer, record, commands, local_id).await;

        let (remote_node, remote_secret) = test_node(5);
        let remote_record = NodeRecord::from_node(&remote_node, 5, &remote_secret).unwrap();
        let remote_id = remote_node.node_id();
        server.table.add(remote_node, Some(remote_record));

        // same seq: nothing requested
        let pong = PongMessage {
            req_id: Bytes::from_static(b"req00001"),
            enr_seq: 5,
            recipient_addr: "127.0.0.1:30303".parse().unwrap(),
        };
        server.handle_pong(&pong, remote_id).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(100), command_receiver.recv())
                .await
                .is_err()
        );

        // higher seq: a FINDNODE distance 0 goes out to fetch the new record
        let pong = PongMessage {
            req_id: Bytes::from_static(b"req00002"),
            enr_seq: 9,
            recipient_addr: "127.0.0.1:30303".parse().unwrap(),
        };
        server.handle_pong(&pong, remote_id).await;
        let command = tokio::time::timeout(Duration::from_secs(1), command_receiver.recv())
            .await
            .expect("expected a refresh command")
            .unwrap();
        match command {
            Command::FindNode { node, distance, .. } => {
                assert_eq!(node.node_id(), remote_id);
                assert_eq!(distance, 0);
            }
            _ => panic!("expected a FINDNODE command"),
        }
    }

    #[tokio::test]
    async fn ip_votes_update_address_on_threshold() {
        let mut server = raw_server(6).await;
        let original_ip = server.local_node.ip;
        let original_seq = server.local_node_record.seq;

        let new_ip: IpAddr = "203.0.113.50".parse().unwrap();
        server.record_ip_vote(new_ip, H256::from_low_u64_be(1));
        server.record_ip_vote(new_ip, H256::from_low_u64_be(2));
        assert_eq!(server.local_node.ip, original_ip);

        server.record_ip_vote(new_ip, H256::from_low_u64_be(3));
        assert_eq!(server.local_node.ip, new_ip);
        assert_eq!(server.local_node_record.seq, original_seq + 1);
        assert!(server.local_node_record.verify_signature());
        assert!(server.ip_votes.is_empty());
    }

    #[tokio::test]
    async fn ip_votes_count_each_peer_once() {
        let mut server = raw_server(7).await;
        let original_ip = server.local_node.ip;
        let new_ip: IpAddr = "203.0.113.50".parse().unwrap();
        let voter = H256::from_low_u64_be(1);

        server.record_ip_vote(new_ip, voter);
        server.record_ip_vote(new_ip, voter);
        server.record_ip_vote(new_ip, voter);

        assert_eq!(server.ip_votes.get(&new_ip).map(|v| v.len()), Some(1));
        assert_eq!(server.local_node.ip, original_ip);
    }

    #[tokio::test]
    async fn ip_votes_ignore_private_addresses() {
        let mut server = raw_server(8).await;
        let voter = H256::from_low_u64_be(1);
        for ip in [
            "192.168.1.100",
            "127.0.0.1",
            "169.254.1.1",
            "::1",
            "fe80::1",
            "fd12::1",
        ] {
            server.record_ip_vote(ip.parse().unwrap(), voter);
        }
        assert!(server.ip_votes.is_empty());

        server.record_ip_vote("203.0.113.50".parse().unwrap(), voter);
        assert_eq!(server.ip_votes.len(), 1);
    }

    #[tokio::test]
    async fn nodes_response_accumulates_out_of_order_packets() {
        let mut rng = StdRng::seed_from_u64(9);
        let (peer, _) = test_node(10);
        let peer_id = peer.node_id();

        let records: Vec<NodeRecord> = (0..4u16)
            .map(|i| {
                let (node, secret) = node_at_distance(&peer_id, 256, 40_000 + i, &mut rng);
                NodeRecord::from_node(&node, 1, &secret).unwrap()
            })
            .collect();

        let req_id = Bytes::from_static(b"req00003");
        let (sender, receiver) = mpsc::channel(RESPONSE_SLOT_CAPACITY);
        // three sub-packets delivered out of order, all sharing the req id
        for chunk in [
            vec![records[3].clone()],
            vec![records[0].clone(), records[1].clone()],
            vec![records[2].clone()],
        ] {
            sender
                .try_send(Message::Nodes(NodesMessage {
                    req_id: req_id.clone(),
                    total: 3,
                    nodes: chunk,
                }))
                .unwrap();
        }

        let assembled = await_nodes(receiver, peer, 256).await;
        let expected: Vec<H256> = [3usize, 0, 1, 2]
            .iter()
            .map(|&i| records[i].node_id().unwrap())
            .collect();
        let got: Vec<H256> = assembled.iter().map(|r| r.node_id().unwrap()).collect();
        // all four arrived, in arrival order
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn nodes_outside_requested_bucket_are_discarded() {
        let mut rng = StdRng::seed_from_u64(11);
        let (peer, _) = test_node(12);
        let peer_id = peer.node_id();

        let (in_bucket, in_secret) = node_at_distance(&peer_id, 256, 41_000, &mut rng);
        let (out_of_bucket, out_secret) = node_at_distance(&peer_id, 255, 41_001, &mut rng);
        let in_record = NodeRecord::from_node(&in_bucket, 1, &in_secret).unwrap();
        let out_record = NodeRecord::from_node(&out_of_bucket, 1, &out_secret).unwrap();

        let (sender, receiver) = mpsc::channel(RESPONSE_SLOT_CAPACITY);
        sender
            .try_send(Message::Nodes(NodesMessage {
                req_id: Bytes::from_static(b"req00004"),
                total: 1,
                nodes: vec![out_record, in_record],
            }))
            .unwrap();

        let assembled = await_nodes(receiver, peer, 256).await;
        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0].node_id(), Some(in_bucket.node_id()));
    }

    #[tokio::test]
    async fn handshake_establishes_sessions_and_serves_requests() {
        let a = Discovery::spawn(test_config(100)).await.unwrap();
        let b = Discovery::spawn(test_config(101)).await.unwrap();
        let a_record = a.local_record().await.unwrap();
        assert!(b.add_node(a_record).await);

        let node_a = b.get_node(a.local_node_id()).await.unwrap();

        // first ping: random packet -> WHOAREYOU -> handshake -> PONG,
        // resolved by the original waiter
        let pong = b.ping(&node_a).await.expect("handshake ping failed");
        assert_eq!(pong.enr_seq, 1);
        assert_eq!(pong.observed_addr, b.local_node().udp_addr());

        // A authenticated B's record and admitted it
        assert!(a.get_node(b.local_node_id()).await.is_some());
        assert_eq!(a.stats().await.table_nodes, 1);

        // second ping rides the installed session
        assert!(b.ping(&node_a).await.is_some());

        // FINDNODE distance 0 returns the peer's own current record
        let self_nodes = b.find_node(&node_a, 0).await;
        assert_eq!(self_nodes.len(), 1);
        assert_eq!(self_nodes[0].node_id(), a.local_node_id());

        a.close_wait().await;
        b.close_wait().await;
    }

    #[tokio::test]
    async fn find_node_serves_bucket_contents_across_packets() {
        let a = Discovery::spawn(test_config(102)).await.unwrap();
        let b = Discovery::spawn(test_config(103)).await.unwrap();
        assert!(b.add_node(a.local_record().await.unwrap()).await);
        let node_a = b.get_node(a.local_node_id()).await.unwrap();
        b.ping(&node_a).await.expect("handshake ping failed");

        // seven records in A's distance-256 bucket force a 3-packet response
        let mut rng = StdRng::seed_from_u64(13);
        let mut expected = FxHashSet::default();
        for i in 0..7u16 {
            let (node, secret) = node_at_distance(&a.local_node_id(), 256, 42_000 + i, &mut rng);
            let record = NodeRecord::from_node(&node, 1, &secret).unwrap();
            expected.insert(node.node_id());
            assert!(a.add_node(record).await);
        }

        let found = b.find_node(&node_a, 256).await;
        let found_ids: FxHashSet<H256> = found.iter().map(|n| n.node_id()).collect();
        assert!(expected.is_subset(&found_ids), "missing bucket entries");
        for node in &found {
            assert_eq!(log_distance(&a.local_node_id(), &node.node_id()), 256);
        }

        a.close_wait().await;
        b.close_wait().await;
    }

    #[tokio::test]
    async fn advertised_address_mismatch_blocks_admission() {
        let a = Discovery::spawn(test_config(110)).await.unwrap();
        // B advertises a public address but its packets arrive from loopback
        let mut config = test_config(111);
        config.local_ip = "203.0.113.9".parse().unwrap();
        let b = Discovery::spawn(config).await.unwrap();

        assert!(b.add_node(a.local_record().await.unwrap()).await);
        let node_a = b.get_node(a.local_node_id()).await.unwrap();

        // the handshake and the request still work: A answers to the source
        assert!(b.ping(&node_a).await.is_some());
        // but A refuses to admit a node whose record points elsewhere
        assert!(a.get_node(b.local_node_id()).await.is_none());
        assert_eq!(a.stats().await.table_nodes, 0);

        a.close_wait().await;
        b.close_wait().await;
    }

    #[tokio::test]
    async fn ping_timeout_leaves_no_request_state() {
        let a = Discovery::spawn(test_config(104)).await.unwrap();

        // a peer that stays silent: bound socket, nobody reading
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let mut rng = StdRng::seed_from_u64(14);
        let secret = SecretKey::new(&mut rng);
        let node = Node::new(
            "127.0.0.1".parse().unwrap(),
            port,
            port,
            public_key_from_secret(&secret),
        );
        let record = NodeRecord::from_node(&node, 1, &secret).unwrap();
        assert!(a.add_node(record).await);

        let started = Instant::now();
        assert!(a.ping(&node).await.is_none());
        assert!(started.elapsed() >= RESPONSE_TIMEOUT);

        // the response slot died with the waiter
        assert_eq!(a.stats().await.outstanding_requests, 0);
        // and the pending-by-nonce entry is swept right after expiry
        tokio::time::sleep(CLEANUP_INTERVAL + Duration::from_millis(200)).await;
        assert_eq!(a.stats().await.pending_messages, 0);

        a.close_wait().await;
    }

    #[tokio::test]
    async fn revalidation_drops_dead_nodes_but_keeps_bootstrap() {
        // a dead bootstrap node and a dead regular node
        let silent_bootstrap = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bootstrap_port = silent_bootstrap.local_addr().unwrap().port();
        let mut rng = StdRng::seed_from_u64(15);
        let bootstrap_secret = SecretKey::new(&mut rng);
        let bootstrap_node = Node::new(
            "127.0.0.1".parse().unwrap(),
            bootstrap_port,
            bootstrap_port,
            public_key_from_secret(&bootstrap_secret),
        );
        let bootstrap_record =
            NodeRecord::from_node(&bootstrap_node, 1, &bootstrap_secret).unwrap();

        let mut config = test_config(105);
        config.enable_maintenance = true;
        config.revalidation_interval = Duration::from_millis(50);
        config.revalidation_failure_threshold = 1;
        config.lookup_interval = Duration::from_secs(600);
        config.bootstrap = vec![bootstrap_record];
        let a = Discovery::spawn(config).await.unwrap();

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let dead_secret = SecretKey::new(&mut rng);
        let dead_node = Node::new(
            "127.0.0.1".parse().unwrap(),
            port,
            port,
            public_key_from_secret(&dead_secret),
        );
        let dead_id = dead_node.node_id();
        let dead_record = NodeRecord::from_node(&dead_node, 1, &dead_secret).unwrap();
        assert!(a.add_node(dead_record).await);

        // the probe loop needs a jitter sleep plus a full ping timeout per
        // node; give it a generous deadline
        let deadline = Instant::now() + Duration::from_secs(20);
        while a.get_node(dead_id).await.is_some() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(
            a.get_node(dead_id).await.is_none(),
            "dead node was not removed"
        );
        assert!(
            a.get_node(bootstrap_node.node_id()).await.is_some(),
            "bootstrap node must be retained"
        );

        a.close_wait().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lookup_traverses_the_network() {
        let bootstrap = Discovery::spawn(test_config(106)).await.unwrap();
        let bootstrap_record = bootstrap.local_record().await.unwrap();
        let bootstrap_id = bootstrap.local_node_id();

        let mut engines = vec![bootstrap];
        for i in 0..5u64 {
            let engine = Discovery::spawn(test_config(107 + i)).await.unwrap();
            assert!(engine.add_node(bootstrap_record.clone()).await);
            let bootstrap_node = engine.get_node(bootstrap_id).await.unwrap();
            engine
                .ping(&bootstrap_node)
                .await
                .expect("bootstrap ping failed");
            engines.push(engine);
        }

        // a target in the far half of the id space relative to the bootstrap
        // node, so first-hop queries land in the populated buckets
        let target = {
            let mut bytes = bootstrap_id.to_fixed_bytes();
            bytes[0] ^= 0x80;
            H256::from(bytes)
        };
        for engine in &engines {
            let found = engine.lookup(target).await;
            assert!(!found.is_empty());
            assert!(found.len() <= BUCKET_SIZE);

            // no duplicates, no self, sorted by XOR distance to the target
            let ids: Vec<H256> = found.iter().map(|n| n.node_id()).collect();
            let unique: FxHashSet<&H256> = ids.iter().collect();
            assert_eq!(unique.len(), ids.len());
            assert!(!ids.contains(&engine.local_node_id()));
            let distances: Vec<H256> = ids.iter().map(|id| *id ^ target).collect();
            assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        }

        // traversal spread knowledge beyond the bootstrap entry point
        for engine in &engines[1..] {
            assert!(engine.stats().await.table_nodes >= 2);
        }

        for engine in &engines {
            engine.close_wait().await;
        }
    }
}
