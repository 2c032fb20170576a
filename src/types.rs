use crate::utils::{compress_pubkey, decompress_pubkey, node_id, public_key_from_secret};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use ethereum_types::{H256, H512};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use secp256k1::{Message as SecpMessage, PublicKey, SecretKey, ecdsa::Signature};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The identity scheme name recorded under the `id` pair.
const ID_SCHEME: &[u8] = b"v5";

#[derive(Debug, thiserror::Error)]
pub enum NodeRecordError {
    #[error("record is missing the `{0}` pair")]
    MissingPair(&'static str),
    #[error("record pair `{0}` is malformed")]
    InvalidPair(&'static str),
    #[error("record signature is invalid")]
    InvalidSignature,
    #[error("signing the record failed")]
    Signing,
    #[error("not an enr URI")]
    InvalidUri,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Rlp(#[from] DecoderError),
}

/// A discoverable node: network address plus the public key its id derives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: H512,
}

impl Node {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16, public_key: H512) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key,
        }
    }

    pub fn node_id(&self) -> H256 {
        node_id(&self.public_key)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Builds a node from the address and key pairs of a signed record.
    /// The record signature is not checked here.
    pub fn from_enr(record: &NodeRecord) -> Result<Node, NodeRecordError> {
        let pairs = record.decode_pairs();
        let ip = pairs.ip.ok_or(NodeRecordError::MissingPair("ip"))?;
        let udp_port = pairs.udp_port.ok_or(NodeRecordError::MissingPair("udp"))?;
        let tcp_port = pairs.tcp_port.unwrap_or(udp_port);
        let compressed = pairs
            .secp256k1
            .ok_or(NodeRecordError::MissingPair("secp256k1"))?;
        let public_key = PublicKey::from_slice(&compressed)
            .map(|pk| decompress_pubkey(&pk))
            .map_err(|_| NodeRecordError::InvalidPair("secp256k1"))?;
        Ok(Node::new(ip, udp_port, tcp_port, public_key))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            hex::encode(&self.node_id().as_bytes()[..8]),
            self.ip,
            self.udp_port
        )
    }
}

/// A signed node record. `pairs` is the sorted key/value list of the wire
/// format; use [`NodeRecord::decode_pairs`] for typed access.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeRecord {
    pub signature: H512,
    pub seq: u64,
    pub pairs: Vec<(Bytes, Bytes)>,
}

/// Typed view over the known pairs of a record.
#[derive(Debug, Clone, Default)]
pub struct NodeRecordPairs {
    pub id: Option<Bytes>,
    pub ip: Option<IpAddr>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub secp256k1: Option<Bytes>,
}

impl NodeRecord {
    /// Builds and signs a record for `node` with the given sequence number.
    pub fn from_node(node: &Node, seq: u64, signer: &SecretKey) -> Result<Self, NodeRecordError> {
        Self::from_node_with_pairs(node, seq, signer, &[])
    }

    /// Same as [`NodeRecord::from_node`] with caller-supplied extra pairs
    /// merged into the sorted pair list.
    pub fn from_node_with_pairs(
        node: &Node,
        seq: u64,
        signer: &SecretKey,
        extra_pairs: &[(String, Bytes)],
    ) -> Result<Self, NodeRecordError> {
        if public_key_from_secret(signer) != node.public_key {
            return Err(NodeRecordError::Signing);
        }
        let compressed = compress_pubkey(node.public_key).ok_or(NodeRecordError::Signing)?;

        let mut pairs: Vec<(Bytes, Bytes)> = Vec::with_capacity(5 + extra_pairs.len());
        pairs.push((Bytes::from_static(b"id"), Bytes::from_static(ID_SCHEME)));
        match node.ip {
            IpAddr::V4(v4) => {
                pairs.push((Bytes::from_static(b"ip"), Bytes::copy_from_slice(&v4.octets())))
            }
            IpAddr::V6(v6) => {
                pairs.push((Bytes::from_static(b"ip6"), Bytes::copy_from_slice(&v6.octets())))
            }
        }
        pairs.push((
            Bytes::from_static(b"secp256k1"),
            Bytes::copy_from_slice(&compressed.serialize()),
        ));
        pairs.push((
            Bytes::from_static(b"tcp"),
            Bytes::copy_from_slice(&node.tcp_port.to_be_bytes()),
        ));
        pairs.push((
            Bytes::from_static(b"udp"),
            Bytes::copy_from_slice(&node.udp_port.to_be_bytes()),
        ));
        for (key, value) in extra_pairs {
            pairs.push((Bytes::copy_from_slice(key.as_bytes()), value.clone()));
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs.dedup_by(|a, b| a.0 == b.0);

        let mut record = NodeRecord {
            signature: H512::zero(),
            seq,
            pairs,
        };
        let digest = SecpMessage::from_digest(record.content_digest());
        let signature = secp256k1::SECP256K1.sign_ecdsa(&digest, signer);
        record.signature = H512::from_slice(&signature.serialize_compact());
        Ok(record)
    }

    pub fn decode_pairs(&self) -> NodeRecordPairs {
        let mut decoded = NodeRecordPairs::default();
        for (key, value) in &self.pairs {
            match key.as_ref() {
                b"id" => decoded.id = Some(value.clone()),
                b"ip" if value.len() == 4 => {
                    let mut octets = [0u8; 4];
                    octets.copy_from_slice(value);
                    decoded.ip = Some(IpAddr::V4(Ipv4Addr::from(octets)));
                }
                b"ip6" if value.len() == 16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(value);
                    decoded.ip = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                }
                b"tcp" => decoded.tcp_port = decode_port(value),
                b"udp" => decoded.udp_port = decode_port(value),
                b"secp256k1" if value.len() == 33 => decoded.secp256k1 = Some(value.clone()),
                _ => {}
            }
        }
        decoded
    }

    /// Checks the record signature against the `secp256k1` pair.
    pub fn verify_signature(&self) -> bool {
        let Some(compressed) = self.decode_pairs().secp256k1 else {
            return false;
        };
        let Ok(public_key) = PublicKey::from_slice(&compressed) else {
            return false;
        };
        let Ok(signature) = Signature::from_compact(self.signature.as_bytes()) else {
            return false;
        };
        let digest = SecpMessage::from_digest(self.content_digest());
        secp256k1::SECP256K1
            .verify_ecdsa(&digest, &signature, &public_key)
            .is_ok()
    }

    /// Node id the record commits to, if the key pair is present.
    pub fn node_id(&self) -> Option<H256> {
        let compressed = self.decode_pairs().secp256k1?;
        let public_key = PublicKey::from_slice(&compressed).ok()?;
        Some(node_id(&decompress_pubkey(&public_key)))
    }

    /// Parses the textual `enr:<base64url>` form.
    pub fn from_uri(uri: &str) -> Result<Self, NodeRecordError> {
        let payload = uri.strip_prefix("enr:").ok_or(NodeRecordError::InvalidUri)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload)?;
        let record: NodeRecord = rlp::decode(&bytes)?;
        if !record.verify_signature() {
            return Err(NodeRecordError::InvalidSignature);
        }
        Ok(record)
    }

    pub fn to_uri(&self) -> String {
        format!("enr:{}", URL_SAFE_NO_PAD.encode(rlp::encode(self)))
    }

    /// `SHA256(rlp([seq, k1, v1, …]))`, the content the signature covers.
    fn content_digest(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(1 + 2 * self.pairs.len());
        stream.append(&self.seq);
        for (key, value) in &self.pairs {
            stream.append(&key.to_vec());
            stream.append(&value.to_vec());
        }
        Sha256::digest(stream.out()).into()
    }
}

fn decode_port(value: &Bytes) -> Option<u16> {
    match value.len() {
        1 => Some(value[0] as u16),
        2 => Some(u16::from_be_bytes([value[0], value[1]])),
        _ => None,
    }
}

impl Encodable for NodeRecord {
    fn rlp_append(&self, stream: &mut RlpStream) {
        stream.begin_list(2 + 2 * self.pairs.len());
        stream.append(&self.signature);
        stream.append(&self.seq);
        for (key, value) in &self.pairs {
            stream.append(&key.to_vec());
            stream.append(&value.to_vec());
        }
    }
}

impl Decodable for NodeRecord {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let item_count = rlp.item_count()?;
        if item_count < 2 || (item_count - 2) % 2 != 0 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let signature: H512 = rlp.val_at(0)?;
        let seq: u64 = rlp.val_at(1)?;
        let mut pairs = Vec::with_capacity((item_count - 2) / 2);
        let mut index = 2;
        while index < item_count {
            let key: Vec<u8> = rlp.val_at(index)?;
            let value: Vec<u8> = rlp.val_at(index + 1)?;
            pairs.push((Bytes::from(key), Bytes::from(value)));
            index += 2;
        }
        Ok(NodeRecord {
            signature,
            seq,
            pairs,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::test_node;
    use super::*;

    #[test]
    fn record_round_trips_through_rlp() {
        let (node, secret) = test_node(1);
        let record = NodeRecord::from_node(&node, 7, &secret).unwrap();
        let encoded = rlp::encode(&record);
        let decoded: NodeRecord = rlp::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.verify_signature());
        assert_eq!(decoded.seq, 7);
        assert_eq!(Node::from_enr(&decoded).unwrap(), node);
    }

    #[test]
    fn record_signature_covers_content() {
        let (node, secret) = test_node(2);
        let mut record = NodeRecord::from_node(&node, 1, &secret).unwrap();
        assert!(record.verify_signature());
        record.seq = 2;
        assert!(!record.verify_signature());
    }

    #[test]
    fn record_node_id_matches_node() {
        let (node, secret) = test_node(3);
        let record = NodeRecord::from_node(&node, 1, &secret).unwrap();
        assert_eq!(record.node_id(), Some(node.node_id()));
    }

    #[test]
    fn enr_uri_round_trip() {
        let (node, secret) = test_node(4);
        let record = NodeRecord::from_node(&node, 3, &secret).unwrap();
        let uri = record.to_uri();
        assert!(uri.starts_with("enr:"));
        let parsed = NodeRecord::from_uri(&uri).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn tampered_uri_is_rejected() {
        let (node, secret) = test_node(5);
        let mut record = NodeRecord::from_node(&node, 3, &secret).unwrap();
        // flip a byte of the signed content
        record.seq += 1;
        let uri = record.to_uri();
        assert!(matches!(
            NodeRecord::from_uri(&uri),
            Err(NodeRecordError::InvalidSignature)
        ));
    }

    #[test]
    fn extra_pairs_are_sorted_and_signed() {
        let (node, secret) = test_node(6);
        let record = NodeRecord::from_node_with_pairs(
            &node,
            1,
            &secret,
            &[("zzz".to_string(), Bytes::from_static(b"1"))],
        )
        .unwrap();
        assert!(record.verify_signature());
        assert!(record.pairs.windows(2).all(|w| w[0].0 <= w[1].0));
        assert!(record.pairs.iter().any(|(k, _)| k.as_ref() == b"zzz"));
    }

    #[test]
    fn foreign_key_cannot_sign_for_node() {
        let (node, _) = test_node(7);
        let (_, other_secret) = test_node(8);
        assert!(NodeRecord::from_node(&node, 1, &other_secret).is_err());
    }
}
