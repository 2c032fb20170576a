use bytes::{Bytes, BytesMut};
use ethereum_types::H256;
use rlp::{Rlp, RlpStream};
use sha2::{Digest, Sha256};
use tokio_util::codec::Decoder;

pub const TAG_LENGTH: usize = 32;
pub const AUTH_TAG_LENGTH: usize = 12;
pub const ID_NONCE_LENGTH: usize = 32;
/// Length of the filler payload of a session-provoking random packet.
pub const RANDOM_PACKET_PAYLOAD_LENGTH: usize = 44;
/// Auth scheme name carried in handshake headers.
const AUTH_SCHEME_NAME: &[u8] = b"gcm";

pub type AuthTag = [u8; AUTH_TAG_LENGTH];
pub type IdNonce = [u8; ID_NONCE_LENGTH];

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("datagram too short")]
    Truncated,
    #[error("field has invalid length")]
    FieldLength,
    #[error("unknown auth scheme")]
    AuthScheme,
    #[error(transparent)]
    Rlp(#[from] rlp::DecoderError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `SHA256(node_id ‖ "WHOAREYOU")`: the cleartext prefix of challenges
/// addressed to `node_id`.
pub fn whoareyou_magic(node_id: &H256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(b"WHOAREYOU");
    H256::from_slice(&hasher.finalize())
}

/// `SHA256(node_id)`: the component each peer XORs its own id against to
/// form (and strip) packet tags.
pub fn tag_hash(node_id: &H256) -> H256 {
    H256::from_slice(&Sha256::digest(node_id.as_bytes()))
}

/// Tag prefix of a packet from `sender_id` to `recipient_id`.
pub fn compute_tag(sender_id: &H256, recipient_id: &H256) -> H256 {
    tag_hash(recipient_id) ^ *sender_id
}

/// Recovers the sender id from a received tag given our own tag hash.
pub fn sender_from_tag(tag: &H256, local_tag_hash: &H256) -> H256 {
    *tag ^ *local_tag_hash
}

/// A classified inbound datagram. Payload decryption is stateful and happens
/// in the engine.
#[derive(Debug, Clone)]
pub enum InboundPacket {
    /// Cleartext challenge: solicits a handshake for the referenced request.
    WhoAreYou(WhoAreYouPacket),
    /// Handshake-initiating message carrying an authentication header.
    Handshake(HandshakePacket),
    /// Ordinary message sealed under an existing session (or a random packet,
    /// indistinguishable until decryption fails).
    Ordinary(OrdinaryPacket),
}

#[derive(Debug, Clone)]
pub struct WhoAreYouPacket {
    pub auth_tag: AuthTag,
    pub id_nonce: IdNonce,
    pub enr_seq: u64,
}

#[derive(Debug, Clone)]
pub struct HandshakePacket {
    pub src_id: H256,
    pub tag: H256,
    pub auth_tag: AuthTag,
    pub id_nonce: IdNonce,
    pub ephemeral_pubkey: Bytes,
    pub auth_response: Bytes,
    pub ciphertext: Bytes,
}

#[derive(Debug, Clone)]
pub struct OrdinaryPacket {
    pub src_id: H256,
    pub tag: H256,
    pub auth_tag: AuthTag,
    pub ciphertext: Bytes,
}

/// Stateless outer-frame parser bound to the local node id; attached to a
/// `UdpFramed` stream.
#[derive(Debug, Clone)]
pub struct Discv5Codec {
    magic: H256,
    local_tag_hash: H256,
}

impl Discv5Codec {
    pub fn new(local_node_id: H256) -> Self {
        Self {
            magic: whoareyou_magic(&local_node_id),
            local_tag_hash: tag_hash(&local_node_id),
        }
    }
}

impl Decoder for Discv5Codec {
    type Item = InboundPacket;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split_to(src.len()).freeze();
        parse_packet(&datagram, &self.magic, &self.local_tag_hash).map(Some)
    }
}

fn parse_packet(
    datagram: &Bytes,
    magic: &H256,
    local_tag_hash: &H256,
) -> Result<InboundPacket, PacketError> {
    if datagram.len() <= TAG_LENGTH {
        return Err(PacketError::Truncated);
    }
    let prefix = H256::from_slice(&datagram[..TAG_LENGTH]);
    let rest = &datagram[TAG_LENGTH..];

    if prefix == *magic {
        let rlp = Rlp::new(rest);
        let auth_tag = fixed_bytes::<AUTH_TAG_LENGTH>(&rlp.val_at::<Vec<u8>>(0)?)?;
        let id_nonce = fixed_bytes::<ID_NONCE_LENGTH>(&rlp.val_at::<Vec<u8>>(1)?)?;
        let enr_seq: u64 = rlp.val_at(2)?;
        return Ok(InboundPacket::WhoAreYou(WhoAreYouPacket {
            auth_tag,
            id_nonce,
            enr_seq,
        }));
    }

    let src_id = sender_from_tag(&prefix, local_tag_hash);
    let header = Rlp::new(rest);
    let info = header.payload_info()?;
    let header_length = info.header_len + info.value_len;
    if rest.len() < header_length {
        return Err(PacketError::Truncated);
    }
    let ciphertext = datagram.slice(TAG_LENGTH + header_length..);

    if header.is_list() {
        if header.item_count()? != 5 {
            return Err(PacketError::FieldLength);
        }
        let auth_tag = fixed_bytes::<AUTH_TAG_LENGTH>(&header.val_at::<Vec<u8>>(0)?)?;
        let scheme: Vec<u8> = header.val_at(1)?;
        if scheme != AUTH_SCHEME_NAME {
            return Err(PacketError::AuthScheme);
        }
        let id_nonce = fixed_bytes::<ID_NONCE_LENGTH>(&header.val_at::<Vec<u8>>(2)?)?;
        let ephemeral_pubkey = Bytes::from(header.val_at::<Vec<u8>>(3)?);
        let auth_response = Bytes::from(header.val_at::<Vec<u8>>(4)?);
        Ok(InboundPacket::Handshake(HandshakePacket {
            src_id,
            tag: prefix,
            auth_tag,
            id_nonce,
            ephemeral_pubkey,
            auth_response,
            ciphertext,
        }))
    } else {
        let auth_tag = fixed_bytes::<AUTH_TAG_LENGTH>(header.data()?)?;
        Ok(InboundPacket::Ordinary(OrdinaryPacket {
            src_id,
            tag: prefix,
            auth_tag,
            ciphertext,
        }))
    }
}

/// WHOAREYOU challenge addressed to `dest_id`, referencing the auth-tag of
/// the packet that could not be authenticated.
pub fn encode_whoareyou(
    dest_id: &H256,
    auth_tag: &AuthTag,
    id_nonce: &IdNonce,
    enr_seq: u64,
) -> Vec<u8> {
    let mut stream = RlpStream::new_list(3);
    stream.append(&auth_tag.to_vec());
    stream.append(&id_nonce.to_vec());
    stream.append(&enr_seq);
    let body = stream.out();

    let magic = whoareyou_magic(dest_id);
    let mut buf = Vec::with_capacity(TAG_LENGTH + body.len());
    buf.extend_from_slice(magic.as_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Ordinary message frame: `tag ‖ rlp(auth-tag) ‖ ciphertext`.
pub fn encode_ordinary(tag: &H256, auth_tag: &AuthTag, ciphertext: &[u8]) -> Vec<u8> {
    let mut stream = RlpStream::new();
    stream.append(&auth_tag.to_vec());
    let header = stream.out();

    let mut buf = Vec::with_capacity(TAG_LENGTH + header.len() + ciphertext.len());
    buf.extend_from_slice(tag.as_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(ciphertext);
    buf
}

/// A random packet has the shape of an ordinary message but an unreadable
/// payload; its only purpose is to provoke a WHOAREYOU from the recipient.
pub fn encode_random(tag: &H256, auth_tag: &AuthTag, payload: &[u8]) -> Vec<u8> {
    encode_ordinary(tag, auth_tag, payload)
}

/// Handshake message frame:
/// `tag ‖ rlp([auth-tag, "gcm", id-nonce, ephemeral-pubkey, auth-response]) ‖ ciphertext`.
pub fn encode_handshake(
    tag: &H256,
    auth_tag: &AuthTag,
    id_nonce: &IdNonce,
    ephemeral_pubkey: &[u8],
    auth_response: &[u8],
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut stream = RlpStream::new_list(5);
    stream.append(&auth_tag.to_vec());
    stream.append(&AUTH_SCHEME_NAME.to_vec());
    stream.append(&id_nonce.to_vec());
    stream.append(&ephemeral_pubkey.to_vec());
    stream.append(&auth_response.to_vec());
    let header = stream.out();

    let mut buf = Vec::with_capacity(TAG_LENGTH + header.len() + ciphertext.len());
    buf.extend_from_slice(tag.as_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(ciphertext);
    buf
}

fn fixed_bytes<const N: usize>(bytes: &[u8]) -> Result<[u8; N], PacketError> {
    bytes.try_into().map_err(|_| PacketError::FieldLength)
}
