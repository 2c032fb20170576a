use crate::discv5::codec::ID_NONCE_LENGTH;
use crate::types::NodeRecord;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Key, KeyInit, Nonce};
use ethereum_types::H256;
use hkdf::Hkdf;
use rlp::{Rlp, RlpStream};
use rustc_hash::FxHashMap;
use secp256k1::{Message as SecpMessage, PublicKey, SecretKey, ecdsa::Signature};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

/// HKDF info prefix for session-key agreement.
const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";
/// Domain-separation prefix of the id-nonce signature.
const ID_NONCE_PREFIX: &[u8] = b"discovery-id-nonce";
/// Version number carried in the auth-response plaintext.
const AUTH_RESPONSE_VERSION: u64 = 5;

pub const SESSION_KEY_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptographyError {
    #[error("AEAD operation failed")]
    Aead,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("invalid key material")]
    InvalidKey,
    #[error("malformed auth response")]
    MalformedAuthResponse,
}

/// Symmetric keys agreed with one remote endpoint. Both sides send under
/// their own `write_key` and receive under `read_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub write_key: [u8; SESSION_KEY_LENGTH],
    pub read_key: [u8; SESSION_KEY_LENGTH],
}

impl Session {
    /// Opaque form persisted in the session store.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * SESSION_KEY_LENGTH);
        buf.extend_from_slice(&self.write_key);
        buf.extend_from_slice(&self.read_key);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 2 * SESSION_KEY_LENGTH {
            return None;
        }
        let mut write_key = [0u8; SESSION_KEY_LENGTH];
        let mut read_key = [0u8; SESSION_KEY_LENGTH];
        write_key.copy_from_slice(&bytes[..SESSION_KEY_LENGTH]);
        read_key.copy_from_slice(&bytes[SESSION_KEY_LENGTH..]);
        Some(Session {
            write_key,
            read_key,
        })
    }
}

/// Key/value store holding session secrets keyed by `(node_id, address)`.
/// Values are opaque bytes; the engine tolerates an empty store at startup.
pub trait SessionStore: Send + 'static {
    fn get(&self, node_id: &H256, addr: &SocketAddr) -> Option<Vec<u8>>;
    fn put(&mut self, node_id: H256, addr: SocketAddr, value: Vec<u8>);
    fn delete(&mut self, node_id: &H256, addr: &SocketAddr);
}

/// Process-local session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: FxHashMap<(H256, SocketAddr), Vec<u8>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, node_id: &H256, addr: &SocketAddr) -> Option<Vec<u8>> {
        self.entries.get(&(*node_id, *addr)).cloned()
    }

    fn put(&mut self, node_id: H256, addr: SocketAddr, value: Vec<u8>) {
        self.entries.insert((node_id, addr), value);
    }

    fn delete(&mut self, node_id: &H256, addr: &SocketAddr) {
        self.entries.remove(&(*node_id, *addr));
    }
}

/// The three keys derived during a handshake.
pub struct SessionKeys {
    pub initiator_key: [u8; SESSION_KEY_LENGTH],
    pub recipient_key: [u8; SESSION_KEY_LENGTH],
    pub auth_resp_key: [u8; SESSION_KEY_LENGTH],
}

/// HKDF-SHA256 over the ECDH shared secret: salt is the challenge's id-nonce,
/// info is `"discovery v5 key agreement" ‖ initiator-id ‖ recipient-id`.
pub fn derive_session_keys(
    local_secret: &SecretKey,
    remote_public: &PublicKey,
    initiator_id: &H256,
    recipient_id: &H256,
    id_nonce: &[u8; ID_NONCE_LENGTH],
) -> Result<SessionKeys, CryptographyError> {
    let point = secp256k1::ecdh::shared_secret_point(remote_public, local_secret);
    let shared_secret = &point[..32];

    let mut info = Vec::with_capacity(KEY_AGREEMENT_INFO.len() + 64);
    info.extend_from_slice(KEY_AGREEMENT_INFO);
    info.extend_from_slice(initiator_id.as_bytes());
    info.extend_from_slice(recipient_id.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(id_nonce), shared_secret);
    let mut okm = [0u8; 3 * SESSION_KEY_LENGTH];
    hkdf.expand(&info, &mut okm)
        .map_err(|_| CryptographyError::KeyDerivation)?;

    let mut keys = SessionKeys {
        initiator_key: [0u8; SESSION_KEY_LENGTH],
        recipient_key: [0u8; SESSION_KEY_LENGTH],
        auth_resp_key: [0u8; SESSION_KEY_LENGTH],
    };
    keys.initiator_key.copy_from_slice(&okm[..16]);
    keys.recipient_key.copy_from_slice(&okm[16..32]);
    keys.auth_resp_key.copy_from_slice(&okm[32..]);
    Ok(keys)
}

fn id_nonce_digest(id_nonce: &[u8; ID_NONCE_LENGTH], ephemeral_pubkey: &[u8]) -> SecpMessage {
    let mut hasher = Sha256::new();
    hasher.update(ID_NONCE_PREFIX);
    hasher.update(id_nonce);
    hasher.update(ephemeral_pubkey);
    SecpMessage::from_digest(hasher.finalize().into())
}

/// Signs `SHA256("discovery-id-nonce" ‖ id-nonce ‖ ephemeral-pubkey)` with
/// the local identity key. Compact 64-byte form.
pub fn create_id_signature(
    signer: &SecretKey,
    id_nonce: &[u8; ID_NONCE_LENGTH],
    ephemeral_pubkey: &[u8],
) -> [u8; 64] {
    let digest = id_nonce_digest(id_nonce, ephemeral_pubkey);
    secp256k1::SECP256K1
        .sign_ecdsa(&digest, signer)
        .serialize_compact()
}

pub fn verify_id_signature(
    public_key: &PublicKey,
    id_nonce: &[u8; ID_NONCE_LENGTH],
    ephemeral_pubkey: &[u8],
    signature: &[u8; 64],
) -> bool {
    let Ok(signature) = Signature::from_compact(signature) else {
        return false;
    };
    let digest = id_nonce_digest(id_nonce, ephemeral_pubkey);
    secp256k1::SECP256K1
        .verify_ecdsa(&digest, &signature, public_key)
        .is_ok()
}

/// Seals `rlp([version, id-signature, record?])` under the auth-response key
/// with an all-zero nonce and no associated data.
pub fn seal_auth_response(
    auth_resp_key: &[u8; SESSION_KEY_LENGTH],
    id_signature: &[u8; 64],
    record: Option<&NodeRecord>,
) -> Result<Vec<u8>, CryptographyError> {
    let mut stream = RlpStream::new_list(if record.is_some() { 3 } else { 2 });
    stream.append(&AUTH_RESPONSE_VERSION);
    stream.append(&id_signature.to_vec());
    if let Some(record) = record {
        stream.append(record);
    }
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(auth_resp_key));
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), stream.out().as_ref())
        .map_err(|_| CryptographyError::Aead)
}

/// Opens an auth-response blob; returns the id-signature and the optional
/// node record it carried.
pub fn open_auth_response(
    auth_resp_key: &[u8; SESSION_KEY_LENGTH],
    ciphertext: &[u8],
) -> Result<([u8; 64], Option<NodeRecord>), CryptographyError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(auth_resp_key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| CryptographyError::Aead)?;

    let rlp = Rlp::new(&plaintext);
    let item_count = rlp
        .item_count()
        .map_err(|_| CryptographyError::MalformedAuthResponse)?;
    if !(2..=3).contains(&item_count) {
        return Err(CryptographyError::MalformedAuthResponse);
    }
    let version: u64 = rlp
        .val_at(0)
        .map_err(|_| CryptographyError::MalformedAuthResponse)?;
    if version != AUTH_RESPONSE_VERSION {
        return Err(CryptographyError::MalformedAuthResponse);
    }
    let signature_bytes: Vec<u8> = rlp
        .val_at(1)
        .map_err(|_| CryptographyError::MalformedAuthResponse)?;
    let signature: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| CryptographyError::MalformedAuthResponse)?;
    let record = if item_count == 3 {
        Some(
            rlp.val_at(2)
                .map_err(|_| CryptographyError::MalformedAuthResponse)?,
        )
    } else {
        None
    };
    Ok((signature, record))
}

/// AES-128-GCM seal used for message payloads; the nonce is the packet's
/// auth-tag and the associated data is the 32-byte tag prefix.
pub fn encrypt_message(
    key: &[u8; SESSION_KEY_LENGTH],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptographyError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptographyError::Aead)
}

/// Failure to authenticate a payload with the current session keys. The
/// engine answers these with a WHOAREYOU challenge.
#[derive(Debug, thiserror::Error)]
#[error("message could not be authenticated with the current session keys")]
pub struct DecryptError;

pub fn decrypt_message(
    key: &[u8; SESSION_KEY_LENGTH],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| DecryptError)
}
