use ethereum_types::{H256, H512, U256};
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Derives a node id from an uncompressed public key: `SHA256(pubkey)`.
pub fn node_id(public_key: &H512) -> H256 {
    H256::from_slice(&Sha256::digest(public_key.as_bytes()))
}

/// Uncompressed 64-byte representation of the public key matching `secret`.
pub fn public_key_from_secret(secret: &SecretKey) -> H512 {
    let public = secret.public_key(secp256k1::SECP256K1);
    H512::from_slice(&public.serialize_uncompressed()[1..])
}

pub fn compress_pubkey(public_key: H512) -> Option<PublicKey> {
    let mut buf = [0u8; 65];
    buf[0] = 0x04;
    buf[1..].copy_from_slice(public_key.as_bytes());
    PublicKey::from_slice(&buf).ok()
}

pub fn decompress_pubkey(public_key: &PublicKey) -> H512 {
    H512::from_slice(&public_key.serialize_uncompressed()[1..])
}

/// Logarithmic distance between two node ids:
/// `256 - leading_zero_bits(a XOR b)`, and `0` iff `a == b`.
pub fn log_distance(a: &H256, b: &H256) -> u64 {
    let xor = a ^ b;
    U256::from_big_endian(xor.as_bytes()).bits() as u64
}

/// Whether an address advertised in a NODES response is plausible given the
/// address the response came from. Loopback and site-local addresses are only
/// accepted from peers that are themselves loopback/site-local; unspecified
/// and multicast addresses are never accepted.
pub fn is_valid_neighbour_ip(sender: &IpAddr, advertised: &IpAddr) -> bool {
    if advertised.is_unspecified() || advertised.is_multicast() {
        return false;
    }
    if advertised.is_loopback() && !sender.is_loopback() {
        return false;
    }
    if is_site_local(advertised) && !is_site_local(sender) {
        return false;
    }
    true
}

/// Returns true if the IP is private/local (not useful for external connectivity).
/// For IPv6, mirrors the checks from `Ipv6Addr::is_global` (nightly-only).
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // unique local (fc00::/7)
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // link-local (fe80::/10)
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn is_site_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
