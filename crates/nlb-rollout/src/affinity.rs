//! Build-independent affinity hashing.
//!
//! Color decisions must not move when the toolchain changes, so keys are
//! hashed with FNV-1a 64-bit over a fixed byte encoding instead of the
//! standard library's hasher.

use std::net::{IpAddr, SocketAddr};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// A value that can pin a connection to one color.
pub trait AffinityKey {
    fn affinity_bytes(&self, out: &mut Vec<u8>);

    fn affinity_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(16);
        self.affinity_bytes(&mut bytes);
        hash_bytes(&bytes)
    }
}

impl AffinityKey for [u8] {
    fn affinity_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl AffinityKey for str {
    fn affinity_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl AffinityKey for String {
    fn affinity_bytes(&self, out: &mut Vec<u8>) {
        self.as_str().affinity_bytes(out);
    }
}

impl AffinityKey for u64 {
    fn affinity_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl AffinityKey for IpAddr {
    fn affinity_bytes(&self, out: &mut Vec<u8>) {
        match self {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
    }
}

/// Hashes the IP only; the ephemeral port changes per connection.
impl AffinityKey for SocketAddr {
    fn affinity_bytes(&self, out: &mut Vec<u8>) {
        self.ip().affinity_bytes(out);
    }
}

/// FNV-1a 64-bit followed by a murmur3 finalizer so the low digits used
/// for the weight split depend on every input byte.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51afd7ed558ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ceb9fe1a85ec53);
    hash ^ (hash >> 33)
}
