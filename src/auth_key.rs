//! Authorization key material.
//!
//! A persistent key is the 256-byte output of the DH handshake with one data
//! center. The core never uses the key bytes itself; it files keys per DC,
//! hands them to sessions, matches server-side destruction notices against
//! the 8-byte key id and snapshots the whole set for persistence.

use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::dc_id::DcId;

/// Shared handle to one authorization key.
pub type AuthKeyPtr = Arc<AuthKey>;

/// A 256-byte authorization key bound to the DC it was negotiated with.
#[derive(Clone)]
pub struct AuthKey {
    dc_id: DcId,
    data: [u8; 256],
    key_id: [u8; 8],
}

impl AuthKey {
    /// Wrap raw DH output for the given DC.
    pub fn new(dc_id: DcId, data: [u8; 256]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let sha: [u8; 20] = hasher.finalize().into();
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { dc_id, data, key_id }
    }

    /// The DC this key was negotiated with.
    pub fn dc_id(&self) -> DcId {
        self.dc_id
    }

    /// Raw 256-byte representation, for sessions and persistence.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte key identifier, `SHA-1(key)[12..20]`, as the server quotes
    /// it in `destroy_auth_key` notices.
    pub fn key_id(&self) -> u64 {
        u64::from_le_bytes(self.key_id)
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(dc={}, id={})", self.dc_id, self.key_id())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_stable_and_nonzero() {
        let key = AuthKey::new(2, [0x5au8; 256]);
        assert_eq!(key.key_id(), AuthKey::new(3, [0x5au8; 256]).key_id());
        assert_ne!(key.key_id(), 0);
    }

    #[test]
    fn equality_follows_key_id() {
        let a = AuthKey::new(2, [1u8; 256]);
        let b = AuthKey::new(2, [1u8; 256]);
        let c = AuthKey::new(2, [2u8; 256]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
