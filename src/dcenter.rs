//! Per-DC control block.
//!
//! One `Dcenter` exists per *shifted* DC id that has ever been used, so role
//! variants of the same data center keep independent key slots. The block
//! carries the bare id and the current persistent key; sessions read the key
//! through the shared handle.

use std::sync::{Arc, Mutex};

use crate::auth_key::AuthKeyPtr;
use crate::dc_id::DcId;

pub struct Dcenter {
    id: DcId,
    key: Mutex<Option<AuthKeyPtr>>,
}

impl Dcenter {
    pub fn new(id: DcId, key: Option<AuthKeyPtr>) -> Arc<Self> {
        Arc::new(Self { id, key: Mutex::new(key) })
    }

    /// Bare id of the data center this block controls.
    pub fn id(&self) -> DcId {
        self.id
    }

    pub fn current_key(&self) -> Option<AuthKeyPtr> {
        self.key.lock().unwrap().clone()
    }

    pub fn set_key(&self, key: Option<AuthKeyPtr>) {
        *self.key.lock().unwrap() = key;
    }

    /// Forget the current key if the server quoted its id in a destruction
    /// notice. Returns whether anything was forgotten.
    pub fn destroy_confirmed_forgotten_key(&self, key_id: u64) -> bool {
        let mut slot = self.key.lock().unwrap();
        match slot.as_ref() {
            Some(key) if key.key_id() == key_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_key::AuthKey;

    #[test]
    fn confirmed_destruction_only_matches_current_key() {
        let key = Arc::new(AuthKey::new(2, [7u8; 256]));
        let dc = Dcenter::new(2, Some(key.clone()));
        assert!(!dc.destroy_confirmed_forgotten_key(key.key_id() ^ 1));
        assert!(dc.current_key().is_some());
        assert!(dc.destroy_confirmed_forgotten_key(key.key_id()));
        assert!(dc.current_key().is_none());
        assert!(!dc.destroy_confirmed_forgotten_key(key.key_id()), "already forgotten");
    }
}
