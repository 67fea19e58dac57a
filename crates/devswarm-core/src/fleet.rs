//! An insertion-ordered collection of [`DeviceSession`] handles, keyed by
//! device id hex. The minimal surface an orchestrator needs to drive N
//! devices without reaching into session internals.

use std::collections::HashMap;

use crate::identity::{DeviceIdentity, ServerIdentity};
use crate::session::DeviceSession;

pub struct DeviceFleet {
    order: Vec<String>,
    sessions: HashMap<String, DeviceSession>,
    server_identity: ServerIdentity,
    addr: String,
    throttle_ms: u64,
}

impl DeviceFleet {
    pub fn new(server_identity: ServerIdentity, addr: impl Into<String>, throttle_ms: u64) -> Self {
        Self {
            order: Vec::new(),
            sessions: HashMap::new(),
            server_identity,
            addr: addr.into(),
            throttle_ms,
        }
    }

    /// Creates a new session for `identity` and adds it to the fleet,
    /// returning the handle's device-id-hex key.
    pub fn spawn(&mut self, identity: DeviceIdentity) -> String {
        let session = DeviceSession::new(identity, self.server_identity.clone(), self.addr.clone(), self.throttle_ms);
        let key = session.device_id_hex();
        self.order.push(key.clone());
        self.sessions.insert(key.clone(), session);
        key
    }

    pub fn get(&self, device_id_hex: &str) -> Option<&DeviceSession> {
        self.sessions.get(device_id_hex)
    }

    pub fn remove(&mut self, device_id_hex: &str) -> Option<DeviceSession> {
        self.order.retain(|k| k != device_id_hex);
        self.sessions.remove(device_id_hex)
    }

    /// Iterates sessions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceSession)> {
        self.order.iter().filter_map(move |k| self.sessions.get(k).map(|s| (k.as_str(), s)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Counts sessions currently in the `Ready` state.
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for (_, session) in self.iter() {
            if session.is_connected().await {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;

    fn test_server_identity() -> ServerIdentity {
        let key = crate::crypto::rsa_generate_1024().unwrap();
        ServerIdentity::from_public_key(RsaPublicKey::from(&key))
    }

    #[test]
    fn spawn_keeps_insertion_order() {
        let mut fleet = DeviceFleet::new(test_server_identity(), "127.0.0.1:0", 0);
        let mut keys = Vec::new();
        for _ in 0..5 {
            let identity = DeviceIdentity::generate().unwrap();
            keys.push(fleet.spawn(identity));
        }
        let observed: Vec<&str> = fleet.iter().map(|(k, _)| k).collect();
        assert_eq!(observed, keys);
        assert_eq!(fleet.len(), 5);
    }

    #[test]
    fn remove_drops_from_order_and_map() {
        let mut fleet = DeviceFleet::new(test_server_identity(), "127.0.0.1:0", 0);
        let key = fleet.spawn(DeviceIdentity::generate().unwrap());
        assert!(fleet.remove(&key).is_some());
        assert!(fleet.get(&key).is_none());
        assert!(fleet.is_empty());
    }

    #[tokio::test]
    async fn connected_count_is_zero_before_any_connect() {
        let mut fleet = DeviceFleet::new(test_server_identity(), "127.0.0.1:0", 0);
        fleet.spawn(DeviceIdentity::generate().unwrap());
        fleet.spawn(DeviceIdentity::generate().unwrap());
        assert_eq!(fleet.connected_count().await, 0);
    }
}
