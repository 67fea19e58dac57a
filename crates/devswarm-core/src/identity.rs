//! Device and server identity, and the session-key layout recovered from
//! the handshake.

use rsa::{RsaPrivateKey, RsaPublicKey};
use std::sync::Arc;

use crate::crypto::{export_public_der, export_public_pem, random_bytes, rsa_generate_1024, rsa_load_public};
use crate::error::{DeviceError, Result};

pub const DEVICE_ID_LEN: usize = 12;
const SESSION_SECRETS_LEN: usize = 40;
const AES_KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const TOKEN_PREFIX_LEN: usize = 6;

/// A single virtual device's identity: a random 12-byte id plus its own
/// RSA keypair.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub id: [u8; DEVICE_ID_LEN],
    pub private_key: RsaPrivateKey,
}

impl DeviceIdentity {
    /// Generates a fresh random id and RSA-1024 keypair.
    pub fn generate() -> Result<Self> {
        let mut id = [0u8; DEVICE_ID_LEN];
        random_bytes(&mut id);
        let private_key = rsa_generate_1024()?;
        Ok(Self { id, private_key })
    }

    pub fn from_parts(id: [u8; DEVICE_ID_LEN], private_key: RsaPrivateKey) -> Self {
        Self { id, private_key }
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        export_public_der(&self.public_key())
    }

    pub fn public_key_pem(&self) -> Result<String> {
        export_public_pem(&self.public_key())
    }
}

/// The server's published RSA public key, shared read-only across every
/// session in the process.
#[derive(Clone)]
pub struct ServerIdentity(Arc<RsaPublicKey>);

impl ServerIdentity {
    pub fn from_pem(pem: &str) -> Result<Self> {
        Ok(Self(Arc::new(rsa_load_public(pem)?)))
    }

    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self(Arc::new(key))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.0
    }
}

/// The 40-byte secret blob recovered by decrypting the server's handshake
/// response with the device's private key: a 16-byte AES key, a 16-byte
/// initial IV, a big-endian initial CoAP message id, and a 6-byte token
/// prefix used to seed every subsequent request token.
#[derive(Debug, Clone, Copy)]
pub struct SessionSecrets {
    pub aes_key: [u8; AES_KEY_LEN],
    pub initial_iv: [u8; IV_LEN],
    pub initial_message_id: u16,
    pub token_prefix: [u8; TOKEN_PREFIX_LEN],
}

impl SessionSecrets {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SESSION_SECRETS_LEN {
            return Err(DeviceError::CryptoIntegrity(format!(
                "session secrets blob too short: {} < {SESSION_SECRETS_LEN}",
                bytes.len()
            )));
        }
        let mut aes_key = [0u8; AES_KEY_LEN];
        aes_key.copy_from_slice(&bytes[0..16]);
        let mut initial_iv = [0u8; IV_LEN];
        initial_iv.copy_from_slice(&bytes[16..32]);
        let initial_message_id = u16::from_be_bytes([bytes[32], bytes[33]]);
        let mut token_prefix = [0u8; TOKEN_PREFIX_LEN];
        token_prefix.copy_from_slice(&bytes[34..40]);
        Ok(Self { aes_key, initial_iv, initial_message_id, token_prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identity_generates_distinct_ids() {
        let a = DeviceIdentity::generate().unwrap();
        let b = DeviceIdentity::generate().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), DEVICE_ID_LEN);
    }

    #[test]
    fn session_secrets_parse_layout() {
        let mut blob = vec![0u8; SESSION_SECRETS_LEN];
        for (i, b) in blob.iter_mut().enumerate().take(16) {
            *b = i as u8;
        }
        blob[32] = 0x01;
        blob[33] = 0x02;
        blob[34..40].copy_from_slice(&[0xAA; 6]);

        let secrets = SessionSecrets::parse(&blob).unwrap();
        assert_eq!(secrets.aes_key, core::array::from_fn(|i| i as u8));
        assert_eq!(secrets.initial_message_id, 0x0102);
        assert_eq!(secrets.token_prefix, [0xAA; 6]);
    }

    #[test]
    fn session_secrets_rejects_short_blob() {
        assert!(SessionSecrets::parse(&[0u8; 39]).is_err());
    }
}
