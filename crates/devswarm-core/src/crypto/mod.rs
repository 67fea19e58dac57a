//! RSA key exchange, AES-128-CBC framing cipher, and HMAC-SHA1 integrity
//! checks used by the handshake and the per-frame cipher chain.
//!
//! Grounded on the teacher's `proudnet.rs` crypto handler (RSA keygen,
//! one-shot AES block cipher, HMAC-based integrity check), generalized
//! from AES-ECB to AES-128-CBC via the `cbc` crate's `Encryptor`/
//! `Decryptor` pair in the same style the pack's `tuya_protocol` reference
//! uses for its own block cipher.

use aes::Aes128;
use cbc::cipher::block_padding::{Pkcs7, UnpadError};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::{DeviceError, Result};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha1 = Hmac<Sha1>;

/// Number of bits in a freshly generated device identity key.
pub const DEVICE_KEY_BITS: usize = 1024;

/// Generates a new device RSA keypair.
pub fn rsa_generate_1024() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, DEVICE_KEY_BITS)
        .map_err(|e| DeviceError::CryptoIntegrity(format!("rsa keygen failed: {e}")))
}

/// Loads a PKCS#1-encoded RSA private key from PEM text.
pub fn rsa_load_private(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .map_err(|e| DeviceError::CryptoIntegrity(format!("invalid private key pem: {e}")))
}

/// Loads a PKCS#8-encoded RSA public key from PEM text (the server's
/// published identity key).
pub fn rsa_load_public(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| DeviceError::CryptoIntegrity(format!("invalid public key pem: {e}")))
}

/// Exports a private key as PKCS#1 PEM, for on-disk persistence.
pub fn export_private_pem(key: &RsaPrivateKey) -> Result<String> {
    key.to_pkcs1_pem(Default::default())
        .map(|s| s.to_string())
        .map_err(|e| DeviceError::CryptoIntegrity(format!("private key pem encode failed: {e}")))
}

/// Exports a public key as PKCS#8 PEM, for `public_key_pem()`.
pub fn export_public_pem(key: &RsaPublicKey) -> Result<String> {
    key.to_public_key_pem(Default::default())
        .map_err(|e| DeviceError::CryptoIntegrity(format!("public key pem encode failed: {e}")))
}

/// Exports a public key as PKCS#8 DER bytes, embedded in the handshake
/// payload the device sends to the server.
pub fn export_public_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    key.to_public_key_der()
        .map(|d| d.as_bytes().to_vec())
        .map_err(|e| DeviceError::CryptoIntegrity(format!("public key der encode failed: {e}")))
}

/// Encrypts `data` under the server's public key (PKCS#1 v1.5 padding).
/// Used for the device's handshake-open payload.
pub fn rsa_encrypt_public(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    key.encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|e| DeviceError::CryptoIntegrity(format!("rsa public encrypt failed: {e}")))
}

/// Decrypts `ciphertext` with the device's own private key (PKCS#1 v1.5
/// padding). Used to recover the session key from the server's response.
pub fn rsa_decrypt_private(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    key.decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|e| DeviceError::CryptoIntegrity(format!("rsa private decrypt failed: {e}")))
}

/// Raw RSA primitive: `m^d mod n` over PKCS#1 type-1 (signature-style)
/// padding. This is the "encrypt with the private key" step the handshake
/// uses to authenticate the session key — a textbook-RSA signature, not a
/// confidentiality operation, so it is implemented directly over the key's
/// modulus/exponent rather than through the `rsa` crate's higher-level
/// encrypt/decrypt API (which only speaks the public-key direction).
pub fn rsa_encrypt_private(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let k = key.size();
    let padded = pkcs1_pad_type1(k, data)?;
    let m = BigUint::from_bytes_be(&padded);
    let c = m.modpow(key.d(), key.n());
    Ok(left_pad(&c.to_bytes_be(), k))
}

/// Raw RSA primitive: `c^e mod n`, then strips PKCS#1 type-1 padding.
/// Recovers the plaintext digest the server signed with its private key,
/// for a manual comparison against the locally computed HMAC.
pub fn rsa_decrypt_public(key: &RsaPublicKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let k = key.size();
    if ciphertext.len() != k {
        return Err(DeviceError::CryptoIntegrity(format!(
            "signature length {} does not match key size {k}",
            ciphertext.len()
        )));
    }
    let c = BigUint::from_bytes_be(ciphertext);
    let m = c.modpow(key.e(), key.n());
    let padded = left_pad(&m.to_bytes_be(), k);
    pkcs1_unpad_type1(&padded)
}

fn pkcs1_pad_type1(k: usize, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() + 11 > k {
        return Err(DeviceError::CryptoIntegrity(
            "data too long for pkcs1 type-1 padding".into(),
        ));
    }
    let mut out = Vec::with_capacity(k);
    out.push(0x00);
    out.push(0x01);
    out.extend(std::iter::repeat(0xFFu8).take(k - data.len() - 3));
    out.push(0x00);
    out.extend_from_slice(data);
    Ok(out)
}

fn pkcs1_unpad_type1(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 11 || padded[0] != 0x00 || padded[1] != 0x01 {
        return Err(DeviceError::CryptoIntegrity(
            "pkcs1 type-1 header mismatch".into(),
        ));
    }
    let sep = padded[2..]
        .iter()
        .position(|&b| b != 0xFF)
        .map(|p| p + 2)
        .ok_or_else(|| DeviceError::CryptoIntegrity("pkcs1 type-1 padding not terminated".into()))?;
    if padded[sep] != 0x00 {
        return Err(DeviceError::CryptoIntegrity(
            "pkcs1 type-1 padding missing separator".into(),
        ));
    }
    Ok(padded[sep + 1..].to_vec())
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

/// One-shot AES-128-CBC encrypt with PKCS#7 padding.
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// One-shot AES-128-CBC decrypt, verifying PKCS#7 padding.
pub fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e: UnpadError| DeviceError::CryptoIntegrity(format!("cbc unpad failed: {e}")))
}

/// HMAC-SHA1 over `data` keyed by `key`, producing the 20-byte digest the
/// handshake uses to authenticate the session key.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let out = mac.finalize().into_bytes();
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&out);
    digest
}

/// Constant-time-in-effect comparison over two equal-length digests. Both
/// operands here are always fixed 20-byte HMAC outputs, so a fold across
/// the full length (rather than short-circuiting) is sufficient; this
/// replaces the original system's `compare() === -1` check, which silently
/// accepted digests that merely sorted earlier than expected.
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Fills `buf` with cryptographically random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_cbc_round_trip() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plaintext = b"hello device transport";
        let ct = aes128_cbc_encrypt(&key, &iv, plaintext);
        assert_ne!(ct, plaintext);
        let pt = aes128_cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn aes_cbc_different_iv_changes_ciphertext() {
        let key = [0x11u8; 16];
        let plaintext = b"same plaintext, different iv";
        let ct_a = aes128_cbc_encrypt(&key, &[0u8; 16], plaintext);
        let ct_b = aes128_cbc_encrypt(&key, &[1u8; 16], plaintext);
        assert_ne!(ct_a, ct_b);
    }

    #[test]
    fn rsa_session_key_round_trip() {
        let server_key = rsa_generate_1024().unwrap();
        let server_pub = RsaPublicKey::from(&server_key);
        let session_key = b"0123456789abcdef0123456789012345678"; // 37 bytes
        let ct = rsa_encrypt_public(&server_pub, session_key).unwrap();
        let pt = rsa_decrypt_private(&server_key, &ct).unwrap();
        assert_eq!(pt, session_key);
    }

    #[test]
    fn rsa_raw_sign_and_recover_round_trip() {
        let server_key = rsa_generate_1024().unwrap();
        let server_pub = RsaPublicKey::from(&server_key);
        let digest = hmac_sha1(b"session-key-bytes", b"ciphertext-bytes");
        let signed = rsa_encrypt_private(&server_key, &digest).unwrap();
        let recovered = rsa_decrypt_public(&server_pub, &signed).unwrap();
        assert_eq!(recovered, digest);
    }

    #[test]
    fn tampered_signature_does_not_recover_original_digest() {
        let server_key = rsa_generate_1024().unwrap();
        let server_pub = RsaPublicKey::from(&server_key);
        let digest = hmac_sha1(b"k", b"d");
        let mut signed = rsa_encrypt_private(&server_key, &digest).unwrap();
        let last = signed.len() - 1;
        signed[last] ^= 0xFF;
        match rsa_decrypt_public(&server_pub, &signed) {
            Ok(recovered) => assert_ne!(recovered, digest),
            Err(_) => {}
        }
    }

    #[test]
    fn digest_equality_check() {
        let a = hmac_sha1(b"k", b"d");
        let b = hmac_sha1(b"k", b"d");
        let c = hmac_sha1(b"k", b"e");
        assert!(digests_equal(&a, &b));
        assert!(!digests_equal(&a, &c));
    }

    #[test]
    fn pem_export_import_round_trip() {
        let key = rsa_generate_1024().unwrap();
        let pem = export_private_pem(&key).unwrap();
        let reloaded = rsa_load_private(&pem).unwrap();
        assert_eq!(key.to_pkcs1_pem(Default::default()).unwrap().to_string(), export_private_pem(&reloaded).unwrap());

        let public_pem = export_public_pem(&RsaPublicKey::from(&key)).unwrap();
        let reloaded_pub = rsa_load_public(&public_pem).unwrap();
        assert_eq!(reloaded_pub, RsaPublicKey::from(&key));
    }
}
