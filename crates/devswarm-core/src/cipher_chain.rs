//! Per-direction AES-128-CBC cipher chain: the IV for frame N+1 is the
//! final ciphertext block of frame N, tracked independently for the send
//! and receive directions so a replayed or reordered frame from one
//! direction can never be decrypted against the wrong chain state.

use crate::crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt};
use crate::error::Result;

const IV_LEN: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct CipherState {
    iv: [u8; IV_LEN],
}

impl CipherState {
    pub fn new(initial_iv: [u8; IV_LEN]) -> Self {
        Self { iv: initial_iv }
    }

    fn advance(&mut self, ciphertext: &[u8]) {
        let tail = &ciphertext[ciphertext.len() - IV_LEN..];
        self.iv.copy_from_slice(tail);
    }
}

/// Owns the AES key shared by both directions and the two independent
/// chain states.
#[derive(Debug, Clone, Copy)]
pub struct CipherChain {
    key: [u8; 16],
    send: CipherState,
    recv: CipherState,
}

impl CipherChain {
    pub fn new(key: [u8; 16], initial_iv: [u8; IV_LEN]) -> Self {
        Self {
            key,
            send: CipherState::new(initial_iv),
            recv: CipherState::new(initial_iv),
        }
    }

    /// Encrypts `frame` under the current send-direction IV, then advances
    /// the send chain to the resulting ciphertext's tail block.
    pub fn encrypt(&mut self, frame: &[u8]) -> Vec<u8> {
        let ct = aes128_cbc_encrypt(&self.key, &self.send.iv, frame);
        self.send.advance(&ct);
        ct
    }

    /// Decrypts `frame` under the current recv-direction IV, then advances
    /// the recv chain to the ciphertext's tail block (not the plaintext's
    /// — the chain tracks what was observed on the wire).
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let pt = aes128_cbc_decrypt(&self.key, &self.recv.iv, frame)?;
        self.recv.advance(frame);
        Ok(pt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_round_trip_across_multiple_frames() {
        let key = [0x7Au8; 16];
        let iv = [0x00u8; 16];
        let mut sender = CipherChain::new(key, iv);
        let mut receiver = CipherChain::new(key, iv);

        for msg in ["frame one", "frame two", "frame three"] {
            let ct = sender.encrypt(msg.as_bytes());
            let pt = receiver.decrypt(&ct).unwrap();
            assert_eq!(pt, msg.as_bytes());
        }
    }

    #[test]
    fn send_and_recv_chains_are_independent() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let mut a = CipherChain::new(key, iv);
        let mut b = CipherChain::new(key, iv);

        // a sends twice before b replies once; the chains must not
        // cross-contaminate.
        let ct1 = a.encrypt(b"one");
        let _ct2 = a.encrypt(b"two");
        let reply_ct = b.encrypt(b"reply");

        assert!(b.decrypt(&ct1).is_ok());
        assert!(a.decrypt(&reply_ct).is_ok());
    }

    #[test]
    fn out_of_order_frame_fails_to_decrypt() {
        let key = [0x33u8; 16];
        let iv = [0x44u8; 16];
        let mut sender = CipherChain::new(key, iv);
        let mut receiver = CipherChain::new(key, iv);

        let ct1 = sender.encrypt(b"first");
        let ct2 = sender.encrypt(b"second");
        // Receiver sees frame 2 before frame 1: its recv IV is still the
        // initial IV, which does not match what frame 2 was encrypted
        // under, so decryption must fail rather than silently succeed.
        assert!(receiver.decrypt(&ct2).is_err());
        let _ = ct1;
    }
}
