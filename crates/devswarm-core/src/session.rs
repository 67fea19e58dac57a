//! The per-device connection state machine: handshake, cipher
//! installation, CoAP dispatch, ACK correlation, periodic ping, and the
//! reconnect loop.
//!
//! One `tokio::task` owns the socket's read half and runs the dispatch
//! loop; writes are serialized behind a `tokio::sync::Mutex` so
//! `send_webhook`/`send_event` calls from other tasks can never interleave
//! ciphertext with the session's own ping/hello traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cipher_chain::CipherChain;
use crate::coap::{code, describe_flag, hello_payload, CoapMessage, CoapType};
use crate::crypto::{digests_equal, hmac_sha1, rsa_decrypt_private, rsa_decrypt_public, rsa_encrypt_public};
use crate::error::{DeviceError, Result};
use crate::framing::{encode_frame, Decoder};
use crate::identity::{DeviceIdentity, ServerIdentity, SessionSecrets};
use crate::throttle::ThrottleFilter;

const RECONNECT_DELAY: Duration = Duration::from_secs(15);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(3);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(31);
const PRODUCT_ID: u16 = 0;
const FIRMWARE_VERSION: u16 = 1;
const PLATFORM_ID: u16 = 0;

/// Observable connection state, per the handshake diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Nonce,
    AwaitSessionKey,
    Ready,
}

/// Subscriber callback for server-sent events (`E`/`e` Uri-Path).
pub type EventCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct WriteSide {
    cipher: CipherChain,
    throttle: ThrottleFilter,
    writer: OwnedWriteHalf,
    next_message_id: u16,
}

impl WriteSide {
    fn take_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    async fn send(&mut self, msg: &CoapMessage) -> Result<()> {
        let encoded = msg.encode()?;
        let ciphertext = self.cipher.encrypt(&encoded);
        let framed = encode_frame(&ciphertext)?;
        self.throttle.delay().await;
        self.writer.write_all(&framed).await.map_err(DeviceError::Transport)?;
        Ok(())
    }
}

struct Shared {
    state: RwLock<SessionState>,
    sticky_disconnected: AtomicBool,
    write_side: Mutex<Option<WriteSide>>,
    pending_acks: Mutex<HashMap<u16, oneshot::Sender<CoapMessage>>>,
    hello_waiter: Mutex<Option<oneshot::Sender<()>>>,
    subscribers: Mutex<HashMap<String, Vec<EventCallback>>>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// A single virtual device's connection to the cloud. Cheap to clone: all
/// mutable state lives behind an `Arc`.
#[derive(Clone)]
pub struct DeviceSession {
    identity: Arc<DeviceIdentity>,
    server_identity: ServerIdentity,
    addr: String,
    throttle_ms: u64,
    shared: Arc<Shared>,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity, server_identity: ServerIdentity, addr: impl Into<String>, throttle_ms: u64) -> Self {
        Self {
            identity: Arc::new(identity),
            server_identity,
            addr: addr.into(),
            throttle_ms,
            shared: Arc::new(Shared {
                state: RwLock::new(SessionState::Disconnected),
                sticky_disconnected: AtomicBool::new(false),
                write_side: Mutex::new(None),
                pending_acks: Mutex::new(HashMap::new()),
                hello_waiter: Mutex::new(None),
                subscribers: Mutex::new(HashMap::new()),
                connection_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn device_id_hex(&self) -> String {
        self.identity.id_hex()
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.identity.public_key_pem()
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.shared.state.read().await, SessionState::Ready)
    }

    /// Registers a callback for events arriving under `E`/`e` with the
    /// given name (the Uri-Path with the leading `E`/`e` segment removed).
    pub async fn subscribe(&self, event_name: impl Into<String>, callback: EventCallback) {
        self.shared.subscribers.lock().await.entry(event_name.into()).or_default().push(callback);
    }

    /// Starts (or resumes) the connection loop. A no-op once `disconnect`
    /// has been called, and idempotent while already connecting/connected.
    pub async fn connect(&self) {
        if self.shared.sticky_disconnected.load(Ordering::SeqCst) {
            debug!(device = %self.device_id_hex(), "connect() ignored: session was explicitly disconnected");
            return;
        }
        let mut guard = self.shared.connection_task.lock().await;
        if guard.is_some() {
            return;
        }
        if let Some(reconnect) = self.shared.reconnect_task.lock().await.take() {
            reconnect.abort();
        }
        *self.shared.state.write().await = SessionState::Nonce;
        let session = self.clone();
        *guard = Some(tokio::spawn(async move { session.run_until_disconnected().await }));
    }

    /// Tears the session down: aborts the connection task, clears the
    /// write side, cancels any pending reconnect, and rejects further
    /// `connect()` calls until a new `DeviceSession` is constructed.
    pub async fn disconnect(&self) {
        self.shared.sticky_disconnected.store(true, Ordering::SeqCst);
        if let Some(task) = self.shared.connection_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.shared.reconnect_task.lock().await.take() {
            task.abort();
        }
        *self.shared.write_side.lock().await = None;
        self.shared.pending_acks.lock().await.clear();
        *self.shared.state.write().await = SessionState::Disconnected;
    }

    /// Sends a one-off webhook-style event to the server. Silently
    /// discarded (per the write-when-not-ready failure mode) if the
    /// session is not currently `Ready`.
    pub async fn send_webhook(&self, path: &str, payload: Vec<u8>) -> Result<()> {
        let mut guard = self.shared.write_side.lock().await;
        let Some(write_side) = guard.as_mut() else {
            warn!(device = %self.device_id_hex(), "send_webhook discarded: socket not writable");
            return Ok(());
        };
        let message_id = write_side.take_message_id();
        let msg = CoapMessage::new(CoapType::NonConfirmable, code::POST, message_id)
            .with_uri_path(path)
            .with_payload(payload);
        write_side.send(&msg).await
    }

    /// Sends a request and awaits its correlated ACK, failing with
    /// [`DeviceError::CorrelationTimeout`] after ten seconds of silence.
    pub async fn send_and_wait(&self, path: &str, payload: Vec<u8>) -> Result<CoapMessage> {
        let (tx, rx) = oneshot::channel();
        let message_id = {
            let mut guard = self.shared.write_side.lock().await;
            let Some(write_side) = guard.as_mut() else {
                return Err(DeviceError::Handshake("session not ready".into()));
            };
            let message_id = write_side.take_message_id();
            self.shared.pending_acks.lock().await.insert(message_id, tx);
            let msg = CoapMessage::new(CoapType::Confirmable, code::GET, message_id)
                .with_uri_path(path)
                .with_payload(payload);
            write_side.send(&msg).await?;
            message_id
        };
        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            _ => {
                self.shared.pending_acks.lock().await.remove(&message_id);
                Err(DeviceError::CorrelationTimeout(message_id))
            }
        }
    }

    async fn run_until_disconnected(&self) {
        loop {
            if self.shared.sticky_disconnected.load(Ordering::SeqCst) {
                return;
            }
            *self.shared.state.write().await = SessionState::Nonce;
            match self.run_connection_once().await {
                Ok(()) => info!(device = %self.device_id_hex(), "connection closed cleanly"),
                Err(e) => warn!(device = %self.device_id_hex(), error = %e, "connection attempt failed"),
            }
            *self.shared.write_side.lock().await = None;
            *self.shared.state.write().await = SessionState::Disconnected;

            if self.shared.sticky_disconnected.load(Ordering::SeqCst) {
                return;
            }

            let (tx, rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(RECONNECT_DELAY).await;
                let _ = tx.send(());
            });
            *self.shared.reconnect_task.lock().await = Some(handle);
            let _ = rx.await;
            *self.shared.reconnect_task.lock().await = None;
        }
    }

    async fn run_connection_once(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await.map_err(DeviceError::Transport)?;
        let (mut reader, mut writer) = stream.into_split();

        let mut nonce = [0u8; 40];
        reader.read_exact(&mut nonce).await.map_err(DeviceError::Transport)?;

        let mut open_payload = Vec::with_capacity(40 + 12 + 160);
        open_payload.extend_from_slice(&nonce);
        open_payload.extend_from_slice(&self.identity.id);
        open_payload.extend_from_slice(&self.identity.public_key_der()?);
        let ciphertext = rsa_encrypt_public(self.server_identity.public_key(), &open_payload)?;
        writer.write_all(&ciphertext).await.map_err(DeviceError::Transport)?;

        *self.shared.state.write().await = SessionState::AwaitSessionKey;

        // The session key is encrypted under this device's public key, so
        // it is exactly one device-key-sized block; the signature over it
        // is produced with the server's own private key, so it is one
        // server-key-sized block.
        let device_key_size = self.identity.private_key.size();
        let server_key_size = self.server_identity.public_key().size();
        let mut session_response = vec![0u8; device_key_size + server_key_size];
        reader.read_exact(&mut session_response).await.map_err(DeviceError::Transport)?;
        let (session_key_ct, signed_hmac) = session_response.split_at(device_key_size);

        let session_key = rsa_decrypt_private(&self.identity.private_key, session_key_ct)?;
        let expected = hmac_sha1(&session_key, session_key_ct);
        let recovered = rsa_decrypt_public(self.server_identity.public_key(), signed_hmac)?;
        if !digests_equal(&recovered, &expected) {
            return Err(DeviceError::CryptoIntegrity(
                "server session-key signature did not match expected HMAC".into(),
            ));
        }

        let secrets = SessionSecrets::parse(&session_key)?;
        let cipher = CipherChain::new(secrets.aes_key, secrets.initial_iv);
        let throttle = ThrottleFilter::new(self.throttle_ms);

        let mut write_side = WriteSide {
            cipher,
            throttle,
            writer,
            next_message_id: secrets.initial_message_id,
        };

        let (hello_tx, hello_rx) = oneshot::channel();
        *self.shared.hello_waiter.lock().await = Some(hello_tx);

        let hello_msg_id = write_side.take_message_id();
        let mut token = secrets.token_prefix.to_vec();
        token.push(0);
        let hello = CoapMessage::new(CoapType::Confirmable, code::POST, hello_msg_id)
            .with_token(token)
            .with_uri_path("h")
            .with_payload(hello_payload(PRODUCT_ID, FIRMWARE_VERSION, PLATFORM_ID, &self.identity.id));
        write_side.send(&hello).await?;

        *self.shared.write_side.lock().await = Some(write_side);

        // The server's Hello acknowledgement only arrives on the socket
        // the read loop below drains, so the hello wait has to run
        // concurrently with that loop rather than block ahead of it —
        // otherwise the ACK sits unread and every handshake times out.
        self.serve(reader, hello_rx).await
    }

    async fn serve(&self, mut reader: OwnedReadHalf, hello_rx: oneshot::Receiver<()>) -> Result<()> {
        let recv_throttle = ThrottleFilter::new(self.throttle_ms);
        let mut decoder = Decoder::new();
        let mut read_buf = vec![0u8; 4096];
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately; skip it

        let mut awaiting_hello = true;
        let mut hello_rx = hello_rx;
        let hello_deadline = tokio::time::sleep(HELLO_TIMEOUT);
        tokio::pin!(hello_deadline);

        let idle_deadline = tokio::time::sleep(IDLE_TIMEOUT);
        tokio::pin!(idle_deadline);

        loop {
            tokio::select! {
                read_result = reader.read(&mut read_buf) => {
                    let n = read_result.map_err(DeviceError::Transport)?;
                    if n == 0 {
                        return Ok(());
                    }
                    idle_deadline.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                    recv_throttle.delay().await;
                    for ciphertext in decoder.push(&read_buf[..n]) {
                        self.handle_inbound_frame(&ciphertext).await;
                    }
                }
                res = &mut hello_rx, if awaiting_hello => {
                    awaiting_hello = false;
                    if res.is_ok() {
                        *self.shared.state.write().await = SessionState::Ready;
                        info!(device = %self.device_id_hex(), "session ready");
                    }
                }
                _ = &mut hello_deadline, if awaiting_hello => {
                    *self.shared.hello_waiter.lock().await = None;
                    return Err(DeviceError::Handshake("no hello response from server within timeout".into()));
                }
                _ = &mut idle_deadline => {
                    return Err(DeviceError::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no inbound traffic within idle timeout",
                    )));
                }
                _ = ping_interval.tick() => {
                    self.send_ping().await;
                }
            }
        }
    }

    async fn handle_inbound_frame(&self, ciphertext: &[u8]) {
        let plaintext = {
            let mut guard = self.shared.write_side.lock().await;
            let Some(write_side) = guard.as_mut() else { return };
            match write_side.cipher.decrypt(ciphertext) {
                Ok(pt) => pt,
                Err(e) => {
                    warn!(device = %self.device_id_hex(), error = %e, "dropping frame with bad padding/integrity");
                    return;
                }
            }
        };
        let msg = match CoapMessage::decode(&plaintext) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(device = %self.device_id_hex(), error = %e, "dropping malformed coap message");
                return;
            }
        };
        self.dispatch(msg).await;
    }

    async fn dispatch(&self, msg: CoapMessage) {
        if msg.msg_type == CoapType::Acknowledgement {
            if let Some(tx) = self.shared.pending_acks.lock().await.remove(&msg.message_id) {
                let _ = tx.send(msg);
                return;
            }
        }

        match msg.uri_path.first().map(String::as_str) {
            Some("h") => {
                if let Some(tx) = self.shared.hello_waiter.lock().await.take() {
                    let _ = tx.send(());
                }
            }
            Some("d") => {
                let flag = describe_flag(&msg.payload);
                let body = describe_body(flag);
                self.reply(&msg, code::CONTENT, body).await;
            }
            Some("f") => {
                let mut result = vec![0u8; 4];
                crate::crypto::random_bytes(&mut result);
                self.reply(&msg, code::CHANGED, result).await;
            }
            Some("v") => {
                let mut result = vec![0u8; 4];
                crate::crypto::random_bytes(&mut result);
                self.reply(&msg, code::CONTENT, result).await;
            }
            Some("E") | Some("e") => {
                // Segments after the verb and before the trailing numeric index.
                let segments = &msg.uri_path;
                let event_name = segments
                    .get(1..segments.len().saturating_sub(1))
                    .map(|s| s.join("/"))
                    .unwrap_or_default();
                let subscribers = self.shared.subscribers.lock().await;
                if let Some(callbacks) = subscribers.get(&event_name) {
                    for cb in callbacks {
                        cb(&event_name, &msg.payload);
                    }
                }
            }
            other => {
                debug!(device = %self.device_id_hex(), uri = ?other, "ignoring message on unrecognized uri-path");
            }
        }
    }

    async fn reply(&self, request: &CoapMessage, code: u8, payload: Vec<u8>) {
        let mut guard = self.shared.write_side.lock().await;
        let Some(write_side) = guard.as_mut() else { return };
        let response = CoapMessage::new(CoapType::Acknowledgement, code, request.message_id)
            .with_token(request.token.clone())
            .with_payload(payload);
        if let Err(e) = write_side.send(&response).await {
            warn!(device = %self.device_id_hex(), error = %e, "failed to send reply");
        }
    }

    async fn send_ping(&self) {
        let mut guard = self.shared.write_side.lock().await;
        let Some(write_side) = guard.as_mut() else { return };
        let message_id = write_side.take_message_id();
        let ping = CoapMessage::new(CoapType::Confirmable, code::EMPTY, message_id);
        if let Err(e) = write_side.send(&ping).await {
            warn!(device = %self.device_id_hex(), error = %e, "ping send failed");
        }
    }
}

fn describe_body(flag: u8) -> Vec<u8> {
    let json = match flag {
        0 => serde_json::json!({ "f": [] }),
        1 => serde_json::json!({ "v": [] }),
        _ => serde_json::json!({ "f": [], "v": [] }),
    };
    serde_json::to_vec(&json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_equality() {
        assert_eq!(SessionState::Ready, SessionState::Ready);
        assert_ne!(SessionState::Ready, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn new_session_starts_disconnected_and_not_connected() {
        let identity = DeviceIdentity::generate().unwrap();
        let server_key = crate::crypto::rsa_generate_1024().unwrap();
        let server_identity = ServerIdentity::from_public_key(RsaPublicKey::from(&server_key));
        let session = DeviceSession::new(identity, server_identity, "127.0.0.1:0", 0);
        assert_eq!(session.state().await, SessionState::Disconnected);
        assert!(!session.is_connected().await);
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_sticky_and_idempotent() {
        let identity = DeviceIdentity::generate().unwrap();
        let server_key = crate::crypto::rsa_generate_1024().unwrap();
        let server_identity = ServerIdentity::from_public_key(RsaPublicKey::from(&server_key));
        let session = DeviceSession::new(identity, server_identity, "127.0.0.1:0", 0);
        session.disconnect().await;
        session.disconnect().await;
        session.connect().await;
        assert_eq!(session.state().await, SessionState::Disconnected);
    }
}
