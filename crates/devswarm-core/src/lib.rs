//! Virtual-device transport stack: RSA handshake, chained AES-128-CBC
//! framing, a CoAP-over-stream message layer, and the reconnecting
//! session state machine that ties them together.

pub mod cipher_chain;
pub mod coap;
pub mod crypto;
pub mod error;
pub mod fleet;
pub mod framing;
pub mod identity;
pub mod session;
pub mod throttle;

pub use error::{DeviceError, Result};
pub use fleet::DeviceFleet;
pub use identity::{DeviceIdentity, ServerIdentity, SessionSecrets};
pub use session::{DeviceSession, SessionState};
