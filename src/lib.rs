//! FHSS Link - frequency-hopping LoRa link with an RSSI-keyed handshake
//!
//! Rust implementation of the link layer: static and dynamic hop schedules,
//! the quantized-RSSI session-key handshake, per-message keys, the ASCII
//! frame envelope, and the passive sniffer that breaks the handshake by
//! exhaustive search.

mod types;
mod config;
mod clock;
mod radio;
mod hop;
mod keys;
mod ratchet;
mod crypto;
mod envelope;
mod handshake;
mod session;
mod node;
mod sniffer;
mod sim;

pub use types::*;
pub use config::*;
pub use clock::*;
pub use radio::*;
pub use hop::*;
pub use keys::*;
pub use ratchet::*;
pub use crypto::*;
pub use envelope::*;
pub use handshake::*;
pub use session::*;
pub use node::*;
pub use sniffer::*;
pub use sim::*;
