//! Type definitions and protocol constants for the FHSS link.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Size of a handshake nonce in bytes.
pub const NONCE_SIZE: usize = 8;

/// Size of every symmetric key (session, wrapping, message) in bytes.
pub const KEY_SIZE: usize = 16;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Size of the wrapped `SessionKey || TagBlock` transport block.
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + TAG_BLOCK_SIZE;

/// Size of the tag block appended to the session key before wrapping.
pub const TAG_BLOCK_SIZE: usize = 16;

/// Fixed public tag checked after unwrapping.
///
/// Identical on every participant, attackers included. A match only signals
/// that the candidate wrapping key decrypted the block; it authenticates nothing.
pub const DEFAULT_TAG_BLOCK: [u8; TAG_BLOCK_SIZE] = *b"HSK-OK-ICEWIN!!#";

/// Label for the RSSI wrapping-key KDF.
pub const RSSI_KDF_LABEL: &[u8] = b"RSSI-KDFv1|";

/// Label for the direct message-key KDF.
pub const MSG_KDF_LABEL: &[u8] = b"MSG-KDF-v1|";

/// Label for the rolling-generator seed KDF.
pub const LCG_SEED_LABEL: &[u8] = b"LCG-SEEDv1|";

/// Label for the rolling-generator message-key KDF.
pub const SYNTH_KDF_LABEL: &[u8] = b"SYNTHK-v1|";

/// Label for the dynamic hop seed KDF.
pub const HOP_SEED_LABEL: &[u8] = b"FHSS-SEED-v1|";

/// Label for the dynamic per-slot channel hash.
pub const HOP_INDEX_LABEL: &[u8] = b"FHSS-HOP-v1|";

/// LCG multiplier shared by the static hop PRN and the rolling generator.
pub const LCG_MULTIPLIER: u64 = 1_103_515_245;

/// LCG increment.
pub const LCG_INCREMENT: u64 = 12_345;

/// LCG modulus mask (`mod 2^31`).
pub const LCG_MASK: u64 = 0x7FFF_FFFF;

/// Longest epoch countdown; wraparound-safe tick arithmetic covers half the
/// 32-bit range.
pub const MAX_COUNTDOWN_MS: u32 = i32::MAX as u32;

/// A 16-byte symmetric key.
pub type Key = [u8; KEY_SIZE];

/// Session key chosen by the Responder.
pub type SessionKey = Key;

/// Ephemeral key protecting the session key in transit.
pub type WrappingKey = Key;

/// Per-message CBC key.
pub type MessageKey = Key;

/// Handshake nonce, rendered on the wire as 16 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Wraps raw nonce bytes.
    pub const fn new(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw nonce bytes, as fed into the KDFs.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Nonce {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != NONCE_SIZE * 2 {
            return Err(LinkError::MalformedFrame(format!(
                "nonce must be {} hex chars, got {}",
                NONCE_SIZE * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; NONCE_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| LinkError::MalformedFrame(format!("bad nonce hex: {}", e)))?;
        Ok(Self(bytes))
    }
}

/// Errors that can occur on the link.
///
/// The first seven variants are the frame-level taxonomy; none of them is
/// fatal to a node's control loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No frame arrived within the receive window.
    #[error("Receive timeout")]
    ReceiveTimeout,

    /// The radio reported a corrupted frame.
    #[error("CRC error")]
    CrcError,

    /// Missing required keys, bad hex, or otherwise unparseable frame.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// PKCS#7 padding check failed after CBC decryption.
    #[error("Invalid PKCS#7 padding")]
    PaddingError,

    /// No candidate in the search window produced the tag block.
    #[error("No quantized RSSI candidate unwrapped the key for nonce {nonce}")]
    TagMismatch { nonce: Nonce },

    /// A frame echoed a nonce other than the one outstanding.
    #[error("Nonce mismatch: expected {expected}, received {received}")]
    NonceMismatch { expected: Nonce, received: Nonce },

    /// A Hello reused a nonce that was already answered.
    #[error("Replayed nonce {nonce}")]
    ReplayedNonce { nonce: Nonce },

    /// The radio did not finish transmitting before the timeout.
    #[error("Transmit timeout")]
    TransmitTimeout,

    /// A key of the wrong length was supplied.
    #[error("Invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Whether a control loop should log this error and keep running.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LinkError::Config(_) | LinkError::InvalidKeyLength(_))
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_hex_roundtrip() {
        let nonce: Nonce = "0102030405060708".parse().unwrap();
        assert_eq!(nonce.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(nonce.to_string(), "0102030405060708");
    }

    #[test]
    fn test_nonce_rejects_bad_input() {
        assert!(matches!(
            "0102".parse::<Nonce>(),
            Err(LinkError::MalformedFrame(_))
        ));
        assert!(matches!(
            "zz02030405060708".parse::<Nonce>(),
            Err(LinkError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_frame_errors_are_recoverable() {
        assert!(LinkError::ReceiveTimeout.is_recoverable());
        assert!(LinkError::PaddingError.is_recoverable());
        assert!(LinkError::TagMismatch {
            nonce: Nonce::new([0; 8])
        }
        .is_recoverable());
        assert!(!LinkError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_tag_block_is_sixteen_bytes() {
        assert_eq!(DEFAULT_TAG_BLOCK.len(), TAG_BLOCK_SIZE);
        assert_eq!(&DEFAULT_TAG_BLOCK, b"HSK-OK-ICEWIN!!#");
    }
}
