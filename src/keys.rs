//! Key material for the RSSI handshake.
//!
//! The wrapping key is `SHA256("RSSI-KDFv1|" || str(q) || "|" || nonce)[..16]`,
//! where `q` is the quantized RSSI rendered as a signed decimal. The quantized
//! RSSI space is tiny (a few dozen values), which is what makes the sniffer's
//! exhaustive search tractable.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::types::{
    Key, LinkError, Nonce, Result, SessionKey, WrappingKey, KEY_SIZE, LCG_SEED_LABEL, NONCE_SIZE,
    RSSI_KDF_LABEL,
};

/// Quantize an RSSI reading: `round(rssi / step) * step`.
///
/// Halfway values round to the even neighbour, so `-72.5` becomes `-72` and
/// `-73.0` at step 2 becomes `-72`.
pub fn quantize_rssi(rssi_dbm: f32, step: i32) -> i32 {
    let step = step.max(1);
    ((rssi_dbm / step as f32).round_ties_even() as i32) * step
}

/// Derive the wrapping key for a quantized RSSI and nonce.
pub fn derive_wrapping_key(quantized_rssi: i32, nonce: &Nonce) -> WrappingKey {
    let mut hasher = Sha256::new();
    hasher.update(RSSI_KDF_LABEL);
    hasher.update(quantized_rssi.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(nonce.as_bytes());
    truncate_digest(&hasher.finalize())
}

/// Seed of the rolling message-key generator for a handshake.
///
/// `be32(SHA256("LCG-SEEDv1|" || str(q) || "|" || nonce)[..4])`.
pub fn derive_rolling_seed(quantized_rssi: i32, nonce: &Nonce) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(LCG_SEED_LABEL);
    hasher.update(quantized_rssi.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(nonce.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Generate a fresh random handshake nonce.
pub fn generate_nonce<R: RngCore + ?Sized>(rng: &mut R) -> Nonce {
    let mut bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut bytes);
    Nonce(bytes)
}

/// Generate a fresh random session key.
pub fn generate_session_key<R: RngCore + ?Sized>(rng: &mut R) -> SessionKey {
    let mut key = [0u8; KEY_SIZE];
    rng.fill_bytes(&mut key);
    key
}

/// Copy a slice into a fixed-size key.
pub fn key_from_slice(bytes: &[u8]) -> Result<Key> {
    if bytes.len() != KEY_SIZE {
        return Err(LinkError::InvalidKeyLength(bytes.len()));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(bytes);
    Ok(key)
}

/// First 16 bytes of a SHA-256 digest.
pub(crate) fn truncate_digest(digest: &[u8]) -> Key {
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_nonce() -> Nonce {
        "0102030405060708".parse().unwrap()
    }

    #[test]
    fn test_quantize_rssi() {
        assert_eq!(quantize_rssi(-73.4, 1), -73);
        assert_eq!(quantize_rssi(-73.6, 1), -74);
        assert_eq!(quantize_rssi(-73.0, 2), -72);
        assert_eq!(quantize_rssi(-75.0, 2), -76);
        assert_eq!(quantize_rssi(-72.5, 1), -72);
        assert_eq!(quantize_rssi(-73.5, 1), -74);
        assert_eq!(quantize_rssi(-70.0, 4), -72);
        assert_eq!(quantize_rssi(-71.0, 4), -72);
        assert_eq!(quantize_rssi(-12.0, 0), -12);
    }

    #[test]
    fn test_wrapping_key_matches_manual_hash() {
        let nonce = test_nonce();
        let mut input = b"RSSI-KDFv1|-73|".to_vec();
        input.extend_from_slice(nonce.as_bytes());
        let expected = Sha256::digest(&input);
        assert_eq!(derive_wrapping_key(-73, &nonce).to_vec(), expected[..16].to_vec());
    }

    #[test]
    fn test_wrapping_key_depends_on_q_and_nonce() {
        let nonce = test_nonce();
        let other: Nonce = "0102030405060709".parse().unwrap();
        assert_ne!(derive_wrapping_key(-73, &nonce), derive_wrapping_key(-72, &nonce));
        assert_ne!(derive_wrapping_key(-73, &nonce), derive_wrapping_key(-73, &other));
    }

    #[test]
    fn test_rolling_seed_is_deterministic() {
        let nonce = test_nonce();
        assert_eq!(derive_rolling_seed(-73, &nonce), derive_rolling_seed(-73, &nonce));
        assert_ne!(derive_rolling_seed(-73, &nonce), derive_rolling_seed(-74, &nonce));
    }

    #[test]
    fn test_generated_nonces_differ() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = generate_nonce(&mut rng);
        let b = generate_nonce(&mut rng);
        assert_ne!(a, b);
        assert_ne!(generate_session_key(&mut rng), generate_session_key(&mut rng));
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(key_from_slice(&[0u8; 16]).is_ok());
        assert!(matches!(
            key_from_slice(&[0u8; 15]),
            Err(LinkError::InvalidKeyLength(15))
        ));
    }
}
