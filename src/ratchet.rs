//! Per-message key derivation.
//!
//! Two deployments exist and are never mixed on one link:
//!
//! - **Direct**: `SHA256("MSG-KDF-v1|" || session_key || "|" || be32(counter))[..16]`.
//! - **Rolling**: the shared LCG, seeded from the handshake, advanced
//!   `counter + 1` times; then
//!   `SHA256("SYNTHK-v1|" || session_key || be32(state))[..16]`.
//!
//! Both are pure in `(session_key, counter)`, so a retransmitted or reordered
//! frame can always be decrypted. The rolling generator is fast-forwarded in
//! closed form instead of being stepped `counter + 1` times.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keys::{derive_rolling_seed, truncate_digest};
use crate::types::{
    MessageKey, Nonce, SessionKey, LCG_INCREMENT, LCG_MASK, LCG_MULTIPLIER, MSG_KDF_LABEL,
    SYNTH_KDF_LABEL,
};

/// Which message-key scheme a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKeyVariant {
    #[default]
    Direct,
    Rolling,
}

/// Direct message key for a counter.
pub fn derive_direct_message_key(session_key: &SessionKey, counter: u32) -> MessageKey {
    let mut hasher = Sha256::new();
    hasher.update(MSG_KDF_LABEL);
    hasher.update(session_key);
    hasher.update(b"|");
    hasher.update(counter.to_be_bytes());
    truncate_digest(&hasher.finalize())
}

/// Affine map `x -> a*x + c (mod 2^31)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Affine {
    a: u64,
    c: u64,
}

impl Affine {
    const IDENTITY: Affine = Affine { a: 1, c: 0 };
    const LCG: Affine = Affine {
        a: LCG_MULTIPLIER,
        c: LCG_INCREMENT,
    };

    /// `other` applied after `self`.
    fn then(self, other: Affine) -> Affine {
        Affine {
            a: (other.a * self.a) & LCG_MASK,
            c: (other.a * self.c + other.c) & LCG_MASK,
        }
    }

    fn apply(self, x: u64) -> u64 {
        (self.a * (x & LCG_MASK) + self.c) & LCG_MASK
    }
}

/// State of the shared LCG after `steps` iterations from `seed`.
///
/// O(log steps): powers of the affine step are composed by repeated squaring.
/// Only `seed mod 2^31` influences the result.
pub fn lcg_fast_forward(seed: u32, steps: u64) -> u32 {
    let mut result = Affine::IDENTITY;
    let mut power = Affine::LCG;
    let mut remaining = steps;
    while remaining > 0 {
        if remaining & 1 == 1 {
            result = result.then(power);
        }
        power = power.then(power);
        remaining >>= 1;
    }
    result.apply(u64::from(seed)) as u32
}

/// Rolling-generator state for a message counter.
pub fn rolling_state(seed: u32, counter: u32) -> u32 {
    lcg_fast_forward(seed, u64::from(counter) + 1)
}

/// Rolling-generator message key for a counter.
pub fn derive_rolling_message_key(session_key: &SessionKey, seed: u32, counter: u32) -> MessageKey {
    let state = rolling_state(seed, counter);
    let mut hasher = Sha256::new();
    hasher.update(SYNTH_KDF_LABEL);
    hasher.update(session_key);
    hasher.update(state.to_be_bytes());
    truncate_digest(&hasher.finalize())
}

/// Message-key deriver bound to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKeyDeriver {
    Direct { session_key: SessionKey },
    Rolling { session_key: SessionKey, seed: u32 },
}

impl MessageKeyDeriver {
    /// Builds the deriver for a completed handshake.
    pub fn for_session(
        variant: MessageKeyVariant,
        session_key: SessionKey,
        quantized_rssi: i32,
        nonce: &Nonce,
    ) -> Self {
        match variant {
            MessageKeyVariant::Direct => MessageKeyDeriver::Direct { session_key },
            MessageKeyVariant::Rolling => MessageKeyDeriver::Rolling {
                session_key,
                seed: derive_rolling_seed(quantized_rssi, nonce),
            },
        }
    }

    pub fn variant(&self) -> MessageKeyVariant {
        match self {
            MessageKeyDeriver::Direct { .. } => MessageKeyVariant::Direct,
            MessageKeyDeriver::Rolling { .. } => MessageKeyVariant::Rolling,
        }
    }

    /// Key for the message carrying `counter`.
    pub fn message_key(&self, counter: u32) -> MessageKey {
        match self {
            MessageKeyDeriver::Direct { session_key } => {
                derive_direct_message_key(session_key, counter)
            }
            MessageKeyDeriver::Rolling { session_key, seed } => {
                derive_rolling_message_key(session_key, *seed, counter)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::lcg_step;
    use std::collections::HashSet;

    fn test_session_key() -> SessionKey {
        [0xAA; 16]
    }

    #[test]
    fn test_direct_key_layout() {
        let key = test_session_key();
        let mut input = b"MSG-KDF-v1|".to_vec();
        input.extend_from_slice(&key);
        input.push(b'|');
        input.extend_from_slice(&7u32.to_be_bytes());
        let digest = Sha256::digest(&input);
        assert_eq!(derive_direct_message_key(&key, 7).to_vec(), digest[..16].to_vec());
    }

    #[test]
    fn test_direct_key_is_deterministic() {
        let key = test_session_key();
        assert_eq!(
            derive_direct_message_key(&key, 42),
            derive_direct_message_key(&key, 42)
        );
        assert_ne!(
            derive_direct_message_key(&key, 42),
            derive_direct_message_key(&key, 43)
        );
    }

    #[test]
    fn test_fast_forward_matches_sequential_steps() {
        for seed in [0u32, 1, 0x1234_ABCD, 0xFFFF_FFFF] {
            let mut x = seed;
            for n in 1..=300u64 {
                x = lcg_step(x);
                assert_eq!(lcg_fast_forward(seed, n), x, "seed {seed:#x} steps {n}");
            }
        }
    }

    #[test]
    fn test_fast_forward_zero_steps_reduces_seed() {
        assert_eq!(lcg_fast_forward(0x8000_0005, 0), 5);
    }

    #[test]
    fn test_rolling_state_advances_counter_plus_one() {
        let seed = 0xCAFE_BABE;
        assert_eq!(rolling_state(seed, 0), lcg_step(seed));
        assert_eq!(rolling_state(seed, 1), lcg_step(lcg_step(seed)));
        // Huge counters cost the same as small ones.
        let _ = rolling_state(seed, u32::MAX);
    }

    #[test]
    fn test_rolling_keys_distinct_across_counters() {
        let key = test_session_key();
        let keys: HashSet<_> = (0..1000)
            .map(|c| derive_rolling_message_key(&key, 99, c))
            .collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_deriver_variants_differ() {
        let nonce: Nonce = "0102030405060708".parse().unwrap();
        let direct =
            MessageKeyDeriver::for_session(MessageKeyVariant::Direct, test_session_key(), -73, &nonce);
        let rolling =
            MessageKeyDeriver::for_session(MessageKeyVariant::Rolling, test_session_key(), -73, &nonce);
        assert_eq!(direct.variant(), MessageKeyVariant::Direct);
        assert_eq!(rolling.variant(), MessageKeyVariant::Rolling);
        assert_ne!(direct.message_key(0), rolling.message_key(0));
        assert_eq!(
            rolling.message_key(5),
            derive_rolling_message_key(&test_session_key(), derive_rolling_seed(-73, &nonce), 5)
        );
    }
}
