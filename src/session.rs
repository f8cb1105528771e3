//! Per-session state owned by a node's control loop.
//!
//! Holds the session key and everything derived from it: the message-key
//! deriver, the dynamic hop seed, the epoch anchor, and the send and receive
//! counters. A new handshake replaces the whole context.

use rand::RngCore;
use tracing::warn;

use crate::config::{HopConfig, HopScheme};
use crate::crypto::{decrypt_message, encrypt_message};
use crate::envelope::DataFrame;
use crate::handshake::Agreement;
use crate::hop::derive_hop_seed;
use crate::ratchet::{MessageKeyDeriver, MessageKeyVariant};
use crate::types::{Nonce, Result, SessionKey};

/// State for one established session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_key: SessionKey,
    nonce: Nonce,
    q: i32,
    deriver: MessageKeyDeriver,
    hop_seed: Option<u32>,
    epoch_ms: Option<u32>,
    /// The next counter value to use when sending.
    pub send_counter: u32,
    /// The highest counter value received from the peer.
    pub peer_last_counter: Option<u32>,
}

impl SessionContext {
    /// Builds the context for a completed handshake.
    ///
    /// # Arguments
    /// * `agreement` - Key material from either handshake role
    /// * `variant` - Message-key scheme of this deployment
    /// * `hopping` - Hop configuration; a dynamic scheme gets a hop seed
    pub fn new(agreement: &Agreement, variant: MessageKeyVariant, hopping: &HopConfig) -> Self {
        let hop_seed = match hopping.scheme {
            HopScheme::Static { .. } => None,
            HopScheme::Dynamic { bind_rssi, .. } => Some(derive_hop_seed(
                &agreement.session_key,
                bind_rssi.then_some(agreement.q),
            )),
        };
        Self {
            session_key: agreement.session_key,
            nonce: agreement.nonce,
            q: agreement.q,
            deriver: MessageKeyDeriver::for_session(
                variant,
                agreement.session_key,
                agreement.q,
                &agreement.nonce,
            ),
            hop_seed,
            epoch_ms: None,
            send_counter: 0,
            peer_last_counter: None,
        }
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// Nonce of the handshake that created this session.
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Quantized RSSI the session key was wrapped under.
    pub fn q(&self) -> i32 {
        self.q
    }

    pub fn deriver(&self) -> &MessageKeyDeriver {
        &self.deriver
    }

    /// Dynamic hop seed; `None` under the static scheme.
    pub fn hop_seed(&self) -> Option<u32> {
        self.hop_seed
    }

    /// Tick at which hopping begins.
    pub fn epoch_ms(&self) -> Option<u32> {
        self.epoch_ms
    }

    pub fn anchor_epoch(&mut self, epoch_ms: u32) {
        self.epoch_ms = Some(epoch_ms);
    }

    /// Advances and returns the next send counter.
    pub fn advance_send_counter(&mut self) -> u32 {
        let counter = self.send_counter;
        self.send_counter = self.send_counter.wrapping_add(1);
        counter
    }

    /// Records a received counter.
    ///
    /// # Returns
    /// `true` when the counter did not go backwards. Regressions are logged
    /// but the message is still accepted.
    pub fn record_receive(&mut self, counter: u32) -> bool {
        match self.peer_last_counter {
            Some(last) if counter < last => {
                warn!(counter, last, nonce = %self.nonce, "peer counter went backwards");
                false
            }
            _ => {
                self.peer_last_counter = Some(counter);
                true
            }
        }
    }

    /// Encrypts the next outgoing message.
    pub fn seal<R: RngCore + ?Sized>(
        &mut self,
        plaintext: &str,
        t_ms: u32,
        slot: Option<u32>,
        rng: &mut R,
    ) -> DataFrame {
        let counter = self.advance_send_counter();
        encrypt_message(&self.deriver, counter, plaintext, t_ms, slot, rng)
    }

    /// Decrypts an incoming message.
    pub fn open(&self, frame: &DataFrame) -> Result<String> {
        decrypt_message(&self.deriver, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn agreement() -> Agreement {
        Agreement {
            session_key: [0x42; 16],
            q: -73,
            nonce: "0102030405060708".parse().unwrap(),
        }
    }

    #[test]
    fn test_static_session_has_no_hop_seed() {
        let config = LinkConfig::static_hopping();
        let session = SessionContext::new(&agreement(), config.message_key, &config.hopping);
        assert_eq!(session.hop_seed(), None);
        assert_eq!(session.epoch_ms(), None);
    }

    #[test]
    fn test_dynamic_session_binds_rssi() {
        let config = LinkConfig::dynamic_hopping();
        let session = SessionContext::new(&agreement(), config.message_key, &config.hopping);
        assert_eq!(session.hop_seed(), Some(derive_hop_seed(&[0x42; 16], Some(-73))));

        let mut unbound = LinkConfig::dynamic_hopping();
        unbound.hopping.scheme = HopScheme::Dynamic {
            rendezvous_hz: 915_000_000,
            start_delay_ms: 3_000,
            bind_rssi: false,
        };
        let session = SessionContext::new(&agreement(), unbound.message_key, &unbound.hopping);
        assert_eq!(session.hop_seed(), Some(derive_hop_seed(&[0x42; 16], None)));
    }

    #[test]
    fn test_advance_send_counter() {
        let config = LinkConfig::default();
        let mut session = SessionContext::new(&agreement(), config.message_key, &config.hopping);
        assert_eq!(session.advance_send_counter(), 0);
        assert_eq!(session.advance_send_counter(), 1);
        assert_eq!(session.send_counter, 2);
    }

    #[test]
    fn test_record_receive_flags_regression() {
        let config = LinkConfig::default();
        let mut session = SessionContext::new(&agreement(), config.message_key, &config.hopping);
        assert!(session.record_receive(0));
        assert!(session.record_receive(5));
        assert!(!session.record_receive(3));
        assert_eq!(session.peer_last_counter, Some(5));
        assert!(session.record_receive(5));
    }

    #[test]
    fn test_seal_open_both_variants() {
        let mut rng = StdRng::seed_from_u64(3);
        for variant in [MessageKeyVariant::Direct, MessageKeyVariant::Rolling] {
            let config = LinkConfig::default();
            let mut sender = SessionContext::new(&agreement(), variant, &config.hopping);
            let receiver = SessionContext::new(&agreement(), variant, &config.hopping);
            for i in 0..3 {
                let frame = sender.seal(&format!("msg {}", i), 100 * i, None, &mut rng);
                assert_eq!(frame.counter, i);
                assert_eq!(receiver.open(&frame).unwrap(), format!("msg {}", i));
            }
        }
    }
}
