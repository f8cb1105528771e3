//! RSSI-keyed session-key handshake.
//!
//! ```text
//! Initiator                                   Responder
//!   | hello=1,nonce=N                             |
//!   |-------------------------------------------->| q = quantize(rssi_hello)
//!   |                                             | K = KDF(q, N), SK random
//!   |        ek=ECB(K, SK || TAG),nonce=N[,..]    |
//!   |<--------------------------------------------|
//!   | try q' in [round(rssi_reply) +- W] step S   |
//!   | accept first q' whose tag block matches     |
//! ```
//!
//! Both roles are sans-IO state machines: they consume decoded frames plus an
//! RSSI reading and produce frames, leaving radio timing to the node loop.

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::config::HandshakeConfig;
use crate::crypto::{unwrap_session_key, wrap_session_key};
use crate::envelope::{Frame, KeyReply};
use crate::keys::{derive_wrapping_key, generate_nonce, generate_session_key, quantize_rssi};
use crate::types::{
    LinkError, Nonce, Result, SessionKey, TAG_BLOCK_SIZE, WRAPPED_KEY_SIZE,
};

/// Handshake progress for one party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    HelloSent,
    AwaitingReply,
    Established,
    Failed,
}

/// Inclusive range of quantized RSSI candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    low: i32,
    high: i32,
    step: i32,
}

impl SearchWindow {
    /// Window `[low, high]` stepping by `step`.
    pub fn new(low: i32, high: i32, step: i32) -> Result<Self> {
        if step <= 0 {
            return Err(LinkError::Config(format!("search step must be positive, got {}", step)));
        }
        if low > high {
            return Err(LinkError::Config(format!("empty search window [{}, {}]", low, high)));
        }
        Ok(Self { low, high, step })
    }

    /// Window `[center - half_width, center + half_width]`.
    pub fn around(center: i32, half_width: i32, step: i32) -> Result<Self> {
        Self::new(
            center.saturating_sub(half_width),
            center.saturating_add(half_width),
            step,
        )
    }

    /// The Initiator's window for a reply heard at `rssi_dbm`.
    pub fn for_reply(rssi_dbm: f32, config: &HandshakeConfig) -> Result<Self> {
        let center = quantize_rssi(rssi_dbm, config.quantization_step);
        Self::around(center, config.search_half_width, config.search_step)
    }

    pub fn low(&self) -> i32 {
        self.low
    }

    pub fn high(&self) -> i32 {
        self.high
    }

    /// Candidates in ascending order.
    pub fn candidates(&self) -> impl Iterator<Item = i32> {
        let step = self.step as usize;
        (self.low..=self.high).step_by(step)
    }

    pub fn contains(&self, q: i32) -> bool {
        q >= self.low
            && q <= self.high
            && (i64::from(q) - i64::from(self.low)) % i64::from(self.step) == 0
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        ((i64::from(self.high) - i64::from(self.low)) / i64::from(self.step)) as usize + 1
    }

    /// Always false: construction rejects empty ranges.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Wrap a session key for a given quantized RSSI.
pub fn wrap_for_q(
    session_key: &SessionKey,
    quantized_rssi: i32,
    nonce: &Nonce,
    tag: &[u8; TAG_BLOCK_SIZE],
) -> [u8; WRAPPED_KEY_SIZE] {
    let wrapping_key = derive_wrapping_key(quantized_rssi, nonce);
    wrap_session_key(&wrapping_key, session_key, tag)
}

/// Try a single quantized RSSI.
pub fn unwrap_for_q(
    wrapped: &[u8; WRAPPED_KEY_SIZE],
    nonce: &Nonce,
    quantized_rssi: i32,
    tag: &[u8; TAG_BLOCK_SIZE],
) -> Option<SessionKey> {
    let wrapping_key = derive_wrapping_key(quantized_rssi, nonce);
    unwrap_session_key(&wrapping_key, wrapped, tag)
}

/// Brute-force unwrap over `candidates`, accepting the first tag match.
///
/// Returns the session key and the candidate that produced it.
pub fn unwrap_candidates<I>(
    wrapped: &[u8; WRAPPED_KEY_SIZE],
    nonce: &Nonce,
    candidates: I,
    tag: &[u8; TAG_BLOCK_SIZE],
) -> Result<(SessionKey, i32)>
where
    I: IntoIterator<Item = i32>,
{
    for q in candidates {
        if let Some(session_key) = unwrap_for_q(wrapped, nonce, q, tag) {
            return Ok((session_key, q));
        }
    }
    Err(LinkError::TagMismatch { nonce: *nonce })
}

/// Bounded brute-force unwrap over a search window.
pub fn unwrap_in_window(
    wrapped: &[u8; WRAPPED_KEY_SIZE],
    nonce: &Nonce,
    window: &SearchWindow,
    tag: &[u8; TAG_BLOCK_SIZE],
) -> Result<(SessionKey, i32)> {
    unwrap_candidates(wrapped, nonce, window.candidates(), tag)
}

/// Key material agreed by a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    pub session_key: SessionKey,
    /// Quantized RSSI the key was wrapped under.
    pub q: i32,
    pub nonce: Nonce,
}

/// Initiator side: sends Hello, unwraps the reply.
#[derive(Debug, Clone)]
pub struct Initiator {
    config: HandshakeConfig,
    tag: [u8; TAG_BLOCK_SIZE],
    state: HandshakeState,
    nonce: Option<Nonce>,
    attempts: u32,
}

impl Initiator {
    pub fn new(config: &HandshakeConfig) -> Result<Self> {
        Ok(Self {
            tag: config.tag_bytes()?,
            config: config.clone(),
            state: HandshakeState::Idle,
            nonce: None,
            attempts: 0,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Nonce of the current attempt.
    pub fn nonce(&self) -> Option<Nonce> {
        self.nonce
    }

    /// Hello frames generated so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Begins a new attempt with a fresh nonce.
    ///
    /// Allowed from any state; retries are immediate and unbounded.
    pub fn start<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> Frame {
        let nonce = generate_nonce(rng);
        self.nonce = Some(nonce);
        self.attempts = self.attempts.wrapping_add(1);
        self.state = HandshakeState::HelloSent;
        debug!(nonce = %nonce, attempt = self.attempts, "hello generated");
        Frame::Hello { nonce }
    }

    /// The Hello left the radio; now waiting for the reply.
    pub fn hello_sent(&mut self) -> Result<()> {
        if self.state != HandshakeState::HelloSent {
            return Err(LinkError::InvalidState(format!(
                "hello_sent in state {:?}",
                self.state
            )));
        }
        self.state = HandshakeState::AwaitingReply;
        Ok(())
    }

    /// The Hello could not be transmitted.
    pub fn send_failed(&mut self) {
        self.state = HandshakeState::Idle;
    }

    /// No reply arrived in time.
    pub fn timed_out(&mut self) {
        if self.state == HandshakeState::AwaitingReply {
            self.state = HandshakeState::Idle;
        }
    }

    /// Handle a KeyReply heard at `rssi_dbm`.
    ///
    /// # Returns
    /// The agreed key material. A reply for another nonce is rejected with
    /// `NonceMismatch` and leaves the Initiator waiting; an exhausted window
    /// moves it to `Failed` with `TagMismatch`.
    pub fn on_reply(&mut self, reply: &KeyReply, rssi_dbm: f32) -> Result<Agreement> {
        if self.state != HandshakeState::AwaitingReply {
            return Err(LinkError::InvalidState(format!(
                "key reply in state {:?}",
                self.state
            )));
        }
        let expected = self
            .nonce
            .ok_or_else(|| LinkError::InvalidState("no outstanding nonce".into()))?;
        if reply.nonce != expected {
            return Err(LinkError::NonceMismatch {
                expected,
                received: reply.nonce,
            });
        }

        let window = SearchWindow::for_reply(rssi_dbm, &self.config)?;
        match unwrap_in_window(&reply.wrapped_key, &expected, &window, &self.tag) {
            Ok((session_key, q)) => {
                self.state = HandshakeState::Established;
                info!(nonce = %expected, q, rssi_dbm, "session key unwrapped");
                Ok(Agreement {
                    session_key,
                    q,
                    nonce: expected,
                })
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                warn!(
                    nonce = %expected,
                    rssi_dbm,
                    low = window.low(),
                    high = window.high(),
                    "no candidate unwrapped the session key"
                );
                Err(e)
            }
        }
    }
}

/// Key issued by the Responder for one Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIssue {
    pub agreement: Agreement,
    pub wrapped_key: [u8; WRAPPED_KEY_SIZE],
}

impl KeyIssue {
    /// Reply frame; `start_in_ms` is measured at the moment of sending.
    pub fn reply(&self, start_in_ms: Option<u32>, advertise_q: bool) -> Frame {
        Frame::KeyReply(KeyReply {
            wrapped_key: self.wrapped_key,
            nonce: self.agreement.nonce,
            start_in_ms,
            q: advertise_q.then_some(self.agreement.q),
        })
    }
}

/// Responder side: answers Hello with a wrapped session key.
#[derive(Debug, Clone)]
pub struct Responder {
    config: HandshakeConfig,
    tag: [u8; TAG_BLOCK_SIZE],
    state: HandshakeState,
    last_nonce: Option<Nonce>,
}

impl Responder {
    pub fn new(config: &HandshakeConfig) -> Result<Self> {
        Ok(Self {
            tag: config.tag_bytes()?,
            config: config.clone(),
            state: HandshakeState::Idle,
            last_nonce: None,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Nonce of the most recent key issued.
    pub fn last_nonce(&self) -> Option<Nonce> {
        self.last_nonce
    }

    pub fn advertise_q(&self) -> bool {
        self.config.advertise_q
    }

    /// Handle a Hello heard at `rssi_dbm`, issuing a fresh session key.
    ///
    /// A nonce that was already answered is rejected as a replay.
    pub fn on_hello<R: RngCore + ?Sized>(
        &mut self,
        nonce: Nonce,
        rssi_dbm: f32,
        rng: &mut R,
    ) -> Result<KeyIssue> {
        if self.last_nonce == Some(nonce) {
            return Err(LinkError::ReplayedNonce { nonce });
        }
        let q = quantize_rssi(rssi_dbm, self.config.quantization_step);
        let session_key = generate_session_key(rng);
        let wrapped_key = wrap_for_q(&session_key, q, &nonce, &self.tag);
        self.last_nonce = Some(nonce);
        self.state = HandshakeState::Established;
        info!(nonce = %nonce, q, rssi_dbm, "session key issued");
        Ok(KeyIssue {
            agreement: Agreement {
                session_key,
                q,
                nonce,
            },
            wrapped_key,
        })
    }

    /// Checks that a KeyReply on air echoes the nonce this Responder last
    /// issued a key for; anything else is cross-talk or a replay.
    pub fn check_reply(&self, reply: &KeyReply) -> Result<()> {
        match self.last_nonce {
            Some(expected) if expected == reply.nonce => Ok(()),
            Some(expected) => Err(LinkError::NonceMismatch {
                expected,
                received: reply.nonce,
            }),
            None => Err(LinkError::InvalidState(format!(
                "key reply for {} before any hello",
                reply.nonce
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_TAG_BLOCK;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> HandshakeConfig {
        HandshakeConfig::default()
    }

    #[test]
    fn test_search_window() {
        let window = SearchWindow::around(-73, 8, 1).unwrap();
        assert_eq!(window.low(), -81);
        assert_eq!(window.high(), -65);
        assert_eq!(window.len(), 17);
        assert_eq!(window.candidates().count(), 17);
        assert!(window.contains(-73));
        assert!(!window.contains(-64));

        let stepped = SearchWindow::new(-10, 0, 3).unwrap();
        assert_eq!(stepped.candidates().collect::<Vec<_>>(), vec![-10, -7, -4, -1]);
        assert_eq!(stepped.len(), 4);
        assert!(!stepped.contains(0));

        let full = SearchWindow::new(i32::MIN, i32::MAX, 1).unwrap();
        assert_eq!(full.len(), u32::MAX as usize + 1);
        assert!(full.contains(i32::MAX));
        assert!(full.contains(i32::MIN));
        let wide = SearchWindow::new(i32::MIN, i32::MAX, i32::MAX).unwrap();
        assert_eq!(wide.len(), 3);
        assert!(wide.contains(-1));
        assert!(!wide.contains(0));

        assert!(SearchWindow::new(0, -1, 1).is_err());
        assert!(SearchWindow::new(0, 1, 0).is_err());
    }

    #[test]
    fn test_window_for_reply_rounds_rssi() {
        let window = SearchWindow::for_reply(-72.6, &config()).unwrap();
        assert_eq!((window.low(), window.high()), (-81, -65));
    }

    #[test]
    fn test_unwrap_single_candidate() {
        let nonce: Nonce = "0102030405060708".parse().unwrap();
        let session_key = [0x3Cu8; 16];
        let wrapped = wrap_for_q(&session_key, -73, &nonce, &DEFAULT_TAG_BLOCK);
        assert_eq!(
            unwrap_for_q(&wrapped, &nonce, -73, &DEFAULT_TAG_BLOCK),
            Some(session_key)
        );
        assert_eq!(unwrap_for_q(&wrapped, &nonce, -72, &DEFAULT_TAG_BLOCK), None);
    }

    #[test]
    fn test_unwrap_reports_matching_candidate() {
        let nonce = Nonce::new([9; 8]);
        let session_key = [1u8; 16];
        let wrapped = wrap_for_q(&session_key, -60, &nonce, &DEFAULT_TAG_BLOCK);
        let window = SearchWindow::around(-58, 4, 1).unwrap();
        assert_eq!(
            unwrap_in_window(&wrapped, &nonce, &window, &DEFAULT_TAG_BLOCK).unwrap(),
            (session_key, -60)
        );
        let miss = SearchWindow::new(-50, -40, 1).unwrap();
        assert_eq!(
            unwrap_in_window(&wrapped, &nonce, &miss, &DEFAULT_TAG_BLOCK),
            Err(LinkError::TagMismatch { nonce })
        );
    }

    #[test]
    fn test_full_exchange() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut initiator = Initiator::new(&config()).unwrap();
        let mut responder = Responder::new(&config()).unwrap();

        let nonce = match initiator.start(&mut rng) {
            Frame::Hello { nonce } => nonce,
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(initiator.state(), HandshakeState::HelloSent);
        initiator.hello_sent().unwrap();
        assert_eq!(initiator.state(), HandshakeState::AwaitingReply);

        let issue = responder.on_hello(nonce, -70.0, &mut rng).unwrap();
        assert_eq!(responder.state(), HandshakeState::Established);
        let reply = match issue.reply(None, false) {
            Frame::KeyReply(reply) => reply,
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(reply.q, None);
        responder.check_reply(&reply).unwrap();

        // Asymmetric link: the reply is heard 5 dB weaker.
        let agreement = initiator.on_reply(&reply, -75.0).unwrap();
        assert_eq!(initiator.state(), HandshakeState::Established);
        assert_eq!(agreement, issue.agreement);
        assert_eq!(agreement.q, -70);
    }

    #[test]
    fn test_initiator_ignores_foreign_nonce() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut initiator = Initiator::new(&config()).unwrap();
        let mut responder = Responder::new(&config()).unwrap();
        initiator.start(&mut rng);
        initiator.hello_sent().unwrap();

        let foreign = responder
            .on_hello(Nonce::new([0xEE; 8]), -70.0, &mut rng)
            .unwrap();
        let reply = match foreign.reply(None, false) {
            Frame::KeyReply(reply) => reply,
            other => panic!("unexpected frame {:?}", other),
        };
        assert!(matches!(
            initiator.on_reply(&reply, -70.0),
            Err(LinkError::NonceMismatch { .. })
        ));
        assert_eq!(initiator.state(), HandshakeState::AwaitingReply);
    }

    #[test]
    fn test_initiator_fails_outside_window_then_retries_with_fresh_nonce() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut initiator = Initiator::new(&config()).unwrap();
        let mut responder = Responder::new(&config()).unwrap();

        let first = match initiator.start(&mut rng) {
            Frame::Hello { nonce } => nonce,
            other => panic!("unexpected frame {:?}", other),
        };
        initiator.hello_sent().unwrap();
        let issue = responder.on_hello(first, -40.0, &mut rng).unwrap();
        let reply = match issue.reply(None, false) {
            Frame::KeyReply(reply) => reply,
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(
            initiator.on_reply(&reply, -90.0),
            Err(LinkError::TagMismatch { nonce: first })
        );
        assert_eq!(initiator.state(), HandshakeState::Failed);

        initiator.start(&mut rng);
        assert_eq!(initiator.attempts(), 2);
        assert_ne!(initiator.nonce(), Some(first));
    }

    #[test]
    fn test_initiator_timeout_returns_to_idle() {
        let mut rng = StdRng::seed_from_u64(14);
        let mut initiator = Initiator::new(&config()).unwrap();
        initiator.start(&mut rng);
        initiator.hello_sent().unwrap();
        initiator.timed_out();
        assert_eq!(initiator.state(), HandshakeState::Idle);
        assert!(initiator.hello_sent().is_err());
    }

    #[test]
    fn test_responder_rejects_replayed_hello() {
        let mut rng = StdRng::seed_from_u64(15);
        let mut responder = Responder::new(&config()).unwrap();
        let nonce = Nonce::new([1; 8]);
        responder.on_hello(nonce, -50.0, &mut rng).unwrap();
        assert_eq!(
            responder.on_hello(nonce, -50.0, &mut rng),
            Err(LinkError::ReplayedNonce { nonce })
        );
        assert!(responder.on_hello(Nonce::new([2; 8]), -50.0, &mut rng).is_ok());
    }

    #[test]
    fn test_responder_flags_cross_talk() {
        let mut rng = StdRng::seed_from_u64(16);
        let mut responder = Responder::new(&config()).unwrap();
        let reply = KeyReply {
            wrapped_key: [0; 32],
            nonce: Nonce::new([3; 8]),
            start_in_ms: None,
            q: None,
        };
        assert!(matches!(
            responder.check_reply(&reply),
            Err(LinkError::InvalidState(_))
        ));
        responder.on_hello(Nonce::new([4; 8]), -50.0, &mut rng).unwrap();
        assert!(matches!(
            responder.check_reply(&reply),
            Err(LinkError::NonceMismatch { .. })
        ));
    }

    #[test]
    fn test_reply_advertises_q_when_enabled() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut responder = Responder::new(&config()).unwrap();
        let issue = responder.on_hello(Nonce::new([5; 8]), -66.4, &mut rng).unwrap();
        match issue.reply(Some(1_000), true) {
            Frame::KeyReply(reply) => {
                assert_eq!(reply.q, Some(-66));
                assert_eq!(reply.start_in_ms, Some(1_000));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
