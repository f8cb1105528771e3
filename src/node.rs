//! Cooperative control loops for the two link roles.
//!
//! Each node owns its radio, clock, channel plan and session. `poll` performs
//! one bounded radio operation and reports what happened as a [`LinkEvent`].
//! This is the frame-processing boundary: timeouts, CRC failures, malformed
//! frames, padding errors and nonce mismatches are logged and turned into
//! events, never returned as errors, so a node can run unattended forever.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::clock::{ticks_after, ticks_diff, Clock};
use crate::config::{HopScheme, LinkConfig};
use crate::envelope::{DataFrame, Frame};
use crate::handshake::{HandshakeState, Initiator, Responder};
use crate::hop::{Channel, ChannelPlan};
use crate::radio::Radio;
use crate::session::SessionContext;
use crate::types::{LinkError, Nonce, Result};

/// Outcome of one step of a node's control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Nothing arrived (timeout or CRC failure).
    Idle,
    HelloSent {
        nonce: Nonce,
        attempt: u32,
        frequency_hz: u32,
    },
    ReplyTimeout {
        nonce: Nonce,
    },
    /// No candidate in the search window unwrapped the key.
    HandshakeFailed {
        error: LinkError,
    },
    Established {
        nonce: Nonce,
        q: i32,
        epoch_ms: Option<u32>,
    },
    KeyIssued {
        nonce: Nonce,
        q: i32,
        start_in_ms: Option<u32>,
        frequency_hz: u32,
    },
    DataSent {
        counter: u32,
        slot: Option<u32>,
        frequency_hz: u32,
    },
    DataReceived {
        counter: u32,
        text: String,
        slot: Option<u32>,
        frequency_hz: u32,
        rssi_dbm: f32,
        /// False when the counter went backwards.
        in_order: bool,
    },
    /// The Responder gave up on a dynamic session that carried no data.
    SessionAbandoned {
        nonce: Option<Nonce>,
    },
    /// A well-formed frame this node has no use for.
    Ignored {
        kind: &'static str,
    },
    /// A frame or operation was rejected and dropped.
    Dropped {
        error: LinkError,
    },
}

/// A decoded frame and its reception metadata.
#[derive(Debug, Clone)]
pub struct Heard {
    pub frame: Frame,
    pub rssi_dbm: f32,
    pub snr_db: f32,
    /// Tick at which the receive call returned.
    pub at_ms: u32,
    pub channel: Channel,
}

/// Radio, clock, channel plan and session shared by both roles.
pub struct Link<R, C> {
    radio: R,
    clock: C,
    config: LinkConfig,
    plan: ChannelPlan,
    rng: StdRng,
    session: Option<SessionContext>,
}

impl<R: Radio, C: Clock> Link<R, C> {
    /// Validates the configuration and pushes the modulation settings.
    pub fn new(mut radio: R, clock: C, config: LinkConfig, rng: StdRng) -> Result<Self> {
        config.validate()?;
        let plan = ChannelPlan::from_config(&config.hopping)?;
        config.radio.apply(&mut radio);
        Ok(Self {
            radio,
            clock,
            config,
            plan,
            rng,
            session: None,
        })
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    pub fn now(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Tunes the radio for `now_ms`. Must precede every send or receive.
    fn tune(&mut self, now_ms: u32) -> Channel {
        let channel = self.plan.channel_at(now_ms);
        self.radio.set_frequency(channel.frequency_hz);
        channel
    }

    /// Sends a handshake frame immediately on the current channel.
    fn transmit(&mut self, frame: &Frame) -> Result<Channel> {
        let now = self.now();
        let channel = self.tune(now);
        let payload = frame.encode();
        if !self
            .radio
            .send(&payload, self.config.handshake.send_timeout_ms)
        {
            warn!(kind = frame.kind(), freq_hz = channel.frequency_hz, "transmit timed out");
            return Err(LinkError::TransmitTimeout);
        }
        debug!(
            kind = frame.kind(),
            freq_hz = channel.frequency_hz,
            slot = ?channel.slot,
            len = payload.len(),
            "frame sent"
        );
        Ok(channel)
    }

    /// Listens on the current channel, never past the next channel change.
    fn listen(&mut self, requested_ms: u32) -> Result<Heard> {
        let now = self.now();
        let channel = self.tune(now);
        let timeout = self.plan.bound_rx_timeout(now, requested_ms);
        let reception = self.radio.receive(timeout);
        let at_ms = self.now();
        let payload = match reception.payload {
            Some(payload) => payload,
            None if reception.crc_error => return Err(LinkError::CrcError),
            None => return Err(LinkError::ReceiveTimeout),
        };
        let frame = Frame::parse(&payload)?;
        debug!(
            kind = frame.kind(),
            freq_hz = channel.frequency_hz,
            slot = ?channel.slot,
            rssi_dbm = reception.rssi_dbm,
            snr_db = reception.snr_db,
            "frame received"
        );
        Ok(Heard {
            frame,
            rssi_dbm: reception.rssi_dbm,
            snr_db: reception.snr_db,
            at_ms,
            channel,
        })
    }

    /// Replaces the session and, under the dynamic scheme, re-anchors hopping.
    fn install_session(&mut self, session: SessionContext) {
        match (session.hop_seed(), session.epoch_ms()) {
            (Some(hop_seed), Some(epoch_ms)) => self.plan.anchor(hop_seed, epoch_ms),
            _ => self.plan.reset(),
        }
        self.session = Some(session);
    }

    /// Drops the session and parks on the rendezvous channel.
    fn clear_session(&mut self) {
        self.session = None;
        self.plan.reset();
    }

    /// Encrypts and sends one message, aligned to the slot centre.
    pub fn send_message(&mut self, text: &str) -> Result<LinkEvent> {
        if self.session.is_none() {
            return Err(LinkError::InvalidState("no session established".into()));
        }
        let delay = self.plan.tx_delay(self.now());
        if delay > 0 {
            debug!(delay_ms = delay, "aligning transmit to slot centre");
            self.clock.sleep_ms(delay);
        }
        let now = self.now();
        let channel = self.tune(now);
        let slot = if self.plan.is_dynamic() {
            channel.slot
        } else {
            None
        };
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| LinkError::InvalidState("no session established".into()))?;
        let data = session.seal(text, now, slot, &mut self.rng);
        let counter = data.counter;
        let payload = Frame::Data(data).encode();
        if !self
            .radio
            .send(&payload, self.config.handshake.send_timeout_ms)
        {
            warn!(counter, freq_hz = channel.frequency_hz, "data transmit timed out");
            return Err(LinkError::TransmitTimeout);
        }
        info!(counter, slot = ?channel.slot, freq_hz = channel.frequency_hz, "data sent");
        Ok(LinkEvent::DataSent {
            counter,
            slot,
            frequency_hz: channel.frequency_hz,
        })
    }

    fn on_data(&mut self, data: DataFrame, heard: &Heard) -> LinkEvent {
        let Some(session) = self.session.as_mut() else {
            warn!(counter = data.counter, "data frame before any session");
            return LinkEvent::Dropped {
                error: LinkError::InvalidState("data frame before any session".into()),
            };
        };
        if data.slot.is_some() && data.slot != heard.channel.slot {
            debug!(sent = ?data.slot, local = ?heard.channel.slot, "slot differs from local schedule");
        }
        match session.open(&data) {
            Ok(text) => {
                let in_order = session.record_receive(data.counter);
                info!(
                    counter = data.counter,
                    freq_hz = heard.channel.frequency_hz,
                    rssi_dbm = heard.rssi_dbm,
                    "data received"
                );
                LinkEvent::DataReceived {
                    counter: data.counter,
                    text,
                    slot: heard.channel.slot,
                    frequency_hz: heard.channel.frequency_hz,
                    rssi_dbm: heard.rssi_dbm,
                    in_order,
                }
            }
            Err(error) => {
                warn!(counter = data.counter, %error, "dropping undecryptable data frame");
                LinkEvent::Dropped { error }
            }
        }
    }

    /// Idle listening window: one hop interval plus the guard.
    fn idle_listen_ms(&self) -> u32 {
        self.config
            .hopping
            .hop_interval_ms
            .saturating_add(self.config.hopping.rx_guard_ms)
    }
}

/// Downgrades a receive failure to an event.
fn receive_failure(error: LinkError) -> LinkEvent {
    match error {
        LinkError::ReceiveTimeout => LinkEvent::Idle,
        LinkError::CrcError => {
            debug!("crc error");
            LinkEvent::Idle
        }
        error => {
            warn!(%error, "dropping frame");
            LinkEvent::Dropped { error }
        }
    }
}

/// The party that starts the handshake and then sends data.
pub struct InitiatorNode<R, C> {
    link: Link<R, C>,
    handshake: Initiator,
    reply_deadline_ms: u32,
}

impl<R: Radio, C: Clock> InitiatorNode<R, C> {
    pub fn new(radio: R, clock: C, config: LinkConfig) -> Result<Self> {
        Self::with_rng(radio, clock, config, StdRng::from_entropy())
    }

    /// Like [`InitiatorNode::new`] with a caller-supplied generator.
    pub fn with_rng(radio: R, clock: C, config: LinkConfig, rng: StdRng) -> Result<Self> {
        let handshake = Initiator::new(&config.handshake)?;
        Ok(Self {
            link: Link::new(radio, clock, config, rng)?,
            handshake,
            reply_deadline_ms: 0,
        })
    }

    pub fn link(&self) -> &Link<R, C> {
        &self.link
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Hello frames sent so far, retries included.
    pub fn attempts(&self) -> u32 {
        self.handshake.attempts()
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.link.session()
    }

    pub fn is_established(&self) -> bool {
        self.handshake.state() == HandshakeState::Established
    }

    /// One step of the control loop. Never fails.
    pub fn poll(&mut self) -> LinkEvent {
        match self.handshake.state() {
            HandshakeState::Idle | HandshakeState::Failed | HandshakeState::HelloSent => {
                self.send_hello()
            }
            HandshakeState::AwaitingReply => self.await_reply(),
            HandshakeState::Established => match self.link.listen(self.link.idle_listen_ms()) {
                Ok(heard) => match heard.frame.clone() {
                    Frame::Data(data) => self.link.on_data(data, &heard),
                    other => LinkEvent::Ignored { kind: other.kind() },
                },
                Err(error) => receive_failure(error),
            },
        }
    }

    /// Sends a message on the established session.
    pub fn send_message(&mut self, text: &str) -> Result<LinkEvent> {
        self.link.send_message(text)
    }

    fn send_hello(&mut self) -> LinkEvent {
        self.link.clear_session();
        let frame = self.handshake.start(&mut self.link.rng);
        let nonce = self.handshake.nonce().unwrap_or(Nonce::new([0; 8]));
        let channel = match self.link.transmit(&frame) {
            Ok(channel) => channel,
            Err(error) => {
                self.handshake.send_failed();
                return LinkEvent::Dropped { error };
            }
        };
        if let Err(error) = self.handshake.hello_sent() {
            return LinkEvent::Dropped { error };
        }
        self.reply_deadline_ms =
            ticks_after(self.link.now(), self.link.config.handshake.reply_timeout_ms);
        info!(
            nonce = %nonce,
            attempt = self.handshake.attempts(),
            freq_hz = channel.frequency_hz,
            "hello sent"
        );
        LinkEvent::HelloSent {
            nonce,
            attempt: self.handshake.attempts(),
            frequency_hz: channel.frequency_hz,
        }
    }

    fn await_reply(&mut self) -> LinkEvent {
        let remaining = ticks_diff(self.reply_deadline_ms, self.link.now());
        if remaining <= 0 {
            self.handshake.timed_out();
            let nonce = self.handshake.nonce().unwrap_or(Nonce::new([0; 8]));
            warn!(nonce = %nonce, "no key reply, retrying");
            return LinkEvent::ReplyTimeout { nonce };
        }
        let heard = match self.link.listen(remaining as u32) {
            Ok(heard) => heard,
            Err(error) => return receive_failure(error),
        };
        let reply = match &heard.frame {
            Frame::KeyReply(reply) => reply,
            other => return LinkEvent::Ignored { kind: other.kind() },
        };
        match self.handshake.on_reply(reply, heard.rssi_dbm) {
            Ok(agreement) => {
                let mut session = SessionContext::new(
                    &agreement,
                    self.link.config.message_key,
                    &self.link.config.hopping,
                );
                if session.hop_seed().is_some() {
                    let start_in = reply.start_in_ms.unwrap_or(0);
                    session.anchor_epoch(ticks_after(heard.at_ms, start_in));
                }
                let epoch_ms = session.epoch_ms();
                self.link.install_session(session);
                info!(nonce = %agreement.nonce, q = agreement.q, epoch_ms = ?epoch_ms, "session established");
                LinkEvent::Established {
                    nonce: agreement.nonce,
                    q: agreement.q,
                    epoch_ms,
                }
            }
            Err(error @ LinkError::TagMismatch { .. }) => LinkEvent::HandshakeFailed { error },
            Err(error) => {
                warn!(%error, "discarding key reply");
                LinkEvent::Dropped { error }
            }
        }
    }
}

/// The party that answers Hello frames and receives data.
pub struct ResponderNode<R, C> {
    link: Link<R, C>,
    handshake: Responder,
    /// Under the dynamic scheme, the tick by which the first data frame of a
    /// new session must arrive. Cleared once it does.
    confirm_deadline_ms: Option<u32>,
}

impl<R: Radio, C: Clock> ResponderNode<R, C> {
    pub fn new(radio: R, clock: C, config: LinkConfig) -> Result<Self> {
        Self::with_rng(radio, clock, config, StdRng::from_entropy())
    }

    pub fn with_rng(radio: R, clock: C, config: LinkConfig, rng: StdRng) -> Result<Self> {
        let handshake = Responder::new(&config.handshake)?;
        Ok(Self {
            link: Link::new(radio, clock, config, rng)?,
            handshake,
            confirm_deadline_ms: None,
        })
    }

    pub fn link(&self) -> &Link<R, C> {
        &self.link
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.link.session()
    }

    /// Whether a dynamic session is still waiting for its first data frame.
    pub fn awaiting_confirmation(&self) -> bool {
        self.confirm_deadline_ms.is_some()
    }

    /// One step of the control loop. Never fails.
    pub fn poll(&mut self) -> LinkEvent {
        if let Some(deadline) = self.confirm_deadline_ms {
            if ticks_diff(self.link.now(), deadline) >= 0 {
                return self.abandon_unconfirmed();
            }
        }
        let heard = match self.link.listen(self.link.idle_listen_ms()) {
            Ok(heard) => heard,
            Err(error) => return receive_failure(error),
        };
        match heard.frame.clone() {
            Frame::Hello { nonce } => self.on_hello(nonce, &heard),
            Frame::KeyReply(reply) => match self.handshake.check_reply(&reply) {
                Ok(()) => LinkEvent::Ignored { kind: "key-reply" },
                Err(error) => {
                    warn!(%error, "foreign key reply on air");
                    LinkEvent::Dropped { error }
                }
            },
            Frame::Data(data) => {
                let event = self.link.on_data(data, &heard);
                if matches!(event, LinkEvent::DataReceived { .. }) {
                    self.confirm_deadline_ms = None;
                }
                event
            }
            Frame::Unknown(_) => LinkEvent::Ignored { kind: "unknown" },
        }
    }

    /// Drops a hopping session that never carried data and parks on the
    /// rendezvous channel, where the Initiator retries its Hello.
    fn abandon_unconfirmed(&mut self) -> LinkEvent {
        self.confirm_deadline_ms = None;
        let nonce = self.link.session().map(|s| s.nonce());
        self.link.clear_session();
        warn!(nonce = ?nonce, "no data on the new session, back to rendezvous");
        LinkEvent::SessionAbandoned { nonce }
    }

    /// Sends a message on the established session.
    pub fn send_message(&mut self, text: &str) -> Result<LinkEvent> {
        self.link.send_message(text)
    }

    fn on_hello(&mut self, nonce: Nonce, heard: &Heard) -> LinkEvent {
        info!(nonce = %nonce, rssi_dbm = heard.rssi_dbm, freq_hz = heard.channel.frequency_hz, "hello received");
        let issue = match self
            .handshake
            .on_hello(nonce, heard.rssi_dbm, &mut self.link.rng)
        {
            Ok(issue) => issue,
            Err(error) => {
                warn!(%error, "ignoring hello");
                return LinkEvent::Dropped { error };
            }
        };

        let mut session = SessionContext::new(
            &issue.agreement,
            self.link.config.message_key,
            &self.link.config.hopping,
        );
        self.confirm_deadline_ms = None;
        if let HopScheme::Dynamic { start_delay_ms, .. } = self.link.config.hopping.scheme {
            let epoch_ms = ticks_after(heard.at_ms, start_delay_ms);
            session.anchor_epoch(epoch_ms);
            let window_ms = self
                .link
                .config
                .hopping
                .hop_interval_ms
                .saturating_mul(self.link.config.handshake.confirm_slots);
            self.confirm_deadline_ms = Some(ticks_after(epoch_ms, window_ms));
        }
        let epoch_ms = session.epoch_ms();
        self.link.install_session(session);

        // The countdown is taken at send time so a late reply still
        // announces the epoch that was fixed on receipt.
        let start_in_ms = epoch_ms.map(|epoch| ticks_diff(epoch, self.link.now()).max(0) as u32);
        let reply = issue.reply(start_in_ms, self.handshake.advertise_q());
        match self.link.transmit(&reply) {
            Ok(channel) => LinkEvent::KeyIssued {
                nonce,
                q: issue.agreement.q,
                start_in_ms,
                frequency_hz: channel.frequency_hz,
            },
            Err(error) => LinkEvent::Dropped { error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sim::{Ether, SimRadio};

    type Pair = (
        Ether,
        InitiatorNode<SimRadio, ManualClock>,
        ResponderNode<SimRadio, ManualClock>,
    );

    fn pair(config: LinkConfig) -> Pair {
        let ether = Ether::new(ManualClock::starting_at(1_000));
        let initiator = InitiatorNode::with_rng(
            ether.attach(),
            ether.clock(),
            config.clone(),
            StdRng::seed_from_u64(1),
        )
        .unwrap();
        let responder = ResponderNode::with_rng(
            ether.attach(),
            ether.clock(),
            config,
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        (ether, initiator, responder)
    }

    fn establish(initiator: &mut InitiatorNode<SimRadio, ManualClock>, responder: &mut ResponderNode<SimRadio, ManualClock>) {
        for _ in 0..1_000 {
            initiator.poll();
            if initiator.is_established() {
                return;
            }
            responder.poll();
        }
        panic!("handshake did not complete");
    }

    #[test]
    fn test_radio_settings_applied() {
        let (_ether, initiator, _responder) = pair(LinkConfig::default());
        assert_eq!(initiator.link().radio().settings().spreading_factor, 7);
        assert_eq!(initiator.link().radio().settings().tx_power_dbm, 14);
    }

    #[test]
    fn test_static_handshake_and_data() {
        let (_ether, mut initiator, mut responder) = pair(LinkConfig::static_hopping());
        establish(&mut initiator, &mut responder);
        assert_eq!(
            initiator.session().unwrap().session_key(),
            responder.session().unwrap().session_key()
        );

        let sent = initiator.send_message("hello 0").unwrap();
        assert!(matches!(sent, LinkEvent::DataSent { counter: 0, slot: None, .. }));
        match responder.poll() {
            LinkEvent::DataReceived { counter, text, in_order, .. } => {
                assert_eq!(counter, 0);
                assert_eq!(text, "hello 0");
                assert!(in_order);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_send_before_handshake_is_rejected() {
        let (_ether, mut initiator, _responder) = pair(LinkConfig::default());
        assert!(matches!(
            initiator.send_message("too early"),
            Err(LinkError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reply_timeout_then_retry_with_fresh_nonce() {
        let (ether, mut initiator, mut responder) = pair(LinkConfig::static_hopping());
        let responder_id = 1;
        ether.drop_next_from(responder_id, 1);

        let first = match initiator.poll() {
            LinkEvent::HelloSent { nonce, attempt: 1, .. } => nonce,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(matches!(responder.poll(), LinkEvent::KeyIssued { .. }));

        let mut timed_out = false;
        for _ in 0..1_000 {
            if let LinkEvent::ReplyTimeout { nonce } = initiator.poll() {
                assert_eq!(nonce, first);
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);
        assert_eq!(initiator.state(), HandshakeState::Idle);

        match initiator.poll() {
            LinkEvent::HelloSent { nonce, attempt, .. } => {
                assert_eq!(attempt, 2);
                assert_ne!(nonce, first);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_garbage_frames_do_not_stop_the_loop() {
        let (ether, mut initiator, mut responder) = pair(LinkConfig::static_hopping());
        establish(&mut initiator, &mut responder);
        let freq = responder.link().radio().frequency_hz();

        ether.inject(freq, b"iv=zz,msg=00,counter=1,t=0,kind=data", -30.0);
        assert!(matches!(
            responder.poll(),
            LinkEvent::Dropped { error: LinkError::MalformedFrame(_) }
        ));

        let empty_msg = format!("iv={},msg=,counter=1,t=0,kind=data", "00".repeat(16));
        ether.inject(freq, empty_msg.as_bytes(), -30.0);
        assert_eq!(
            responder.poll(),
            LinkEvent::Dropped {
                error: LinkError::PaddingError
            }
        );

        ether.inject(freq, b"just noise", -30.0);
        assert_eq!(responder.poll(), LinkEvent::Ignored { kind: "unknown" });
        assert_eq!(responder.poll(), LinkEvent::Idle);
    }

    #[test]
    fn test_silent_dynamic_session_returns_to_rendezvous() {
        let (ether, mut initiator, mut responder) = pair(LinkConfig::dynamic_hopping());
        establish(&mut initiator, &mut responder);
        assert!(responder.awaiting_confirmation());
        let epoch = responder.session().unwrap().epoch_ms().unwrap();
        let nonce = responder.session().unwrap().nonce();

        let mut abandoned = None;
        for _ in 0..20_000 {
            if let LinkEvent::SessionAbandoned { nonce } = responder.poll() {
                abandoned = Some(nonce);
                break;
            }
        }
        assert_eq!(abandoned, Some(Some(nonce)));
        assert!(ticks_diff(ether.clock().now_ms(), epoch) >= 30_000);
        assert!(responder.session().is_none());
        assert!(!responder.awaiting_confirmation());
        let channel = responder.link().plan().channel_at(ether.clock().now_ms());
        assert_eq!(channel.frequency_hz, crate::config::DEFAULT_RENDEZVOUS_HZ);
        assert_eq!(channel.slot, None);
    }

    #[test]
    fn test_first_data_confirms_dynamic_session() {
        let (ether, mut initiator, mut responder) = pair(LinkConfig::dynamic_hopping());
        establish(&mut initiator, &mut responder);
        initiator.send_message("first").unwrap();
        assert!(matches!(responder.poll(), LinkEvent::DataReceived { .. }));
        assert!(!responder.awaiting_confirmation());

        ether.clock().advance(120_000);
        assert_eq!(responder.poll(), LinkEvent::Idle);
        assert!(responder.session().is_some());
    }
}
