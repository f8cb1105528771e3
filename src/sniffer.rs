//! Passive attacker that recovers session keys without any RSSI measurement.
//!
//! The tag block is public and the quantized RSSI space is a few dozen
//! values, so a captured KeyReply is enough: try every `q` in
//! `[q_min, q_max]` until the trailing block decrypts to the tag. A recovered
//! key then decrypts the session's data frames, and, under the dynamic hop
//! scheme, yields the hop seed and epoch needed to follow the hops.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{debug, info, warn};

use crate::clock::{ticks_after, Clock};
use crate::config::{HopScheme, LinkConfig};
use crate::crypto::decrypt_message;
use crate::envelope::{DataFrame, Frame, KeyReply};
use crate::handshake::unwrap_candidates;
use crate::hop::{derive_hop_seed, ChannelPlan};
use crate::radio::Radio;
use crate::ratchet::MessageKeyDeriver;
use crate::types::{
    LinkError, Nonce, Result, SessionKey, TAG_BLOCK_SIZE, WRAPPED_KEY_SIZE,
};

/// Header line for [`SniffRow::to_csv_line`].
pub const SNIFF_CSV_HEADER: &str = "ts_ms,rssi_dBm,snr_dB,type,nonce,status,q,counter,details";

/// What the sniffer learned about one handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnifferRecord {
    pub hello_seen: bool,
    pub wrapped_key: Option<[u8; WRAPPED_KEY_SIZE]>,
    pub recovered: Option<RecoveredKey>,
}

/// A cracked session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredKey {
    pub session_key: SessionKey,
    pub q: i32,
}

/// Session currently used to decrypt data frames.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub nonce: Nonce,
    pub key: RecoveredKey,
    deriver: MessageKeyDeriver,
}

/// Per-frame outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffStatus {
    Hello,
    KeyRecovered,
    KeyNotRecovered,
    DecOk,
    NoKey,
    DecryptFailed,
    Malformed,
    Other,
}

impl SniffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SniffStatus::Hello => "hello",
            SniffStatus::KeyRecovered => "key-recovered",
            SniffStatus::KeyNotRecovered => "key-not-recovered",
            SniffStatus::DecOk => "dec-ok",
            SniffStatus::NoKey => "no-key",
            SniffStatus::DecryptFailed => "decrypt-failed",
            SniffStatus::Malformed => "malformed",
            SniffStatus::Other => "other",
        }
    }
}

impl fmt::Display for SniffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log row per frame heard.
#[derive(Debug, Clone, PartialEq)]
pub struct SniffRow {
    pub ts_ms: u32,
    pub rssi_dbm: f32,
    pub snr_db: f32,
    /// Frame type: `hello`, `ek`, `data`, `bin` or `other`.
    pub frame_type: &'static str,
    pub nonce: Option<Nonce>,
    pub status: SniffStatus,
    pub q: Option<i32>,
    pub counter: Option<u32>,
    /// Decrypted text, error message or raw frame text.
    pub details: String,
}

impl SniffRow {
    /// Renders the row as one CSV line matching [`SNIFF_CSV_HEADER`].
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},\"{}\"",
            self.ts_ms,
            self.rssi_dbm,
            self.snr_db,
            self.frame_type,
            self.nonce.map(|n| n.to_hex()).unwrap_or_default(),
            self.status,
            self.q.map(|q| q.to_string()).unwrap_or_default(),
            self.counter.map(|c| c.to_string()).unwrap_or_default(),
            self.details.replace('"', "\"\"")
        )
    }
}

/// Session-key cracker and traffic decryptor.
#[derive(Debug, Clone)]
pub struct Sniffer {
    config: LinkConfig,
    tag: [u8; TAG_BLOCK_SIZE],
    records: HashMap<Nonce, SnifferRecord>,
    /// Record nonces, oldest first.
    order: VecDeque<Nonce>,
    active: Option<ActiveSession>,
    /// Epoch announced by the last cracked reply, for hop following.
    epoch_ms: Option<u32>,
}

impl Sniffer {
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tag: config.handshake.tag_bytes()?,
            config,
            records: HashMap::new(),
            order: VecDeque::new(),
            active: None,
            epoch_ms: None,
        })
    }

    pub fn record(&self, nonce: &Nonce) -> Option<&SnifferRecord> {
        self.records.get(nonce)
    }

    pub fn records(&self) -> &HashMap<Nonce, SnifferRecord> {
        &self.records
    }

    /// Record for `nonce`, created if needed. Evicts the oldest record once
    /// `max_records` is reached.
    fn record_mut(&mut self, nonce: Nonce) -> &mut SnifferRecord {
        if !self.records.contains_key(&nonce) {
            while self.order.len() >= self.config.sniffer.max_records {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.records.remove(&oldest);
                debug!(nonce = %oldest, "forgetting handshake record");
            }
            self.order.push_back(nonce);
        }
        self.records.entry(nonce).or_default()
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    /// Full-range brute force over `[q_min, q_max]`, trying `hint` first.
    pub fn crack(
        &self,
        nonce: &Nonce,
        wrapped: &[u8; WRAPPED_KEY_SIZE],
        hint: Option<i32>,
    ) -> Result<RecoveredKey> {
        let (q_min, q_max) = (self.config.sniffer.q_min, self.config.sniffer.q_max);
        let candidates = hint
            .into_iter()
            .chain((q_min..=q_max).filter(move |q| Some(*q) != hint));
        let (session_key, q) = unwrap_candidates(wrapped, nonce, candidates, &self.tag)?;
        Ok(RecoveredKey { session_key, q })
    }

    /// Hop seed and epoch of the active session, when the dynamic scheme is
    /// in use and the reply carried a countdown.
    pub fn hop_anchor(&self) -> Option<(u32, u32)> {
        let HopScheme::Dynamic { bind_rssi, .. } = self.config.hopping.scheme else {
            return None;
        };
        let active = self.active.as_ref()?;
        let epoch_ms = self.epoch_ms?;
        let seed = derive_hop_seed(&active.key.session_key, bind_rssi.then_some(active.key.q));
        Some((seed, epoch_ms))
    }

    /// Processes one received payload. Never fails; every outcome is a row.
    pub fn observe(&mut self, payload: &[u8], rssi_dbm: f32, snr_db: f32, now_ms: u32) -> SniffRow {
        let mut row = SniffRow {
            ts_ms: now_ms,
            rssi_dbm,
            snr_db,
            frame_type: "other",
            nonce: None,
            status: SniffStatus::Other,
            q: None,
            counter: None,
            details: String::new(),
        };
        let frame = match Frame::parse(payload) {
            Ok(frame) => frame,
            Err(error) => {
                row.frame_type = if std::str::from_utf8(payload).is_ok() {
                    "other"
                } else {
                    "bin"
                };
                row.status = SniffStatus::Malformed;
                row.details = error.to_string();
                warn!(%error, len = payload.len(), "malformed frame on air");
                return row;
            }
        };
        match frame {
            Frame::Hello { nonce } => {
                self.record_mut(nonce).hello_seen = true;
                info!(nonce = %nonce, rssi_dbm, "hello observed");
                row.frame_type = "hello";
                row.nonce = Some(nonce);
                row.status = SniffStatus::Hello;
            }
            Frame::KeyReply(reply) => {
                row.frame_type = "ek";
                row.nonce = Some(reply.nonce);
                self.on_key_reply(&reply, now_ms, &mut row);
            }
            Frame::Data(data) => {
                row.frame_type = "data";
                row.nonce = self.active.as_ref().map(|a| a.nonce);
                row.counter = Some(data.counter);
                self.on_data(&data, &mut row);
            }
            Frame::Unknown(text) => {
                debug!(text = %text, "unknown frame");
                row.details = text;
            }
        }
        row
    }

    fn on_key_reply(&mut self, reply: &KeyReply, now_ms: u32, row: &mut SniffRow) {
        let record = self.record_mut(reply.nonce);
        record.wrapped_key = Some(reply.wrapped_key);
        let known = record.recovered;

        let recovered = match known {
            Some(key) => Ok(key),
            None => self.crack(&reply.nonce, &reply.wrapped_key, reply.q),
        };
        match recovered {
            Ok(key) => {
                if let Some(record) = self.records.get_mut(&reply.nonce) {
                    record.recovered = Some(key);
                }
                info!(nonce = %reply.nonce, q = key.q, "session key recovered");
                self.active = Some(ActiveSession {
                    nonce: reply.nonce,
                    key,
                    deriver: MessageKeyDeriver::for_session(
                        self.config.message_key,
                        key.session_key,
                        key.q,
                        &reply.nonce,
                    ),
                });
                self.epoch_ms = reply.start_in_ms.map(|s| ticks_after(now_ms, s));
                row.status = SniffStatus::KeyRecovered;
                row.q = Some(key.q);
                row.details = hex::encode(key.session_key);
            }
            Err(error) => {
                warn!(
                    nonce = %reply.nonce,
                    q_min = self.config.sniffer.q_min,
                    q_max = self.config.sniffer.q_max,
                    "failed to recover session key"
                );
                // A new handshake supersedes whatever key was active.
                self.active = None;
                self.epoch_ms = None;
                row.status = SniffStatus::KeyNotRecovered;
                row.details = error.to_string();
            }
        }
    }

    fn on_data(&mut self, data: &DataFrame, row: &mut SniffRow) {
        let Some(active) = self.active.as_ref() else {
            debug!(counter = data.counter, "data frame without a key");
            row.status = SniffStatus::NoKey;
            row.details = hex::encode(&data.ciphertext);
            return;
        };
        match decrypt_message(&active.deriver, data) {
            Ok(text) => {
                info!(counter = data.counter, text = %text, "data decrypted");
                row.status = SniffStatus::DecOk;
                row.details = text;
            }
            Err(error) => {
                warn!(counter = data.counter, %error, "data decrypt failed");
                row.status = SniffStatus::DecryptFailed;
                row.details = error.to_string();
            }
        }
    }
}

/// Receive loop around a [`Sniffer`], in continuous-receive mode.
pub struct SnifferNode<R, C> {
    radio: R,
    clock: C,
    sniffer: Sniffer,
    plan: ChannelPlan,
    tuned_hz: Option<u32>,
    anchored: Option<(u32, u32)>,
}

impl<R: Radio, C: Clock> SnifferNode<R, C> {
    pub fn new(mut radio: R, clock: C, config: LinkConfig) -> Result<Self> {
        let plan = ChannelPlan::from_config(&config.hopping)?;
        config.radio.apply(&mut radio);
        Ok(Self {
            sniffer: Sniffer::new(config)?,
            radio,
            clock,
            plan,
            tuned_hz: None,
            anchored: None,
        })
    }

    pub fn sniffer(&self) -> &Sniffer {
        &self.sniffer
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Frequency the sniffer should be on now.
    fn target_frequency(&self, now_ms: u32) -> u32 {
        let follow = self.sniffer.config.sniffer.follow_hops;
        match self.sniffer.config.sniffer.listen_hz {
            Some(hz) if !follow => hz,
            _ => self.plan.channel_at(now_ms).frequency_hz,
        }
    }

    fn follow_hops(&mut self) {
        if !self.sniffer.config.sniffer.follow_hops {
            return;
        }
        let anchor = self.sniffer.hop_anchor();
        if anchor == self.anchored {
            return;
        }
        match anchor {
            Some((seed, epoch_ms)) => {
                info!(hop_seed = seed, epoch_ms, "following session hops");
                self.plan.anchor(seed, epoch_ms);
            }
            None => self.plan.reset(),
        }
        self.anchored = anchor;
    }

    /// Polls the radio once; returns a row when a frame was heard.
    pub fn poll(&mut self) -> Option<SniffRow> {
        let now = self.clock.now_ms();
        let target = self.target_frequency(now);
        if self.tuned_hz != Some(target) {
            self.radio.set_frequency(target);
            self.radio.receive_continuous();
            self.tuned_hz = Some(target);
            debug!(freq_hz = target, "sniffer retuned");
        }
        let timeout = self
            .plan
            .bound_rx_timeout(now, self.sniffer.config.sniffer.poll_ms);
        let reception = self.radio.receive_keep_listening(timeout);
        let payload = match reception.payload {
            Some(payload) => payload,
            None => {
                if reception.crc_error {
                    debug!(freq_hz = target, "crc error");
                }
                return None;
            }
        };
        let row = self
            .sniffer
            .observe(&payload, reception.rssi_dbm, reception.snr_db, self.clock.now_ms());
        self.follow_hops();
        Some(row)
    }
}

/// Offline crack of a captured `(nonce, ek)` pair over `[q_min, q_max]`.
pub fn crack_capture(
    config: &LinkConfig,
    nonce: &Nonce,
    wrapped: &[u8; WRAPPED_KEY_SIZE],
    hint: Option<i32>,
) -> Result<RecoveredKey> {
    Sniffer::new(config.clone())?.crack(nonce, wrapped, hint)
}

/// Parses a 64-hex-char wrapped key as captured from a KeyReply.
pub fn parse_wrapped_key(hex_text: &str) -> Result<[u8; WRAPPED_KEY_SIZE]> {
    let bytes = hex::decode(hex_text.trim())
        .map_err(|e| LinkError::MalformedFrame(format!("bad ek hex: {}", e)))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        LinkError::MalformedFrame(format!("ek must be {} bytes, got {}", WRAPPED_KEY_SIZE, len))
    })
}
