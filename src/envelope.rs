//! Wire frames for the FHSS link.
//!
//! Frames are ASCII, comma-separated `key=value` tokens:
//!
//! - Hello: `hello=1,nonce=<16 hex>`
//! - KeyReply: `ek=<64 hex>,nonce=<16 hex>[,start_in=<ms>][,q=<dBm>]`
//! - Data: `iv=<32 hex>,msg=<hex>,counter=<n>,t=<ms>,kind=data[,slot=<n>]`
//!
//! Tokens without `=` and unknown keys are ignored. A frame that looks like a
//! known type but lacks a required field, or carries bad hex or a bad number,
//! is rejected with [`LinkError::MalformedFrame`]. So is a `hello` other than
//! `1` and a `start_in` beyond [`MAX_COUNTDOWN_MS`]. Anything else is
//! [`Frame::Unknown`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;

use crate::types::{LinkError, Nonce, Result, BLOCK_SIZE, MAX_COUNTDOWN_MS, WRAPPED_KEY_SIZE};

/// Session-key transport reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyReply {
    /// `ECB(K, SessionKey || TagBlock)`.
    pub wrapped_key: [u8; WRAPPED_KEY_SIZE],
    /// Echo of the Hello nonce.
    pub nonce: Nonce,
    /// Countdown to the hopping epoch, measured at send time.
    pub start_in_ms: Option<u32>,
    /// Responder's quantized RSSI, when advertised.
    pub q: Option<i32>,
}

/// Encrypted application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub iv: [u8; BLOCK_SIZE],
    /// CBC ciphertext of the `msg` field.
    pub ciphertext: Vec<u8>,
    /// Sender's message counter, always cleartext.
    pub counter: u32,
    /// Sender tick count at send time.
    pub t_ms: u32,
    /// Hop slot the frame was sent in.
    pub slot: Option<u32>,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello { nonce: Nonce },
    KeyReply(KeyReply),
    Data(DataFrame),
    /// Valid text that matches no known frame type.
    Unknown(String),
}

impl Frame {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::KeyReply(_) => "key-reply",
            Frame::Data(_) => "data",
            Frame::Unknown(_) => "unknown",
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        match self {
            Frame::Hello { nonce } => {
                let _ = write!(out, "hello=1,nonce={}", nonce);
            }
            Frame::KeyReply(reply) => {
                let _ = write!(
                    out,
                    "ek={},nonce={}",
                    hex::encode(reply.wrapped_key),
                    reply.nonce
                );
                if let Some(start_in) = reply.start_in_ms {
                    let _ = write!(out, ",start_in={}", start_in);
                }
                if let Some(q) = reply.q {
                    let _ = write!(out, ",q={}", q);
                }
            }
            Frame::Data(data) => {
                let _ = write!(
                    out,
                    "iv={},msg={},counter={},t={},kind=data",
                    hex::encode(data.iv),
                    hex::encode(&data.ciphertext),
                    data.counter,
                    data.t_ms
                );
                if let Some(slot) = data.slot {
                    let _ = write!(out, ",slot={}", slot);
                }
            }
            Frame::Unknown(text) => out.push_str(text),
        }
        out.into_bytes()
    }

    /// Decode wire bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| LinkError::MalformedFrame(format!("not UTF-8: {}", e)))?;
        let fields = Fields::split(text);

        if let Some(version) = fields.get("hello") {
            if version != "1" {
                return Err(LinkError::MalformedFrame(format!(
                    "unsupported hello value {:?}",
                    version
                )));
            }
            return Ok(Frame::Hello {
                nonce: fields.parse("nonce")?,
            });
        }
        if fields.contains("ek") {
            let start_in_ms: Option<u32> = fields.parse_opt("start_in")?;
            if let Some(start_in) = start_in_ms.filter(|&ms| ms > MAX_COUNTDOWN_MS) {
                return Err(LinkError::MalformedFrame(format!(
                    "start_in {} exceeds {} ms",
                    start_in, MAX_COUNTDOWN_MS
                )));
            }
            return Ok(Frame::KeyReply(KeyReply {
                wrapped_key: fields.hex_array("ek")?,
                nonce: fields.parse("nonce")?,
                start_in_ms,
                q: fields.parse_opt("q")?,
            }));
        }
        if fields.get("kind") == Some("data") || fields.contains("iv") || fields.contains("msg") {
            if fields.get("kind") != Some("data") {
                return Err(LinkError::MalformedFrame("missing kind=data".into()));
            }
            return Ok(Frame::Data(DataFrame {
                iv: fields.hex_array("iv")?,
                ciphertext: fields.hex("msg")?,
                counter: fields.parse("counter")?,
                t_ms: fields.parse("t")?,
                slot: fields.parse_opt("slot")?,
            }));
        }
        Ok(Frame::Unknown(text.to_string()))
    }
}

/// Tokenized `key=value` pairs; later duplicates win.
struct Fields<'a> {
    map: HashMap<&'a str, &'a str>,
}

impl<'a> Fields<'a> {
    fn split(text: &'a str) -> Self {
        let map = text
            .trim()
            .split(',')
            .filter_map(|token| token.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        Self { map }
    }

    fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).copied()
    }

    fn require(&self, key: &str) -> Result<&'a str> {
        self.get(key)
            .ok_or_else(|| LinkError::MalformedFrame(format!("missing field '{}'", key)))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<T> {
        let value = self.require(key)?;
        value
            .parse()
            .map_err(|_| LinkError::MalformedFrame(format!("bad value for '{}': {:?}", key, value)))
    }

    fn parse_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(_) => self.parse(key).map(Some),
            None => Ok(None),
        }
    }

    fn hex(&self, key: &str) -> Result<Vec<u8>> {
        hex::decode(self.require(key)?)
            .map_err(|e| LinkError::MalformedFrame(format!("bad hex in '{}': {}", key, e)))
    }

    fn hex_array<const N: usize>(&self, key: &str) -> Result<[u8; N]> {
        let bytes = self.hex(key)?;
        bytes.try_into().map_err(|b: Vec<u8>| {
            LinkError::MalformedFrame(format!(
                "'{}' must be {} bytes, got {}",
                key,
                N,
                b.len()
            ))
        })
    }
}
