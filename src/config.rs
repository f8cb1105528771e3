//! Link configuration.
//!
//! Every participant (attackers included) must agree on the frequency table,
//! hop interval, hop scheme and tag block. Loaded from JSON; every field has a
//! default matching the reference deployment.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::radio::RadioSettings;
use crate::ratchet::MessageKeyVariant;
use crate::types::{LinkError, Result, DEFAULT_TAG_BLOCK, MAX_COUNTDOWN_MS, TAG_BLOCK_SIZE};

/// Default channel table, 914.0 to 916.1 MHz in 300 kHz steps.
pub const DEFAULT_FREQUENCIES_HZ: [u32; 8] = [
    914_000_000,
    914_300_000,
    914_600_000,
    914_900_000,
    915_200_000,
    915_500_000,
    915_800_000,
    916_100_000,
];

/// Default slot length.
pub const DEFAULT_HOP_INTERVAL_MS: u32 = 10_000;

/// Default static shared secret.
pub const DEFAULT_SECRET_SEED: u32 = 0x1234_ABCD;

/// Default rendezvous channel for the dynamic scheme.
pub const DEFAULT_RENDEZVOUS_HZ: u32 = 915_000_000;

/// How the channel for a slot is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HopScheme {
    /// LCG over `secret_seed XOR slot`; slots counted from boot.
    Static { secret_seed: u32 },
    /// Hash over a per-session seed; slots counted from a negotiated epoch.
    Dynamic {
        /// Channel used for the handshake and until the epoch.
        rendezvous_hz: u32,
        /// Countdown the Responder announces in its reply.
        start_delay_ms: u32,
        /// Whether the hop seed also binds the quantized RSSI.
        bind_rssi: bool,
    },
}

impl Default for HopScheme {
    fn default() -> Self {
        HopScheme::Static {
            secret_seed: DEFAULT_SECRET_SEED,
        }
    }
}

/// Frequency-hopping parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HopConfig {
    /// Ordered channel table in Hz.
    pub frequencies_hz: Vec<u32>,
    /// Slot length in milliseconds.
    pub hop_interval_ms: u32,
    /// Static or dynamic hopping.
    pub scheme: HopScheme,
    /// Transmit immediately when within this distance of the slot centre.
    pub tx_align_tolerance_ms: u32,
    /// Extra listening time allowed past the end of the current slot.
    pub rx_guard_ms: u32,
}

impl Default for HopConfig {
    fn default() -> Self {
        Self {
            frequencies_hz: DEFAULT_FREQUENCIES_HZ.to_vec(),
            hop_interval_ms: DEFAULT_HOP_INTERVAL_MS,
            scheme: HopScheme::default(),
            tx_align_tolerance_ms: 4_000,
            rx_guard_ms: 500,
        }
    }
}

/// Handshake parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// RSSI quantization step in dB.
    pub quantization_step: i32,
    /// Initiator search half-width W around its own rounded RSSI.
    pub search_half_width: i32,
    /// Initiator search step S.
    pub search_step: i32,
    /// Public tag appended to the session key; exactly 16 ASCII bytes.
    pub tag_block: String,
    /// How long the Initiator waits for a KeyReply.
    pub reply_timeout_ms: u32,
    /// Timeout for every transmission.
    pub send_timeout_ms: u32,
    /// Whether the Responder reveals its quantized RSSI in the reply.
    pub advertise_q: bool,
    /// Slots past the epoch a dynamic Responder keeps an unconfirmed session
    /// before it parks on the rendezvous channel again.
    pub confirm_slots: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            quantization_step: 1,
            search_half_width: 8,
            search_step: 1,
            tag_block: String::from_utf8_lossy(&DEFAULT_TAG_BLOCK).into_owned(),
            reply_timeout_ms: 3_000,
            send_timeout_ms: 5_000,
            advertise_q: false,
            confirm_slots: 3,
        }
    }
}

impl HandshakeConfig {
    /// Tag block as raw bytes.
    pub fn tag_bytes(&self) -> Result<[u8; TAG_BLOCK_SIZE]> {
        let bytes = self.tag_block.as_bytes();
        if bytes.len() != TAG_BLOCK_SIZE {
            return Err(LinkError::Config(format!(
                "tag_block must be {} bytes, got {}",
                TAG_BLOCK_SIZE,
                bytes.len()
            )));
        }
        let mut tag = [0u8; TAG_BLOCK_SIZE];
        tag.copy_from_slice(bytes);
        Ok(tag)
    }
}

/// Passive attacker parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnifferConfig {
    /// Lowest quantized RSSI tried.
    pub q_min: i32,
    /// Highest quantized RSSI tried (inclusive).
    pub q_max: i32,
    /// Follow the dynamic hop schedule once a session is recovered.
    pub follow_hops: bool,
    /// Fixed listening channel when not following hops.
    pub listen_hz: Option<u32>,
    /// Polling window for continuous receive.
    pub poll_ms: u32,
    /// Handshake records kept; the oldest nonce is forgotten first.
    pub max_records: usize,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            q_min: -40,
            q_max: 0,
            follow_hops: true,
            listen_hz: None,
            poll_ms: 200,
            max_records: 64,
        }
    }
}

/// Complete configuration for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LinkConfig {
    pub radio: RadioSettings,
    pub hopping: HopConfig,
    pub handshake: HandshakeConfig,
    pub message_key: MessageKeyVariant,
    pub sniffer: SnifferConfig,
}

impl LinkConfig {
    /// Configuration using the static LCG hop scheme.
    pub fn static_hopping() -> Self {
        Self::default()
    }

    /// Configuration using the dynamic per-session hop scheme.
    pub fn dynamic_hopping() -> Self {
        let mut config = Self::default();
        config.hopping.scheme = HopScheme::Dynamic {
            rendezvous_hz: DEFAULT_RENDEZVOUS_HZ,
            start_delay_ms: 3_000,
            bind_rssi: true,
        };
        config
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| LinkError::Config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::Config(format!("cannot serialize: {}", e)))
    }

    /// Checks the invariants every participant relies on.
    pub fn validate(&self) -> Result<()> {
        if self.hopping.frequencies_hz.is_empty() {
            return Err(LinkError::Config("frequency table is empty".into()));
        }
        if self.hopping.hop_interval_ms == 0 {
            return Err(LinkError::Config("hop_interval_ms must be positive".into()));
        }
        if self.handshake.quantization_step <= 0 {
            return Err(LinkError::Config("quantization_step must be positive".into()));
        }
        if self.handshake.search_step <= 0 {
            return Err(LinkError::Config("search_step must be positive".into()));
        }
        if self.handshake.search_half_width < 0 {
            return Err(LinkError::Config("search_half_width must not be negative".into()));
        }
        if let HopScheme::Dynamic { start_delay_ms, .. } = self.hopping.scheme {
            if start_delay_ms > MAX_COUNTDOWN_MS {
                return Err(LinkError::Config(format!(
                    "start_delay_ms must not exceed {}",
                    MAX_COUNTDOWN_MS
                )));
            }
        }
        if self.handshake.confirm_slots == 0 {
            return Err(LinkError::Config("confirm_slots must be positive".into()));
        }
        if self.sniffer.max_records == 0 {
            return Err(LinkError::Config("max_records must be positive".into()));
        }
        if self.sniffer.q_min > self.sniffer.q_max {
            return Err(LinkError::Config(format!(
                "sniffer range is empty: q_min {} > q_max {}",
                self.sniffer.q_min, self.sniffer.q_max
            )));
        }
        self.handshake.tag_bytes()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.hopping.frequencies_hz.len(), 8);
        assert_eq!(config.hopping.hop_interval_ms, 10_000);
        assert_eq!(config.handshake.tag_bytes().unwrap(), DEFAULT_TAG_BLOCK);
        assert_eq!(config.message_key, MessageKeyVariant::Direct);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "hopping": {
                "hop_interval_ms": 2000,
                "scheme": { "kind": "dynamic", "rendezvous_hz": 923200000, "start_delay_ms": 1500, "bind_rssi": false }
            },
            "message_key": "rolling"
        }"#;
        let config = LinkConfig::from_json_str(json).unwrap();
        assert_eq!(config.hopping.hop_interval_ms, 2000);
        assert_eq!(config.hopping.frequencies_hz, DEFAULT_FREQUENCIES_HZ.to_vec());
        assert_eq!(config.message_key, MessageKeyVariant::Rolling);
        assert!(matches!(
            config.hopping.scheme,
            HopScheme::Dynamic { rendezvous_hz: 923_200_000, .. }
        ));
    }

    #[test]
    fn test_rejects_empty_table() {
        let json = r#"{ "hopping": { "frequencies_hz": [] } }"#;
        assert!(matches!(
            LinkConfig::from_json_str(json),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_short_tag() {
        let mut config = LinkConfig::default();
        config.handshake.tag_block = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_timing() {
        let mut config = LinkConfig::default();
        config.handshake.confirm_slots = 0;
        assert!(matches!(config.validate(), Err(LinkError::Config(_))));

        let mut config = LinkConfig::dynamic_hopping();
        if let HopScheme::Dynamic { start_delay_ms, .. } = &mut config.hopping.scheme {
            *start_delay_ms = 4_000_000_000;
        }
        assert!(matches!(config.validate(), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = LinkConfig::dynamic_hopping();
        let json = config.to_json().unwrap();
        assert_eq!(LinkConfig::from_json_str(&json).unwrap(), config);
    }
}
