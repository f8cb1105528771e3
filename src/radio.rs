//! Radio interface consumed by the link layer.
//!
//! The transceiver is strictly half-duplex: at any instant it is receiving,
//! transmitting, in standby, or asleep. Drivers implement [`Radio`]; the link
//! layer never touches registers.

use serde::{Deserialize, Serialize};

/// Operating mode of a half-duplex transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Sleep,
    Standby,
    Transmit,
    Receive,
}

/// Outcome of a receive call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    /// Frame bytes, or `None` on timeout or CRC failure.
    pub payload: Option<Vec<u8>>,
    /// True when the frame was dropped for a bad CRC.
    pub crc_error: bool,
    /// Packet RSSI in dBm (meaningless without a payload).
    pub rssi_dbm: f32,
    /// Packet SNR in dB (meaningless without a payload).
    pub snr_db: f32,
}

impl Reception {
    /// A successfully received frame.
    pub fn frame(payload: Vec<u8>, rssi_dbm: f32, snr_db: f32) -> Self {
        Self {
            payload: Some(payload),
            crc_error: false,
            rssi_dbm,
            snr_db,
        }
    }

    /// Nothing arrived before the timeout.
    pub fn timeout() -> Self {
        Self {
            payload: None,
            crc_error: false,
            rssi_dbm: 0.0,
            snr_db: 0.0,
        }
    }

    /// A frame arrived but failed its CRC.
    pub fn crc_failure() -> Self {
        Self {
            crc_error: true,
            ..Self::timeout()
        }
    }
}

/// Transceiver contract implemented by the hardware driver.
///
/// Configuration setters are fire-and-forget. Every send or receive must be
/// preceded by `set_frequency` for the current hop slot.
pub trait Radio {
    fn set_frequency(&mut self, hz: u32);

    fn set_tx_power(&mut self, dbm: i8);

    fn set_spreading_factor(&mut self, sf: u8);

    fn set_bandwidth(&mut self, hz: u32);

    /// Coding rate denominator, 5..=8 for 4/5..4/8.
    fn set_coding_rate(&mut self, cr: u8);

    fn set_crc(&mut self, enabled: bool);

    /// Blocking transmit; true iff it completed before the timeout.
    fn send(&mut self, data: &[u8], timeout_ms: u32) -> bool;

    /// Blocking receive; the radio is left in standby afterwards.
    fn receive(&mut self, timeout_ms: u32) -> Reception;

    /// Enters continuous receive without blocking.
    fn receive_continuous(&mut self);

    /// Polls while staying in continuous receive.
    fn receive_keep_listening(&mut self, timeout_ms: u32) -> Reception;

    fn standby(&mut self);

    fn sleep(&mut self);

    /// Current operating mode.
    fn mode(&self) -> RadioMode;
}

/// Modulation settings applied once at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioSettings {
    pub tx_power_dbm: i8,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    pub coding_rate: u8,
    pub crc: bool,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            tx_power_dbm: 14,
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coding_rate: 5,
            crc: true,
        }
    }
}

impl RadioSettings {
    /// Pushes every setting to the radio and leaves it in standby.
    pub fn apply<R: Radio + ?Sized>(&self, radio: &mut R) {
        radio.set_tx_power(self.tx_power_dbm);
        radio.set_spreading_factor(self.spreading_factor);
        radio.set_bandwidth(self.bandwidth_hz);
        radio.set_coding_rate(self.coding_rate);
        radio.set_crc(self.crc);
        radio.standby();
    }
}
