//! Frequency-hop scheduling.
//!
//! Two schedulers map a time slot to an index in the shared frequency table:
//!
//! - **Static**: `LCG(secret_seed XOR slot) mod |table|`, slots counted from
//!   boot ticks. Pure and stateless.
//! - **Dynamic**: `SHA256("FHSS-HOP-v1|" || be32(hop_seed) || be32(slot))[0] mod |table|`,
//!   where the hop seed is derived once per handshake and slots are counted
//!   from the session's epoch anchor.
//!
//! [`SlotTimer`] turns an epoch anchor and hop interval into slot numbers,
//! transmit alignment delays and receive timeout bounds.

use sha2::{Digest, Sha256};

use crate::clock::{ticks_add, ticks_diff};
use crate::config::{HopConfig, HopScheme};
use crate::types::{
    LinkError, Result, SessionKey, HOP_INDEX_LABEL, HOP_SEED_LABEL, LCG_INCREMENT, LCG_MASK,
    LCG_MULTIPLIER,
};

/// Ordered set of channel frequencies, identical on every participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyTable {
    frequencies_hz: Vec<u32>,
}

impl FrequencyTable {
    /// Creates a table; it must hold at least one channel.
    pub fn new(frequencies_hz: Vec<u32>) -> Result<Self> {
        if frequencies_hz.is_empty() {
            return Err(LinkError::Config("frequency table is empty".into()));
        }
        Ok(Self { frequencies_hz })
    }

    pub fn len(&self) -> usize {
        self.frequencies_hz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies_hz.is_empty()
    }

    /// Frequency at `index`, reduced modulo the table length.
    pub fn frequency(&self, index: usize) -> u32 {
        self.frequencies_hz[index % self.frequencies_hz.len()]
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.frequencies_hz
    }
}

/// One step of the shared LCG: `(1103515245 * x + 12345) mod 2^31`.
pub fn lcg_step(x: u32) -> u32 {
    ((LCG_MULTIPLIER * u64::from(x) + LCG_INCREMENT) & LCG_MASK) as u32
}

/// Static-scheme PRN for a slot.
pub fn static_prn(secret_seed: u32, slot: u32) -> u32 {
    lcg_step(secret_seed ^ slot)
}

/// Static-scheme table index for a slot. An empty table yields index 0.
pub fn static_index(secret_seed: u32, slot: u32, table_len: usize) -> usize {
    (static_prn(secret_seed, slot) as usize)
        .checked_rem(table_len)
        .unwrap_or(0)
}

/// Static-scheme slot for a boot-relative tick count.
pub fn static_slot(now_ms: u32, hop_interval_ms: u32) -> u32 {
    now_ms / hop_interval_ms
}

/// Derives the dynamic hop seed from the session key and, optionally, the
/// quantized RSSI both ends agreed on.
pub fn derive_hop_seed(session_key: &SessionKey, quantized_rssi: Option<i32>) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(HOP_SEED_LABEL);
    hasher.update(session_key);
    if let Some(q) = quantized_rssi {
        hasher.update(b"|");
        hasher.update(q.to_string().as_bytes());
    }
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Dynamic-scheme table index for a slot. An empty table yields index 0.
pub fn dynamic_index(hop_seed: u32, slot: u32, table_len: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(HOP_INDEX_LABEL);
    hasher.update(hop_seed.to_be_bytes());
    hasher.update(slot.to_be_bytes());
    (hasher.finalize()[0] as usize)
        .checked_rem(table_len)
        .unwrap_or(0)
}

/// Maps a hop seed and slot to a frequency.
pub trait HopScheduler {
    fn index(&self, slot: u32, table_len: usize) -> usize;

    fn select_frequency(&self, table: &FrequencyTable, slot: u32) -> u32 {
        table.frequency(self.index(slot, table.len()))
    }
}

/// LCG scheduler keyed by a compile-time shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticHopper {
    pub secret_seed: u32,
}

impl HopScheduler for StaticHopper {
    fn index(&self, slot: u32, table_len: usize) -> usize {
        static_index(self.secret_seed, slot, table_len)
    }
}

/// Hash scheduler keyed by a per-session hop seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicHopper {
    pub hop_seed: u32,
}

impl DynamicHopper {
    pub fn from_session(session_key: &SessionKey, quantized_rssi: Option<i32>) -> Self {
        Self {
            hop_seed: derive_hop_seed(session_key, quantized_rssi),
        }
    }
}

impl HopScheduler for DynamicHopper {
    fn index(&self, slot: u32, table_len: usize) -> usize {
        dynamic_index(self.hop_seed, slot, table_len)
    }
}

/// Slot arithmetic relative to an epoch anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTimer {
    pub epoch_ms: u32,
    pub hop_interval_ms: u32,
    pub tx_tolerance_ms: u32,
    pub rx_guard_ms: u32,
    /// Boot-anchored timers have no "before the epoch"; ticks simply wrap.
    pub free_running: bool,
}

impl SlotTimer {
    pub fn new(epoch_ms: u32, config: &HopConfig) -> Self {
        Self {
            epoch_ms,
            hop_interval_ms: config.hop_interval_ms,
            tx_tolerance_ms: config.tx_align_tolerance_ms,
            rx_guard_ms: config.rx_guard_ms,
            free_running: false,
        }
    }

    /// Milliseconds elapsed since the epoch, `None` before it.
    fn elapsed(&self, now_ms: u32) -> Option<u32> {
        if self.free_running {
            return Some(now_ms.wrapping_sub(self.epoch_ms));
        }
        let elapsed = ticks_diff(now_ms, self.epoch_ms);
        (elapsed >= 0).then_some(elapsed as u32)
    }

    /// Whether hopping has begun.
    pub fn started(&self, now_ms: u32) -> bool {
        self.elapsed(now_ms).is_some()
    }

    /// Milliseconds until the epoch; zero once it has passed.
    pub fn until_start(&self, now_ms: u32) -> u32 {
        ticks_diff(self.epoch_ms, now_ms).max(0) as u32
    }

    /// Current slot, valid only once `now >= epoch`.
    pub fn slot(&self, now_ms: u32) -> Option<u32> {
        self.elapsed(now_ms).map(|e| e / self.hop_interval_ms)
    }

    /// Offset into the current slot.
    fn offset(&self, now_ms: u32) -> u32 {
        match self.elapsed(now_ms) {
            Some(e) => e % self.hop_interval_ms,
            None => 0,
        }
    }

    /// Time left before the next channel change.
    ///
    /// Before the epoch this is the time left on the rendezvous channel.
    pub fn remaining_in_slot(&self, now_ms: u32) -> u32 {
        match self.elapsed(now_ms) {
            Some(_) => self.hop_interval_ms - self.offset(now_ms),
            None => self.until_start(now_ms),
        }
    }

    /// Delay before transmitting so the frame lands near a slot centre.
    ///
    /// Zero when already within the tolerance window; otherwise waits for the
    /// centre of this slot or, past it, the centre of the next one.
    pub fn tx_delay(&self, now_ms: u32) -> u32 {
        if !self.started(now_ms) {
            return 0;
        }
        let offset = i64::from(self.offset(now_ms));
        let center = i64::from(self.hop_interval_ms / 2);
        let tolerance = i64::from(self.tx_tolerance_ms);
        if (offset - center).abs() <= tolerance {
            0
        } else if offset < center {
            (center - offset) as u32
        } else {
            (i64::from(self.hop_interval_ms) - offset + center) as u32
        }
    }

    /// Caps a requested receive timeout so the radio never listens past the
    /// next channel change plus the guard interval.
    pub fn bound_rx_timeout(&self, now_ms: u32, requested_ms: u32) -> u32 {
        let limit = self.remaining_in_slot(now_ms).saturating_add(self.rx_guard_ms);
        if requested_ms == 0 {
            limit
        } else {
            requested_ms.min(limit)
        }
    }

    /// Tick at which `slot` begins.
    pub fn slot_start(&self, slot: u32) -> u32 {
        ticks_add(self.epoch_ms, (slot.wrapping_mul(self.hop_interval_ms)) as i32)
    }
}

/// Channel assignment for one node: which frequency to tune to right now.
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    table: FrequencyTable,
    hop_interval_ms: u32,
    tx_tolerance_ms: u32,
    rx_guard_ms: u32,
    mode: PlanMode,
}

#[derive(Debug, Clone)]
enum PlanMode {
    Static(StaticHopper),
    Rendezvous { rendezvous_hz: u32 },
    Dynamic {
        rendezvous_hz: u32,
        hopper: DynamicHopper,
        timer: SlotTimer,
    },
}

/// Where the plan puts the radio at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub frequency_hz: u32,
    /// Hop slot, `None` while parked on the rendezvous channel.
    pub slot: Option<u32>,
}

impl ChannelPlan {
    /// Initial plan for a node: static hopping, or parked on the rendezvous
    /// channel until a session supplies a hop seed and epoch.
    pub fn from_config(config: &HopConfig) -> Result<Self> {
        let table = FrequencyTable::new(config.frequencies_hz.clone())?;
        if config.hop_interval_ms == 0 {
            return Err(LinkError::Config("hop_interval_ms must be positive".into()));
        }
        let mode = match config.scheme {
            HopScheme::Static { secret_seed } => PlanMode::Static(StaticHopper { secret_seed }),
            HopScheme::Dynamic { rendezvous_hz, .. } => PlanMode::Rendezvous { rendezvous_hz },
        };
        Ok(Self {
            table,
            hop_interval_ms: config.hop_interval_ms,
            tx_tolerance_ms: config.tx_align_tolerance_ms,
            rx_guard_ms: config.rx_guard_ms,
            mode,
        })
    }

    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    pub fn is_dynamic(&self) -> bool {
        !matches!(self.mode, PlanMode::Static(_))
    }

    /// Switches a dynamic plan onto a session's hop seed and epoch.
    ///
    /// Has no effect under the static scheme.
    pub fn anchor(&mut self, hop_seed: u32, epoch_ms: u32) {
        let rendezvous_hz = match self.mode {
            PlanMode::Static(_) => return,
            PlanMode::Rendezvous { rendezvous_hz } => rendezvous_hz,
            PlanMode::Dynamic { rendezvous_hz, .. } => rendezvous_hz,
        };
        self.mode = PlanMode::Dynamic {
            rendezvous_hz,
            hopper: DynamicHopper { hop_seed },
            timer: self.timer(epoch_ms),
        };
    }

    /// Drops any session anchor and parks on the rendezvous channel again.
    pub fn reset(&mut self) {
        if let PlanMode::Dynamic { rendezvous_hz, .. } = self.mode {
            self.mode = PlanMode::Rendezvous { rendezvous_hz };
        }
    }

    fn timer(&self, epoch_ms: u32) -> SlotTimer {
        SlotTimer {
            epoch_ms,
            hop_interval_ms: self.hop_interval_ms,
            tx_tolerance_ms: self.tx_tolerance_ms,
            rx_guard_ms: self.rx_guard_ms,
            free_running: false,
        }
    }

    /// The slot timer in force, if any. Static slots are anchored at tick 0.
    pub fn slot_timer(&self) -> Option<SlotTimer> {
        match &self.mode {
            PlanMode::Static(_) => Some(SlotTimer {
                free_running: true,
                ..self.timer(0)
            }),
            PlanMode::Rendezvous { .. } => None,
            PlanMode::Dynamic { timer, .. } => Some(*timer),
        }
    }

    /// Channel to use at `now_ms`.
    pub fn channel_at(&self, now_ms: u32) -> Channel {
        match &self.mode {
            PlanMode::Static(hopper) => {
                let slot = static_slot(now_ms, self.hop_interval_ms);
                Channel {
                    frequency_hz: hopper.select_frequency(&self.table, slot),
                    slot: Some(slot),
                }
            }
            PlanMode::Rendezvous { rendezvous_hz } => Channel {
                frequency_hz: *rendezvous_hz,
                slot: None,
            },
            PlanMode::Dynamic {
                rendezvous_hz,
                hopper,
                timer,
            } => match timer.slot(now_ms) {
                Some(slot) => Channel {
                    frequency_hz: hopper.select_frequency(&self.table, slot),
                    slot: Some(slot),
                },
                None => Channel {
                    frequency_hz: *rendezvous_hz,
                    slot: None,
                },
            },
        }
    }

    /// Delay before transmitting at `now_ms`.
    pub fn tx_delay(&self, now_ms: u32) -> u32 {
        self.slot_timer().map_or(0, |t| t.tx_delay(now_ms))
    }

    /// Receive timeout bounded to the current slot.
    pub fn bound_rx_timeout(&self, now_ms: u32, requested_ms: u32) -> u32 {
        match self.slot_timer() {
            Some(timer) => timer.bound_rx_timeout(now_ms, requested_ms),
            None => requested_ms,
        }
    }
}
