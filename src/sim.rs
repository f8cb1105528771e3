//! In-memory radio medium for tests and offline simulation.
//!
//! Every [`SimRadio`] attached to one [`Ether`] shares a [`ManualClock`].
//! Nodes are stepped round-robin on one thread, so a radio cannot be listening
//! at the instant another one transmits. Instead every frame is queued at
//! every other awake radio, and a receive call picks up frames sent on the
//! channel it is tuned to within the last hold window; older frames are lost.
//! A receive call with nothing pending advances the shared timeline by a short
//! poll step instead of the full timeout.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tracing::trace;

use crate::clock::{Clock, ManualClock};
use crate::radio::{Radio, RadioMode, RadioSettings, Reception};

/// Transmitter id used for frames injected from outside the simulation.
pub const FOREIGN_TRANSMITTER: usize = usize::MAX;

const DEFAULT_RSSI_DBM: f32 = -30.0;
const DEFAULT_SNR_DB: f32 = 9.5;
const DEFAULT_AIRTIME_MS: u32 = 50;
const DEFAULT_POLL_STEP_MS: u32 = 10;
const DEFAULT_HOLD_MS: u32 = 250;

/// One frame put on air.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub from: usize,
    pub frequency_hz: u32,
    /// Tick at which the transmission completed.
    pub at_ms: u32,
    pub payload: Vec<u8>,
    /// False when the frame was deliberately lost.
    pub delivered: bool,
}

#[derive(Debug, Clone)]
struct Delivery {
    frequency_hz: u32,
    at_ms: u32,
    payload: Option<Vec<u8>>,
    rssi_dbm: f32,
    snr_db: f32,
}

#[derive(Debug)]
struct Station {
    frequency_hz: u32,
    mode: RadioMode,
    inbox: VecDeque<Delivery>,
}

#[derive(Debug)]
struct EtherState {
    stations: Vec<Station>,
    link_rssi: HashMap<(usize, usize), f32>,
    default_rssi_dbm: f32,
    snr_db: f32,
    airtime_ms: u32,
    poll_step_ms: u32,
    hold_ms: u32,
    drop_next: HashMap<usize, u32>,
    corrupt_next: HashMap<usize, u32>,
    log: Vec<Transmission>,
}

/// Shared medium.
#[derive(Debug, Clone)]
pub struct Ether {
    state: Rc<RefCell<EtherState>>,
    clock: ManualClock,
}

impl Ether {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(EtherState {
                stations: Vec::new(),
                link_rssi: HashMap::new(),
                default_rssi_dbm: DEFAULT_RSSI_DBM,
                snr_db: DEFAULT_SNR_DB,
                airtime_ms: DEFAULT_AIRTIME_MS,
                poll_step_ms: DEFAULT_POLL_STEP_MS,
                hold_ms: DEFAULT_HOLD_MS,
                drop_next: HashMap::new(),
                corrupt_next: HashMap::new(),
                log: Vec::new(),
            })),
            clock,
        }
    }

    /// Clock shared by the medium and every attached radio.
    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    /// Attaches a new radio, initially in standby on 0 Hz.
    pub fn attach(&self) -> SimRadio {
        let mut state = self.state.borrow_mut();
        state.stations.push(Station {
            frequency_hz: 0,
            mode: RadioMode::Standby,
            inbox: VecDeque::new(),
        });
        SimRadio {
            id: state.stations.len() - 1,
            ether: self.clone(),
            settings: RadioSettings::default(),
        }
    }

    /// RSSI at which `to` hears `from`; links may be asymmetric.
    pub fn set_link_rssi(&self, from: usize, to: usize, rssi_dbm: f32) {
        self.state.borrow_mut().link_rssi.insert((from, to), rssi_dbm);
    }

    /// RSSI for every link without an explicit setting.
    pub fn set_default_rssi(&self, rssi_dbm: f32) {
        self.state.borrow_mut().default_rssi_dbm = rssi_dbm;
    }

    pub fn set_airtime_ms(&self, ms: u32) {
        self.state.borrow_mut().airtime_ms = ms;
    }

    pub fn set_poll_step_ms(&self, ms: u32) {
        self.state.borrow_mut().poll_step_ms = ms.max(1);
    }

    /// How long a frame stays receivable after it was sent.
    pub fn set_hold_ms(&self, ms: u32) {
        self.state.borrow_mut().hold_ms = ms;
    }

    /// Loses the next `count` frames sent by `from`.
    pub fn drop_next_from(&self, from: usize, count: u32) {
        self.state.borrow_mut().drop_next.insert(from, count);
    }

    /// Delivers the next `count` frames sent by `from` with a bad CRC.
    pub fn corrupt_next_from(&self, from: usize, count: u32) {
        self.state.borrow_mut().corrupt_next.insert(from, count);
    }

    /// Puts a frame on air from a transmitter outside the simulation.
    pub fn inject(&self, frequency_hz: u32, payload: &[u8], rssi_dbm: f32) {
        let now = self.clock.now_ms();
        let mut state = self.state.borrow_mut();
        let snr_db = state.snr_db;
        for station in state.stations.iter_mut() {
            if station.mode != RadioMode::Sleep {
                station.inbox.push_back(Delivery {
                    frequency_hz,
                    at_ms: now,
                    payload: Some(payload.to_vec()),
                    rssi_dbm,
                    snr_db,
                });
            }
        }
        state.log.push(Transmission {
            from: FOREIGN_TRANSMITTER,
            frequency_hz,
            at_ms: now,
            payload: payload.to_vec(),
            delivered: true,
        });
    }

    /// Every frame put on air so far.
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.borrow().log.clone()
    }

    fn take_counter(map: &mut HashMap<usize, u32>, from: usize) -> bool {
        match map.get_mut(&from) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn transmit(&self, from: usize, payload: &[u8], timeout_ms: u32) -> bool {
        let airtime_ms = self.state.borrow().airtime_ms;
        if airtime_ms > timeout_ms {
            self.clock.advance(timeout_ms);
            return false;
        }
        self.clock.advance(airtime_ms);
        let now = self.clock.now_ms();

        let mut state = self.state.borrow_mut();
        let frequency_hz = state.stations[from].frequency_hz;
        let dropped = Self::take_counter(&mut state.drop_next, from);
        let corrupted = Self::take_counter(&mut state.corrupt_next, from);
        let default_rssi = state.default_rssi_dbm;
        let snr_db = state.snr_db;
        let rssi: Vec<f32> = (0..state.stations.len())
            .map(|to| {
                state
                    .link_rssi
                    .get(&(from, to))
                    .copied()
                    .unwrap_or(default_rssi)
            })
            .collect();

        if !dropped {
            for (to, station) in state.stations.iter_mut().enumerate() {
                if to == from || station.mode == RadioMode::Sleep {
                    continue;
                }
                station.inbox.push_back(Delivery {
                    frequency_hz,
                    at_ms: now,
                    payload: (!corrupted).then(|| payload.to_vec()),
                    rssi_dbm: rssi[to],
                    snr_db,
                });
            }
        }
        trace!(from, frequency_hz, len = payload.len(), dropped, "sim transmit");
        state.log.push(Transmission {
            from,
            frequency_hz,
            at_ms: now,
            payload: payload.to_vec(),
            delivered: !dropped,
        });
        true
    }

    fn poll_inbox(&self, id: usize, timeout_ms: u32) -> Reception {
        let now = self.clock.now_ms();
        let delivery = {
            let mut state = self.state.borrow_mut();
            let hold_ms = state.hold_ms;
            let station = &mut state.stations[id];
            let frequency_hz = station.frequency_hz;
            station
                .inbox
                .retain(|d| now.wrapping_sub(d.at_ms) <= hold_ms);
            station
                .inbox
                .iter()
                .position(|d| d.frequency_hz == frequency_hz)
                .and_then(|i| station.inbox.remove(i))
        };
        match delivery {
            Some(Delivery {
                payload: Some(payload),
                rssi_dbm,
                snr_db,
                ..
            }) => Reception::frame(payload, rssi_dbm, snr_db),
            Some(_) => Reception::crc_failure(),
            None => {
                let step = self.state.borrow().poll_step_ms;
                let wait = if timeout_ms == 0 { step } else { step.min(timeout_ms) };
                self.clock.advance(wait);
                Reception::timeout()
            }
        }
    }

    fn set_mode(&self, id: usize, mode: RadioMode) {
        let mut state = self.state.borrow_mut();
        let station = &mut state.stations[id];
        station.mode = mode;
        if mode == RadioMode::Sleep {
            station.inbox.clear();
        }
    }
}

/// Simulated transceiver attached to an [`Ether`].
#[derive(Debug, Clone)]
pub struct SimRadio {
    id: usize,
    ether: Ether,
    settings: RadioSettings,
}

impl SimRadio {
    /// Station id, used to configure links on the medium.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Modulation settings last pushed by the node.
    pub fn settings(&self) -> &RadioSettings {
        &self.settings
    }

    pub fn frequency_hz(&self) -> u32 {
        self.ether.state.borrow().stations[self.id].frequency_hz
    }
}

impl Radio for SimRadio {
    fn set_frequency(&mut self, hz: u32) {
        self.ether.state.borrow_mut().stations[self.id].frequency_hz = hz;
    }

    fn set_tx_power(&mut self, dbm: i8) {
        self.settings.tx_power_dbm = dbm;
    }

    fn set_spreading_factor(&mut self, sf: u8) {
        self.settings.spreading_factor = sf;
    }

    fn set_bandwidth(&mut self, hz: u32) {
        self.settings.bandwidth_hz = hz;
    }

    fn set_coding_rate(&mut self, cr: u8) {
        self.settings.coding_rate = cr;
    }

    fn set_crc(&mut self, enabled: bool) {
        self.settings.crc = enabled;
    }

    fn send(&mut self, data: &[u8], timeout_ms: u32) -> bool {
        self.ether.set_mode(self.id, RadioMode::Transmit);
        let ok = self.ether.transmit(self.id, data, timeout_ms);
        self.ether.set_mode(self.id, RadioMode::Standby);
        ok
    }

    fn receive(&mut self, timeout_ms: u32) -> Reception {
        self.ether.set_mode(self.id, RadioMode::Receive);
        let reception = self.ether.poll_inbox(self.id, timeout_ms);
        self.ether.set_mode(self.id, RadioMode::Standby);
        reception
    }

    fn receive_continuous(&mut self) {
        self.ether.set_mode(self.id, RadioMode::Receive);
    }

    fn receive_keep_listening(&mut self, timeout_ms: u32) -> Reception {
        self.ether.set_mode(self.id, RadioMode::Receive);
        self.ether.poll_inbox(self.id, timeout_ms)
    }

    fn standby(&mut self) {
        self.ether.set_mode(self.id, RadioMode::Standby);
    }

    fn sleep(&mut self) {
        self.ether.set_mode(self.id, RadioMode::Sleep);
    }

    fn mode(&self) -> RadioMode {
        self.ether.state.borrow().stations[self.id].mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Ether, SimRadio, SimRadio) {
        let ether = Ether::new(ManualClock::starting_at(0));
        let a = ether.attach();
        let b = ether.attach();
        (ether, a, b)
    }

    #[test]
    fn test_delivery_requires_same_frequency() {
        let (ether, mut a, mut b) = pair();
        a.set_frequency(915_000_000);
        b.set_frequency(914_000_000);
        assert!(a.send(b"one", 1_000));
        assert_eq!(b.receive(100).payload, None);
        assert_eq!(b.receive(100).payload, None);

        // Too late to catch "one" after retuning.
        ether.clock().advance(1_000);
        b.set_frequency(915_000_000);
        assert_eq!(b.receive(100).payload, None);

        assert!(a.send(b"two", 1_000));
        let reception = b.receive(100);
        assert_eq!(reception.payload, Some(b"two".to_vec()));
        assert_eq!(reception.rssi_dbm, DEFAULT_RSSI_DBM);
        assert_eq!(ether.transmissions().len(), 2);
        assert!(ether.transmissions()[0].delivered);
    }

    #[test]
    fn test_receiver_hopping_in_step_catches_recent_frame() {
        let (_ether, mut a, mut b) = pair();
        b.set_frequency(1);
        a.set_frequency(2);
        assert!(a.send(b"hop", 1_000));
        b.set_frequency(2);
        assert_eq!(b.receive(100).payload, Some(b"hop".to_vec()));
    }

    #[test]
    fn test_sender_never_hears_itself() {
        let (_ether, mut a, _b) = pair();
        a.set_frequency(915_000_000);
        assert!(a.send(b"echo", 1_000));
        assert_eq!(a.receive(100).payload, None);
    }

    #[test]
    fn test_asymmetric_rssi() {
        let (ether, mut a, mut b) = pair();
        ether.set_link_rssi(a.id(), b.id(), -70.0);
        ether.set_link_rssi(b.id(), a.id(), -74.0);
        a.set_frequency(1);
        b.set_frequency(1);
        a.send(b"x", 1_000);
        assert_eq!(b.receive(10).rssi_dbm, -70.0);
        b.send(b"y", 1_000);
        assert_eq!(a.receive(10).rssi_dbm, -74.0);
    }

    #[test]
    fn test_drop_and_corrupt() {
        let (ether, mut a, mut b) = pair();
        a.set_frequency(1);
        b.set_frequency(1);
        ether.drop_next_from(a.id(), 1);
        ether.corrupt_next_from(a.id(), 1);
        a.send(b"lost", 1_000);
        assert!(b.receive(10).payload.is_none());
        assert!(!ether.transmissions()[0].delivered);
        a.send(b"garbled", 1_000);
        let reception = b.receive(10);
        assert!(reception.crc_error);
        assert!(reception.payload.is_none());
        a.send(b"fine", 1_000);
        assert_eq!(b.receive(10).payload, Some(b"fine".to_vec()));
    }

    #[test]
    fn test_timing() {
        let (ether, mut a, mut b) = pair();
        let clock = ether.clock();
        a.set_frequency(1);
        b.set_frequency(1);
        a.send(b"x", 1_000);
        assert_eq!(clock.now_ms(), DEFAULT_AIRTIME_MS);
        b.receive(1_000);
        assert_eq!(clock.now_ms(), DEFAULT_AIRTIME_MS);
        b.receive(1_000);
        assert_eq!(clock.now_ms(), DEFAULT_AIRTIME_MS + DEFAULT_POLL_STEP_MS);
        assert!(!a.send(b"slow", 10));
        assert_eq!(a.mode(), RadioMode::Standby);
    }

    #[test]
    fn test_sleeping_radio_hears_nothing() {
        let (_ether, mut a, mut b) = pair();
        a.set_frequency(1);
        b.set_frequency(1);
        b.sleep();
        a.send(b"x", 1_000);
        assert!(b.receive(10).payload.is_none());
    }

    #[test]
    fn test_continuous_receive_keeps_mode() {
        let (ether, _a, mut b) = pair();
        b.set_frequency(7);
        b.receive_continuous();
        ether.inject(7, b"hello=1,nonce=0102030405060708", -20.0);
        let reception = b.receive_keep_listening(50);
        assert_eq!(reception.rssi_dbm, -20.0);
        assert_eq!(b.mode(), RadioMode::Receive);
        b.receive(10);
        assert_eq!(b.mode(), RadioMode::Standby);
    }
}
