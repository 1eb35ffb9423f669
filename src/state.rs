use crate::address::BdAddr;
use crate::model::DeviceModel;
use crate::mrtg::MrtgSeries;
use crate::reading::Reading;
use std::collections::{BTreeMap, VecDeque};

/// Everything the acquisition loop knows about the devices it has seen,
/// threaded explicitly through the main loop rather than living in statics.
#[derive(Debug, Default)]
pub struct AcquisitionState {
    /// Address -> last-known model, persisted across restarts.
    pub thermometers: BTreeMap<BdAddr, DeviceModel>,
    /// Readings waiting for the next log-file flush, in arrival order.
    pub pending: BTreeMap<BdAddr, VecDeque<Reading>>,
    /// In-memory multi-resolution history per device.
    pub mrtg: BTreeMap<BdAddr, MrtgSeries>,
    /// When each device's flash history was last pulled successfully.
    pub last_download: BTreeMap<BdAddr, i64>,
    /// Most recent advertisement reading, kept for the battery level that
    /// history records get stamped with.
    pub last_reading: BTreeMap<BdAddr, Reading>,
}

impl AcquisitionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a model for an address. A known model never degrades back to
    /// Unknown.
    pub fn register_model(&mut self, address: BdAddr, model: DeviceModel) {
        if model != DeviceModel::Unknown {
            self.thermometers.insert(address, model);
        } else {
            self.thermometers.entry(address).or_insert(model);
        }
    }

    pub fn model_of(&self, address: &BdAddr) -> DeviceModel {
        self.thermometers
            .get(address)
            .copied()
            .unwrap_or(DeviceModel::Unknown)
    }

    /// Queue a reading for the next log flush and fold it into the rings.
    pub fn accept_reading(&mut self, address: BdAddr, reading: Reading) {
        self.pending.entry(address).or_default().push_back(reading);
        self.mrtg.entry(address).or_default().update(&reading);
        self.last_reading.insert(address, reading);
    }

    /// Queue a history sample; replayed history feeds the rings but does
    /// not displace the freshest advertisement in the last-reading cache.
    pub fn accept_history(&mut self, address: BdAddr, reading: Reading) {
        self.pending.entry(address).or_default().push_back(reading);
        self.mrtg.entry(address).or_default().update(&reading);
    }

    /// Battery percentage to stamp history records with, from the freshest
    /// advertisement.
    pub fn battery_of(&self, address: &BdAddr) -> i32 {
        self.last_reading
            .get(address)
            .map(|reading| reading.battery)
            .unwrap_or(0)
    }

    pub fn pending_total(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> BdAddr {
        text.parse().unwrap()
    }

    fn valid_reading(time: i64) -> Reading {
        let mut reading = Reading::new(time, 21.0, 50.0, 88);
        reading.model = DeviceModel::H5075;
        reading
    }

    #[test]
    fn register_model_never_degrades() {
        let mut state = AcquisitionState::new();
        let a = addr("A4:C1:38:37:BC:AE");
        state.register_model(a, DeviceModel::H5075);
        state.register_model(a, DeviceModel::Unknown);
        assert_eq!(state.model_of(&a), DeviceModel::H5075);
    }

    #[test]
    fn unknown_devices_are_still_tracked() {
        let mut state = AcquisitionState::new();
        let a = addr("A4:C1:38:37:BC:AE");
        state.register_model(a, DeviceModel::Unknown);
        assert!(state.thermometers.contains_key(&a));
        assert_eq!(state.model_of(&a), DeviceModel::Unknown);
    }

    #[test]
    fn accept_reading_feeds_queue_rings_and_cache() {
        let mut state = AcquisitionState::new();
        let a = addr("A4:C1:38:37:BC:AE");
        state.accept_reading(a, valid_reading(1_000_000));
        state.accept_reading(a, valid_reading(1_000_060));
        assert_eq!(state.pending_total(), 2);
        assert_eq!(state.mrtg[&a].current().unwrap().time, 1_000_060);
        assert_eq!(state.battery_of(&a), 88);
    }

    #[test]
    fn history_does_not_touch_last_reading() {
        let mut state = AcquisitionState::new();
        let a = addr("A4:C1:38:37:BC:AE");
        state.accept_reading(a, valid_reading(1_000_000));
        state.accept_history(a, valid_reading(2_000_000));
        assert_eq!(state.last_reading[&a].time, 1_000_000);
        assert_eq!(state.pending_total(), 2);
    }
}
