//! # Device State
//!
//! Latest decoded value per data-id, shared between the driver (single
//! writer) and any number of readers.
//!
//! Readers load an immutable snapshot of the table; the writer swaps in a
//! modified copy, so a read never waits for a write.

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::error::{OpenThermError, Result};
use crate::protocol::data_id::{DataValue, MasterStatus, SlaveStatus, STATUS};

/// Where a reading came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Acknowledged by the boiler
    Boiler,
    /// Written by the upstream room unit (gateway mode)
    Upstream,
}

/// One stored value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub raw: u16,
    pub value: DataValue,
    pub updated_at: Instant,
    pub valid: bool,
    pub source: Source,
}

/// Shared table of decoded boiler data
#[derive(Debug, Default)]
pub struct DeviceState {
    readings: ArcSwap<HashMap<u8, Reading>>,
    /// Last raw value the room unit wrote, untouched by boiler ACKs
    upstream: ArcSwap<HashMap<u8, u16>>,
    unsupported: ArcSwap<HashSet<u8>>,
    link_fault: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, data_id: u8, raw: u16, source: Source) {
        let reading = Reading {
            raw,
            value: DataValue::decode(data_id, raw),
            updated_at: Instant::now(),
            valid: true,
            source,
        };
        self.readings.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(data_id, reading);
            next
        });
    }

    /// Store a value acknowledged by the boiler
    pub fn update(&self, data_id: u8, raw: u16) {
        self.store(data_id, raw, Source::Boiler);
    }

    /// Store a value written by the upstream master
    pub fn record_upstream(&self, data_id: u8, raw: u16) {
        self.store(data_id, raw, Source::Upstream);
        self.upstream.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(data_id, raw);
            next
        });
    }

    /// What the room unit last wrote for `data_id`
    ///
    /// Unlike [`reading`](Self::reading) this survives later ACKs for the
    /// same id.
    pub fn upstream_raw(&self, data_id: u8) -> Option<u16> {
        self.upstream.load().get(&data_id).copied()
    }

    /// Mark the stored value for `data_id` as no longer trustworthy
    pub fn invalidate(&self, data_id: u8) {
        if !self.readings.load().contains_key(&data_id) {
            return;
        }
        self.readings.rcu(|current| {
            let mut next = HashMap::clone(current);
            if let Some(reading) = next.get_mut(&data_id) {
                reading.valid = false;
            }
            next
        });
    }

    /// Decoded value for `data_id`
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if no valid value has been stored yet
    pub fn read(&self, data_id: u8) -> Result<DataValue> {
        match self.readings.load().get(&data_id) {
            Some(reading) if reading.valid => Ok(reading.value),
            _ => Err(OpenThermError::Unavailable(data_id)),
        }
    }

    /// Full stored record, valid or not
    pub fn reading(&self, data_id: u8) -> Option<Reading> {
        self.readings.load().get(&data_id).copied()
    }

    /// Time since the value was last stored
    pub fn age(&self, data_id: u8) -> Option<Duration> {
        self.reading(data_id).map(|r| r.updated_at.elapsed())
    }

    /// Valid value as a float
    pub fn temperature(&self, data_id: u8) -> Option<f32> {
        self.read(data_id).ok().and_then(|v| v.as_f32())
    }

    /// Valid raw word
    pub fn raw(&self, data_id: u8) -> Option<u16> {
        self.reading(data_id).filter(|r| r.valid).map(|r| r.raw)
    }

    pub fn slave_status(&self) -> Option<SlaveStatus> {
        self.raw(STATUS).map(|raw| SlaveStatus::from_byte((raw & 0xFF) as u8))
    }

    pub fn master_status(&self) -> Option<MasterStatus> {
        self.raw(STATUS).map(|raw| MasterStatus::from_byte((raw >> 8) as u8))
    }

    /// Remember that the boiler answered UNKNOWN-DATAID for `data_id`
    pub fn mark_unsupported(&self, data_id: u8) {
        if self.is_unsupported(data_id) {
            return;
        }
        info!("Boiler does not support data-id {}, skipping it from now on", data_id);
        self.unsupported.rcu(|current| {
            let mut next = HashSet::clone(current);
            next.insert(data_id);
            next
        });
    }

    pub fn is_unsupported(&self, data_id: u8) -> bool {
        self.unsupported.load().contains(&data_id)
    }

    /// Mirror the master session's link health
    pub fn set_link_health(&self, consecutive_failures: u32, fault_latched: bool) {
        self.consecutive_failures.store(consecutive_failures, Ordering::Relaxed);
        self.link_fault.store(fault_latched, Ordering::Relaxed);
    }

    pub fn link_fault(&self) -> bool {
        self.link_fault.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Immutable view of every stored reading
    pub fn snapshot(&self) -> Arc<HashMap<u8, Reading>> {
        self.readings.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::data_id::{BOILER_TEMPERATURE, ROOM_SETPOINT, ROOM_TEMPERATURE};

    #[test]
    fn test_unavailable_before_update() {
        let state = DeviceState::new();
        assert!(matches!(
            state.read(BOILER_TEMPERATURE),
            Err(OpenThermError::Unavailable(BOILER_TEMPERATURE))
        ));
        assert!(state.age(BOILER_TEMPERATURE).is_none());
    }

    #[test]
    fn test_update_then_read() {
        let state = DeviceState::new();
        state.update(BOILER_TEMPERATURE, 0x1900);
        assert_eq!(state.read(BOILER_TEMPERATURE).unwrap(), DataValue::Float(25.0));
        assert_eq!(state.temperature(BOILER_TEMPERATURE), Some(25.0));
        assert_eq!(state.reading(BOILER_TEMPERATURE).unwrap().source, Source::Boiler);
    }

    #[test]
    fn test_upstream_source() {
        let state = DeviceState::new();
        state.record_upstream(ROOM_TEMPERATURE, 0x1480);
        let reading = state.reading(ROOM_TEMPERATURE).unwrap();
        assert_eq!(reading.source, Source::Upstream);
        assert_eq!(state.temperature(ROOM_TEMPERATURE), Some(20.5));
    }

    #[test]
    fn test_upstream_value_survives_ack() {
        let state = DeviceState::new();
        state.record_upstream(ROOM_SETPOINT, 0x1400);
        state.update(ROOM_SETPOINT, 0x1600);

        assert_eq!(state.reading(ROOM_SETPOINT).unwrap().source, Source::Boiler);
        assert_eq!(state.upstream_raw(ROOM_SETPOINT), Some(0x1400));
        assert_eq!(state.upstream_raw(ROOM_TEMPERATURE), None);
    }

    #[test]
    fn test_invalidate() {
        let state = DeviceState::new();
        state.update(BOILER_TEMPERATURE, 0x1900);
        state.invalidate(BOILER_TEMPERATURE);
        assert!(state.read(BOILER_TEMPERATURE).is_err());
        // Record is kept, flagged invalid
        assert!(!state.reading(BOILER_TEMPERATURE).unwrap().valid);

        state.update(BOILER_TEMPERATURE, 0x1A00);
        assert_eq!(state.temperature(BOILER_TEMPERATURE), Some(26.0));
    }

    #[test]
    fn test_invalidate_missing_is_noop() {
        let state = DeviceState::new();
        state.invalidate(BOILER_TEMPERATURE);
        assert!(state.reading(BOILER_TEMPERATURE).is_none());
    }

    #[test]
    fn test_status_helpers() {
        let state = DeviceState::new();
        assert!(state.slave_status().is_none());

        state.update(STATUS, 0x030A);
        let slave = state.slave_status().unwrap();
        assert!(slave.ch_active);
        assert!(slave.flame);
        assert!(!slave.fault);
        let master = state.master_status().unwrap();
        assert!(master.ch_enable);
        assert!(master.dhw_enable);
    }

    #[test]
    fn test_unsupported_ids() {
        let state = DeviceState::new();
        assert!(!state.is_unsupported(115));
        state.mark_unsupported(115);
        state.mark_unsupported(115);
        assert!(state.is_unsupported(115));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let state = DeviceState::new();
        state.update(BOILER_TEMPERATURE, 0x1900);
        let before = state.snapshot();
        state.update(BOILER_TEMPERATURE, 0x2000);
        assert_eq!(before[&BOILER_TEMPERATURE].raw, 0x1900);
        assert_eq!(state.raw(BOILER_TEMPERATURE), Some(0x2000));
    }

    #[test]
    fn test_link_health_mirror() {
        let state = DeviceState::new();
        state.set_link_health(5, true);
        assert!(state.link_fault());
        assert_eq!(state.consecutive_failures(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_advances() {
        let state = DeviceState::new();
        state.update(BOILER_TEMPERATURE, 0x1900);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(state.age(BOILER_TEMPERATURE).unwrap() >= Duration::from_secs(3));
    }
}
