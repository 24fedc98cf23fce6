//! Published view of the boiler

use serde::Serialize;
use std::time::Duration;

use super::poller::{DIAGNOSTIC_IDS, STARTUP_IDS};
use crate::climate::ZoneReadback;
use crate::protocol::data_id::*;
use crate::protocol::decoder::s8_pair;
use crate::session::master::TransactionStats;
use crate::state::DeviceState;

/// Sensor name and the data-id it is read from, for staleness checks
const SENSOR_IDS: [(&str, u8); 18] = [
    ("external_temperature", OUTSIDE_TEMPERATURE),
    ("return_temperature", RETURN_TEMPERATURE),
    ("boiler_temperature", BOILER_TEMPERATURE),
    ("pressure", CH_PRESSURE),
    ("modulation", MODULATION),
    ("heating_target_temperature", CH_SETPOINT),
    ("max_ch_setpoint", MAX_CH_SETPOINT),
    ("min_ch_setpoint", CH_SETPOINT_BOUNDS),
    ("max_modulation", MAX_MODULATION),
    ("oem_fault_code", FAULT_FLAGS),
    ("oem_diagnostic_code", OEM_DIAGNOSTIC_CODE),
    ("master_ot_version", MASTER_OT_VERSION),
    ("slave_ot_version", SLAVE_OT_VERSION),
    ("room_temperature", ROOM_TEMPERATURE),
    ("room_setpoint", ROOM_SETPOINT),
    ("dhw_temperature", DHW_TEMPERATURE),
    ("dhw_setpoint", DHW_SETPOINT),
    ("flame", STATUS),
];

/// Everything the gateway reports, as of one moment
///
/// Field names double as sensor names in the `[sensors]` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoilerSnapshot {
    pub external_temperature: Option<f32>,
    pub return_temperature: Option<f32>,
    pub boiler_temperature: Option<f32>,
    /// bar
    pub pressure: Option<f32>,
    /// percent
    pub modulation: Option<f32>,
    pub heating_target_temperature: Option<f32>,
    pub max_ch_setpoint: Option<f32>,
    pub min_ch_setpoint: Option<f32>,
    pub max_modulation: Option<f32>,
    pub oem_fault_code: Option<u8>,
    pub oem_diagnostic_code: Option<u16>,
    pub master_ot_version: Option<f32>,
    pub slave_ot_version: Option<f32>,
    pub room_temperature: Option<f32>,
    pub room_setpoint: Option<f32>,
    pub dhw_temperature: Option<f32>,
    pub dhw_setpoint: Option<f32>,
    pub flame: Option<bool>,
    pub ch_active: Option<bool>,
    pub dhw_active: Option<bool>,
    /// Boiler fault flag or latched link fault
    pub fault: bool,
    pub diagnostic: Option<bool>,
    pub link_fault: bool,
    pub consecutive_failures: u32,
    /// Sensors whose value is older than the staleness limit
    pub stale: Vec<&'static str>,
    pub stats: TransactionStats,
    pub zones: Vec<ZoneReadback>,
}

impl BoilerSnapshot {
    pub fn capture(
        state: &DeviceState,
        stats: TransactionStats,
        zones: Vec<ZoneReadback>,
        stale_after: Duration,
    ) -> Self {
        let status = state.slave_status();
        let link_fault = state.link_fault();
        // Diagnostic ids are only read while this holds
        let reporting = status.is_some_and(|s| s.fault || s.diagnostic);

        // Startup ids are read once, so their age says nothing
        let stale = SENSOR_IDS
            .iter()
            .filter(|(_, id)| !STARTUP_IDS.contains(id))
            .filter(|(_, id)| reporting || !DIAGNOSTIC_IDS.contains(id))
            .filter(|(_, id)| state.age(*id).is_some_and(|age| age > stale_after))
            .map(|(name, _)| *name)
            .collect();

        let (oem_fault_code, oem_diagnostic_code) = match status {
            Some(_) if !reporting => (Some(0), Some(0)),
            _ => (
                state.raw(FAULT_FLAGS).map(|raw| (raw & 0xFF) as u8),
                state.raw(OEM_DIAGNOSTIC_CODE),
            ),
        };

        Self {
            external_temperature: state.temperature(OUTSIDE_TEMPERATURE),
            return_temperature: state.temperature(RETURN_TEMPERATURE),
            boiler_temperature: state.temperature(BOILER_TEMPERATURE),
            pressure: state.temperature(CH_PRESSURE),
            modulation: state.temperature(MODULATION),
            heating_target_temperature: state.temperature(CH_SETPOINT),
            max_ch_setpoint: state.temperature(MAX_CH_SETPOINT),
            min_ch_setpoint: state
                .raw(CH_SETPOINT_BOUNDS)
                .map(|raw| f32::from(s8_pair(raw).1)),
            max_modulation: state.temperature(MAX_MODULATION),
            oem_fault_code,
            oem_diagnostic_code,
            master_ot_version: state.temperature(MASTER_OT_VERSION),
            slave_ot_version: state.temperature(SLAVE_OT_VERSION),
            room_temperature: state.temperature(ROOM_TEMPERATURE),
            room_setpoint: state.temperature(ROOM_SETPOINT),
            dhw_temperature: state.temperature(DHW_TEMPERATURE),
            dhw_setpoint: state.temperature(DHW_SETPOINT),
            flame: status.map(|s| s.flame),
            ch_active: status.map(|s| s.ch_active),
            dhw_active: status.map(|s| s.dhw_active),
            fault: status.is_some_and(|s| s.fault) || link_fault,
            diagnostic: status.map(|s| s.diagnostic),
            link_fault,
            consecutive_failures: state.consecutive_failures(),
            stale,
            stats,
            zones,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encoder::{f88_from_f32, u8_pair};

    fn capture(state: &DeviceState) -> BoilerSnapshot {
        BoilerSnapshot::capture(state, TransactionStats::default(), Vec::new(), Duration::from_secs(60))
    }

    #[test]
    fn test_empty_state() {
        let snapshot = capture(&DeviceState::new());
        assert_eq!(snapshot.boiler_temperature, None);
        assert_eq!(snapshot.flame, None);
        assert!(!snapshot.fault);
        assert!(snapshot.stale.is_empty());
    }

    #[test]
    fn test_decoded_values() {
        let state = DeviceState::new();
        state.update(BOILER_TEMPERATURE, f88_from_f32(45.5));
        state.update(CH_PRESSURE, f88_from_f32(1.5));
        state.update(CH_SETPOINT_BOUNDS, u8_pair(80, 25));
        state.update(FAULT_FLAGS, u8_pair(0x01, 42));
        state.update(OEM_DIAGNOSTIC_CODE, 1234);
        // Fault, CH active, flame
        state.update(STATUS, 0x000B);

        let snapshot = capture(&state);
        assert_eq!(snapshot.boiler_temperature, Some(45.5));
        assert_eq!(snapshot.pressure, Some(1.5));
        assert_eq!(snapshot.min_ch_setpoint, Some(25.0));
        assert_eq!(snapshot.oem_fault_code, Some(42));
        assert_eq!(snapshot.oem_diagnostic_code, Some(1234));
        assert_eq!(snapshot.flame, Some(true));
        assert_eq!(snapshot.ch_active, Some(true));
        assert_eq!(snapshot.dhw_active, Some(false));
    }

    #[test]
    fn test_fault_includes_link_fault() {
        let state = DeviceState::new();
        state.update(STATUS, 0x0000);
        assert!(!capture(&state).fault);

        state.set_link_health(5, true);
        let snapshot = capture(&state);
        assert!(snapshot.fault);
        assert!(snapshot.link_fault);
        assert_eq!(snapshot.consecutive_failures, 5);

        state.set_link_health(0, false);
        state.update(STATUS, 0x0001);
        assert!(capture(&state).fault);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_readings_flagged() {
        let state = DeviceState::new();
        state.update(BOILER_TEMPERATURE, f88_from_f32(45.0));
        tokio::time::advance(Duration::from_secs(61)).await;
        state.update(RETURN_TEMPERATURE, f88_from_f32(38.0));

        let snapshot = capture(&state);
        assert_eq!(snapshot.stale, vec!["boiler_temperature"]);
        // Stale values are still reported
        assert_eq!(snapshot.boiler_temperature, Some(45.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_once_ids_never_stale() {
        let state = DeviceState::new();
        for id in STARTUP_IDS {
            state.update(id, 0x0100);
        }
        state.update(FAULT_FLAGS, 0);
        state.update(OEM_DIAGNOSTIC_CODE, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        state.update(STATUS, 0x000A);
        state.update(BOILER_TEMPERATURE, f88_from_f32(45.0));

        assert!(capture(&state).stale.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostic_ids_stale_while_fault_active() {
        let state = DeviceState::new();
        state.update(FAULT_FLAGS, u8_pair(0x01, 42));
        tokio::time::advance(Duration::from_secs(61)).await;
        state.update(STATUS, 0x0001);

        assert_eq!(capture(&state).stale, vec!["oem_fault_code"]);
    }

    #[test]
    fn test_codes_zero_without_fault() {
        let state = DeviceState::new();
        state.update(FAULT_FLAGS, u8_pair(0x01, 42));
        state.update(OEM_DIAGNOSTIC_CODE, 1234);
        state.update(STATUS, 0x0001);
        assert_eq!(capture(&state).oem_fault_code, Some(42));

        // Fault cleared, the stored codes are left over from it
        state.update(STATUS, 0x0000);
        let snapshot = capture(&state);
        assert_eq!(snapshot.oem_fault_code, Some(0));
        assert_eq!(snapshot.oem_diagnostic_code, Some(0));
    }
}
