//! # Climate Module
//!
//! Per-zone setpoint control on top of the request queue.
//!
//! This module handles:
//! - OFF / HEAT / AUTO mode per zone
//! - Coalescing setpoint writes (one outstanding write per zone)
//! - Verifying the boiler's accepted setpoint
//! - Gateway overrides of the upstream room unit

pub mod controller;
pub mod override_policy;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::data_id::{
    BOILER_TEMPERATURE, CH_SETPOINT, DHW_SETPOINT, DHW_TEMPERATURE, ROOM_SETPOINT,
    ROOM_TEMPERATURE,
};

pub use controller::ClimateController;

/// The two zones an OpenTherm boiler controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    HotWater,
    HeatingWater,
}

impl ZoneKind {
    /// Data-id the zone's target is written to
    pub fn setpoint_id(self, gateway: bool) -> u8 {
        match (self, gateway) {
            (ZoneKind::HotWater, _) => DHW_SETPOINT,
            (ZoneKind::HeatingWater, false) => CH_SETPOINT,
            (ZoneKind::HeatingWater, true) => ROOM_SETPOINT,
        }
    }

    /// Data-ids the current temperature is read from, in order of preference
    pub fn current_ids(self, gateway: bool) -> &'static [u8] {
        match (self, gateway) {
            (ZoneKind::HotWater, _) => &[DHW_TEMPERATURE],
            (ZoneKind::HeatingWater, false) => &[BOILER_TEMPERATURE],
            (ZoneKind::HeatingWater, true) => &[ROOM_TEMPERATURE, BOILER_TEMPERATURE],
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneKind::HotWater => f.write_str("hot_water"),
            ZoneKind::HeatingWater => f.write_str("heating_water"),
        }
    }
}

/// Zone operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClimateMode {
    Off,
    #[default]
    Heat,
    Auto,
}

/// What a zone reports after a refresh
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneReadback {
    pub zone: ZoneKind,
    pub mode: ClimateMode,
    pub target: Option<f32>,
    pub current: Option<f32>,
    pub active: bool,
    pub write_pending: bool,
    pub override_active: bool,
}
