//! Gateway override rules
//!
//! While a user override is active the gateway rewrites the room unit's
//! setpoint writes before they reach the boiler. Room setpoint and DHW
//! setpoint writes are replaced by the user's target. Control setpoint
//! (TSet) writes follow a simple weather-compensated curve:
//!
//! - room warmer than target + 0.2 °C: send 20 °C water (burner idles)
//! - room colder than target − 0.5 °C: `25 + 1.4 × (20 − outdoor)`, clamped
//!   to 25–75 °C
//! - otherwise: keep the room unit's value

use std::time::Duration;
use tokio::time::Instant;

use super::ZoneKind;

/// Upstream DHW setpoint closer than this to the user target releases the override
pub const DHW_TOLERANCE: f32 = 0.5;
/// Upstream room setpoint closer than this to the user target releases the override
pub const ROOM_TOLERANCE: f32 = 0.3;

const ROOM_ABOVE_MARGIN: f32 = 0.2;
const ROOM_BELOW_MARGIN: f32 = 0.5;
const IDLE_WATER_TEMPERATURE: f32 = 20.0;
const CURVE_BASE: f32 = 25.0;
const CURVE_SLOPE: f32 = 1.4;
const CURVE_REFERENCE_OUTDOOR: f32 = 20.0;
const CURVE_MIN: f32 = 25.0;
const CURVE_MAX: f32 = 75.0;

/// An active user override
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Override {
    pub target: f32,
    pub started: Instant,
}

impl Override {
    pub fn new(target: f32) -> Self {
        Self {
            target,
            started: Instant::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.started.elapsed() >= timeout
    }
}

/// Difference below which an upstream setpoint counts as equal to the user's
pub fn tolerance(zone: ZoneKind) -> f32 {
    match zone {
        ZoneKind::HotWater => DHW_TOLERANCE,
        ZoneKind::HeatingWater => ROOM_TOLERANCE,
    }
}

pub fn setpoints_match(zone: ZoneKind, upstream: f32, user: f32) -> bool {
    (upstream - user).abs() < tolerance(zone)
}

/// Water temperature for an outdoor temperature
///
/// # Examples
///
/// ```
/// use opentherm_gateway::climate::override_policy::heating_curve;
///
/// assert_eq!(heating_curve(0.0), 53.0);
/// assert_eq!(heating_curve(25.0), 25.0);
/// assert_eq!(heating_curve(-30.0), 75.0);
/// ```
pub fn heating_curve(outdoor: f32) -> f32 {
    (CURVE_BASE + CURVE_SLOPE * (CURVE_REFERENCE_OUTDOOR - outdoor)).clamp(CURVE_MIN, CURVE_MAX)
}

/// Control setpoint to send instead of the room unit's `upstream` value
pub fn rewrite_ch_setpoint(
    upstream: f32,
    room: Option<f32>,
    room_target: f32,
    outdoor: Option<f32>,
) -> f32 {
    match room {
        Some(room) if room > room_target + ROOM_ABOVE_MARGIN => IDLE_WATER_TEMPERATURE,
        Some(room) if room < room_target - ROOM_BELOW_MARGIN => {
            outdoor.map(heating_curve).unwrap_or(upstream)
        }
        _ => upstream,
    }
}
