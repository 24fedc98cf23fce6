//! # Data-ID Table
//!
//! Data-ids used by the gateway and how their 16-bit values are laid out,
//! following the public OpenTherm 2.2 protocol document.

use serde::Serialize;

use super::decoder::{f88_to_f32, s8_pair, u8_pair};

/// Master and slave status flags (HB master, LB slave)
pub const STATUS: u8 = 0;
/// Control setpoint, CH water temperature (°C)
pub const CH_SETPOINT: u8 = 1;
/// Slave configuration flags / member id
pub const SLAVE_CONFIG: u8 = 3;
/// Remote command (HB command code, LB response code)
pub const COMMAND: u8 = 4;
/// Application-specific fault flags (HB) and OEM fault code (LB)
pub const FAULT_FLAGS: u8 = 5;
/// Maximum relative modulation level setting (%)
pub const MAX_MODULATION: u8 = 14;
/// Room setpoint (°C)
pub const ROOM_SETPOINT: u8 = 16;
/// Relative modulation level (%)
pub const MODULATION: u8 = 17;
/// CH water pressure (bar)
pub const CH_PRESSURE: u8 = 18;
/// Room temperature (°C)
pub const ROOM_TEMPERATURE: u8 = 24;
/// Boiler flow water temperature (°C)
pub const BOILER_TEMPERATURE: u8 = 25;
/// DHW temperature (°C)
pub const DHW_TEMPERATURE: u8 = 26;
/// Outside temperature (°C)
pub const OUTSIDE_TEMPERATURE: u8 = 27;
/// Return water temperature (°C)
pub const RETURN_TEMPERATURE: u8 = 28;
/// DHW setpoint upper/lower bounds (°C)
pub const DHW_SETPOINT_BOUNDS: u8 = 48;
/// Max CH water setpoint upper/lower bounds (°C)
pub const CH_SETPOINT_BOUNDS: u8 = 49;
/// DHW setpoint (°C)
pub const DHW_SETPOINT: u8 = 56;
/// Max CH water setpoint (°C)
pub const MAX_CH_SETPOINT: u8 = 57;
/// OEM-specific diagnostic code
pub const OEM_DIAGNOSTIC_CODE: u8 = 115;
/// OpenTherm protocol version implemented by the master
pub const MASTER_OT_VERSION: u8 = 124;
/// OpenTherm protocol version implemented by the slave
pub const SLAVE_OT_VERSION: u8 = 125;

/// Command code for a boiler lock-out reset
pub const COMMAND_BLOR: u8 = 1;

/// Layout of a data value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// Signed f8.8 fixed point
    F88,
    /// Two flag bytes
    Flags,
    /// Unsigned high and low bytes
    U8Pair,
    /// Signed high and low bytes
    S8Pair,
    /// Plain unsigned 16-bit
    U16,
}

/// Value layout for a data-id
pub fn kind_of(data_id: u8) -> DataKind {
    match data_id {
        STATUS | SLAVE_CONFIG | FAULT_FLAGS => DataKind::Flags,
        COMMAND => DataKind::U8Pair,
        DHW_SETPOINT_BOUNDS | CH_SETPOINT_BOUNDS => DataKind::S8Pair,
        CH_SETPOINT | MAX_MODULATION | ROOM_SETPOINT | MODULATION | CH_PRESSURE
        | ROOM_TEMPERATURE | BOILER_TEMPERATURE | DHW_TEMPERATURE | OUTSIDE_TEMPERATURE
        | RETURN_TEMPERATURE | DHW_SETPOINT | MAX_CH_SETPOINT | MASTER_OT_VERSION
        | SLAVE_OT_VERSION => DataKind::F88,
        _ => DataKind::U16,
    }
}

/// Human-readable name of a data-id, for logs
pub fn name_of(data_id: u8) -> &'static str {
    match data_id {
        STATUS => "Status",
        CH_SETPOINT => "TSet",
        SLAVE_CONFIG => "SConfigSMemberID",
        COMMAND => "Command",
        FAULT_FLAGS => "ASFflags",
        MAX_MODULATION => "MaxRelModLevelSetting",
        ROOM_SETPOINT => "TrSet",
        MODULATION => "RelModLevel",
        CH_PRESSURE => "CHPressure",
        ROOM_TEMPERATURE => "Tr",
        BOILER_TEMPERATURE => "Tboiler",
        DHW_TEMPERATURE => "Tdhw",
        OUTSIDE_TEMPERATURE => "Toutside",
        RETURN_TEMPERATURE => "Tret",
        DHW_SETPOINT_BOUNDS => "TdhwSetUBTdhwSetLB",
        CH_SETPOINT_BOUNDS => "MaxTSetUBMaxTSetLB",
        DHW_SETPOINT => "TdhwSet",
        MAX_CH_SETPOINT => "MaxTSet",
        OEM_DIAGNOSTIC_CODE => "OEMDiagnosticCode",
        MASTER_OT_VERSION => "OpenThermVersionMaster",
        SLAVE_OT_VERSION => "OpenThermVersionSlave",
        _ => "Unknown",
    }
}

/// A decoded data value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataValue {
    /// f8.8 quantity (temperature, percentage, pressure, version)
    Float(f32),
    /// Flag bytes
    Flags { high: u8, low: u8 },
    /// Unsigned byte pair
    Bytes { high: u8, low: u8 },
    /// Signed byte pair
    SignedBytes { high: i8, low: i8 },
    /// Plain 16-bit value
    Unsigned(u16),
}

impl DataValue {
    /// Decode a raw value according to the data-id's layout
    pub fn decode(data_id: u8, raw: u16) -> Self {
        match kind_of(data_id) {
            DataKind::F88 => DataValue::Float(f88_to_f32(raw)),
            DataKind::Flags => {
                let (high, low) = u8_pair(raw);
                DataValue::Flags { high, low }
            }
            DataKind::U8Pair => {
                let (high, low) = u8_pair(raw);
                DataValue::Bytes { high, low }
            }
            DataKind::S8Pair => {
                let (high, low) = s8_pair(raw);
                DataValue::SignedBytes { high, low }
            }
            DataKind::U16 => DataValue::Unsigned(raw),
        }
    }

    /// Value as a float, where the layout has a single numeric reading
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            DataValue::Float(v) => Some(v),
            DataValue::Unsigned(v) => Some(v as f32),
            _ => None,
        }
    }
}

/// Slave status flags (low byte of data-id 0)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlaveStatus {
    pub fault: bool,
    pub ch_active: bool,
    pub dhw_active: bool,
    pub flame: bool,
    pub cooling: bool,
    pub ch2_active: bool,
    pub diagnostic: bool,
}

impl SlaveStatus {
    pub fn from_byte(lb: u8) -> Self {
        Self {
            fault: lb & 0x01 != 0,
            ch_active: lb & 0x02 != 0,
            dhw_active: lb & 0x04 != 0,
            flame: lb & 0x08 != 0,
            cooling: lb & 0x10 != 0,
            ch2_active: lb & 0x20 != 0,
            diagnostic: lb & 0x40 != 0,
        }
    }
}

/// Master status flags (high byte of data-id 0)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MasterStatus {
    pub ch_enable: bool,
    pub dhw_enable: bool,
    pub cooling_enable: bool,
    pub otc_active: bool,
    pub ch2_enable: bool,
}

impl MasterStatus {
    pub fn from_byte(hb: u8) -> Self {
        Self {
            ch_enable: hb & 0x01 != 0,
            dhw_enable: hb & 0x02 != 0,
            cooling_enable: hb & 0x04 != 0,
            otc_active: hb & 0x08 != 0,
            ch2_enable: hb & 0x10 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.ch_enable as u8)
            | (self.dhw_enable as u8) << 1
            | (self.cooling_enable as u8) << 2
            | (self.otc_active as u8) << 3
            | (self.ch2_enable as u8) << 4
    }
}
