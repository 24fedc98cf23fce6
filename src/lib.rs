//! # OpenTherm Gateway Library
//!
//! OpenTherm master/slave protocol engine with hot-water and heating
//! thermostats.
//!
//! This library polls an OpenTherm boiler over a GPIO line pair, keeps the
//! decoded device state, and drives setpoint writes from two virtual
//! thermostats. In gateway mode it also answers an upstream room unit on
//! the second pair.

pub mod boiler;
pub mod climate;
pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod session;
pub mod state;
pub mod telemetry;
