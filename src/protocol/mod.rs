//! # OpenTherm Protocol Module
//!
//! Implementation of the OpenTherm frame format.
//!
//! This module handles:
//! - 32-bit frame layout (message type, data-id, data value)
//! - Even parity calculation and checking
//! - f8.8 fixed-point and byte-pair value codecs
//! - The data-id table for the parameters the gateway uses

pub mod frame;
pub mod encoder;
pub mod decoder;
pub mod parity;
pub mod data_id;
