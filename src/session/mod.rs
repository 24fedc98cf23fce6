//! # Session Module
//!
//! Transaction layer on top of the bit links.
//!
//! This module handles:
//! - The shared request queue (ordering, cancellation, outcomes)
//! - Master transactions with the boiler (timeouts, retries, fault latch)
//! - Answering an upstream room unit in gateway mode

pub mod master;
pub mod request;
pub mod slave;

pub use master::{MasterSession, TransactionReport, TransactionStats};
pub use request::{FailureReason, Outcome, Request, RequestId, RequestQueue, RequestStatus};
pub use slave::{SlaveSession, UpstreamExchange};
