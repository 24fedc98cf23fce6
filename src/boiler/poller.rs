//! Poll planning
//!
//! Decides which reads go into the queue at startup and on each cycle.
//! Room temperature and room setpoint are never polled; they only arrive
//! from upstream writes.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PollingConfig;
use crate::protocol::data_id::*;
use crate::protocol::frame::MessageType;
use crate::session::request::{Request, RequestQueue};
use crate::state::DeviceState;

/// Read once when the driver starts
pub const STARTUP_IDS: [u8; 6] = [
    MAX_CH_SETPOINT,
    MAX_MODULATION,
    MASTER_OT_VERSION,
    SLAVE_OT_VERSION,
    CH_SETPOINT_BOUNDS,
    DHW_SETPOINT_BOUNDS,
];

/// Read every cycle, after Status
pub const CYCLE_IDS: [u8; 8] = [
    BOILER_TEMPERATURE,
    RETURN_TEMPERATURE,
    OUTSIDE_TEMPERATURE,
    CH_PRESSURE,
    MODULATION,
    CH_SETPOINT,
    DHW_TEMPERATURE,
    DHW_SETPOINT,
];

/// Read only while the boiler reports a fault or diagnostic event
pub const DIAGNOSTIC_IDS: [u8; 2] = [FAULT_FLAGS, OEM_DIAGNOSTIC_CODE];

#[derive(Debug, Clone)]
pub struct PollPlan {
    min_refresh: Duration,
    expire_after: Duration,
}

impl PollPlan {
    pub fn new(config: &PollingConfig) -> Self {
        Self {
            min_refresh: config.min_refresh(),
            expire_after: config.update_interval(),
        }
    }

    fn poll_read(&self, data_id: u8) -> Request {
        Request::read(data_id)
            .untracked()
            .expires_at(Instant::now() + self.expire_after)
    }

    pub fn startup(&self, state: &DeviceState) -> Vec<Request> {
        STARTUP_IDS
            .iter()
            .filter(|id| !state.is_unsupported(**id))
            .map(|id| self.poll_read(*id))
            .collect()
    }

    /// Reads for one cycle, Status first
    pub fn cycle(&self, state: &DeviceState, queue: &RequestQueue, master: MasterStatus) -> Vec<Request> {
        let mut requests = Vec::with_capacity(1 + CYCLE_IDS.len() + DIAGNOSTIC_IDS.len());

        if !queue.contains(MessageType::ReadData, STATUS) {
            let flags = u16::from(master.to_byte()) << 8;
            requests.push(self.poll_read(STATUS).with_value(flags));
        }

        let diagnostics = state
            .slave_status()
            .is_some_and(|status| status.fault || status.diagnostic);
        let extra: &[u8] = if diagnostics { &DIAGNOSTIC_IDS } else { &[] };

        for &id in CYCLE_IDS.iter().chain(extra) {
            if state.is_unsupported(id) || queue.contains(MessageType::ReadData, id) {
                continue;
            }
            let fresh = state
                .reading(id)
                .is_some_and(|r| r.valid && r.updated_at.elapsed() < self.min_refresh);
            if fresh {
                continue;
            }
            requests.push(self.poll_read(id));
        }
        requests
    }

    pub fn schedule_startup(&self, state: &DeviceState, queue: &RequestQueue) -> usize {
        let requests = self.startup(state);
        let count = requests.len();
        for request in requests {
            queue.enqueue(request);
        }
        count
    }

    pub fn schedule_cycle(&self, state: &DeviceState, queue: &RequestQueue, master: MasterStatus) -> usize {
        let requests = self.cycle(state, queue, master);
        let count = requests.len();
        for request in requests {
            queue.enqueue(request);
        }
        debug!("Poll cycle: {} reads queued", count);
        count
    }
}
