//! Virtual thermostat for one zone
//!
//! A controller never touches the line. It enqueues tracked writes into the
//! shared queue and reads feedback from the device state, keeping at most one
//! write per zone outstanding.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::override_policy::{rewrite_ch_setpoint, setpoints_match, Override};
use super::{ClimateMode, ZoneKind, ZoneReadback};
use crate::config::{GatewayConfig, ZoneConfig};
use crate::error::{OpenThermError, Result};
use crate::protocol::data_id::{CH_SETPOINT, OUTSIDE_TEMPERATURE, ROOM_TEMPERATURE};
use crate::protocol::decoder::f88_to_f32;
use crate::protocol::encoder::{f88_from_f32, write_request};
use crate::protocol::frame::{Frame, MessageType};
use crate::session::request::{FailureReason, Request, RequestId, RequestQueue, RequestStatus};
use crate::state::{DeviceState, Source};

/// Accepted setpoint further than this from the request is logged
const ACCEPT_TOLERANCE: f32 = 1.0;

/// Boiler readback further than this from the target is re-written
const DRIFT_TOLERANCE: f32 = 0.5;

/// Setpoint control for one zone
#[derive(Debug)]
pub struct ClimateController {
    kind: ZoneKind,
    gateway: bool,
    mode: ClimateMode,
    target: Option<f32>,
    /// Latest target not yet handed to the queue
    desired: Option<f32>,
    pending: Option<(RequestId, f32)>,
    min_temperature: f32,
    max_temperature: f32,
    active_override: Option<Override>,
    override_timeout: Duration,
    queue: RequestQueue,
    state: Arc<DeviceState>,
}

impl ClimateController {
    pub fn new(
        kind: ZoneKind,
        zone: &ZoneConfig,
        gateway: &GatewayConfig,
        queue: RequestQueue,
        state: Arc<DeviceState>,
    ) -> Self {
        let (min_temperature, max_temperature) = zone.limits(kind, gateway.enabled);
        Self {
            kind,
            gateway: gateway.enabled,
            mode: zone.mode,
            target: zone.initial_target,
            desired: zone.initial_target,
            pending: None,
            min_temperature,
            max_temperature,
            active_override: None,
            override_timeout: gateway.override_timeout(),
            queue,
            state,
        }
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn mode(&self) -> ClimateMode {
        self.mode
    }

    pub fn target(&self) -> Option<f32> {
        self.target
    }

    pub fn is_override_active(&self) -> bool {
        self.active_override.is_some()
    }

    /// Whether the zone's enable flag is set in the master status
    pub fn enable_flag(&self) -> bool {
        self.mode != ClimateMode::Off
    }

    fn setpoint_id(&self) -> u8 {
        self.kind.setpoint_id(self.gateway)
    }

    /// Request a new target temperature
    ///
    /// AUTO switches to HEAT. In OFF the target is kept and written once the
    /// zone is switched back on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCommand` if the value is outside the zone's limits
    pub fn set_target_temperature(&mut self, value: f32) -> Result<()> {
        if !value.is_finite() || value < self.min_temperature || value > self.max_temperature {
            return Err(OpenThermError::InvalidCommand(format!(
                "{} target {} outside {}..={}",
                self.kind, value, self.min_temperature, self.max_temperature
            )));
        }

        if self.mode == ClimateMode::Auto {
            info!("{} switched from auto to heat by a target change", self.kind);
            self.mode = ClimateMode::Heat;
        }

        if self.gateway && !self.update_override(value) && self.pending.is_none() {
            // The boiler already runs on the room unit's matching value
            self.target = Some(value);
            self.desired = None;
            return Ok(());
        }

        self.target = Some(value);
        self.desired = Some(value);
        self.flush();
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ClimateMode) {
        if self.mode == mode {
            return;
        }
        info!("{} mode {:?} -> {:?}", self.kind, self.mode, mode);
        self.mode = mode;

        match mode {
            ClimateMode::Heat if self.desired.is_none() && self.pending.is_none() => {
                self.desired = self.target;
            }
            ClimateMode::Auto => {
                self.desired = None;
                self.active_override = None;
            }
            _ => {}
        }
        self.flush();
    }

    /// Start or release the override against the upstream room unit
    ///
    /// Returns whether an override is active afterwards.
    fn update_override(&mut self, value: f32) -> bool {
        let upstream = self.state.upstream_raw(self.setpoint_id()).map(f88_to_f32);

        match upstream {
            Some(upstream) if setpoints_match(self.kind, upstream, value) => {
                if self.active_override.take().is_some() {
                    info!("{} override released, room unit already at {}", self.kind, upstream);
                }
                false
            }
            _ => {
                warn!(
                    "{} override to {} (room unit {:?}) for up to {:?}",
                    self.kind, value, upstream, self.override_timeout
                );
                self.active_override = Some(Override::new(value));
                true
            }
        }
    }

    /// Hand the coalesced target to the queue if nothing is outstanding
    fn flush(&mut self) {
        if self.mode == ClimateMode::Off || self.pending.is_some() {
            return;
        }
        let Some(value) = self.desired.take() else {
            return;
        };

        let data_id = self.setpoint_id();
        let id = self.queue.enqueue(Request::write(data_id, f88_from_f32(value)));
        debug!("{} write {} queued as {}", self.kind, value, id);
        self.pending = Some((id, value));
    }

    fn resolve_pending(&mut self) {
        let Some((id, requested)) = self.pending else {
            return;
        };

        match self.queue.take_outcome(id) {
            Some(RequestStatus::Queued) | Some(RequestStatus::InFlight) => {}
            Some(RequestStatus::Done(response)) => {
                self.pending = None;
                let accepted = f88_to_f32(response.data_value());
                if (accepted - requested).abs() > ACCEPT_TOLERANCE {
                    warn!(
                        "{} setpoint {} accepted as {} by the boiler",
                        self.kind, requested, accepted
                    );
                }
                if self.desired.is_none() {
                    self.target = Some(accepted);
                }
            }
            Some(RequestStatus::Failed(reason)) => {
                self.pending = None;
                warn!("{} setpoint write {} failed: {}", self.kind, requested, reason);
                let retry = !matches!(reason, FailureReason::UnknownDataId | FailureReason::Cancelled);
                if retry && self.desired.is_none() {
                    self.desired = Some(requested);
                }
            }
            None => self.pending = None,
        }
    }

    /// Resolve the outstanding write and read feedback from the device state
    pub fn refresh(&mut self) -> ZoneReadback {
        self.resolve_pending();

        let readback = self.state.temperature(self.setpoint_id());
        match self.mode {
            ClimateMode::Auto => {
                if readback.is_some() {
                    self.target = readback;
                }
            }
            ClimateMode::Heat if !self.gateway => {
                let idle = self.pending.is_none() && self.desired.is_none();
                let from_boiler = self
                    .state
                    .reading(self.setpoint_id())
                    .is_some_and(|r| r.source == Source::Boiler);
                if let (Some(target), Some(actual)) = (self.target, readback) {
                    if idle && from_boiler && (actual - target).abs() > DRIFT_TOLERANCE {
                        info!("{} boiler reports {}, re-asserting {}", self.kind, actual, target);
                        self.desired = Some(target);
                    }
                }
            }
            _ => {}
        }

        if self
            .active_override
            .is_some_and(|o| o.is_expired(self.override_timeout))
        {
            info!("{} override expired", self.kind);
            self.active_override = None;
        }

        self.flush();
        self.readback()
    }

    pub fn readback(&self) -> ZoneReadback {
        let current = self
            .kind
            .current_ids(self.gateway)
            .iter()
            .find_map(|id| self.state.temperature(*id));
        let active = self.state.slave_status().is_some_and(|s| match self.kind {
            ZoneKind::HotWater => s.dhw_active,
            ZoneKind::HeatingWater => s.ch_active,
        });

        ZoneReadback {
            zone: self.kind,
            mode: self.mode,
            target: self.target,
            current,
            active,
            write_pending: self.pending.is_some() || self.desired.is_some(),
            override_active: self.active_override.is_some(),
        }
    }

    /// Apply an active override to a write from the upstream room unit
    ///
    /// Frames this zone has no say over are returned unchanged.
    pub fn rewrite_upstream(&mut self, frame: Frame) -> Frame {
        if !self.gateway || frame.msg_type() != MessageType::WriteData {
            return frame;
        }
        if self
            .active_override
            .is_some_and(|o| o.is_expired(self.override_timeout))
        {
            info!("{} override expired", self.kind);
            self.active_override = None;
        }
        let Some(active) = self.active_override else {
            return frame;
        };

        let upstream = f88_to_f32(frame.data_value());
        if frame.data_id() == self.setpoint_id() {
            if setpoints_match(self.kind, upstream, active.target) {
                info!("{} override released, room unit set {}", self.kind, upstream);
                self.active_override = None;
                return frame;
            }
            debug!("{} upstream setpoint {} rewritten to {}", self.kind, upstream, active.target);
            return write_request(frame.data_id(), f88_from_f32(active.target));
        }

        if self.kind == ZoneKind::HeatingWater && frame.data_id() == CH_SETPOINT {
            let room = self.state.temperature(ROOM_TEMPERATURE);
            let outdoor = self.state.temperature(OUTSIDE_TEMPERATURE);
            let value = rewrite_ch_setpoint(upstream, room, active.target, outdoor);
            if value != upstream {
                debug!("Upstream TSet {} rewritten to {}", upstream, value);
                return write_request(CH_SETPOINT, f88_from_f32(value));
            }
        }
        frame
    }

    /// Withdraw the outstanding write if it has not been sent yet
    pub fn cancel_pending(&mut self) -> bool {
        self.desired = None;
        match self.pending {
            Some((id, _)) if self.queue.cancel(id) => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
