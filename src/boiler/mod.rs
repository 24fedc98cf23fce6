//! # Boiler Module
//!
//! The driver task that owns the master session.
//!
//! This module handles:
//! - Startup reads and the periodic poll cycle
//! - Routing upstream room unit traffic in gateway mode
//! - Commands from any number of [`BoilerHandle`] clones
//! - Publishing [`BoilerSnapshot`]s on a watch channel

pub mod poller;
pub mod snapshot;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::climate::{ClimateController, ClimateMode, ZoneKind};
use crate::config::Config;
use crate::error::{OpenThermError, Result};
use crate::link::{BitLink, LineIo};
use crate::protocol::data_id::{MasterStatus, COMMAND, COMMAND_BLOR, STATUS};
use crate::protocol::encoder::{encode, u8_pair};
use crate::protocol::frame::{Frame, MessageType};
use crate::session::master::MasterSession;
use crate::session::request::{Request, RequestQueue};
use crate::session::slave::UpstreamExchange;
use crate::state::DeviceState;

pub use poller::PollPlan;
pub use snapshot::BoilerSnapshot;

const COMMAND_CHANNEL_SIZE: usize = 32;

/// Whether a WRITE-ACK to the BLOR command reports a successful reset
pub fn reset_succeeded(response: Frame) -> bool {
    response.low_byte() >= 128 || response.high_byte() == COMMAND_BLOR
}

/// Messages from [`BoilerHandle`] to the driver
#[derive(Debug)]
pub enum Command {
    SetTarget {
        zone: ZoneKind,
        value: f32,
        reply: oneshot::Sender<Result<()>>,
    },
    SetMode {
        zone: ZoneKind,
        mode: ClimateMode,
        reply: oneshot::Sender<Result<()>>,
    },
    ResetBoiler {
        reply: oneshot::Sender<Result<bool>>,
    },
    ClearFault {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end to a running [`Boiler`]
#[derive(Debug, Clone)]
pub struct BoilerHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<BoilerSnapshot>,
}

impl BoilerHandle {
    async fn request<T>(&self, command: Command, reply: oneshot::Receiver<T>) -> Result<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| OpenThermError::ChannelClosed("boiler driver"))?;
        reply
            .await
            .map_err(|_| OpenThermError::ChannelClosed("boiler driver"))
    }

    /// # Errors
    ///
    /// - `InvalidCommand` if the zone is not configured or the value is out of range
    /// - `ChannelClosed` if the driver has stopped
    pub async fn set_target_temperature(&self, zone: ZoneKind, value: f32) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetTarget { zone, value, reply }, rx).await?
    }

    pub async fn set_mode(&self, zone: ZoneKind, mode: ClimateMode) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SetMode { zone, mode, reply }, rx).await?
    }

    /// Send a boiler lock-out reset and wait for the boiler's answer
    ///
    /// Returns whether the boiler reports the reset as done.
    pub async fn reset_boiler(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ResetBoiler { reply }, rx).await?
    }

    pub async fn clear_fault(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ClearFault { reply }, rx).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> BoilerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BoilerSnapshot> {
        self.snapshots.clone()
    }
}

/// What woke the driver while it was idle
enum Wake {
    Shutdown,
    Upstream(UpstreamExchange),
    UpstreamClosed,
    Command(Command),
    CommandsClosed,
    Tick,
    Queued,
}

async fn recv_upstream(
    upstream: &mut Option<mpsc::Receiver<UpstreamExchange>>,
) -> Option<UpstreamExchange> {
    match upstream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Driver task owning the master side of the link
pub struct Boiler<L: LineIo> {
    session: MasterSession<L>,
    zones: Vec<ClimateController>,
    plan: PollPlan,
    gateway: bool,
    update_interval: Duration,
    stale_after: Duration,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    upstream: Option<mpsc::Receiver<UpstreamExchange>>,
    snapshots: watch::Sender<BoilerSnapshot>,
    cycle_active: bool,
}

impl<L: LineIo> Boiler<L> {
    pub fn new(line: L, config: &Config, state: Arc<DeviceState>) -> (Self, BoilerHandle) {
        let queue = RequestQueue::new();
        let session = MasterSession::new(BitLink::new(line), queue.clone(), state.clone(), &config.master);

        let zones = [ZoneKind::HotWater, ZoneKind::HeatingWater]
            .into_iter()
            .filter(|kind| config.climate.zone(*kind).enabled)
            .map(|kind| {
                ClimateController::new(
                    kind,
                    config.climate.zone(kind),
                    &config.gateway,
                    queue.clone(),
                    state.clone(),
                )
            })
            .collect();

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (snapshot_tx, snapshot_rx) = watch::channel(BoilerSnapshot::default());

        let boiler = Self {
            session,
            zones,
            plan: PollPlan::new(&config.polling),
            gateway: config.gateway.enabled,
            update_interval: config.polling.update_interval(),
            stale_after: config.polling.stale_after(),
            commands: command_rx,
            commands_open: true,
            upstream: None,
            snapshots: snapshot_tx,
            cycle_active: false,
        };
        let handle = BoilerHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        };
        (boiler, handle)
    }

    /// Receive frames from a slave session
    pub fn with_upstream(mut self, upstream: mpsc::Receiver<UpstreamExchange>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        self.session.state()
    }

    pub fn session(&self) -> &MasterSession<L> {
        &self.session
    }

    fn zone_mut(&mut self, kind: ZoneKind) -> Result<&mut ClimateController> {
        self.zones
            .iter_mut()
            .find(|zone| zone.kind() == kind)
            .ok_or_else(|| OpenThermError::InvalidCommand(format!("{} zone is not configured", kind)))
    }

    fn zone_enabled(&self, kind: ZoneKind) -> bool {
        self.zones
            .iter()
            .find(|zone| zone.kind() == kind)
            .map_or(true, |zone| zone.enable_flag())
    }

    /// Master status flags sent with every Status read
    pub fn master_flags(&self) -> MasterStatus {
        MasterStatus {
            ch_enable: self.zone_enabled(ZoneKind::HeatingWater),
            dhw_enable: self.zone_enabled(ZoneKind::HotWater),
            ..MasterStatus::default()
        }
    }

    /// Run until `shutdown` turns true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Boiler driver started (gateway mode {}, {} zone(s), poll every {:?})",
            if self.gateway { "on" } else { "off" },
            self.zones.len(),
            self.update_interval
        );

        let queue = self.session.queue().clone();
        let queued = self.plan.schedule_startup(self.state(), &queue);
        debug!("Startup: {} reads queued", queued);

        let mut ticker = interval(self.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Upstream exchanges go first, then one queued transaction
            while let Some(exchange) = self.upstream.as_mut().and_then(|rx| rx.try_recv().ok()) {
                self.handle_upstream(exchange).await;
            }

            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }

            let upstream = &self.upstream;
            let upstream_waiting = || upstream.as_ref().is_some_and(|rx| !rx.is_empty());
            if let Some(report) = self.session.run_transaction_until(upstream_waiting).await {
                trace!("Transaction {:?}", report);
                self.refresh_zones();
                if self.cycle_active && queue.is_empty() {
                    self.cycle_active = false;
                    self.publish();
                }
                continue;
            }
            if self.session.has_suspended() {
                continue;
            }

            let wake = tokio::select! {
                changed = shutdown.changed() => match changed {
                    Ok(()) => continue,
                    Err(_) => Wake::Shutdown,
                },
                exchange = recv_upstream(&mut self.upstream) => match exchange {
                    Some(exchange) => Wake::Upstream(exchange),
                    None => Wake::UpstreamClosed,
                },
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::CommandsClosed,
                },
                _ = ticker.tick() => Wake::Tick,
                _ = queue.notified() => Wake::Queued,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Upstream(exchange) => self.handle_upstream(exchange).await,
                Wake::UpstreamClosed => {
                    warn!("Slave session stopped, no more upstream traffic");
                    self.upstream = None;
                }
                Wake::Command(command) => self.handle_command(command),
                Wake::CommandsClosed => {
                    debug!("All boiler handles dropped");
                    self.commands_open = false;
                }
                Wake::Tick => self.start_cycle(),
                Wake::Queued => {}
            }
        }

        for zone in &mut self.zones {
            zone.cancel_pending();
        }
        let suspended = usize::from(self.session.cancel_suspended());
        let cancelled = queue.cancel_all() + suspended;
        self.publish();
        info!("Boiler driver stopped ({} queued request(s) cancelled)", cancelled);
    }

    fn start_cycle(&mut self) {
        let flags = self.master_flags();
        let queue = self.session.queue().clone();
        let queued = self.plan.schedule_cycle(self.state(), &queue, flags);
        self.cycle_active = queued > 0;
        if !self.cycle_active {
            self.refresh_zones();
            self.publish();
        }
    }

    fn refresh_zones(&mut self) {
        for zone in &mut self.zones {
            zone.refresh();
        }
    }

    fn publish(&self) {
        let zones = self.zones.iter().map(|zone| zone.readback()).collect();
        let snapshot = BoilerSnapshot::capture(self.state(), self.session.stats(), zones, self.stale_after);
        self.snapshots.send_replace(snapshot);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetTarget { zone, value, reply } => {
                let result = self
                    .zone_mut(zone)
                    .and_then(|controller| controller.set_target_temperature(value));
                if let Err(e) = &result {
                    warn!("Rejected target {} for {}: {}", value, zone, e);
                }
                let _ = reply.send(result);
                self.publish();
            }
            Command::SetMode { zone, mode, reply } => {
                let result = self.zone_mut(zone).map(|controller| controller.set_mode(mode));
                let _ = reply.send(result);
                self.publish();
            }
            Command::ResetBoiler { reply } => {
                info!("Sending boiler lock-out reset");
                let request = Request::write(COMMAND, u8_pair(COMMAND_BLOR, 0)).untracked();
                let (_, outcome) = self.session.queue().submit(request);
                tokio::spawn(async move {
                    let result = match outcome.await {
                        Ok(Ok(response)) => Ok(reset_succeeded(response)),
                        Ok(Err(reason)) => Err(reason.into_error(COMMAND)),
                        Err(_) => Err(OpenThermError::ChannelClosed("request queue")),
                    };
                    match &result {
                        Ok(true) => info!("Boiler reset accepted"),
                        Ok(false) => warn!("Boiler did not confirm the reset"),
                        Err(e) => warn!("Boiler reset failed: {}", e),
                    }
                    let _ = reply.send(result);
                });
            }
            Command::ClearFault { reply } => {
                self.session.clear_fault();
                let _ = reply.send(());
                self.publish();
            }
        }
    }

    /// Clear the enable flags of zones switched off here
    fn apply_enable_flags(&self, frame: Frame) -> Frame {
        let flags = self.master_flags();
        let mut master = frame.high_byte();
        if !flags.ch_enable {
            master &= !0x01;
        }
        if !flags.dhw_enable {
            master &= !0x02;
        }
        if master == frame.high_byte() {
            return frame;
        }
        encode(frame.msg_type(), STATUS, u8_pair(master, frame.low_byte()))
    }

    async fn handle_upstream(&mut self, exchange: UpstreamExchange) {
        let original = exchange.request;
        if exchange.reply.is_closed() {
            debug!("Upstream {} already answered by the slave session, not forwarded", original);
            return;
        }

        let mut frame = original;

        for zone in &mut self.zones {
            frame = zone.rewrite_upstream(frame);
        }
        if frame.data_id() == STATUS && frame.msg_type() == MessageType::ReadData {
            frame = self.apply_enable_flags(frame);
        }
        if frame != original {
            debug!("Upstream {} sent as {}", original, frame);
        }

        let response = match self.session.forward(frame).await {
            Ok(response) => Some(response),
            Err(e) => {
                debug!("No boiler answer for upstream {}: {}", frame, e);
                None
            }
        };

        // Keep what the room unit asked for, not the rewritten value
        if original.msg_type() == MessageType::WriteData {
            self.state()
                .record_upstream(original.data_id(), original.data_value());
        }

        let _ = exchange.reply.send(response);
        self.refresh_zones();
        self.publish();
    }
}
