//! # Master Session
//!
//! Request/response exchange with the boiler on the master pair.
//!
//! Each transaction moves IDLE → SENDING → WAITING_RESPONSE and ends DONE,
//! RETRY (back to SENDING after a fixed backoff) or FAILED. The session owns
//! the link, so no second frame can go out while a response is awaited.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::request::{FailureReason, Outcome, Request, RequestId, RequestQueue};
use crate::config::MasterConfig;
use crate::error::{OpenThermError, Result};
use crate::link::{BitLink, LineIo};
use crate::protocol::data_id::name_of;
use crate::protocol::encoder::encode;
use crate::protocol::frame::{Frame, MessageType};
use crate::state::DeviceState;

/// Where the current transaction stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Idle,
    Sending,
    WaitingResponse,
    Done,
    Retry,
    Failed,
}

/// Summary of one finished transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReport {
    pub request_id: Option<RequestId>,
    pub data_id: u8,
    pub attempts: u8,
    pub outcome: Outcome,
}

/// Running transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    pub ok: u64,
    pub failed: u64,
    pub retried: u64,
    pub forwarded: u64,
}

/// Check a response against the request it answers
///
/// # Errors
///
/// - `UnknownDataId` / `DataInvalid` when the slave says so
/// - `ProtocolMismatch` for a wrong data-id or message type
pub fn validate_response(request_type: MessageType, data_id: u8, response: Frame) -> Result<()> {
    if response.data_id() != data_id {
        return Err(OpenThermError::ProtocolMismatch(format!(
            "expected data-id {}, got {}",
            data_id,
            response.data_id()
        )));
    }

    let expected = request_type.expected_ack();
    match response.msg_type() {
        actual if Some(actual) == expected => Ok(()),
        MessageType::UnknownDataId => Err(OpenThermError::UnknownDataId(data_id)),
        MessageType::DataInvalid => Err(OpenThermError::DataInvalid(data_id)),
        actual => Err(OpenThermError::ProtocolMismatch(format!(
            "{} answered with {}",
            request_type, actual
        ))),
    }
}

/// A request whose retries were put off for upstream traffic
#[derive(Debug)]
struct Suspended {
    request: Request,
    attempts: u8,
}

/// Master side of the OpenTherm link
pub struct MasterSession<L: LineIo> {
    link: BitLink<L>,
    queue: RequestQueue,
    state: Arc<DeviceState>,
    response_timeout: Duration,
    max_attempts: u8,
    retry_backoff: Duration,
    inter_frame_gap: Duration,
    fault_threshold: u32,
    phase: TransactionPhase,
    consecutive_failures: u32,
    fault_latched: bool,
    last_exchange: Option<Instant>,
    /// Last exchange ended without a clean response
    line_dirty: bool,
    suspended: Option<Suspended>,
    stats: TransactionStats,
}

impl<L: LineIo> MasterSession<L> {
    pub fn new(
        link: BitLink<L>,
        queue: RequestQueue,
        state: Arc<DeviceState>,
        config: &MasterConfig,
    ) -> Self {
        Self {
            link,
            queue,
            state,
            response_timeout: config.response_timeout(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            inter_frame_gap: config.inter_frame_gap(),
            fault_threshold: config.fault_threshold,
            phase: TransactionPhase::Idle,
            consecutive_failures: 0,
            fault_latched: false,
            last_exchange: None,
            line_dirty: false,
            suspended: None,
            stats: TransactionStats::default(),
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn link(&self) -> &BitLink<L> {
        &self.link
    }

    pub fn phase(&self) -> TransactionPhase {
        self.phase
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_fault_latched(&self) -> bool {
        self.fault_latched
    }

    /// Release the latched link fault
    pub fn clear_fault(&mut self) {
        if self.fault_latched {
            info!("OpenTherm link fault cleared");
        }
        self.fault_latched = false;
        self.consecutive_failures = 0;
        self.state.set_link_health(0, false);
    }

    /// Run the next queued request to completion
    ///
    /// Returns `None` when the queue is empty.
    pub async fn run_transaction(&mut self) -> Option<TransactionReport> {
        self.run_transaction_until(|| false).await
    }

    /// Like [`run_transaction`](Self::run_transaction), but stop between
    /// attempts once `preempt` returns true
    ///
    /// A stopped request stays in flight and resumes, backoff included, on
    /// the next call. Returns `None` in that case too; see
    /// [`has_suspended`](Self::has_suspended).
    pub async fn run_transaction_until<F>(&mut self, preempt: F) -> Option<TransactionReport>
    where
        F: Fn() -> bool,
    {
        let (mut request, mut attempts) = match self.suspended.take() {
            Some(suspended) => {
                if let Some(last) = self.last_exchange {
                    tokio::time::sleep_until(last + self.retry_backoff).await;
                }
                (suspended.request, suspended.attempts)
            }
            None => {
                let mut request = self.queue.pop_next()?;
                if request.is_expired(Instant::now()) {
                    let data_id = request.data_id;
                    debug!("Dropping expired request for {} ({})", name_of(data_id), data_id);
                    self.phase = TransactionPhase::Failed;
                    let outcome: Outcome = Err(FailureReason::Expired);
                    let request_id = request.id();
                    self.queue.complete(request, outcome.clone());
                    return Some(TransactionReport { request_id, data_id, attempts: 0, outcome });
                }
                request.retries_remaining = self.max_attempts - 1;
                (request, 0u8)
            }
        };

        let request_id = request.id();
        let data_id = request.data_id;
        let frame = encode(request.msg_type, data_id, request.data_value);

        let result = loop {
            attempts += 1;
            let attempt = match self.exchange(frame).await {
                Ok(response) => validate_response(request.msg_type, data_id, response).map(|_| response),
                Err(e) => Err(e),
            };

            match attempt {
                Ok(response) => break Ok(response),
                Err(OpenThermError::UnknownDataId(id)) => {
                    break Err(OpenThermError::UnknownDataId(id));
                }
                Err(e) if request.retries_remaining > 0 => {
                    warn!(
                        "{} {} attempt {}/{} failed: {}",
                        request.msg_type,
                        name_of(data_id),
                        attempts,
                        self.max_attempts,
                        e
                    );
                    self.phase = TransactionPhase::Retry;
                    self.stats.retried += 1;
                    request.retries_remaining -= 1;
                    if preempt() {
                        debug!("Retry of {} put off for upstream traffic", name_of(data_id));
                        self.suspended = Some(Suspended { request, attempts });
                        return None;
                    }
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => break Err(e),
            }
        };

        let outcome = match result {
            Ok(response) => {
                self.phase = TransactionPhase::Done;
                self.stats.ok += 1;
                debug!("{} -> {}", frame, response);
                self.state.update(data_id, response.data_value());
                self.record_success();
                Ok(response)
            }
            Err(e) => {
                self.phase = TransactionPhase::Failed;
                self.stats.failed += 1;
                match &e {
                    OpenThermError::UnknownDataId(id) => self.state.mark_unsupported(*id),
                    OpenThermError::DataInvalid(id) => self.state.invalidate(*id),
                    _ => {}
                }
                warn!(
                    "{} {} ({}) failed after {} attempt(s): {}",
                    request.msg_type,
                    name_of(data_id),
                    data_id,
                    attempts,
                    e
                );
                if e.counts_as_link_failure() {
                    self.record_failure();
                }
                Err(FailureReason::from_error(&e))
            }
        };

        self.queue.complete(request, outcome.clone());
        Some(TransactionReport { request_id, data_id, attempts, outcome })
    }

    /// Whether a request is waiting to resume its retries
    pub fn has_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    /// Fail a suspended request as cancelled; returns whether there was one
    pub fn cancel_suspended(&mut self) -> bool {
        match self.suspended.take() {
            Some(suspended) => {
                self.queue.complete(suspended.request, Err(FailureReason::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Pass an upstream frame through to the boiler, single attempt
    ///
    /// Any response with the request's data-id is returned; ACKs also update
    /// the device state.
    ///
    /// # Errors
    ///
    /// Link errors and a data-id mismatch
    pub async fn forward(&mut self, frame: Frame) -> Result<Frame> {
        self.stats.forwarded += 1;
        let result = self.exchange(frame).await.and_then(|response| {
            if response.data_id() == frame.data_id() {
                Ok(response)
            } else {
                Err(OpenThermError::ProtocolMismatch(format!(
                    "forwarded data-id {}, got {}",
                    frame.data_id(),
                    response.data_id()
                )))
            }
        });

        match &result {
            Ok(response) => {
                debug!("Forwarded {} -> {}", frame, response);
                if matches!(response.msg_type(), MessageType::ReadAck | MessageType::WriteAck) {
                    self.state.update(response.data_id(), response.data_value());
                }
                self.phase = TransactionPhase::Done;
                self.record_success();
            }
            Err(e) => {
                warn!("Forwarding {} failed: {}", frame, e);
                self.phase = TransactionPhase::Failed;
                self.record_failure();
            }
        }
        result
    }

    /// One frame out, one frame back
    async fn exchange(&mut self, frame: Frame) -> Result<Frame> {
        if let Some(last) = self.last_exchange {
            tokio::time::sleep_until(last + self.inter_frame_gap).await;
        }
        // A late or broken response may still be on the line
        if self.line_dirty {
            self.link.drain().await;
        }

        self.phase = TransactionPhase::Sending;
        let sent = self.link.transmit(frame).await;
        let result = match sent {
            Ok(()) => {
                self.phase = TransactionPhase::WaitingResponse;
                self.link.receive_frame(self.response_timeout).await
            }
            Err(e) => Err(e),
        };

        self.last_exchange = Some(Instant::now());
        self.line_dirty = result.is_err();
        result
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state.set_link_health(0, self.fault_latched);
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.fault_latched && self.consecutive_failures >= self.fault_threshold {
            self.fault_latched = true;
            error!(
                "OpenTherm link fault: {} consecutive failed transactions",
                self.consecutive_failures
            );
        }
        self.state
            .set_link_health(self.consecutive_failures, self.fault_latched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::sim::{InjectedFault, SimulatedBoiler};
    use crate::protocol::data_id::*;
    use crate::protocol::encoder::f88_from_f32;
    use crate::protocol::frame::RESPONSE_TIMEOUT_MS;
    use crate::session::request::{Request, RequestStatus};
    use proptest::prelude::*;

    fn session(boiler: &SimulatedBoiler) -> MasterSession<SimulatedBoiler> {
        MasterSession::new(
            BitLink::new(boiler.clone()),
            RequestQueue::new(),
            Arc::new(DeviceState::new()),
            &MasterConfig::default(),
        )
    }

    #[test]
    fn test_validate_response() {
        let ack = encode(MessageType::ReadAck, 25, 0x1900);
        assert!(validate_response(MessageType::ReadData, 25, ack).is_ok());

        let wrong_id = encode(MessageType::ReadAck, 26, 0x1900);
        assert!(matches!(
            validate_response(MessageType::ReadData, 25, wrong_id),
            Err(OpenThermError::ProtocolMismatch(_))
        ));

        let write_ack = encode(MessageType::WriteAck, 25, 0x1900);
        assert!(matches!(
            validate_response(MessageType::ReadData, 25, write_ack),
            Err(OpenThermError::ProtocolMismatch(_))
        ));

        let unknown = encode(MessageType::UnknownDataId, 25, 0);
        assert!(matches!(
            validate_response(MessageType::ReadData, 25, unknown),
            Err(OpenThermError::UnknownDataId(25))
        ));

        let invalid = encode(MessageType::DataInvalid, 56, 0);
        assert!(matches!(
            validate_response(MessageType::WriteData, 56, invalid),
            Err(OpenThermError::DataInvalid(56))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boiler_temperature_read() {
        let boiler = SimulatedBoiler::new();
        boiler.set_register(BOILER_TEMPERATURE, 0x1900);
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        let report = master.run_transaction().await.unwrap();

        assert_eq!(report.attempts, 1);
        assert!(report.outcome.is_ok());
        assert_eq!(master.phase(), TransactionPhase::Done);
        assert_eq!(master.state().temperature(BOILER_TEMPERATURE), Some(25.0));
        assert_eq!(master.stats().ok, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_returns_none() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);
        assert!(master.run_transaction().await.is_none());
        assert_eq!(master.phase(), TransactionPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_timeouts_fail_and_remove() {
        let boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::NoResponse, 3);
        let mut master = session(&boiler);

        let id = master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        let started = Instant::now();
        let report = master.run_transaction().await.unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.outcome, Err(FailureReason::Timeout));
        assert_eq!(master.phase(), TransactionPhase::Failed);
        assert!(master.queue().is_empty());
        assert_eq!(
            master.queue().take_outcome(id),
            Some(RequestStatus::Failed(FailureReason::Timeout))
        );
        assert_eq!(boiler.requests().len(), 3);
        assert_eq!(master.stats().retried, 2);
        // Three response windows plus two backoffs
        assert!(started.elapsed() >= Duration::from_millis(3 * RESPONSE_TIMEOUT_MS + 200));
        assert!(master.state().read(BOILER_TEMPERATURE).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::CorruptParity, 1);
        boiler.inject(InjectedFault::WrongDataId, 1);
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(RETURN_TEMPERATURE));
        let report = master.run_transaction().await.unwrap();

        assert_eq!(report.attempts, 3);
        assert!(report.outcome.is_ok());
        assert_eq!(master.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_response_is_retried() {
        let boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::Truncated, 1);
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(CH_PRESSURE));
        let report = master.run_transaction().await.unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(master.state().temperature(CH_PRESSURE), Some(1.5));
        assert_eq!(boiler.half_duplex_violations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_data_id_fails_immediately() {
        let boiler = SimulatedBoiler::new();
        boiler.remove_register(OEM_DIAGNOSTIC_CODE);
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(OEM_DIAGNOSTIC_CODE));
        let report = master.run_transaction().await.unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome, Err(FailureReason::UnknownDataId));
        assert!(master.state().is_unsupported(OEM_DIAGNOSTIC_CODE));
        // The link itself is fine
        assert_eq!(master.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_invalid_invalidates_reading() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(DHW_TEMPERATURE));
        master.run_transaction().await.unwrap();
        assert!(master.state().read(DHW_TEMPERATURE).is_ok());

        boiler.inject(InjectedFault::DataInvalid, 3);
        master.queue().enqueue(Request::read(DHW_TEMPERATURE));
        let report = master.run_transaction().await.unwrap();

        assert_eq!(report.outcome, Err(FailureReason::DataInvalid));
        assert!(master.state().read(DHW_TEMPERATURE).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_latch() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        boiler.inject(InjectedFault::NoResponse, 5 * 3);
        for _ in 0..5 {
            master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
            master.run_transaction().await.unwrap();
        }
        assert!(master.is_fault_latched());
        assert!(master.state().link_fault());
        assert_eq!(master.consecutive_failures(), 5);

        // Success resets the counter, the latch stays
        master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        let report = master.run_transaction().await.unwrap();
        assert!(report.outcome.is_ok());
        assert_eq!(master.consecutive_failures(), 0);
        assert!(master.is_fault_latched());
        assert!(master.state().link_fault());

        master.clear_fault();
        assert!(!master.is_fault_latched());
        assert!(!master.state().link_fault());
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_failures_do_not_latch() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        boiler.inject(InjectedFault::NoResponse, 4 * 3);
        for _ in 0..4 {
            master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
            master.run_transaction().await.unwrap();
        }
        assert!(!master.is_fault_latched());
        assert_eq!(master.consecutive_failures(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_request_not_transmitted() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        let deadline = Instant::now() + Duration::from_secs(1);
        master.queue().enqueue(Request::read(BOILER_TEMPERATURE).expires_at(deadline));
        tokio::time::advance(Duration::from_secs(2)).await;

        let report = master.run_transaction().await.unwrap();
        assert_eq!(report.attempts, 0);
        assert_eq!(report.outcome, Err(FailureReason::Expired));
        assert!(boiler.requests().is_empty());
        assert_eq!(master.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_stores_accepted_value() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        master
            .queue()
            .enqueue(Request::write(DHW_SETPOINT, f88_from_f32(60.0)));
        let report = master.run_transaction().await.unwrap();

        let ack = report.outcome.unwrap();
        assert_eq!(ack.msg_type(), MessageType::WriteAck);
        assert_eq!(master.state().temperature(DHW_SETPOINT), Some(60.0));
        assert_eq!(boiler.register(DHW_SETPOINT), Some(0x3C00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_frame_gap() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        master.queue().enqueue(Request::read(RETURN_TEMPERATURE));
        master.run_transaction().await.unwrap();
        let first_done = Instant::now();
        master.run_transaction().await.unwrap();

        // gap + request frame + response delay + response frame
        assert!(first_done.elapsed() >= Duration::from_millis(100 + 34 + 40 + 33));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_discarded() {
        let boiler = SimulatedBoiler::new().with_response_delay(Duration::from_millis(900));
        let mut master = session(&boiler);

        master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        let report = master.run_transaction().await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.outcome, Err(FailureReason::Timeout));

        // The next transaction gets its own answer, after the gap
        boiler.set_response_delay(Duration::from_millis(40));
        master.queue().enqueue(Request::read(RETURN_TEMPERATURE));
        let failed_at = Instant::now();
        let report = master.run_transaction().await.unwrap();

        let response = report.outcome.unwrap();
        assert_eq!(response.data_id(), RETURN_TEMPERATURE);
        assert_eq!(master.state().temperature(RETURN_TEMPERATURE), Some(38.0));
        assert!(failed_at.elapsed() >= Duration::from_millis(100 + 34 + 40 + 33));
        assert_eq!(boiler.half_duplex_violations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_put_off_and_resumed() {
        let boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::NoResponse, 1);
        let mut master = session(&boiler);

        let id = master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        assert!(master.run_transaction_until(|| true).await.is_none());
        assert!(master.has_suspended());
        assert_eq!(master.queue().status(id), Some(RequestStatus::InFlight));

        let forwarded = master.forward(encode(MessageType::ReadData, DHW_TEMPERATURE, 0)).await;
        assert!(forwarded.is_ok());

        let report = master.run_transaction().await.unwrap();
        assert_eq!(report.request_id, Some(id));
        assert_eq!(report.attempts, 2);
        assert!(report.outcome.is_ok());
        assert!(!master.has_suspended());

        let ids: Vec<u8> = boiler.requests().iter().map(|f| f.data_id()).collect();
        assert_eq!(ids, vec![BOILER_TEMPERATURE, DHW_TEMPERATURE, BOILER_TEMPERATURE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suspended() {
        let boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::NoResponse, 1);
        let mut master = session(&boiler);

        let id = master.queue().enqueue(Request::read(BOILER_TEMPERATURE));
        assert!(master.run_transaction_until(|| true).await.is_none());
        assert!(master.cancel_suspended());
        assert_eq!(
            master.queue().take_outcome(id),
            Some(RequestStatus::Failed(FailureReason::Cancelled))
        );
        assert!(master.run_transaction().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_passes_unknown_data_id_back() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        let request = encode(MessageType::ReadData, 200, 0);
        let response = master.forward(request).await.unwrap();
        assert_eq!(response.msg_type(), MessageType::UnknownDataId);
        assert_eq!(master.stats().forwarded, 1);
        assert!(!master.state().is_unsupported(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_updates_state_on_ack() {
        let boiler = SimulatedBoiler::new();
        let mut master = session(&boiler);

        let request = encode(MessageType::WriteData, ROOM_SETPOINT, f88_from_f32(21.0));
        let response = master.forward(request).await.unwrap();
        assert_eq!(response.msg_type(), MessageType::WriteAck);
        assert_eq!(master.state().temperature(ROOM_SETPOINT), Some(21.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_failure_counts() {
        let boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::NoResponse, 1);
        let mut master = session(&boiler);

        let result = master.forward(encode(MessageType::ReadData, STATUS, 0)).await;
        assert!(matches!(result, Err(OpenThermError::Timeout(_))));
        assert_eq!(master.consecutive_failures(), 1);
    }

    fn fault_strategy() -> impl Strategy<Value = Option<InjectedFault>> {
        prop_oneof![
            Just(None),
            Just(Some(InjectedFault::NoResponse)),
            Just(Some(InjectedFault::CorruptParity)),
            Just(Some(InjectedFault::WrongDataId)),
            Just(Some(InjectedFault::DataInvalid)),
            Just(Some(InjectedFault::Truncated)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_half_duplex_holds(
            faults in proptest::collection::vec(fault_strategy(), 1..12),
            delay_ms in 20u64..1200,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let boiler = SimulatedBoiler::new().with_response_delay(Duration::from_millis(delay_ms));
                for fault in faults.iter().flatten() {
                    boiler.inject(*fault, 1);
                }
                let mut master = session(&boiler);
                for id in [STATUS, BOILER_TEMPERATURE, RETURN_TEMPERATURE, CH_PRESSURE] {
                    master.queue().enqueue(Request::read(id).untracked());
                }
                let mut reports = Vec::new();
                while let Some(report) = master.run_transaction().await {
                    reports.push(report);
                }

                assert_eq!(boiler.half_duplex_violations(), 0);
                assert!(master.queue().is_empty());
                if delay_ms > RESPONSE_TIMEOUT_MS {
                    // Answers after the window never count
                    assert!(reports.iter().all(|r| r.outcome == Err(FailureReason::Timeout)));
                    assert_eq!(master.stats().ok, 0);
                }
            });
        }
    }
}
