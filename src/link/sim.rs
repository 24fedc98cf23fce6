//! # Simulated Lines
//!
//! In-process stand-ins for the physical OpenTherm pairs: a boiler that
//! answers from a register table, and an idle line with no traffic.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::line_trait::{Edge, LineIo, Level};
use super::manchester::{frame_to_levels, levels_to_edges, levels_to_frame};
use crate::protocol::data_id::*;
use crate::protocol::decoder::decode;
use crate::protocol::encoder::{encode, f88_from_f32, u8_pair};
use crate::protocol::frame::{Frame, MessageType, HALF_BIT_US};

/// Default delay between the end of a request and the boiler's answer
pub const DEFAULT_RESPONSE_DELAY: Duration = Duration::from_millis(40);

/// Fault applied to the next response of a [`SimulatedBoiler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Stay silent
    NoResponse,
    /// Flip a data bit so the parity check fails
    CorruptParity,
    /// Answer for the neighbouring data-id
    WrongDataId,
    /// Answer DATA-INVALID
    DataInvalid,
    /// Stop transmitting halfway through the frame
    Truncated,
}

/// Ids a boiler accepts WRITE-DATA for
const WRITABLE_IDS: &[u8] = &[
    CH_SETPOINT,
    COMMAND,
    MAX_MODULATION,
    ROOM_SETPOINT,
    ROOM_TEMPERATURE,
    DHW_SETPOINT,
    MAX_CH_SETPOINT,
];

struct SimInner {
    registers: HashMap<u8, u16>,
    faults: VecDeque<InjectedFault>,
    pending: VecDeque<Edge>,
    requests: Vec<Frame>,
    rx_errors: usize,
    half_duplex_violations: usize,
    response_delay: Duration,
}

/// An OpenTherm boiler simulated in-process
///
/// Clones share state, so a test can keep a handle while the session owns
/// the line.
#[derive(Clone)]
pub struct SimulatedBoiler {
    inner: Arc<Mutex<SimInner>>,
    epoch: Instant,
}

impl Default for SimulatedBoiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoiler {
    /// A boiler with plausible readings for every polled id
    pub fn new() -> Self {
        let registers = HashMap::from([
            // CH active and flame on
            (STATUS, 0x000A),
            (CH_SETPOINT, f88_from_f32(40.0)),
            (SLAVE_CONFIG, 0x0100),
            (FAULT_FLAGS, 0x0000),
            (MAX_MODULATION, f88_from_f32(100.0)),
            (MODULATION, f88_from_f32(30.0)),
            (CH_PRESSURE, f88_from_f32(1.5)),
            (BOILER_TEMPERATURE, f88_from_f32(45.0)),
            (DHW_TEMPERATURE, f88_from_f32(48.0)),
            (OUTSIDE_TEMPERATURE, f88_from_f32(5.0)),
            (RETURN_TEMPERATURE, f88_from_f32(38.0)),
            (DHW_SETPOINT_BOUNDS, u8_pair(80, 40)),
            (CH_SETPOINT_BOUNDS, u8_pair(80, 20)),
            (DHW_SETPOINT, f88_from_f32(50.0)),
            (MAX_CH_SETPOINT, f88_from_f32(75.0)),
            (OEM_DIAGNOSTIC_CODE, 0),
            (MASTER_OT_VERSION, f88_from_f32(2.2)),
            (SLAVE_OT_VERSION, f88_from_f32(2.2)),
        ]);

        Self {
            inner: Arc::new(Mutex::new(SimInner {
                registers,
                faults: VecDeque::new(),
                pending: VecDeque::new(),
                requests: Vec::new(),
                rx_errors: 0,
                half_duplex_violations: 0,
                response_delay: DEFAULT_RESPONSE_DELAY,
            })),
            epoch: Instant::now(),
        }
    }

    pub fn with_response_delay(self, delay: Duration) -> Self {
        self.set_response_delay(delay);
        self
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        // A poisoned lock only means a test panicked mid-update
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn set_register(&self, data_id: u8, value: u16) {
        self.lock().registers.insert(data_id, value);
    }

    pub fn register(&self, data_id: u8) -> Option<u16> {
        self.lock().registers.get(&data_id).copied()
    }

    /// Remove a register so the boiler answers UNKNOWN-DATAID for it
    pub fn remove_register(&self, data_id: u8) {
        self.lock().registers.remove(&data_id);
    }

    /// Set the slave status flags (low byte of data-id 0)
    pub fn set_status_flags(&self, flags: u8) {
        let mut inner = self.lock();
        let master = inner.registers.get(&STATUS).copied().unwrap_or(0) & 0xFF00;
        inner.registers.insert(STATUS, master | flags as u16);
    }

    /// Queue `count` occurrences of `fault`, consumed one per request
    pub fn inject(&self, fault: InjectedFault, count: usize) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner.faults.push_back(fault);
        }
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<Frame> {
        self.lock().requests.clone()
    }

    /// Requests that could not be decoded
    pub fn rx_errors(&self) -> usize {
        self.lock().rx_errors
    }

    /// Times the master transmitted while a response was still on the line
    pub fn half_duplex_violations(&self) -> usize {
        self.lock().half_duplex_violations
    }

    fn respond(inner: &mut SimInner, request: Frame) -> Option<Frame> {
        let id = request.data_id();
        let value = request.data_value();

        let response = match request.msg_type() {
            MessageType::ReadData => match inner.registers.get(&id).copied() {
                Some(stored) if id == STATUS => {
                    // Master flags arrive in the request's high byte
                    let merged = (value & 0xFF00) | (stored & 0x00FF);
                    inner.registers.insert(STATUS, merged);
                    encode(MessageType::ReadAck, id, merged)
                }
                Some(stored) => encode(MessageType::ReadAck, id, stored),
                None => encode(MessageType::UnknownDataId, id, value),
            },
            MessageType::WriteData if id == COMMAND => {
                if (value >> 8) as u8 == COMMAND_BLOR {
                    let status = inner.registers.get(&STATUS).copied().unwrap_or(0);
                    inner.registers.insert(STATUS, status & !0x0001);
                    inner.registers.insert(FAULT_FLAGS, 0);
                    encode(MessageType::WriteAck, id, u8_pair(COMMAND_BLOR, 128))
                } else {
                    encode(MessageType::WriteAck, id, value & 0xFF00)
                }
            }
            MessageType::WriteData if WRITABLE_IDS.contains(&id) => {
                let accepted = Self::clamp_write(inner, id, value);
                inner.registers.insert(id, accepted);
                encode(MessageType::WriteAck, id, accepted)
            }
            MessageType::WriteData if inner.registers.contains_key(&id) => {
                encode(MessageType::DataInvalid, id, value)
            }
            MessageType::WriteData => encode(MessageType::UnknownDataId, id, value),
            MessageType::InvalidData => encode(MessageType::DataInvalid, id, value),
            _ => return None,
        };

        Some(response)
    }

    /// Clamp setpoint writes to the bounds the boiler advertises
    fn clamp_write(inner: &SimInner, id: u8, value: u16) -> u16 {
        let bounds_id = match id {
            DHW_SETPOINT => DHW_SETPOINT_BOUNDS,
            CH_SETPOINT => CH_SETPOINT_BOUNDS,
            _ => return value,
        };
        let Some(bounds) = inner.registers.get(&bounds_id).copied() else {
            return value;
        };

        let upper = ((bounds >> 8) as u8 as i8) as f32;
        let lower = ((bounds & 0xFF) as u8 as i8) as f32;
        let requested = crate::protocol::decoder::f88_to_f32(value);
        f88_from_f32(requested.clamp(lower, upper))
    }
}

#[async_trait]
impl LineIo for SimulatedBoiler {
    async fn transmit(&mut self, levels: &[Level], half_bit: Duration) -> io::Result<()> {
        let started_us = self.now_us();
        {
            let mut inner = self.lock();
            let on_line = match (inner.pending.front(), inner.pending.back()) {
                (Some(first), Some(last)) => first.at_us <= started_us && last.at_us > started_us,
                _ => false,
            };
            if on_line {
                warn!("Simulated boiler: master transmitted while a response was on the line");
                inner.half_duplex_violations += 1;
            }
            // A response that has not started yet is abandoned for the new request
            inner.pending.clear();
        }

        tokio::time::sleep(half_bit * levels.len() as u32).await;

        let mut inner = self.lock();
        let request = match levels_to_frame(levels).and_then(decode) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Simulated boiler: rejected request: {}", e);
                inner.rx_errors += 1;
                return Ok(());
            }
        };
        trace!("Simulated boiler: received {}", request);
        inner.requests.push(request);

        let Some(mut response) = Self::respond(&mut inner, request) else {
            return Ok(());
        };

        let mut truncate = false;
        match inner.faults.pop_front() {
            None => {}
            Some(InjectedFault::NoResponse) => return Ok(()),
            Some(InjectedFault::CorruptParity) => {
                response = Frame::from_raw_unchecked(response.raw() ^ 0x0000_0001);
            }
            Some(InjectedFault::WrongDataId) => {
                response = encode(
                    response.msg_type(),
                    response.data_id().wrapping_add(1),
                    response.data_value(),
                );
            }
            Some(InjectedFault::DataInvalid) => {
                response = encode(MessageType::DataInvalid, request.data_id(), request.data_value());
            }
            Some(InjectedFault::Truncated) => truncate = true,
        }

        let start_us = self.now_us() + inner.response_delay.as_micros() as u64;
        let mut edges = levels_to_edges(&frame_to_levels(response.raw()), start_us, HALF_BIT_US);
        if truncate {
            edges.truncate(edges.len() / 2);
        }
        inner.pending.extend(edges);
        Ok(())
    }

    async fn next_edge(&mut self, timeout: Duration) -> io::Result<Option<Edge>> {
        let deadline = Instant::now() + timeout;
        let next = self.lock().pending.front().copied();

        let Some(edge) = next else {
            tokio::time::sleep_until(deadline).await;
            return Ok(None);
        };

        let due = self.epoch + Duration::from_micros(edge.at_us);
        if due > deadline {
            tokio::time::sleep_until(deadline).await;
            return Ok(None);
        }

        tokio::time::sleep_until(due).await;
        self.lock().pending.pop_front();
        Ok(Some(edge))
    }
}

/// A line with no device on the other end
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleLine;

#[async_trait]
impl LineIo for IdleLine {
    async fn transmit(&mut self, levels: &[Level], half_bit: Duration) -> io::Result<()> {
        tokio::time::sleep(half_bit * levels.len() as u32).await;
        Ok(())
    }

    async fn next_edge(&mut self, timeout: Duration) -> io::Result<Option<Edge>> {
        tokio::time::sleep(timeout).await;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::manchester::FrameReceiver;
    use crate::protocol::encoder::{read_request, write_request};

    async fn exchange(boiler: &mut SimulatedBoiler, request: Frame) -> Option<Frame> {
        boiler
            .transmit(&frame_to_levels(request.raw()), Duration::from_micros(HALF_BIT_US))
            .await
            .unwrap();

        let mut receiver = FrameReceiver::new();
        loop {
            let edge = boiler.next_edge(Duration::from_millis(800)).await.unwrap()?;
            if let Ok(Some(raw)) = receiver.push(edge) {
                return decode(raw).ok();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_known_register() {
        let mut boiler = SimulatedBoiler::new();
        boiler.set_register(BOILER_TEMPERATURE, 0x1900);

        let response = exchange(&mut boiler, read_request(BOILER_TEMPERATURE)).await.unwrap();
        assert_eq!(response.msg_type(), MessageType::ReadAck);
        assert_eq!(response.data_id(), BOILER_TEMPERATURE);
        assert_eq!(response.data_value(), 0x1900);
        assert_eq!(boiler.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_respects_delay() {
        let mut boiler = SimulatedBoiler::new().with_response_delay(Duration::from_millis(50));
        boiler
            .transmit(&frame_to_levels(read_request(STATUS).raw()), Duration::from_micros(HALF_BIT_US))
            .await
            .unwrap();

        let sent_at = Instant::now();
        boiler.next_edge(Duration::from_millis(800)).await.unwrap().unwrap();
        assert!(sent_at.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_id() {
        let mut boiler = SimulatedBoiler::new();
        let response = exchange(&mut boiler, read_request(200)).await.unwrap();
        assert_eq!(response.msg_type(), MessageType::UnknownDataId);
        assert_eq!(response.data_id(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_merges_master_flags() {
        let mut boiler = SimulatedBoiler::new();
        boiler.set_status_flags(0x0A);
        let request = encode(MessageType::ReadData, STATUS, 0x0300);
        let response = exchange(&mut boiler, request).await.unwrap();
        assert_eq!(response.data_value(), 0x030A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_is_clamped_to_bounds() {
        let mut boiler = SimulatedBoiler::new();
        let response = exchange(&mut boiler, write_request(DHW_SETPOINT, f88_from_f32(90.0)))
            .await
            .unwrap();
        assert_eq!(response.msg_type(), MessageType::WriteAck);
        assert_eq!(response.data_value(), f88_from_f32(80.0));
        assert_eq!(boiler.register(DHW_SETPOINT), Some(f88_from_f32(80.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blor_clears_fault() {
        let mut boiler = SimulatedBoiler::new();
        boiler.set_status_flags(0x01);
        let response = exchange(&mut boiler, write_request(COMMAND, 0x0100)).await.unwrap();
        assert_eq!(response.low_byte(), 128);
        assert_eq!(boiler.register(STATUS).unwrap() & 0x01, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_fault() {
        let mut boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::NoResponse, 1);
        assert!(exchange(&mut boiler, read_request(STATUS)).await.is_none());
        // Fault is consumed
        assert!(exchange(&mut boiler, read_request(STATUS)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_data_id_fault() {
        let mut boiler = SimulatedBoiler::new();
        boiler.inject(InjectedFault::WrongDataId, 1);
        let response = exchange(&mut boiler, read_request(BOILER_TEMPERATURE)).await.unwrap();
        assert_eq!(response.data_id(), BOILER_TEMPERATURE + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmit_over_response_is_a_violation() {
        let mut boiler = SimulatedBoiler::new();
        let half = Duration::from_micros(HALF_BIT_US);
        boiler.transmit(&frame_to_levels(read_request(STATUS).raw()), half).await.unwrap();
        // Response started 40 ms after the request, still running at 50 ms
        tokio::time::advance(Duration::from_millis(50)).await;
        boiler.transmit(&frame_to_levels(read_request(STATUS).raw()), half).await.unwrap();
        assert_eq!(boiler.half_duplex_violations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstarted_response_is_abandoned() {
        let mut boiler = SimulatedBoiler::new().with_response_delay(Duration::from_millis(900));
        let half = Duration::from_micros(HALF_BIT_US);
        boiler.transmit(&frame_to_levels(read_request(STATUS).raw()), half).await.unwrap();
        boiler.transmit(&frame_to_levels(read_request(STATUS).raw()), half).await.unwrap();
        assert_eq!(boiler.half_duplex_violations(), 0);

        boiler.set_response_delay(DEFAULT_RESPONSE_DELAY);
        let response = exchange(&mut boiler, read_request(BOILER_TEMPERATURE)).await.unwrap();
        assert_eq!(response.data_id(), BOILER_TEMPERATURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_is_counted() {
        let mut boiler = SimulatedBoiler::new();
        boiler
            .transmit(&[Level::Active; 10], Duration::from_micros(HALF_BIT_US))
            .await
            .unwrap();
        assert_eq!(boiler.rx_errors(), 1);
        assert!(boiler.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_line_is_silent() {
        let mut line = IdleLine;
        let started = Instant::now();
        assert!(line.next_edge(Duration::from_millis(10)).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_default_registers_cover_poll_ids() {
        let boiler = SimulatedBoiler::new();
        for id in [STATUS, BOILER_TEMPERATURE, RETURN_TEMPERATURE, CH_PRESSURE, DHW_SETPOINT] {
            assert!(boiler.register(id).is_some(), "missing register {}", name_of(id));
        }
        assert!(boiler.register(ROOM_TEMPERATURE).is_none());
    }
}
