//! # Link Module
//!
//! Physical layer of one OpenTherm pair.
//!
//! This module handles:
//! - Manchester encoding of frames into half-bit line levels
//! - Edge-timed reception of 34-bit frames
//! - Draining the line after a framing error
//! - Line backends (GPIO, simulated boiler, idle)

#[cfg(feature = "gpio")]
pub mod gpio;
pub mod line_trait;
pub mod manchester;
pub mod sim;

use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{OpenThermError, Result};
use crate::protocol::decoder::decode;
use crate::protocol::frame::{Frame, HALF_BIT_US};
pub use line_trait::{Edge, Level, LineIo};
use manchester::{frame_to_levels, FrameReceiver};

/// Longest wait for the next edge once a frame has started
const INTRA_FRAME_TIMEOUT: Duration = Duration::from_millis(2);

/// The line counts as quiet after this long without an edge
const QUIET_PERIOD: Duration = Duration::from_millis(5);

/// Upper bound on edges discarded while draining
const MAX_DRAIN_EDGES: usize = 256;

/// Frame-level access to one OpenTherm line
///
/// Holding a `BitLink` by `&mut` is what serializes access to the pair:
/// whoever owns it is the only party that can transmit.
#[derive(Debug)]
pub struct BitLink<L: LineIo> {
    line: L,
    half_bit: Duration,
}

impl<L: LineIo> BitLink<L> {
    pub fn new(line: L) -> Self {
        Self {
            line,
            half_bit: Duration::from_micros(HALF_BIT_US),
        }
    }

    /// Underlying line, for backend-specific inspection
    pub fn line(&self) -> &L {
        &self.line
    }

    /// Drive one frame onto the line
    ///
    /// # Errors
    ///
    /// Returns `Io` if the backend fails to drive the output
    pub async fn transmit(&mut self, frame: Frame) -> Result<()> {
        trace!("TX {}", frame);
        let levels = frame_to_levels(frame.raw());
        self.line.transmit(&levels, self.half_bit).await?;
        Ok(())
    }

    /// Receive one raw 32-bit word
    ///
    /// # Errors
    ///
    /// - `Timeout` if no frame starts within `timeout`
    /// - `Framing` if the frame is malformed or stops early; the line is
    ///   drained before returning
    pub async fn receive(&mut self, timeout: Duration) -> Result<u32> {
        let first = self
            .line
            .next_edge(timeout)
            .await?
            .ok_or(OpenThermError::Timeout(timeout))?;

        let mut receiver = FrameReceiver::new();
        match self.assemble(&mut receiver, first).await {
            Ok(word) => {
                trace!("RX 0x{:08X}", word);
                Ok(word)
            }
            Err(e) => {
                debug!("Discarding frame after {} bits: {}", receiver.bits_received(), e);
                self.drain().await;
                Err(e)
            }
        }
    }

    /// Receive and decode one frame
    ///
    /// # Errors
    ///
    /// As [`receive`](Self::receive), plus `Parity` / `Framing` from decoding
    pub async fn receive_frame(&mut self, timeout: Duration) -> Result<Frame> {
        decode(self.receive(timeout).await?)
    }

    async fn assemble(&mut self, receiver: &mut FrameReceiver, first: Edge) -> Result<u32> {
        let mut edge = first;
        loop {
            if let Some(word) = receiver.push(edge)? {
                return Ok(word);
            }
            edge = self
                .line
                .next_edge(INTRA_FRAME_TIMEOUT)
                .await?
                .ok_or_else(|| {
                    OpenThermError::Framing(format!(
                        "truncated frame after {} bits",
                        receiver.bits_received()
                    ))
                })?;
        }
    }

    /// Discard edges until the line has been quiet for a while
    pub async fn drain(&mut self) {
        for _ in 0..MAX_DRAIN_EDGES {
            match self.line.next_edge(QUIET_PERIOD).await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::line_trait::mocks::ScriptedLine;
    use crate::link::line_trait::MockLineIo;
    use crate::link::manchester::levels_to_edges;
    use crate::protocol::encoder::read_request;
    use crate::protocol::frame::MessageType;

    fn frame_edges(raw: u32, start_us: u64) -> Vec<Edge> {
        levels_to_edges(&frame_to_levels(raw), start_us, HALF_BIT_US)
    }

    #[tokio::test]
    async fn test_transmit_sends_68_half_bits() {
        let line = ScriptedLine::new();
        let mut link = BitLink::new(line.clone());

        link.transmit(read_request(0)).await.unwrap();

        let sent = line.get_transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 68);
    }

    #[tokio::test]
    async fn test_transmit_error_propagates() {
        let line = ScriptedLine::new();
        line.set_transmit_error(std::io::ErrorKind::BrokenPipe);
        let mut link = BitLink::new(line);

        let result = link.transmit(read_request(0)).await;
        assert!(matches!(result, Err(OpenThermError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_frame() {
        let line = ScriptedLine::new();
        line.push_edges(frame_edges(0xC019_1900, 1_000));
        let mut link = BitLink::new(line);

        let frame = link.receive_frame(Duration::from_millis(800)).await.unwrap();
        assert_eq!(frame.msg_type(), MessageType::ReadAck);
        assert_eq!(frame.data_value(), 0x1900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_timeout() {
        let mut link = BitLink::new(ScriptedLine::new());
        let result = link.receive(Duration::from_millis(800)).await;
        assert!(matches!(result, Err(OpenThermError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_frame_is_framing_error() {
        let line = ScriptedLine::new();
        let edges = frame_edges(0xC019_1900, 0);
        line.push_edges(edges[..20].iter().copied());
        let mut link = BitLink::new(line);

        let err = link.receive(Duration::from_millis(800)).await.unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_framing_error_drains_line() {
        let line = ScriptedLine::new();
        // Idle-going first edge is malformed; the rest of the frame must be drained
        let mut edges = frame_edges(0xC019_1900, 0);
        edges.insert(0, Edge { level: Level::Idle, at_us: 0 });
        line.push_edges(edges);
        let mut link = BitLink::new(line.clone());

        assert!(link.receive(Duration::from_millis(800)).await.is_err());
        assert_eq!(line.remaining_edges(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parity_error_surfaces_from_decode() {
        let line = ScriptedLine::new();
        line.push_edges(frame_edges(0x4019_1900, 0));
        let mut link = BitLink::new(line);

        let result = link.receive_frame(Duration::from_millis(800)).await;
        assert!(matches!(result, Err(OpenThermError::Parity(0x4019_1900))));
    }

    #[tokio::test]
    async fn test_line_io_error_propagates() {
        let mut mock = MockLineIo::new();
        mock.expect_next_edge()
            .times(1)
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::Other, "gpio gone")));
        let mut link = BitLink::new(mock);

        let result = link.receive(Duration::from_millis(800)).await;
        assert!(matches!(result, Err(OpenThermError::Io(_))));
    }

    #[tokio::test]
    async fn test_transmit_uses_half_bit_timing() {
        let mut mock = MockLineIo::new();
        mock.expect_transmit()
            .withf(|levels, half_bit| levels.len() == 68 && *half_bit == Duration::from_micros(500))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut link = BitLink::new(mock);

        link.transmit(read_request(25)).await.unwrap();
    }
}
