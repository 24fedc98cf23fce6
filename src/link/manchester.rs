//! # Manchester Bit Coding
//!
//! OpenTherm sends each bit as a mid-bit transition: `1` is active→idle and
//! `0` is idle→active. A frame on the wire is a start bit (`1`), 32 data bits
//! MSB first and a stop bit (`1`), 34 ms in total.
//!
//! The receiver tracks only mid-bit transitions: after the start bit's
//! transition, an edge more than 750 µs after the previous mid-bit edge is
//! the next mid-bit edge, while earlier edges are bit-boundary transitions
//! and are ignored.

use super::line_trait::{Edge, Level};
use crate::error::{OpenThermError, Result};
use crate::protocol::frame::{FRAME_DATA_BITS, FRAME_WIRE_BITS};

/// Edges closer than this to the previous mid-bit edge are bit boundaries
pub const MID_BIT_THRESHOLD_US: u64 = 750;

/// A gap longer than this means a mid-bit transition went missing
pub const MAX_MID_BIT_GAP_US: u64 = 1250;

/// Number of half-bit symbols in a frame
pub const FRAME_HALF_BITS: usize = FRAME_WIRE_BITS * 2;

/// Expand a 32-bit word into the 68 half-bit levels of a wire frame
pub fn frame_to_levels(raw: u32) -> Vec<Level> {
    let mut levels = Vec::with_capacity(FRAME_HALF_BITS);
    push_bit(&mut levels, true); // start bit

    for bit in (0..FRAME_DATA_BITS).rev() {
        push_bit(&mut levels, (raw >> bit) & 1 == 1);
    }

    push_bit(&mut levels, true); // stop bit
    levels
}

fn push_bit(levels: &mut Vec<Level>, one: bool) {
    if one {
        levels.push(Level::Active);
        levels.push(Level::Idle);
    } else {
        levels.push(Level::Idle);
        levels.push(Level::Active);
    }
}

/// Recover a 32-bit word from the half-bit levels of a wire frame
///
/// # Errors
///
/// Returns `Framing` if the length is wrong, a bit has no mid-bit
/// transition, or the start/stop bits are not `1`.
pub fn levels_to_frame(levels: &[Level]) -> Result<u32> {
    if levels.len() != FRAME_HALF_BITS {
        return Err(OpenThermError::Framing(format!(
            "expected {} half-bits, got {}",
            FRAME_HALF_BITS,
            levels.len()
        )));
    }

    let mut bits = Vec::with_capacity(FRAME_WIRE_BITS);
    for (index, pair) in levels.chunks(2).enumerate() {
        match (pair[0], pair[1]) {
            (Level::Active, Level::Idle) => bits.push(true),
            (Level::Idle, Level::Active) => bits.push(false),
            _ => {
                return Err(OpenThermError::Framing(format!(
                    "no mid-bit transition in bit {}",
                    index
                )))
            }
        }
    }

    if !bits[0] {
        return Err(OpenThermError::Framing("malformed start bit".to_string()));
    }
    if !bits[FRAME_WIRE_BITS - 1] {
        return Err(OpenThermError::Framing("malformed stop bit".to_string()));
    }

    Ok(bits[1..=FRAME_DATA_BITS]
        .iter()
        .fold(0u32, |word, &bit| (word << 1) | bit as u32))
}

/// Edges produced by driving `levels` from an idle line starting at `start_us`
pub fn levels_to_edges(levels: &[Level], start_us: u64, half_bit_us: u64) -> Vec<Edge> {
    let mut edges = Vec::new();
    let mut previous = Level::Idle;

    for (index, &level) in levels.iter().enumerate() {
        if level != previous {
            edges.push(Edge {
                level,
                at_us: start_us + index as u64 * half_bit_us,
            });
            previous = level;
        }
    }

    if previous != Level::Idle {
        edges.push(Edge {
            level: Level::Idle,
            at_us: start_us + levels.len() as u64 * half_bit_us,
        });
    }

    edges
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    AwaitStart,
    StartBit,
    Receiving,
}

/// Incremental frame receiver fed with input edges
#[derive(Debug)]
pub struct FrameReceiver {
    state: RxState,
    last_mid_us: u64,
    word: u32,
    bit_count: usize,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self {
            state: RxState::AwaitStart,
            last_mid_us: 0,
            word: 0,
            bit_count: 0,
        }
    }

    /// Whether the receiver has seen the start of a frame
    pub fn in_frame(&self) -> bool {
        self.state != RxState::AwaitStart
    }

    /// Data bits assembled so far
    pub fn bits_received(&self) -> usize {
        self.bit_count
    }

    /// Feed one edge; returns the word once the stop bit has been seen
    ///
    /// # Errors
    ///
    /// Returns `Framing` for a malformed start or stop bit or a missing
    /// mid-bit transition. The receiver must be discarded after an error.
    pub fn push(&mut self, edge: Edge) -> Result<Option<u32>> {
        match self.state {
            RxState::AwaitStart => {
                if edge.level != Level::Active {
                    return Err(OpenThermError::Framing(
                        "frame did not begin with an active level".to_string(),
                    ));
                }
                self.state = RxState::StartBit;
                self.last_mid_us = edge.at_us;
                Ok(None)
            }
            RxState::StartBit => {
                let elapsed = edge.at_us.saturating_sub(self.last_mid_us);
                if elapsed >= MID_BIT_THRESHOLD_US || edge.level != Level::Idle {
                    return Err(OpenThermError::Framing("malformed start bit".to_string()));
                }
                self.state = RxState::Receiving;
                self.last_mid_us = edge.at_us;
                Ok(None)
            }
            RxState::Receiving => {
                let elapsed = edge.at_us.saturating_sub(self.last_mid_us);
                if elapsed <= MID_BIT_THRESHOLD_US {
                    return Ok(None);
                }
                if elapsed > MAX_MID_BIT_GAP_US {
                    return Err(OpenThermError::Framing(format!(
                        "missing mid-bit transition after bit {} ({} us gap)",
                        self.bit_count, elapsed
                    )));
                }

                self.last_mid_us = edge.at_us;
                let one = edge.level == Level::Idle;

                if self.bit_count < FRAME_DATA_BITS {
                    self.word = (self.word << 1) | one as u32;
                    self.bit_count += 1;
                    Ok(None)
                } else if one {
                    Ok(Some(self.word))
                } else {
                    Err(OpenThermError::Framing("malformed stop bit".to_string()))
                }
            }
        }
    }
}
