//! GPIO-backed OpenTherm line (Raspberry Pi, `rppal`)

use async_trait::async_trait;
use rppal::gpio::{Event, Gpio, InputPin, OutputPin, Trigger};
use std::io;
use std::time::{Duration, Instant};
use tracing::info;

use super::line_trait::{Edge, LineIo, Level};
use crate::config::ActiveLevel;
use crate::error::{OpenThermError, Result};

/// One OpenTherm pair driven through two GPIO pins
///
/// The adapter board's opto-couplers may invert either direction, so the
/// pin level that means "active" is configured per pin.
pub struct GpioLine {
    output: OutputPin,
    input: InputPin,
    output_active: ActiveLevel,
    input_active: ActiveLevel,
}

impl std::fmt::Debug for GpioLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpioLine")
            .field("output", &self.output.pin())
            .field("input", &self.input.pin())
            .finish_non_exhaustive()
    }
}

impl GpioLine {
    /// Claim the pins and park the output at idle
    ///
    /// # Errors
    ///
    /// Returns `Gpio` if the GPIO peripheral or either pin is unavailable
    pub fn open(
        input_pin: u8,
        output_pin: u8,
        input_active: ActiveLevel,
        output_active: ActiveLevel,
    ) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| OpenThermError::Gpio(e.to_string()))?;

        let mut output = gpio
            .get(output_pin)
            .map_err(|e| OpenThermError::Gpio(format!("output pin {}: {}", output_pin, e)))?
            .into_output();
        let mut input = gpio
            .get(input_pin)
            .map_err(|e| OpenThermError::Gpio(format!("input pin {}: {}", input_pin, e)))?
            .into_input();

        input
            .set_interrupt(Trigger::Both, None)
            .map_err(|e| OpenThermError::Gpio(format!("input pin {}: {}", input_pin, e)))?;

        drive(&mut output, output_active, Level::Idle);
        info!("OpenTherm line on GPIO in={} out={}", input_pin, output_pin);

        Ok(Self {
            output,
            input,
            output_active,
            input_active,
        })
    }
}

/// Edge for an interrupt event, stamped with the kernel's event time
///
/// Edges that queue up while the task is descheduled keep their real
/// spacing, which the mid-bit rule depends on.
fn edge_from_event(trigger: Trigger, timestamp: Duration, input_active: ActiveLevel) -> Edge {
    let rising = matches!(trigger, Trigger::RisingEdge);
    let level = match (input_active, rising) {
        (ActiveLevel::High, true) | (ActiveLevel::Low, false) => Level::Active,
        _ => Level::Idle,
    };
    Edge {
        level,
        at_us: timestamp.as_micros() as u64,
    }
}

fn drive(output: &mut OutputPin, active: ActiveLevel, level: Level) {
    let high = matches!(
        (active, level),
        (ActiveLevel::High, Level::Active) | (ActiveLevel::Low, Level::Idle)
    );
    if high {
        output.set_high();
    } else {
        output.set_low();
    }
}

#[async_trait]
impl LineIo for GpioLine {
    async fn transmit(&mut self, levels: &[Level], half_bit: Duration) -> io::Result<()> {
        let output_active = self.output_active;
        let output = &mut self.output;

        // Half-bits are 500 us, below what the async timer can hold, so spin
        tokio::task::block_in_place(|| {
            let start = Instant::now();
            for (index, &level) in levels.iter().enumerate() {
                drive(output, output_active, level);
                let deadline = start + half_bit * (index as u32 + 1);
                while Instant::now() < deadline {
                    std::hint::spin_loop();
                }
            }
            drive(output, output_active, Level::Idle);
        });

        Ok(())
    }

    async fn next_edge(&mut self, timeout: Duration) -> io::Result<Option<Edge>> {
        let input = &mut self.input;
        let polled = tokio::task::block_in_place(|| input.poll_interrupt(false, Some(timeout)))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(polled.map(|event: Event| edge_from_event(event.trigger, event.timestamp, self.input_active)))
    }
}
