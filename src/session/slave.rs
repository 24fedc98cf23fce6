//! # Slave Session
//!
//! Listens on the slave pair for frames from an upstream room unit and
//! answers them within the OpenTherm response window (20 to 800 ms after the
//! request ends). Answers come from the boiler through the driver; if the
//! driver has nothing in time, a READ is answered from a fresh stored value.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OpenThermError, Result};
use crate::link::{BitLink, LineIo};
use crate::protocol::encoder::encode;
use crate::protocol::frame::{Frame, MessageType, MIN_RESPONSE_DELAY_MS, RESPONSE_TIMEOUT_MS};
use crate::state::DeviceState;

const RESPONSE_WINDOW_MIN: Duration = Duration::from_millis(MIN_RESPONSE_DELAY_MS);
const RESPONSE_WINDOW_MAX: Duration = Duration::from_millis(RESPONSE_TIMEOUT_MS);

/// How long the driver may take to produce a forwarded answer
///
/// Leaves time to transmit the 34 ms reply inside the response window.
const FORWARD_BUDGET: Duration = Duration::from_millis(700);

/// Wait per listen call; only bounds how quickly shutdown is noticed
const LISTEN_TIMEOUT: Duration = Duration::from_secs(1);

/// A frame from the upstream master and where to send the answer
#[derive(Debug)]
pub struct UpstreamExchange {
    pub request: Frame,
    pub reply: oneshot::Sender<Option<Frame>>,
}

/// READ-ACK built from a stored value no older than `max_age`
pub fn cached_response(state: &DeviceState, request: Frame, max_age: Duration) -> Option<Frame> {
    if request.msg_type() != MessageType::ReadData {
        return None;
    }
    let reading = state.reading(request.data_id())?;
    if !reading.valid || reading.updated_at.elapsed() > max_age {
        return None;
    }
    Some(encode(MessageType::ReadAck, request.data_id(), reading.raw))
}

/// Slave side of the OpenTherm link
pub struct SlaveSession<L: LineIo> {
    link: BitLink<L>,
    state: Arc<DeviceState>,
    cache_max_age: Duration,
    request_ended: Option<Instant>,
}

impl<L: LineIo> SlaveSession<L> {
    pub fn new(link: BitLink<L>, state: Arc<DeviceState>, cache_max_age: Duration) -> Self {
        Self {
            link,
            state,
            cache_max_age,
            request_ended: None,
        }
    }

    pub fn link(&self) -> &BitLink<L> {
        &self.link
    }

    /// Wait for the next master-to-slave frame
    ///
    /// # Errors
    ///
    /// - `Timeout` if nothing arrives
    /// - `Framing` / `Parity` for a damaged frame
    /// - `ProtocolMismatch` for a slave-to-master message type
    pub async fn next_request(&mut self, timeout: Duration) -> Result<Frame> {
        let frame = self.link.receive_frame(timeout).await?;
        self.request_ended = Some(Instant::now());

        if !frame.msg_type().is_request() {
            return Err(OpenThermError::ProtocolMismatch(format!(
                "upstream sent {}",
                frame.msg_type()
            )));
        }
        Ok(frame)
    }

    /// Answer the last request, keeping to the response window
    ///
    /// Returns `Ok(false)` if the window has already closed; the response is
    /// dropped rather than sent late.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the backend fails to drive the output
    pub async fn respond(&mut self, response: Frame) -> Result<bool> {
        let Some(ended) = self.request_ended.take() else {
            return Ok(false);
        };

        let elapsed = ended.elapsed();
        if elapsed > RESPONSE_WINDOW_MAX {
            warn!("Dropping late response {} ({:?} after request)", response, elapsed);
            return Ok(false);
        }
        if elapsed < RESPONSE_WINDOW_MIN {
            tokio::time::sleep_until(ended + RESPONSE_WINDOW_MIN).await;
        }

        self.link.transmit(response).await?;
        Ok(true)
    }

    /// Serve the upstream master until shutdown
    pub async fn run(
        mut self,
        upstream: mpsc::Sender<UpstreamExchange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Listening for upstream OpenTherm master");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.next_request(LISTEN_TIMEOUT) => result,
            };

            let request = match received {
                Ok(frame) => frame,
                Err(OpenThermError::Timeout(_)) => continue,
                Err(e) => {
                    debug!("Ignoring upstream frame: {}", e);
                    continue;
                }
            };
            debug!("Upstream {}", request);

            let (reply_tx, reply_rx) = oneshot::channel();
            let exchange = UpstreamExchange { request, reply: reply_tx };
            if upstream.send(exchange).await.is_err() {
                warn!("Boiler driver stopped, slave session exiting");
                break;
            }

            let forwarded = match tokio::time::timeout(FORWARD_BUDGET, reply_rx).await {
                Ok(Ok(reply)) => reply,
                _ => None,
            };
            let response =
                forwarded.or_else(|| cached_response(&self.state, request, self.cache_max_age));

            match response {
                Some(frame) => {
                    if let Err(e) = self.respond(frame).await {
                        warn!("Failed to answer upstream {}: {}", request, e);
                    }
                }
                None => debug!("No answer for upstream {}", request),
            }
        }

        info!("Slave session stopped");
    }
}
