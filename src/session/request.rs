//! Pending requests and the shared queue they wait in

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::error::OpenThermError;
use crate::protocol::frame::{Frame, MessageType};

/// Identifier assigned to a request when it is enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One master request waiting for the line
#[derive(Debug)]
pub struct Request {
    pub msg_type: MessageType,
    pub data_id: u8,
    pub data_value: u16,
    /// Dropped without transmitting once this passes
    pub expires_at: Option<Instant>,
    /// Attempts left after the current one; set by the session
    pub retries_remaining: u8,
    /// Whether the outcome is kept for [`RequestQueue::take_outcome`]
    pub tracked: bool,
    id: Option<RequestId>,
    responder: Option<oneshot::Sender<Outcome>>,
}

impl Request {
    fn new(msg_type: MessageType, data_id: u8, data_value: u16) -> Self {
        Self {
            msg_type,
            data_id,
            data_value,
            expires_at: None,
            retries_remaining: 0,
            tracked: true,
            id: None,
            responder: None,
        }
    }

    pub fn read(data_id: u8) -> Self {
        Self::new(MessageType::ReadData, data_id, 0)
    }

    pub fn write(data_id: u8, data_value: u16) -> Self {
        Self::new(MessageType::WriteData, data_id, data_value)
    }

    /// Replace the data value (a READ of Status carries the master flags)
    pub fn with_value(mut self, data_value: u16) -> Self {
        self.data_value = data_value;
        self
    }

    pub fn expires_at(mut self, deadline: Instant) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    /// Don't keep the outcome around (poll reads)
    pub fn untracked(mut self) -> Self {
        self.tracked = false;
        self
    }

    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Why a request did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Framing,
    /// Raw word that failed the check
    Parity(u32),
    Mismatch,
    DataInvalid,
    UnknownDataId,
    Expired,
    Cancelled,
    Link(String),
}

impl FailureReason {
    pub fn from_error(error: &OpenThermError) -> Self {
        match error {
            OpenThermError::Timeout(_) => Self::Timeout,
            OpenThermError::Framing(_) => Self::Framing,
            OpenThermError::Parity(raw) => Self::Parity(*raw),
            OpenThermError::ProtocolMismatch(_) => Self::Mismatch,
            OpenThermError::DataInvalid(_) => Self::DataInvalid,
            OpenThermError::UnknownDataId(_) => Self::UnknownDataId,
            OpenThermError::Expired(_) => Self::Expired,
            OpenThermError::Cancelled => Self::Cancelled,
            other => Self::Link(other.to_string()),
        }
    }

    /// Error equivalent for callers that want a `Result`
    pub fn into_error(self, data_id: u8) -> OpenThermError {
        match self {
            Self::Timeout => OpenThermError::Timeout(std::time::Duration::from_millis(
                crate::protocol::frame::RESPONSE_TIMEOUT_MS,
            )),
            Self::Framing => OpenThermError::Framing(format!("data-id {}", data_id)),
            Self::Parity(raw) => OpenThermError::Parity(raw),
            Self::Mismatch => {
                OpenThermError::ProtocolMismatch(format!("unexpected response to data-id {}", data_id))
            }
            Self::DataInvalid => OpenThermError::DataInvalid(data_id),
            Self::UnknownDataId => OpenThermError::UnknownDataId(data_id),
            Self::Expired => OpenThermError::Expired(data_id),
            Self::Cancelled => OpenThermError::Cancelled,
            Self::Link(message) => {
                OpenThermError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Framing => f.write_str("framing error"),
            Self::Parity(raw) => write!(f, "parity error in 0x{:08X}", raw),
            Self::Mismatch => f.write_str("protocol mismatch"),
            Self::DataInvalid => f.write_str("data invalid"),
            Self::UnknownDataId => f.write_str("unknown data-id"),
            Self::Expired => f.write_str("expired"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Link(message) => write!(f, "link error: {}", message),
        }
    }
}

/// Final result of a request: the accepted response frame or why it failed
pub type Outcome = std::result::Result<Frame, FailureReason>;

/// Lifecycle of a tracked request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    InFlight,
    Done(Frame),
    Failed(FailureReason),
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    queue: VecDeque<Request>,
    in_flight: Option<RequestId>,
    outcomes: HashMap<RequestId, RequestStatus>,
}

/// FIFO of requests shared between producers and the master session
///
/// Insertion order is priority. Producers only enqueue; the session is the
/// only consumer.
#[derive(Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue").field("len", &self.len()).finish()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a request; returns its id
    pub fn enqueue(&self, mut request: Request) -> RequestId {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = RequestId(inner.next_id);
            request.id = Some(id);
            if request.tracked {
                inner.outcomes.insert(id, RequestStatus::Queued);
            }
            inner.queue.push_back(request);
            id
        };
        self.notify.notify_one();
        id
    }

    /// Append a request and get its outcome through a channel
    pub fn submit(&self, mut request: Request) -> (RequestId, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        request.responder = Some(tx);
        (self.enqueue(request), rx)
    }

    /// Remove a request that has not been transmitted yet
    ///
    /// Returns `false` once the request is in flight or finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut inner = self.lock();
        let Some(position) = inner.queue.iter().position(|r| r.id == Some(id)) else {
            return false;
        };
        if let Some(request) = inner.queue.remove(position) {
            Self::finish(&mut inner, request, Err(FailureReason::Cancelled));
        }
        true
    }

    /// Cancel everything still queued; returns how many were removed
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.lock();
        let drained: Vec<Request> = inner.queue.drain(..).collect();
        let count = drained.len();
        for request in drained {
            Self::finish(&mut inner, request, Err(FailureReason::Cancelled));
        }
        count
    }

    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        let inner = self.lock();
        if inner.in_flight == Some(id) {
            return Some(RequestStatus::InFlight);
        }
        inner.outcomes.get(&id).cloned()
    }

    /// Current status; a terminal status is removed once taken
    pub fn take_outcome(&self, id: RequestId) -> Option<RequestStatus> {
        let mut inner = self.lock();
        if inner.in_flight == Some(id) {
            return Some(RequestStatus::InFlight);
        }
        match inner.outcomes.get(&id) {
            Some(status) if status.is_terminal() => inner.outcomes.remove(&id),
            other => other.cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Whether a request of this type for `data_id` is waiting
    pub fn contains(&self, msg_type: MessageType, data_id: u8) -> bool {
        self.lock()
            .queue
            .iter()
            .any(|r| r.msg_type == msg_type && r.data_id == data_id)
    }

    /// Take the next request and mark it in flight
    pub fn pop_next(&self) -> Option<Request> {
        let mut inner = self.lock();
        let request = inner.queue.pop_front()?;
        inner.in_flight = request.id;
        Some(request)
    }

    /// Record the outcome of the in-flight request
    pub fn complete(&self, request: Request, outcome: Outcome) {
        let mut inner = self.lock();
        if inner.in_flight == request.id {
            inner.in_flight = None;
        }
        Self::finish(&mut inner, request, outcome);
    }

    fn finish(inner: &mut QueueInner, mut request: Request, outcome: Outcome) {
        if let Some(id) = request.id {
            if request.tracked {
                let status = match &outcome {
                    Ok(frame) => RequestStatus::Done(*frame),
                    Err(reason) => RequestStatus::Failed(reason.clone()),
                };
                inner.outcomes.insert(id, status);
            }
        }
        if let Some(responder) = request.responder.take() {
            // Receiver may have given up
            let _ = responder.send(outcome);
        }
    }

    /// Resolves after the next enqueue
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
