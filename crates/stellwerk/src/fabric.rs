//! Communication fabric underneath the channel pair.
//!
//! A fabric moves [`WireFrame`]s between the processing units of a node.
//! Frames are addressed by destination rank and demultiplexed on the
//! receiving side into per-(context, lane) inboxes:
//!
//! - **context** — which communication context the frame belongs to
//!   (node, scheduler peer group, or an ephemeral per-task group),
//! - **lane** — which consumer inside the unit it is for (the message
//!   envelope path, the worker control loop, a pending spawn reply, or
//!   group collectives).
//!
//! Two implementations exist: [`mem::MemSwitch`] routes frames between
//! units of a single process and backs the in-process cluster harness and
//! the integration tests; [`zmq::ZmqFabric`] carries frames over ZeroMQ
//! PUSH/PULL sockets, one inbound endpoint per unit.

pub mod mem;
pub mod zmq;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use stellwerk_core::Rank;

use crate::error::StellwerkError;

/// A communication context: the set of units a frame is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextId {
    /// One scheduler plus its host's workers.
    Node,
    /// The schedulers of all hosts.
    Peers,
    /// An ephemeral per-task group, keyed by a scheduler-assigned id.
    Group(u64),
}

/// The consumer a frame is routed to within a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    /// Message envelopes, probed by the receive channel.
    Message,
    /// Control directives, consumed by the worker control loop.
    Control,
    /// Spawn replies, consumed by the task that issued the request.
    Reply,
    /// Group formation and collectives.
    Group,
}

/// The unit of transmission between two processing units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub ctx: ContextId,
    pub lane: Lane,
    /// Wire tag; interpreted against the closed table of the owning lane.
    pub tag: u8,
    pub src: Rank,
    /// Correlation id for request/reply matching and tracing.
    pub correlation: Uuid,
    pub sent_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StellwerkError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StellwerkError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Receiving end of one (context, lane) route.
///
/// `try_recv` never blocks (the receive channel's probe path); `recv`
/// awaits the next frame (worker control loop, group collectives).
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<WireFrame>,
}

impl Inbox {
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Result<WireFrame, StellwerkError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| StellwerkError::Transport("fabric route closed".into()))
    }
}

/// Moves frames between the processing units of a node.
///
/// `deliver` is synchronous up to transport buffering — it enqueues the
/// frame and never waits for the receiver.
pub trait Fabric: Send + Sync {
    fn local_rank(&self) -> Rank;

    /// Number of processing units on this node, scheduler included.
    fn units(&self) -> u32;

    fn deliver(&self, dest: Rank, frame: WireFrame) -> Result<(), StellwerkError>;

    /// Take the inbox for a (context, lane) route. Each route has exactly
    /// one consumer; taking it twice is a programming error.
    fn inbox(&self, ctx: ContextId, lane: Lane) -> Inbox;

    /// Drop the routes of a retired context (an ephemeral group that
    /// finished its task).
    fn retire(&self, ctx: ContextId);
}

// ── Demultiplexer ────────────────────────────────────────────────────

/// Per-unit inbound router: fans incoming frames out to (context, lane)
/// queues. Routes are created on first use from either side, so a frame
/// arriving before the consumer subscribes is buffered, not lost.
pub(crate) struct Demux {
    senders: Mutex<HashMap<(ContextId, Lane), mpsc::UnboundedSender<WireFrame>>>,
    parked: Mutex<HashMap<(ContextId, Lane), mpsc::UnboundedReceiver<WireFrame>>>,
    /// Group ids are never reused, so a retired context stays retired.
    retired: Mutex<std::collections::HashSet<ContextId>>,
}

impl Demux {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            retired: Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn ensure_route(&self, key: (ContextId, Lane)) {
        let mut senders = self.senders.lock().unwrap();
        if !senders.contains_key(&key) {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(key, tx);
            self.parked.lock().unwrap().insert(key, rx);
        }
    }

    pub(crate) fn route(&self, frame: WireFrame) {
        let key = (frame.ctx, frame.lane);
        if self.retired.lock().unwrap().contains(&frame.ctx) {
            tracing::trace!(ctx = ?frame.ctx, "frame for a retired context dropped");
            return;
        }
        self.ensure_route(key);
        let senders = self.senders.lock().unwrap();
        // The receiver may already be gone for a retired context; frames
        // addressed to it are dropped with a trace, not an error.
        if senders
            .get(&key)
            .expect("route exists after ensure_route")
            .send(frame)
            .is_err()
        {
            tracing::trace!(?key, "frame for a closed route dropped");
        }
    }

    pub(crate) fn take(&self, ctx: ContextId, lane: Lane) -> Inbox {
        self.ensure_route((ctx, lane));
        let rx = self
            .parked
            .lock()
            .unwrap()
            .remove(&(ctx, lane))
            .unwrap_or_else(|| panic!("inbox ({ctx:?}, {lane:?}) taken twice"));
        Inbox { rx }
    }

    pub(crate) fn retire(&self, ctx: ContextId) {
        self.retired.lock().unwrap().insert(ctx);
        self.senders.lock().unwrap().retain(|(c, _), _| *c != ctx);
        self.parked.lock().unwrap().retain(|(c, _), _| *c != ctx);
    }
}
