//! The event engine: a typed publish/subscribe dispatcher with a
//! time-ordered pending queue.
//!
//! All scheduler control flow is driven through here. Handlers are
//! registered per event kind, optionally with a payload filter, and run in
//! registration order on the single dispatch thread — which is what lets
//! the scheduler keep its task tables free of locksteps beyond a plain
//! mutex. A handler that returns [`Flow::Done`] is removed after the
//! dispatch round, which is how one-shot waiters disconnect themselves.
//!
//! Events carry a scheduled time: among all queued events the next one
//! dispatched is the earliest whose time has come; if none is due, the
//! loop sleeps until the earliest deadline or a new push. Delayed,
//! self-rescheduling events (the receive channel's probe back-off) ride on
//! this without a separate timer subsystem.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use stellwerk_core::TaskId;

use crate::fabric::ContextId;
use crate::message::Message;

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The receive channel decoded an inbound envelope.
    MessageReceived,
    /// A task entered the ready queue.
    TaskCreated,
    /// A task's completion notice was processed.
    TaskCompleted,
    /// The receive channel should sweep its contexts.
    Probe,
    /// Reserved: terminates the dispatch loop without further dispatch.
    Shutdown,
}

/// Closed sum over the declared content types per event kind.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Message(Message),
    Task(TaskId),
    Probe {
        delay_ms: u64,
        contexts: Vec<ContextId>,
    },
    Unit,
}

impl EventPayload {
    /// The message carried by a `MessageReceived` event.
    ///
    /// Dispatching an event whose payload does not match the registered
    /// kind is a programming error and fails fast.
    pub fn as_message(&self) -> &Message {
        match self {
            Self::Message(m) => m,
            other => panic!("payload type mismatch: expected Message, got {other:?}"),
        }
    }

    /// The task id carried by a `TaskCreated`/`TaskCompleted` event.
    pub fn as_task(&self) -> TaskId {
        match self {
            Self::Task(tid) => *tid,
            other => panic!("payload type mismatch: expected Task, got {other:?}"),
        }
    }

    /// The probe parameters carried by a `Probe` event.
    pub fn as_probe(&self) -> (u64, &[ContextId]) {
        match self {
            Self::Probe { delay_ms, contexts } => (*delay_ms, contexts),
            other => panic!("payload type mismatch: expected Probe, got {other:?}"),
        }
    }
}

/// An event: kind, scheduled time, typed payload. Consumed exactly once.
#[derive(Debug)]
pub struct Event {
    kind: EventKind,
    at: Instant,
    payload: EventPayload,
}

impl Event {
    /// An event due immediately.
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self {
            kind,
            at: Instant::now(),
            payload,
        }
    }

    /// An event due `delay` from now.
    pub fn delayed(kind: EventKind, payload: EventPayload, delay: Duration) -> Self {
        Self {
            kind,
            at: Instant::now() + delay,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn schedule_time(&self) -> Instant {
        self.at
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// What a handler wants done with its registration after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the registration.
    Keep,
    /// Remove it once the dispatch round completes (one-shot waiters).
    Done,
}

pub type HandleId = u64;

type Handler = Box<dyn FnMut(&EventPayload) -> Flow + Send>;
type Filter = Box<dyn Fn(&EventPayload) -> bool + Send>;

struct Registration {
    id: HandleId,
    handler: Handler,
    filter: Option<Filter>,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventKind, Vec<Registration>>,
    /// HandleId → kind, for disconnects.
    index: HashMap<HandleId, EventKind>,
    /// Disconnects requested while the kind's list was out for dispatch.
    pending_disconnect: HashSet<HandleId>,
    next_id: HandleId,
}

// ── Engine ───────────────────────────────────────────────────────────

/// The dispatcher. Registry and pending queue sit behind independent
/// locks; `connect`/`disconnect`/`push` are safe from any thread,
/// including from within a handler body. Handler invocation itself runs
/// on the single thread driving [`EventEngine::run`].
pub struct EventEngine {
    registry: Mutex<Registry>,
    queue: Mutex<Vec<Event>>,
    available: Condvar,
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEngine {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            queue: Mutex::new(Vec::new()),
            available: Condvar::new(),
        }
    }

    /// Register a handler for an event kind.
    pub fn connect<H>(&self, kind: EventKind, handler: H) -> HandleId
    where
        H: FnMut(&EventPayload) -> Flow + Send + 'static,
    {
        self.install(kind, Box::new(handler), None)
    }

    /// Register a handler invoked only for payloads accepted by `filter`.
    pub fn connect_filtered<H, F>(&self, kind: EventKind, handler: H, filter: F) -> HandleId
    where
        H: FnMut(&EventPayload) -> Flow + Send + 'static,
        F: Fn(&EventPayload) -> bool + Send + 'static,
    {
        self.install(kind, Box::new(handler), Some(Box::new(filter)))
    }

    fn install(&self, kind: EventKind, handler: Handler, filter: Option<Filter>) -> HandleId {
        let mut reg = self.registry.lock().unwrap();
        reg.next_id += 1;
        let id = reg.next_id;
        trace!(?kind, id, "connecting event handler");
        reg.index.insert(id, kind);
        reg.handlers.entry(kind).or_default().push(Registration {
            id,
            handler,
            filter,
        });
        id
    }

    /// Remove a registration. Removing an id that already self-removed is
    /// a no-op (a one-shot may have fired concurrently with the caller).
    pub fn disconnect(&self, id: HandleId) {
        let mut reg = self.registry.lock().unwrap();
        let Some(kind) = reg.index.remove(&id) else {
            trace!(id, "disconnect of an already removed handler");
            return;
        };
        if let Some(list) = reg.handlers.get_mut(&kind) {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return;
            }
        }
        // The kind's list is out for dispatch right now; mark for removal
        // at merge-back.
        reg.pending_disconnect.insert(id);
    }

    /// Queue an event. Non-blocking; FIFO among equally ready events.
    pub fn push(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap();
        queue.push(event);
        self.available.notify_one();
    }

    /// Block until an event whose scheduled time has come exists, and
    /// return the earliest such event.
    pub fn pop(&self) -> Event {
        let mut queue = self.queue.lock().unwrap();
        loop {
            let now = Instant::now();
            // Earliest due event wins; the scan keeps the first hit on
            // ties, preserving push order.
            let mut due: Option<(usize, Instant)> = None;
            let mut earliest: Option<Instant> = None;
            for (idx, event) in queue.iter().enumerate() {
                if event.at <= now && due.map_or(true, |(_, t)| event.at < t) {
                    due = Some((idx, event.at));
                }
                if earliest.map_or(true, |t| event.at < t) {
                    earliest = Some(event.at);
                }
            }
            if let Some((idx, _)) = due {
                return queue.remove(idx);
            }
            queue = match earliest {
                // Sleep until the earliest deadline; a push wakes us early.
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    self.available.wait_timeout(queue, wait).unwrap().0
                }
                None => self.available.wait(queue).unwrap(),
            };
        }
    }

    /// The dispatch loop. Runs until a [`EventKind::Shutdown`] event is
    /// popped, which terminates without further dispatch.
    pub fn run(&self) {
        trace!("event dispatch loop starting");
        loop {
            let event = self.pop();
            if event.kind == EventKind::Shutdown {
                break;
            }
            self.process(event);
        }
        trace!("event dispatch loop terminated");
    }

    fn process(&self, event: Event) {
        // Take the kind's list out of the registry so handler bodies can
        // connect/disconnect without deadlocking; merge back afterwards.
        let mut regs = {
            let mut reg = self.registry.lock().unwrap();
            match reg.handlers.remove(&event.kind) {
                Some(list) => list,
                None => return,
            }
        };
        trace!(kind = ?event.kind, handlers = regs.len(), "serving event");

        let mut done: HashSet<HandleId> = HashSet::new();
        for r in regs.iter_mut() {
            let accepted = r.filter.as_ref().map_or(true, |f| f(&event.payload));
            if accepted && (r.handler)(&event.payload) == Flow::Done {
                done.insert(r.id);
            }
        }

        let mut reg = self.registry.lock().unwrap();
        let connected_during_dispatch = reg.handlers.remove(&event.kind).unwrap_or_default();
        let pending = std::mem::take(&mut reg.pending_disconnect);
        let mut merged: Vec<Registration> = regs
            .into_iter()
            .chain(connected_during_dispatch)
            .filter(|r| !done.contains(&r.id) && !pending.contains(&r.id))
            .collect();
        for id in done.iter().chain(pending.iter()) {
            reg.index.remove(id);
        }
        if !merged.is_empty() {
            merged.shrink_to_fit();
            reg.handlers.insert(event.kind, merged);
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}
