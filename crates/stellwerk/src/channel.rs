//! The channel pair: synchronous envelope emission and the self-re-arming
//! receive probe.
//!
//! `SendChannel` serializes nothing at send time — envelopes carry their
//! payload bytes from construction — and never waits for a reply.
//! `ReceiveChannel` owns the recurring probe: one non-blocking receive
//! attempt per registered context per sweep, decode via the closed wire
//! table, publish as `MessageReceived`, then re-arm itself with an
//! exponentially backed-off delay. A hit resets the delay to the base; an
//! idle sweep doubles it up to the ceiling. This turns busy polling into
//! back-off while keeping latency low under load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use stellwerk_core::Rank;

use crate::error::StellwerkError;
use crate::event::{Event, EventEngine, EventKind, EventPayload, Flow};
use crate::fabric::{ContextId, Fabric, Inbox, Lane, WireFrame};
use crate::message::{Directive, Envelope, Message};

// ── Probe timing ─────────────────────────────────────────────────────

/// Probe timing knobs. Defaults reproduce the delays the system was tuned
/// with: first sweep after 10 ms, reset to 2 ms on a hit, never sleep
/// longer than 300 ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_initial_delay() -> u64 {
    10
}

fn default_base_delay() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    300
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ProbeConfig {
    /// The re-arm delay after a sweep: reset on a hit, double while idle,
    /// bounded by the ceiling.
    pub fn next_delay(&self, found: bool, current_ms: u64) -> u64 {
        if found {
            self.base_delay_ms
        } else {
            (current_ms.saturating_mul(2)).min(self.max_delay_ms)
        }
    }
}

// ── Send side ────────────────────────────────────────────────────────

/// Emits envelopes and control directives into the fabric. Synchronous up
/// to transport buffering only — no reply is awaited.
#[derive(Clone)]
pub struct SendChannel {
    fabric: Arc<dyn Fabric>,
}

impl SendChannel {
    pub fn new(fabric: Arc<dyn Fabric>) -> Self {
        Self { fabric }
    }

    /// Transmit a message envelope to its destination endpoint.
    pub fn send(&self, envelope: Envelope) -> Result<(), StellwerkError> {
        trace!(tag = envelope.tag.as_str(), dest = envelope.dest, "sending envelope");
        let frame = WireFrame {
            ctx: envelope.ctx,
            lane: envelope.tag.lane(),
            tag: envelope.tag as u8,
            src: self.fabric.local_rank(),
            correlation: envelope.correlation,
            sent_at: envelope.sent_at,
            payload: envelope.payload,
        };
        self.fabric.deliver(envelope.dest, frame)
    }

    /// Transmit a control directive on the node context's control lane.
    pub fn direct(&self, dest: Rank, directive: &Directive) -> Result<(), StellwerkError> {
        trace!(tag = directive.tag(), dest, "sending directive");
        let frame = WireFrame {
            ctx: ContextId::Node,
            lane: Lane::Control,
            tag: directive.tag(),
            src: self.fabric.local_rank(),
            correlation: uuid::Uuid::new_v4(),
            sent_at: chrono::Utc::now(),
            payload: directive.encode()?,
        };
        self.fabric.deliver(dest, frame)
    }
}

// ── Receive side ─────────────────────────────────────────────────────

/// Polls a set of communication contexts for inbound envelopes and
/// publishes each as a `MessageReceived` event.
pub struct ReceiveChannel {
    engine: Arc<EventEngine>,
    inboxes: Mutex<HashMap<ContextId, Inbox>>,
    config: ProbeConfig,
    shutdown: AtomicBool,
}

impl ReceiveChannel {
    /// Wire a receive channel into an engine: registers the probe handler
    /// and arms the first probe over `contexts`.
    pub fn attach(
        engine: &Arc<EventEngine>,
        fabric: &Arc<dyn Fabric>,
        contexts: &[ContextId],
        config: ProbeConfig,
    ) -> Arc<Self> {
        let inboxes = contexts
            .iter()
            .map(|ctx| (*ctx, fabric.inbox(*ctx, Lane::Message)))
            .collect();
        let channel = Arc::new(Self {
            engine: engine.clone(),
            inboxes: Mutex::new(inboxes),
            config,
            shutdown: AtomicBool::new(false),
        });

        let probe_channel = channel.clone();
        engine.connect(EventKind::Probe, move |payload| {
            let (delay_ms, contexts) = payload.as_probe();
            probe_channel.probe(delay_ms, contexts);
            Flow::Keep
        });

        engine.push(Event::new(
            EventKind::Probe,
            EventPayload::Probe {
                delay_ms: channel.config.initial_delay_ms,
                contexts: contexts.to_vec(),
            },
        ));
        channel
    }

    /// One sweep: a non-blocking check on every context, then re-arm
    /// unless shutdown was requested.
    fn probe(&self, delay_ms: u64, contexts: &[ContextId]) {
        let mut found = false;
        {
            let mut inboxes = self.inboxes.lock().unwrap();
            for ctx in contexts {
                let Some(inbox) = inboxes.get_mut(ctx) else {
                    continue;
                };
                if let Some(frame) = inbox.try_recv() {
                    found = true;
                    debug!(bytes = frame.payload.len(), src = frame.src, "receiving message");
                    // An undecodable envelope means scheduler and worker
                    // have desynchronized; there is nothing to recover.
                    let message = Message::from_frame(frame)
                        .unwrap_or_else(|e| panic!("inbound envelope rejected: {e}"));
                    self.engine.push(Event::new(
                        EventKind::MessageReceived,
                        EventPayload::Message(message),
                    ));
                }
            }
        }

        if !self.shutdown.load(Ordering::SeqCst) {
            let next = self.config.next_delay(found, delay_ms);
            self.engine.push(Event::delayed(
                EventKind::Probe,
                EventPayload::Probe {
                    delay_ms: next,
                    contexts: contexts.to_vec(),
                },
                Duration::from_millis(next),
            ));
        }
    }

    /// Stop re-arming after the current sweep. One-way.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
