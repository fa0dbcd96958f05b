//! In-process fabric: frames between units of a single process.
//!
//! Backs the single-process cluster harness and the integration tests,
//! where the scheduler and every worker unit run as threads of one
//! process. Delivery is a direct enqueue into the destination unit's
//! demultiplexer — no sockets, no runtime required on the sending side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stellwerk_core::Rank;

use crate::error::StellwerkError;
use crate::fabric::{ContextId, Demux, Fabric, Inbox, Lane, WireFrame};

/// Shared switchboard connecting all units of an in-process node.
pub struct MemSwitch {
    units: Mutex<HashMap<Rank, Arc<Demux>>>,
    size: u32,
}

impl MemSwitch {
    pub fn new(units: u32) -> Arc<Self> {
        assert!(units >= 2, "a node needs a scheduler and at least one worker");
        let map = (0..units).map(|r| (r, Arc::new(Demux::new()))).collect();
        Arc::new(Self {
            units: Mutex::new(map),
            size: units,
        })
    }

    /// The fabric handle of one unit.
    pub fn fabric(self: &Arc<Self>, rank: Rank) -> MemFabric {
        let demux = self
            .units
            .lock()
            .unwrap()
            .get(&rank)
            .unwrap_or_else(|| panic!("rank {rank} is not part of this node"))
            .clone();
        MemFabric {
            rank,
            switch: Arc::clone(self),
            demux,
        }
    }

    fn deliver(&self, dest: Rank, frame: WireFrame) -> Result<(), StellwerkError> {
        let demux = self
            .units
            .lock()
            .unwrap()
            .get(&dest)
            .cloned()
            .ok_or_else(|| StellwerkError::Transport(format!("no unit with rank {dest}")))?;
        demux.route(frame);
        Ok(())
    }
}

/// One unit's view of a [`MemSwitch`].
pub struct MemFabric {
    rank: Rank,
    switch: Arc<MemSwitch>,
    demux: Arc<Demux>,
}

impl Fabric for MemFabric {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn units(&self) -> u32 {
        self.switch.size
    }

    fn deliver(&self, dest: Rank, frame: WireFrame) -> Result<(), StellwerkError> {
        self.switch.deliver(dest, frame)
    }

    fn inbox(&self, ctx: ContextId, lane: Lane) -> Inbox {
        self.demux.take(ctx, lane)
    }

    fn retire(&self, ctx: ContextId) {
        self.demux.retire(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn frame(dest_lane: Lane, tag: u8, src: Rank) -> WireFrame {
        WireFrame {
            ctx: ContextId::Node,
            lane: dest_lane,
            tag,
            src,
            correlation: Uuid::new_v4(),
            sent_at: Utc::now(),
            payload: vec![],
        }
    }

    #[test]
    fn frames_cross_units() {
        let switch = MemSwitch::new(3);
        let sender = switch.fabric(1);
        let receiver = switch.fabric(2);

        sender.deliver(2, frame(Lane::Control, 4, 1)).unwrap();

        let mut inbox = receiver.inbox(ContextId::Node, Lane::Control);
        let got = inbox.try_recv().unwrap();
        assert_eq!(got.tag, 4);
        assert_eq!(got.src, 1);
    }

    #[test]
    fn unknown_destination_is_an_error() {
        let switch = MemSwitch::new(2);
        let sender = switch.fabric(0);
        let err = sender.deliver(9, frame(Lane::Message, 1, 0)).unwrap_err();
        assert!(matches!(err, StellwerkError::Transport(_)));
    }
}
