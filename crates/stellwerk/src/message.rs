//! Message envelopes and the closed wire protocol.
//!
//! Two tag namespaces travel over the node context:
//!
//! - **message tags** ([`WireTag`]) — the envelope path between a worker
//!   and its scheduler, probed by the receive channel and dispatched as
//!   events;
//! - **control tags** ([`Directive`]) — small-integer directives consumed
//!   directly by the worker control loop (wake, exit, group membership,
//!   resume, task assignment).
//!
//! Both tables are closed: an unknown tag on decode is a protocol
//! violation, never silently skipped.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stellwerk_core::{Rank, TaskId};

use crate::error::StellwerkError;
use crate::fabric::{ContextId, Lane, WireFrame};

/// Rank of the scheduler's own unit within every node context.
pub const SCHEDULER_RANK: Rank = 0;

// ── Message tags ─────────────────────────────────────────────────────

/// Wire tag of a message envelope. The tag keys the closed table mapping
/// tags to payload types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireTag {
    /// Worker asks the scheduler to create a task; replied with [`WireTag::TidReply`].
    TaskCreate = 0x01,
    /// A task's group leader reports normal completion.
    TaskCompleted = 0x02,
    /// A task's group leader reports suspension on another task.
    TaskWait = 0x03,
    /// Scheduler's reply to [`WireTag::TaskCreate`].
    TidReply = 0x04,
}

impl WireTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::TaskCreate),
            0x02 => Some(Self::TaskCompleted),
            0x03 => Some(Self::TaskWait),
            0x04 => Some(Self::TidReply),
            _ => None,
        }
    }

    /// Which inbound lane carries envelopes with this tag. Spawn replies
    /// bypass the probe and go straight to the requesting task.
    pub fn lane(self) -> Lane {
        match self {
            Self::TidReply => Lane::Reply,
            _ => Lane::Message,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreate => "TASK_CREATE",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskWait => "TASK_WAIT",
            Self::TidReply => "TID_REPLY",
        }
    }
}

// ── Typed payloads ───────────────────────────────────────────────────

/// The declared content types of the message protocol, one per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    TaskCreate { kernel: String, min: u32, max: u32 },
    TaskCompleted { tid: TaskId },
    TaskWait { tid: TaskId, awaited: TaskId },
    TidReply { tid: TaskId },
}

impl Payload {
    pub fn tag(&self) -> WireTag {
        match self {
            Self::TaskCreate { .. } => WireTag::TaskCreate,
            Self::TaskCompleted { .. } => WireTag::TaskCompleted,
            Self::TaskWait { .. } => WireTag::TaskWait,
            Self::TidReply { .. } => WireTag::TidReply,
        }
    }

    /// Serialize the content as the tuple declared for its tag.
    pub fn encode(&self) -> Result<Vec<u8>, StellwerkError> {
        let bytes = match self {
            Self::TaskCreate { kernel, min, max } => rmp_serde::to_vec(&(kernel, min, max))?,
            Self::TaskCompleted { tid } => rmp_serde::to_vec(&(tid,))?,
            Self::TaskWait { tid, awaited } => rmp_serde::to_vec(&(tid, awaited))?,
            Self::TidReply { tid } => rmp_serde::to_vec(&(tid,))?,
        };
        Ok(bytes)
    }

    /// Reconstruct the content declared for `tag`.
    pub fn decode(tag: WireTag, bytes: &[u8]) -> Result<Self, StellwerkError> {
        let payload = match tag {
            WireTag::TaskCreate => {
                let (kernel, min, max): (String, u32, u32) = rmp_serde::from_slice(bytes)?;
                Self::TaskCreate { kernel, min, max }
            }
            WireTag::TaskCompleted => {
                let (tid,): (TaskId,) = rmp_serde::from_slice(bytes)?;
                Self::TaskCompleted { tid }
            }
            WireTag::TaskWait => {
                let (tid, awaited): (TaskId, TaskId) = rmp_serde::from_slice(bytes)?;
                Self::TaskWait { tid, awaited }
            }
            WireTag::TidReply => {
                let (tid,): (TaskId,) = rmp_serde::from_slice(bytes)?;
                Self::TidReply { tid }
            }
        };
        Ok(payload)
    }
}

// ── Envelope (outbound) ──────────────────────────────────────────────

/// A typed, addressed unit of serialized payload.
///
/// The payload bytes are produced exactly once, at construction, and never
/// regenerated.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub tag: WireTag,
    pub dest: Rank,
    pub ctx: ContextId,
    pub correlation: Uuid,
    pub sent_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(dest: Rank, ctx: ContextId, payload: &Payload) -> Result<Self, StellwerkError> {
        Ok(Self {
            tag: payload.tag(),
            dest,
            ctx,
            correlation: Uuid::new_v4(),
            sent_at: Utc::now(),
            payload: payload.encode()?,
        })
    }

    /// An envelope continuing an existing exchange (a spawn reply).
    pub fn with_correlation(
        dest: Rank,
        ctx: ContextId,
        payload: &Payload,
        correlation: Uuid,
    ) -> Result<Self, StellwerkError> {
        Ok(Self {
            tag: payload.tag(),
            dest,
            ctx,
            correlation,
            sent_at: Utc::now(),
            payload: payload.encode()?,
        })
    }
}

// ── Message (inbound) ────────────────────────────────────────────────

/// A fully reconstructed inbound message.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Payload,
    pub src: Rank,
    pub ctx: ContextId,
    pub correlation: Uuid,
}

impl Message {
    /// Reconstruct a message from a raw frame via the closed tag table.
    pub fn from_frame(frame: WireFrame) -> Result<Self, StellwerkError> {
        let tag = WireTag::from_u8(frame.tag)
            .ok_or_else(|| StellwerkError::Protocol(format!("unknown wire tag 0x{:02x}", frame.tag)))?;
        Ok(Self {
            payload: Payload::decode(tag, &frame.payload)?,
            src: frame.src,
            ctx: frame.ctx,
            correlation: frame.correlation,
        })
    }
}

// ── Control directives ───────────────────────────────────────────────

/// Control directives sent on the node context's control lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Terminate the worker control loop.
    Exit,
    /// Nudge preceding a group-membership directive.
    Wake,
    /// Full rank list of a newly allocated task group.
    GroupJoin { gid: u64, ranks: Vec<Rank> },
    /// Transfer control back into a suspended execution context.
    Resume { tid: TaskId },
    /// TaskID of the allocated task; sent to the group leader only.
    AssignTid { tid: TaskId },
    /// Kernel name of the allocated task; sent to the group leader only.
    AssignKernel { kernel: String },
}

impl Directive {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Exit => 0,
            Self::GroupJoin { .. } => 1,
            Self::Wake => 2,
            Self::Resume { .. } => 3,
            Self::AssignTid { .. } => 4,
            Self::AssignKernel { .. } => 5,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StellwerkError> {
        let bytes = match self {
            Self::Exit | Self::Wake => Vec::new(),
            Self::GroupJoin { gid, ranks } => rmp_serde::to_vec(&(gid, ranks))?,
            Self::Resume { tid } => rmp_serde::to_vec(&(tid,))?,
            Self::AssignTid { tid } => rmp_serde::to_vec(&(tid,))?,
            Self::AssignKernel { kernel } => rmp_serde::to_vec(&(kernel,))?,
        };
        Ok(bytes)
    }

    pub fn decode(tag: u8, bytes: &[u8]) -> Result<Self, StellwerkError> {
        let directive = match tag {
            0 => Self::Exit,
            1 => {
                let (gid, ranks): (u64, Vec<Rank>) = rmp_serde::from_slice(bytes)?;
                Self::GroupJoin { gid, ranks }
            }
            2 => Self::Wake,
            3 => {
                let (tid,): (TaskId,) = rmp_serde::from_slice(bytes)?;
                Self::Resume { tid }
            }
            4 => {
                let (tid,): (TaskId,) = rmp_serde::from_slice(bytes)?;
                Self::AssignTid { tid }
            }
            5 => {
                let (kernel,): (String,) = rmp_serde::from_slice(bytes)?;
                Self::AssignKernel { kernel }
            }
            other => {
                return Err(StellwerkError::Protocol(format!(
                    "unknown control tag {other}"
                )))
            }
        };
        Ok(directive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) -> Payload {
        let tag = payload.tag();
        let bytes = payload.encode().expect("encode");
        Payload::decode(tag, &bytes).expect("decode")
    }

    #[test]
    fn roundtrip_task_create() {
        let p = Payload::TaskCreate {
            kernel: "rand_reduce".into(),
            min: 2,
            max: 4,
        };
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn roundtrip_task_completed() {
        let p = Payload::TaskCompleted { tid: TaskId(42) };
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn roundtrip_task_wait() {
        let p = Payload::TaskWait {
            tid: TaskId(3),
            awaited: TaskId(9),
        };
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn roundtrip_tid_reply() {
        let p = Payload::TidReply { tid: TaskId(7) };
        assert_eq!(roundtrip(p.clone()), p);
    }

    #[test]
    fn unknown_wire_tag_is_a_protocol_violation() {
        let frame = WireFrame {
            ctx: ContextId::Node,
            lane: Lane::Message,
            tag: 0x7f,
            src: 1,
            correlation: Uuid::new_v4(),
            sent_at: Utc::now(),
            payload: vec![],
        };
        assert!(matches!(
            Message::from_frame(frame),
            Err(StellwerkError::Protocol(_))
        ));
    }

    #[test]
    fn envelope_message_roundtrip() {
        let payload = Payload::TaskCreate {
            kernel: "k".into(),
            min: 1,
            max: 1,
        };
        let env = Envelope::new(SCHEDULER_RANK, ContextId::Node, &payload).unwrap();
        assert_eq!(env.tag, WireTag::TaskCreate);

        let frame = WireFrame {
            ctx: env.ctx,
            lane: env.tag.lane(),
            tag: env.tag as u8,
            src: 3,
            correlation: env.correlation,
            sent_at: env.sent_at,
            payload: env.payload.clone(),
        };
        let msg = Message::from_frame(frame).unwrap();
        assert_eq!(msg.payload, payload);
        assert_eq!(msg.src, 3);
        assert_eq!(msg.correlation, env.correlation);
    }

    #[test]
    fn directive_roundtrips() {
        let all = [
            Directive::Exit,
            Directive::Wake,
            Directive::GroupJoin {
                gid: 11,
                ranks: vec![1, 2, 3],
            },
            Directive::Resume { tid: TaskId(5) },
            Directive::AssignTid { tid: TaskId(6) },
            Directive::AssignKernel {
                kernel: "rand_reduce".into(),
            },
        ];
        for d in all {
            let decoded = Directive::decode(d.tag(), &d.encode().unwrap()).unwrap();
            assert_eq!(decoded, d);
        }
    }

    #[test]
    fn unknown_control_tag_is_a_protocol_violation() {
        assert!(matches!(
            Directive::decode(99, &[]),
            Err(StellwerkError::Protocol(_))
        ));
    }

    #[test]
    fn reply_tag_uses_reply_lane() {
        assert_eq!(WireTag::TidReply.lane(), Lane::Reply);
        assert_eq!(WireTag::TaskCreate.lane(), Lane::Message);
        assert_eq!(WireTag::TaskCompleted.lane(), Lane::Message);
    }
}
