//! Ephemeral per-task communication groups.
//!
//! A group spans exactly the ranks the scheduler allocated to one task,
//! in the order it listed them; a member's group rank is its position in
//! that list and the member at position 0 is the leader. Formation uses a
//! pairwise binary-merge tree: at merge width `w = 1, 2, 4, …` each
//! participant either initiates a merge with the participant offset by
//! `w` (if present) or accepts a merge initiated by the participant `w`
//! below it, doubling the merged span each round until the whole group is
//! connected in O(log n) rounds. A barrier closes formation.
//!
//! On top of the formed context sit the collectives the kernels use:
//! `barrier`, `broadcast`, `allgather` and a leader-rooted `reduce`.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use stellwerk_core::Rank;

use crate::error::StellwerkError;
use crate::fabric::{ContextId, Fabric, Inbox, Lane, WireFrame};

// Group-lane wire tags.
const TAG_MERGE_SYN: u8 = 1;
const TAG_MERGE_ACK: u8 = 2;
const TAG_BARRIER_ARRIVE: u8 = 3;
const TAG_BARRIER_RELEASE: u8 = 4;
const TAG_BCAST: u8 = 5;
const TAG_GATHER: u8 = 6;

/// Frames from different members interleave on one inbox; mismatches for
/// a later collective are parked until their turn.
struct GroupInbox {
    inbox: Inbox,
    parked: VecDeque<WireFrame>,
}

/// A private communication context over one task's rank set.
pub struct GroupContext {
    gid: u64,
    members: Vec<Rank>,
    index: usize,
    fabric: Arc<dyn Fabric>,
    inbox: Mutex<GroupInbox>,
}

impl GroupContext {
    /// Join the group spanning `members` (scheduler order), connecting it
    /// via the pairwise binary-merge tree, and synchronize all members.
    ///
    /// A rank list that does not include the local unit is a protocol
    /// violation — fatal for the worker.
    pub async fn form(
        fabric: Arc<dyn Fabric>,
        gid: u64,
        members: Vec<Rank>,
    ) -> Result<Arc<Self>, StellwerkError> {
        assert!(!members.is_empty(), "group without members");
        let me = fabric.local_rank();
        let index = members.iter().position(|r| *r == me).ok_or_else(|| {
            StellwerkError::Protocol(format!(
                "group-membership list {members:?} omits the local unit {me}"
            ))
        })?;

        let inbox = fabric.inbox(ContextId::Group(gid), Lane::Group);
        let ctx = Arc::new(Self {
            gid,
            members,
            index,
            fabric,
            inbox: Mutex::new(GroupInbox {
                inbox,
                parked: VecDeque::new(),
            }),
        });

        ctx.merge().await?;
        ctx.barrier().await?;
        debug!(gid, size = ctx.size(), rank = ctx.rank(), "group formed");
        Ok(ctx)
    }

    /// The binary-merge doubling rounds.
    async fn merge(&self) -> Result<(), StellwerkError> {
        let n = self.members.len();
        let mut span: Vec<Rank> = vec![self.members[self.index]];

        let mut width = 1;
        while width < n {
            let block = self.index / width;
            if block % 2 == 0 {
                let partner = self.index + width;
                // No right partner at this width; the span doubles for us
                // on a later round.
                if partner < n {
                    trace!(gid = self.gid, width, partner, "initiating merge");
                    self.post(partner, TAG_MERGE_SYN, &span)?;
                    let theirs: Vec<Rank> = self.fetch(partner, TAG_MERGE_ACK).await?;
                    span.extend(theirs);
                }
            } else {
                let partner = self.index - width;
                trace!(gid = self.gid, width, partner, "accepting merge");
                let theirs: Vec<Rank> = self.fetch(partner, TAG_MERGE_SYN).await?;
                self.post(partner, TAG_MERGE_ACK, &span)?;
                let mut merged = theirs;
                merged.append(&mut span);
                span = merged;
            }
            width *= 2;
        }

        if self.index == 0 {
            debug_assert_eq!(span.len(), n, "leader span must cover the group");
        }
        Ok(())
    }

    pub fn gid(&self) -> u64 {
        self.gid
    }

    /// Group rank of the local unit: its position in the member list.
    pub fn rank(&self) -> usize {
        self.index
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Whether the local unit is the lowest-ranked group member.
    pub fn is_leader(&self) -> bool {
        self.index == 0
    }

    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    // ── Collectives ──────────────────────────────────────────────────

    /// All members synchronize. Leader collects one arrival per member,
    /// then releases everyone.
    pub async fn barrier(&self) -> Result<(), StellwerkError> {
        let n = self.size();
        if n == 1 {
            return Ok(());
        }
        if self.is_leader() {
            for member in 1..n {
                self.fetch::<()>(member, TAG_BARRIER_ARRIVE).await?;
            }
            for member in 1..n {
                self.post(member, TAG_BARRIER_RELEASE, &())?;
            }
        } else {
            self.post(0, TAG_BARRIER_ARRIVE, &())?;
            self.fetch::<()>(0, TAG_BARRIER_RELEASE).await?;
        }
        Ok(())
    }

    /// Leader-rooted broadcast. The leader passes `Some(value)`, everyone
    /// else `None`; all members return the leader's value.
    pub async fn broadcast<T>(&self, value: Option<T>) -> Result<T, StellwerkError>
    where
        T: Serialize + DeserializeOwned,
    {
        if self.is_leader() {
            let value = value.expect("broadcast root must supply a value");
            for member in 1..self.size() {
                self.post(member, TAG_BCAST, &value)?;
            }
            Ok(value)
        } else {
            assert!(value.is_none(), "only the group leader broadcasts");
            self.fetch(0, TAG_BCAST).await
        }
    }

    /// Gather one value per member, in group-rank order, to everyone.
    pub async fn allgather<T>(&self, mine: T) -> Result<Vec<T>, StellwerkError>
    where
        T: Serialize + DeserializeOwned,
    {
        if self.is_leader() {
            let mut slots: Vec<Option<T>> = (0..self.size()).map(|_| None).collect();
            slots[0] = Some(mine);
            for _ in 1..self.size() {
                let frame = self.fetch_frame(None, TAG_GATHER).await?;
                let (member, value): (usize, T) = rmp_serde::from_slice(&frame.payload)?;
                slots[member] = Some(value);
            }
            let gathered: Vec<T> = slots
                .into_iter()
                .map(|s| s.expect("every member contributed"))
                .collect();
            self.broadcast(Some(gathered)).await
        } else {
            self.post(0, TAG_GATHER, &(self.index, mine))?;
            self.broadcast(None).await
        }
    }

    /// Fold one value per member into the leader, in group-rank order.
    /// Returns `Some` at the leader, `None` elsewhere.
    pub async fn reduce<T, F>(&self, mine: T, fold: F) -> Result<Option<T>, StellwerkError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
    {
        if self.is_leader() {
            let mut slots: Vec<Option<T>> = (0..self.size()).map(|_| None).collect();
            slots[0] = Some(mine);
            for _ in 1..self.size() {
                let frame = self.fetch_frame(None, TAG_GATHER).await?;
                let (member, value): (usize, T) = rmp_serde::from_slice(&frame.payload)?;
                slots[member] = Some(value);
            }
            let mut acc: Option<T> = None;
            for value in slots.into_iter().map(|s| s.expect("every member contributed")) {
                acc = Some(match acc {
                    None => value,
                    Some(a) => fold(a, value),
                });
            }
            Ok(acc)
        } else {
            self.post(0, TAG_GATHER, &(self.index, mine))?;
            Ok(None)
        }
    }

    // ── Point-to-point plumbing ──────────────────────────────────────

    fn post<T: Serialize>(
        &self,
        member: usize,
        tag: u8,
        value: &T,
    ) -> Result<(), StellwerkError> {
        let frame = WireFrame {
            ctx: ContextId::Group(self.gid),
            lane: Lane::Group,
            tag,
            src: self.members[self.index],
            correlation: uuid::Uuid::new_v4(),
            sent_at: chrono::Utc::now(),
            payload: rmp_serde::to_vec(value)?,
        };
        self.fabric.deliver(self.members[member], frame)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        member: usize,
        tag: u8,
    ) -> Result<T, StellwerkError> {
        let frame = self.fetch_frame(Some(self.members[member]), tag).await?;
        Ok(rmp_serde::from_slice(&frame.payload)?)
    }

    /// Next frame matching (source, tag); non-matching frames are parked
    /// for whoever asks for them later.
    async fn fetch_frame(
        &self,
        src: Option<Rank>,
        tag: u8,
    ) -> Result<WireFrame, StellwerkError> {
        let mut guard = self.inbox.lock().await;
        if let Some(pos) = guard
            .parked
            .iter()
            .position(|f| f.tag == tag && src.map_or(true, |s| f.src == s))
        {
            return Ok(guard.parked.remove(pos).expect("position just found"));
        }
        loop {
            let frame = guard.inbox.recv().await?;
            if frame.tag == tag && src.map_or(true, |s| frame.src == s) {
                return Ok(frame);
            }
            guard.parked.push_back(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::mem::MemSwitch;
    use std::future::Future;
    use std::pin::Pin;

    type MemberBody = dyn Fn(Arc<GroupContext>) -> Pin<Box<dyn Future<Output = Result<(), StellwerkError>> + Send>>
        + Send
        + Sync;

    /// Run one async body per member, each on its own thread with its own
    /// current-thread runtime, the way worker units host their groups.
    fn each_member(ranks: &[Rank], gid: u64, body: Box<MemberBody>) {
        let switch = MemSwitch::new(ranks.iter().copied().max().unwrap() + 1);
        let body: Arc<MemberBody> = Arc::from(body);
        let members = ranks.to_vec();
        let handles: Vec<_> = ranks
            .iter()
            .map(|&rank| {
                let fabric: Arc<dyn Fabric> = Arc::new(switch.fabric(rank));
                let members = members.clone();
                let body = body.clone();
                std::thread::spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .build()
                        .expect("runtime");
                    rt.block_on(async move {
                        let group = GroupContext::form(fabric, gid, members).await?;
                        body(group).await
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().expect("member thread").expect("member body");
        }
    }

    #[test]
    fn formation_assigns_group_ranks_in_member_order() {
        each_member(
            &[3, 1, 2],
            1,
            Box::new(|group| {
                Box::pin(async move {
                    let me = group.members()[group.rank()];
                    assert_eq!(group.size(), 3);
                    assert_eq!(group.is_leader(), me == 3);
                    Ok(())
                })
            }),
        );
    }

    #[test]
    fn allgather_collects_in_group_rank_order() {
        each_member(
            &[1, 2, 3, 4],
            2,
            Box::new(|group| {
                Box::pin(async move {
                    let gathered = group.allgather(group.rank() as u64 * 10).await?;
                    assert_eq!(gathered, vec![0, 10, 20, 30]);
                    Ok(())
                })
            }),
        );
    }

    #[test]
    fn reduce_folds_to_the_leader_only() {
        each_member(
            &[1, 2, 3],
            3,
            Box::new(|group| {
                Box::pin(async move {
                    let total = group.reduce(group.rank() as u64 + 1, |a, b| a + b).await?;
                    if group.is_leader() {
                        assert_eq!(total, Some(6));
                    } else {
                        assert_eq!(total, None);
                    }
                    Ok(())
                })
            }),
        );
    }

    #[test]
    fn broadcast_reaches_every_member() {
        each_member(
            &[1, 2],
            4,
            Box::new(|group| {
                Box::pin(async move {
                    let value = if group.is_leader() {
                        group.broadcast(Some("payload".to_string())).await?
                    } else {
                        group.broadcast(None).await?
                    };
                    assert_eq!(value, "payload");
                    Ok(())
                })
            }),
        );
    }

    #[test]
    fn single_member_group_is_trivial() {
        each_member(
            &[2],
            5,
            Box::new(|group| {
                Box::pin(async move {
                    assert!(group.is_leader());
                    group.barrier().await?;
                    assert_eq!(group.allgather(7u32).await?, vec![7]);
                    Ok(())
                })
            }),
        );
    }
}
