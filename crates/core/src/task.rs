use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rank::Rank;

/// Identifier of a task, monotonically increasing and scoped to the
/// scheduler that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A named unit of work awaiting allocation.
///
/// Immutable once created. Lives in the scheduler's ready queue until a
/// group of processing units is allocated for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Scheduler-assigned identity.
    pub id: TaskId,
    /// Name of the kernel to execute, resolved at dispatch time.
    pub kernel: String,
    /// Minimum number of processing units required.
    pub min: u32,
    /// Maximum number of processing units the task can use.
    pub max: u32,
}

impl Task {
    pub fn new(id: TaskId, kernel: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            id,
            kernel: kernel.into(),
            min,
            max,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]({}..{})", self.id, self.kernel, self.min, self.max)
    }
}

/// Lifecycle state of an allocated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Units allocated, dispatch directives not yet sent.
    Ready,
    /// Dispatched to its group.
    Run,
    /// Suspended waiting on another task; its units are back in the pool.
    Wait,
}

/// A [`Task`] bound to a concrete set of processing-unit ranks.
///
/// Created when the scheduler allocates units to a ready task, destroyed
/// when the completion notice arrives. While the task is suspended
/// (`Status::Wait`) the bound rank set is empty — the units sit in the free
/// pool and `home_ranks` remembers where to deliver the resume directives.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task: Task,
    pub ranks: BTreeSet<Rank>,
    pub status: Status,
}

impl ActiveTask {
    pub fn new(task: Task, ranks: BTreeSet<Rank>) -> Self {
        assert!(!ranks.is_empty(), "active task must hold at least one rank");
        Self {
            task,
            ranks,
            status: Status::Ready,
        }
    }

    /// Lowest-numbered rank of the group; receives the TaskID and kernel
    /// name and speaks for the group towards the scheduler.
    pub fn leader(&self) -> Rank {
        *self
            .ranks
            .iter()
            .next()
            .expect("active task with an empty rank set has no leader")
    }

    /// Drain the bound rank set for suspension, returning it.
    pub fn suspend(&mut self) -> BTreeSet<Rank> {
        self.status = Status::Wait;
        std::mem::take(&mut self.ranks)
    }

    /// Rebind the original rank set when the task is resumed.
    pub fn resume(&mut self, ranks: BTreeSet<Rank>) {
        assert!(
            self.ranks.is_empty() && self.status == Status::Wait,
            "resume of {} which is not suspended",
            self.task.id
        );
        self.ranks = ranks;
        self.status = Status::Run;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(rs: &[Rank]) -> BTreeSet<Rank> {
        rs.iter().copied().collect()
    }

    #[test]
    fn leader_is_lowest_rank() {
        let t = Task::new(TaskId(1), "k", 2, 4);
        let at = ActiveTask::new(t, ranks(&[3, 1, 2]));
        assert_eq!(at.leader(), 1);
    }

    #[test]
    fn suspend_drains_ranks() {
        let t = Task::new(TaskId(2), "k", 2, 2);
        let mut at = ActiveTask::new(t, ranks(&[1, 2]));
        at.status = Status::Run;

        let home = at.suspend();
        assert_eq!(home, ranks(&[1, 2]));
        assert!(at.ranks.is_empty());
        assert_eq!(at.status, Status::Wait);

        at.resume(home);
        assert_eq!(at.status, Status::Run);
        assert_eq!(at.leader(), 1);
    }

    #[test]
    #[should_panic(expected = "not suspended")]
    fn resume_of_running_task_is_fatal() {
        let t = Task::new(TaskId(3), "k", 1, 1);
        let mut at = ActiveTask::new(t, ranks(&[1]));
        at.resume(ranks(&[1]));
    }

    #[test]
    fn task_display() {
        let t = Task::new(TaskId(7), "rand_reduce", 2, 4);
        assert_eq!(t.to_string(), "t7[rand_reduce](2..4)");
    }
}
