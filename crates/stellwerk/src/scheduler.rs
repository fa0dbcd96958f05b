//! The per-host scheduler: task admission, allocation, completion and
//! suspension.
//!
//! The scheduler is a state machine over (ready queue, free-unit pool,
//! active-task table), driven entirely by events on its dispatch thread —
//! admission, completion and suspension handling are serialized by
//! construction, so the tables need no synchronization beyond the mutex
//! that also admits same-host `spawn` calls.
//!
//! Invariants the bookkeeping maintains in every reachable state:
//! the rank sets of any two active tasks are disjoint, and the free pool
//! plus all active rank sets partition the node's worker units.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::{debug, info, warn};

use stellwerk_core::{ActiveTask, Rank, RankPool, Status, Task, TaskId};

use crate::channel::{ProbeConfig, ReceiveChannel, SendChannel};
use crate::error::StellwerkError;
use crate::event::{Event, EventEngine, EventKind, EventPayload, Flow};
use crate::fabric::{ContextId, Fabric};
use crate::message::{Directive, Envelope, Message, Payload, SCHEDULER_RANK};

struct SchedState {
    ready: VecDeque<Task>,
    pool: RankPool,
    active: HashMap<TaskId, ActiveTask>,
    /// Ids of tasks that have completed, so late waiters return
    /// immediately. Ids are 8 bytes; the set lives as long as the process.
    completed: HashSet<TaskId>,
    /// Group ids are never reused.
    next_gid: u64,
}

/// The per-host scheduling authority, owner of unit 0's dispatch thread.
pub struct Scheduler {
    engine: Arc<EventEngine>,
    send: SendChannel,
    recv: Arc<ReceiveChannel>,
    state: Mutex<SchedState>,
    next_tid: AtomicU64,
    units: u32,
    me: Mutex<Weak<Scheduler>>,
    dispatch: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Bring up the scheduler on unit 0: wires the channel pair into a
    /// fresh event engine, installs the message/admission handlers, and
    /// starts the dispatch thread.
    pub fn start(fabric: Arc<dyn Fabric>, probe: ProbeConfig) -> Arc<Self> {
        assert_eq!(
            fabric.local_rank(),
            SCHEDULER_RANK,
            "the scheduler runs on the node's lowest-ranked unit"
        );
        let units = fabric.units();
        let engine = Arc::new(EventEngine::new());
        let recv = ReceiveChannel::attach(
            &engine,
            &fabric,
            &[ContextId::Node, ContextId::Peers],
            probe,
        );

        let scheduler = Arc::new(Self {
            engine: engine.clone(),
            send: SendChannel::new(fabric),
            recv,
            state: Mutex::new(SchedState {
                ready: VecDeque::new(),
                pool: RankPool::new(units),
                active: HashMap::new(),
                completed: HashSet::new(),
                next_gid: 1,
            }),
            next_tid: AtomicU64::new(0),
            units,
            me: Mutex::new(Weak::new()),
            dispatch: Mutex::new(None),
        });
        *scheduler.me.lock().unwrap() = Arc::downgrade(&scheduler);

        let weak = Arc::downgrade(&scheduler);
        engine.connect(EventKind::MessageReceived, move |payload| {
            match weak.upgrade() {
                Some(s) => {
                    s.message_dispatch(payload.as_message());
                    Flow::Keep
                }
                None => Flow::Done,
            }
        });

        // Admission runs whenever capacity or work appears: on creation,
        // and on completion (which frees units).
        for kind in [EventKind::TaskCreated, EventKind::TaskCompleted] {
            let weak = Arc::downgrade(&scheduler);
            engine.connect(kind, move |_| match weak.upgrade() {
                Some(s) => {
                    s.try_admit();
                    Flow::Keep
                }
                None => Flow::Done,
            });
        }

        let thread_engine = engine.clone();
        let handle = std::thread::Builder::new()
            .name("stellwerk-dispatch".into())
            .spawn(move || thread_engine.run())
            .expect("spawn dispatch thread");
        *scheduler.dispatch.lock().unwrap() = Some(handle);

        info!(units, "scheduler started");
        scheduler
    }

    // ── Task creation ────────────────────────────────────────────────

    /// Create a task and queue it for admission. Same-host client path;
    /// worker requests arrive as `TaskCreate` messages instead.
    pub fn spawn(&self, kernel: &str, min: u32, max: u32) -> TaskId {
        self.create_task(kernel.to_string(), min, max)
    }

    fn create_task(&self, kernel: String, min: u32, max: u32) -> TaskId {
        assert!(min >= 1 && min <= max, "task unit range {min}..{max} is invalid");
        let capacity = self.state.lock().unwrap().pool.capacity();
        assert!(
            min as usize <= capacity,
            "task minimum {min} exceeds the node capacity {capacity}"
        );

        let tid = TaskId(self.next_tid.fetch_add(1, Ordering::SeqCst) + 1);
        let task = Task::new(tid, kernel, min, max);
        info!(%task, "task created");

        self.state.lock().unwrap().ready.push_back(task);
        self.engine
            .push(Event::new(EventKind::TaskCreated, EventPayload::Task(tid)));
        tid
    }

    // ── Message dispatch ─────────────────────────────────────────────

    /// Semantic actions for messages arriving over the channel pair.
    fn message_dispatch(&self, message: &Message) {
        match &message.payload {
            Payload::TaskCreate { kernel, min, max } => {
                let tid = self.create_task(kernel.clone(), *min, *max);
                // Reply synchronously with the new TaskID.
                let reply = Envelope::with_correlation(
                    message.src,
                    message.ctx,
                    &Payload::TidReply { tid },
                    message.correlation,
                )
                .and_then(|env| self.send.send(env));
                if let Err(e) = reply {
                    warn!(src = message.src, error = %e, "failed to reply with task id");
                }
            }
            Payload::TaskCompleted { tid } => self.on_completed(*tid),
            Payload::TaskWait { tid, awaited } => self.on_wait(*tid, *awaited),
            Payload::TidReply { .. } => {
                panic!("protocol violation: task id reply addressed to the scheduler")
            }
        }
    }

    // ── Admission & allocation ───────────────────────────────────────

    /// Admit ready tasks while capacity lasts: first task in arrival
    /// order whose requirement fits the free pool, repeatedly.
    fn try_admit(&self) {
        loop {
            let mut state = self.state.lock().unwrap();
            let Some(pos) = next_fit(&state.ready, state.pool.len()) else {
                return;
            };
            let task = state.ready.remove(pos).expect("position just found");
            let ranks = state.pool.take(task.min as usize);
            let gid = state.next_gid;
            state.next_gid += 1;

            let tid = task.id;
            let kernel = task.kernel.clone();
            info!(%task, ?ranks, gid, "task allocated");
            state.active.insert(tid, ActiveTask::new(task, ranks.clone()));

            // Ordered control sequence: wake, group membership to every
            // selected unit, then the task id and kernel name to the
            // lowest-numbered one, which broadcasts them to its group.
            let rank_list: Vec<Rank> = ranks.iter().copied().collect();
            let leader = rank_list[0];
            for rank in &rank_list {
                self.must_send(*rank, &Directive::Wake);
            }
            for rank in &rank_list {
                self.must_send(
                    *rank,
                    &Directive::GroupJoin {
                        gid,
                        ranks: rank_list.clone(),
                    },
                );
            }
            self.must_send(leader, &Directive::AssignTid { tid });
            self.must_send(leader, &Directive::AssignKernel { kernel });

            state
                .active
                .get_mut(&tid)
                .expect("task inserted above")
                .status = Status::Run;
        }
    }

    // ── Completion ───────────────────────────────────────────────────

    fn on_completed(&self, tid: TaskId) {
        {
            let mut state = self.state.lock().unwrap();
            let active = state
                .active
                .remove(&tid)
                .unwrap_or_else(|| panic!("completion notice for unknown task {tid}"));
            state.pool.release(active.ranks);
            state.completed.insert(tid);
            info!(%tid, free = state.pool.len(), "task completed");
        }
        // The sole signal `wait_for` and suspended tasks consume.
        self.engine
            .push(Event::new(EventKind::TaskCompleted, EventPayload::Task(tid)));
    }

    // ── Suspension ───────────────────────────────────────────────────

    /// A task announced it is blocked on another task: its units go back
    /// to the pool so ready tasks can use the capacity, and a one-shot
    /// resume fires when the awaited task completes.
    fn on_wait(&self, tid: TaskId, awaited: TaskId) {
        debug!(%tid, %awaited, "task suspended");
        let home = {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .active
                .get_mut(&tid)
                .unwrap_or_else(|| panic!("wait notice for unknown task {tid}"));
            let home = entry.suspend();
            state.pool.release(home.clone());
            home
        };

        let already_done = self.state.lock().unwrap().completed.contains(&awaited);
        if already_done {
            self.resume_task(tid, home);
        } else {
            let weak = self.me.lock().unwrap().clone();
            let mut home = Some(home);
            self.engine.connect_filtered(
                EventKind::TaskCompleted,
                move |_| {
                    if let Some(s) = weak.upgrade() {
                        s.resume_task(tid, home.take().expect("one-shot resume fired twice"));
                    }
                    Flow::Done
                },
                move |payload| payload.as_task() == awaited,
            );
        }

        // The freed capacity is offered to the ready queue right away.
        self.try_admit();
    }

    /// Re-send a resume directive to the waiting task's original units.
    ///
    /// The original rank identifiers are re-claimed from the pool; a rank
    /// bound to another task in the interim is a resource invariant
    /// violation and fails fast (documented suspension hazard).
    fn resume_task(&self, tid: TaskId, home: std::collections::BTreeSet<Rank>) {
        {
            let mut state = self.state.lock().unwrap();
            state.pool.take_exact(&home);
            state
                .active
                .get_mut(&tid)
                .unwrap_or_else(|| panic!("resume of unknown task {tid}"))
                .resume(home.clone());
        }
        for rank in &home {
            self.must_send(*rank, &Directive::Resume { tid });
        }
        info!(%tid, "task resumed");
    }

    // ── Blocking wait ────────────────────────────────────────────────

    /// Block the calling thread until `tid` completes. Returns
    /// immediately if it already has. Must not be called from the
    /// dispatch thread.
    pub fn wait_for(&self, tid: TaskId) {
        if self.state.lock().unwrap().completed.contains(&tid) {
            return;
        }

        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let waiter = signal.clone();
        let handle = self.engine.connect_filtered(
            EventKind::TaskCompleted,
            move |_| {
                let (flag, condvar) = &*waiter;
                *flag.lock().unwrap() = true;
                condvar.notify_one();
                Flow::Done
            },
            move |payload| payload.as_task() == tid,
        );

        // The completion may have been dispatched between the check and
        // the connect; re-checking closes the race.
        if self.state.lock().unwrap().completed.contains(&tid) {
            self.engine.disconnect(handle);
            return;
        }

        let (flag, condvar) = &*signal;
        let mut done = flag.lock().unwrap();
        while !*done {
            done = condvar.wait(done).unwrap();
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Signal every worker unit to exit, stop the probe, terminate the
    /// dispatch loop and join its thread.
    pub fn finalize(&self) {
        info!("scheduler shutting down");
        for rank in 1..self.units {
            self.must_send(rank, &Directive::Exit);
        }
        self.recv.shutdown();
        self.engine
            .push(Event::new(EventKind::Shutdown, EventPayload::Unit));
        if let Some(handle) = self.dispatch.lock().unwrap().take() {
            handle.join().expect("dispatch thread panicked");
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn free_units(&self) -> usize {
        self.state.lock().unwrap().pool.len()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().pool.capacity()
    }

    pub fn active_tasks(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn is_completed(&self, tid: TaskId) -> bool {
        self.state.lock().unwrap().completed.contains(&tid)
    }

    /// Transport failures have no recovery path in this design.
    fn must_send(&self, rank: Rank, directive: &Directive) {
        self.send
            .direct(rank, directive)
            .unwrap_or_else(|e| panic!("transport failure towards unit {rank}: {e}"));
    }
}

/// First task in arrival order whose minimum fits the free pool. A task
/// that does not fit is left in place; a later, smaller task behind it
/// may still be selected.
fn next_fit(ready: &VecDeque<Task>, free: usize) -> Option<usize> {
    ready.iter().position(|task| task.min as usize <= free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::mem::MemSwitch;
    use std::time::{Duration, Instant};

    fn ready_queue(mins: &[u32]) -> VecDeque<Task> {
        mins.iter()
            .enumerate()
            .map(|(i, &min)| Task::new(TaskId(i as u64 + 1), "k", min, min))
            .collect()
    }

    #[test]
    fn first_fit_selects_first_task_that_fits() {
        // min = [5, 2, 3] against a pool of 4: the task with min = 2 wins.
        let ready = ready_queue(&[5, 2, 3]);
        assert_eq!(next_fit(&ready, 4), Some(1));
    }

    #[test]
    fn first_fit_never_overdraws() {
        let ready = ready_queue(&[5, 6]);
        assert_eq!(next_fit(&ready, 4), None);
    }

    #[test]
    fn earlier_task_wins_when_both_fit() {
        let ready = ready_queue(&[3, 2]);
        assert_eq!(next_fit(&ready, 4), Some(0));
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn admission_allocates_in_arrival_order_with_first_fit() {
        let switch = MemSwitch::new(5); // 4 worker units
        let scheduler = Scheduler::start(
            Arc::new(switch.fabric(SCHEDULER_RANK)),
            ProbeConfig::default(),
        );

        scheduler.spawn("a", 3, 3);
        scheduler.spawn("b", 3, 3); // does not fit alongside a
        scheduler.spawn("c", 1, 1); // fits in the remainder

        assert!(wait_until(Duration::from_secs(2), || {
            scheduler.active_tasks() == 2 && scheduler.free_units() == 0
        }));
        scheduler.finalize();
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn unsatisfiable_task_is_fatal() {
        let switch = MemSwitch::new(3); // 2 worker units
        let scheduler = Scheduler::start(
            Arc::new(switch.fabric(SCHEDULER_RANK)),
            ProbeConfig::default(),
        );
        scheduler.spawn("too-big", 5, 5);
    }

    #[test]
    #[should_panic(expected = "invalid")]
    fn zero_minimum_is_fatal() {
        let switch = MemSwitch::new(3);
        let scheduler = Scheduler::start(
            Arc::new(switch.fabric(SCHEDULER_RANK)),
            ProbeConfig::default(),
        );
        scheduler.spawn("empty", 0, 1);
    }
}
