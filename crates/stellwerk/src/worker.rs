//! The per-unit worker: one control loop, suspendable execution contexts.
//!
//! A worker unit blocks on the node context's control lane awaiting a
//! wake signal, then acts on the pending directive: exit, join a task
//! group and run its kernel, or transfer control back into a suspended
//! execution context. Kernel bodies run as futures on the unit's
//! cooperative runtime — at most one is logically running per unit, and
//! control transfers at kernel entry, `wait_for`, and kernel return,
//! never preemptively. A suspended body keeps its state (the future and
//! its locals) and is parked on a notifier until the scheduler's resume
//! directive arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace};

use stellwerk_core::{Rank, TaskId};

use crate::channel::SendChannel;
use crate::error::StellwerkError;
use crate::fabric::{ContextId, Fabric, Inbox, Lane, WireFrame};
use crate::group::GroupContext;
use crate::kernel::{KernelResolver, TaskContext};
use crate::message::{Directive, Envelope, Message, Payload, SCHEDULER_RANK};

/// A bound execution context: the parked side of one active task.
#[derive(Clone)]
struct TaskBinding {
    resume: Arc<Notify>,
    gid: u64,
}

struct WorkerState {
    /// TaskId → suspended/running execution context, kept until the task
    /// completes (a suspended context must be findable by a resume).
    active: Mutex<HashMap<TaskId, TaskBinding>>,
    /// The at-most-one context logically running on this unit.
    current: Mutex<Option<TaskId>>,
    /// Spawn replies from the scheduler.
    reply: tokio::sync::Mutex<Inbox>,
    /// Kernel failures are fatal for the owning worker; the wrapper task
    /// reports them here so the control loop can exit.
    fatal: mpsc::UnboundedSender<StellwerkError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<StellwerkError>>>,
}

/// One processing unit executing tasks under its node's scheduler.
pub struct Worker {
    rank: Rank,
    fabric: Arc<dyn Fabric>,
    resolver: Arc<dyn KernelResolver>,
    send: SendChannel,
    state: Arc<WorkerState>,
}

impl Worker {
    pub fn new(fabric: Arc<dyn Fabric>, resolver: Arc<dyn KernelResolver>) -> Self {
        let rank = fabric.local_rank();
        assert_ne!(rank, SCHEDULER_RANK, "the scheduler's unit is not a worker");
        let (fatal, fatal_rx) = mpsc::unbounded_channel();
        let reply = fabric.inbox(ContextId::Node, Lane::Reply);
        Self {
            rank,
            send: SendChannel::new(fabric.clone()),
            fabric,
            resolver,
            state: Arc::new(WorkerState {
                active: Mutex::new(HashMap::new()),
                current: Mutex::new(None),
                reply: tokio::sync::Mutex::new(reply),
                fatal,
                fatal_rx: Mutex::new(Some(fatal_rx)),
            }),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The control loop. Returns when an exit directive arrives, or with
    /// the error that killed the unit.
    pub async fn run(&self) -> Result<(), StellwerkError> {
        let mut ctrl = self.fabric.inbox(ContextId::Node, Lane::Control);
        let mut fatal_rx = self
            .state
            .fatal_rx
            .lock()
            .unwrap()
            .take()
            .expect("worker run twice");
        // Directives pulled off the control lane while the leader was
        // waiting for its task assignment.
        let mut stash: VecDeque<WireFrame> = VecDeque::new();

        info!(rank = self.rank, "worker unit started");
        let result = loop {
            let frame = if let Some(frame) = stash.pop_front() {
                frame
            } else {
                tokio::select! {
                    frame = ctrl.recv() => match frame {
                        Ok(frame) => frame,
                        Err(e) => break Err(e),
                    },
                    Some(e) = fatal_rx.recv() => break Err(e),
                }
            };

            let directive = match Directive::decode(frame.tag, &frame.payload) {
                Ok(d) => d,
                Err(e) => break Err(e),
            };
            trace!(rank = self.rank, tag = directive.tag(), "control directive");

            match directive {
                Directive::Exit => break Ok(()),
                // The wake precedes the real directive; blocking on the
                // control lane already covers it.
                Directive::Wake => {}
                Directive::GroupJoin { gid, ranks } => {
                    if let Err(e) = self.join(gid, ranks, &mut ctrl, &mut stash).await {
                        break Err(e);
                    }
                }
                Directive::Resume { tid } => {
                    let binding = self
                        .state
                        .active
                        .lock()
                        .unwrap()
                        .get(&tid)
                        .cloned()
                        .unwrap_or_else(|| panic!("resume directive for unknown task {tid}"));
                    debug!(rank = self.rank, %tid, "resume directive");
                    binding.resume.notify_one();
                }
                other @ (Directive::AssignTid { .. } | Directive::AssignKernel { .. }) => {
                    break Err(StellwerkError::Protocol(format!(
                        "out-of-band control tag {} outside a group join",
                        other.tag()
                    )));
                }
            }
        };

        match &result {
            Ok(()) => info!(rank = self.rank, "worker unit exiting"),
            Err(e) => error!(rank = self.rank, error = %e, "worker unit failed"),
        }
        result
    }

    /// Join a newly allocated task group and start its kernel.
    async fn join(
        &self,
        gid: u64,
        ranks: Vec<Rank>,
        ctrl: &mut Inbox,
        stash: &mut VecDeque<WireFrame>,
    ) -> Result<(), StellwerkError> {
        debug!(rank = self.rank, gid, ?ranks, "joining task group");
        let group = GroupContext::form(self.fabric.clone(), gid, ranks).await?;

        // The leader receives the assignment from the scheduler and
        // broadcasts it; everyone else listens on the group.
        let (tid, kernel_name) = if group.is_leader() {
            let tid = match self.next_assignment(ctrl, stash).await? {
                Directive::AssignTid { tid } => tid,
                other => {
                    return Err(StellwerkError::Protocol(format!(
                        "expected task id assignment, got control tag {}",
                        other.tag()
                    )))
                }
            };
            let tid = group.broadcast(Some(tid)).await?;
            let kernel = match self.next_assignment(ctrl, stash).await? {
                Directive::AssignKernel { kernel } => kernel,
                other => {
                    return Err(StellwerkError::Protocol(format!(
                        "expected kernel assignment, got control tag {}",
                        other.tag()
                    )))
                }
            };
            let kernel = group.broadcast(Some(kernel)).await?;
            (tid, kernel)
        } else {
            let tid = group.broadcast(None).await?;
            let kernel = group.broadcast(None).await?;
            (tid, kernel)
        };
        debug!(rank = self.rank, %tid, kernel = %kernel_name, "task assignment received");

        let Some(kernel) = self.resolver.resolve(&kernel_name) else {
            error!(rank = self.rank, kernel = %kernel_name, "cannot resolve kernel");
            return Err(StellwerkError::KernelNotFound(kernel_name));
        };

        let binding = TaskBinding {
            resume: Arc::new(Notify::new()),
            gid,
        };
        self.state.active.lock().unwrap().insert(tid, binding);
        let previous = self.state.current.lock().unwrap().replace(tid);
        assert!(
            previous.is_none(),
            "unit {} already hosts running context {previous:?}",
            self.rank
        );

        let task_ctx: Arc<dyn TaskContext> = Arc::new(WorkerTask {
            tid,
            group: group.clone(),
            send: self.send.clone(),
            state: self.state.clone(),
        });
        let body = kernel(task_ctx);

        let state = self.state.clone();
        let fabric = self.fabric.clone();
        let send = self.send.clone();
        tokio::spawn(async move {
            match body.await {
                Ok(()) => {
                    // All members synchronize before completion is
                    // reported and the binding is discarded.
                    if let Err(e) = group.barrier().await {
                        let _ = state.fatal.send(e);
                        return;
                    }
                    if group.is_leader() {
                        debug!(%tid, "kernel completed");
                        let sent = Envelope::new(
                            SCHEDULER_RANK,
                            ContextId::Node,
                            &Payload::TaskCompleted { tid },
                        )
                        .and_then(|env| send.send(env));
                        if let Err(e) = sent {
                            let _ = state.fatal.send(e);
                            return;
                        }
                    }
                    state.active.lock().unwrap().remove(&tid);
                    *state.current.lock().unwrap() = None;
                    fabric.retire(ContextId::Group(gid));
                }
                Err(e) => {
                    error!(%tid, error = %e, "kernel body failed");
                    let _ = state.fatal.send(e);
                }
            }
        });
        // Control returns to the loop; the kernel runs as soon as the
        // loop parks on the control lane.
        Ok(())
    }

    /// Pull the next task assignment off the control lane, stashing
    /// anything else (e.g. a resume racing the join) for the main loop.
    async fn next_assignment(
        &self,
        ctrl: &mut Inbox,
        stash: &mut VecDeque<WireFrame>,
    ) -> Result<Directive, StellwerkError> {
        loop {
            let frame = ctrl.recv().await?;
            match Directive::decode(frame.tag, &frame.payload)? {
                d @ (Directive::AssignTid { .. } | Directive::AssignKernel { .. }) => {
                    return Ok(d)
                }
                _ => stash.push_back(frame),
            }
        }
    }
}

// ── Kernel-facing surface ────────────────────────────────────────────

/// The [`TaskContext`] handed to a kernel body.
struct WorkerTask {
    tid: TaskId,
    group: Arc<GroupContext>,
    send: SendChannel,
    state: Arc<WorkerState>,
}

#[async_trait]
impl TaskContext for WorkerTask {
    fn tid(&self) -> TaskId {
        self.tid
    }

    fn group(&self) -> &GroupContext {
        &self.group
    }

    async fn spawn(&self, kernel: &str, min: u32, max: u32) -> Result<TaskId, StellwerkError> {
        let envelope = Envelope::new(
            SCHEDULER_RANK,
            ContextId::Node,
            &Payload::TaskCreate {
                kernel: kernel.to_string(),
                min,
                max,
            },
        )?;
        let correlation = envelope.correlation;
        self.send.send(envelope)?;

        let mut reply = self.state.reply.lock().await;
        let message = Message::from_frame(reply.recv().await?)?;
        if message.correlation != correlation {
            return Err(StellwerkError::Protocol(
                "spawn reply correlation mismatch".into(),
            ));
        }
        match message.payload {
            Payload::TidReply { tid } => {
                debug!(%tid, kernel, "task generated");
                Ok(tid)
            }
            other => Err(StellwerkError::Protocol(format!(
                "unexpected {} on the reply lane",
                other.tag().as_str()
            ))),
        }
    }

    async fn wait_for(&self, other: TaskId) -> Result<(), StellwerkError> {
        // Waiting on yourself completes trivially.
        if other == self.tid {
            return Ok(());
        }

        let resume = self
            .state
            .active
            .lock()
            .unwrap()
            .get(&self.tid)
            .unwrap_or_else(|| panic!("wait_for outside an active binding for {}", self.tid))
            .resume
            .clone();

        // The leader tells the scheduler; every member suspends and is
        // resumed by its own directive.
        if self.group.is_leader() {
            let envelope = Envelope::new(
                SCHEDULER_RANK,
                ContextId::Node,
                &Payload::TaskWait {
                    tid: self.tid,
                    awaited: other,
                },
            )?;
            self.send.send(envelope)?;
        }

        *self.state.current.lock().unwrap() = None;
        debug!(tid = %self.tid, awaited = %other, "execution context suspended");
        resume.notified().await;
        *self.state.current.lock().unwrap() = Some(self.tid);
        debug!(tid = %self.tid, "execution context resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::mem::MemSwitch;
    use crate::kernel::KernelRegistry;

    fn spawn_worker(
        fabric: Arc<dyn Fabric>,
        resolver: Arc<dyn KernelResolver>,
    ) -> std::thread::JoinHandle<Result<(), StellwerkError>> {
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            let worker = Worker::new(fabric, resolver);
            rt.block_on(worker.run())
        })
    }

    #[test]
    fn exit_directive_terminates_the_loop() {
        let switch = MemSwitch::new(2);
        let send = SendChannel::new(Arc::new(switch.fabric(SCHEDULER_RANK)));
        let handle = spawn_worker(
            Arc::new(switch.fabric(1)),
            Arc::new(KernelRegistry::new()),
        );

        send.direct(1, &Directive::Wake).unwrap();
        send.direct(1, &Directive::Exit).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn out_of_band_assignment_is_fatal() {
        let switch = MemSwitch::new(2);
        let send = SendChannel::new(Arc::new(switch.fabric(SCHEDULER_RANK)));
        let handle = spawn_worker(
            Arc::new(switch.fabric(1)),
            Arc::new(KernelRegistry::new()),
        );

        send.direct(1, &Directive::AssignTid { tid: TaskId(1) }).unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(StellwerkError::Protocol(_))));
    }

    #[test]
    fn unresolved_kernel_is_fatal() {
        let switch = MemSwitch::new(2);
        let send = SendChannel::new(Arc::new(switch.fabric(SCHEDULER_RANK)));
        let handle = spawn_worker(
            Arc::new(switch.fabric(1)),
            Arc::new(KernelRegistry::new()),
        );

        send.direct(
            1,
            &Directive::GroupJoin {
                gid: 1,
                ranks: vec![1],
            },
        )
        .unwrap();
        send.direct(1, &Directive::AssignTid { tid: TaskId(1) }).unwrap();
        send.direct(
            1,
            &Directive::AssignKernel {
                kernel: "missing".into(),
            },
        )
        .unwrap();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(StellwerkError::KernelNotFound(_))));
    }
}
