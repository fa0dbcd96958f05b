//! Top-level surface: role assignment, `init`/`finalize`, and the
//! single-process cluster harness.

use std::sync::Arc;

use tracing::info;

use stellwerk_core::{Rank, TaskId};

use crate::channel::ProbeConfig;
use crate::config::StellwerkConfig;
use crate::error::StellwerkError;
use crate::fabric::mem::MemSwitch;
use crate::fabric::zmq::ZmqFabric;
use crate::fabric::Fabric;
use crate::kernel::KernelResolver;
use crate::message::SCHEDULER_RANK;
use crate::scheduler::Scheduler;
use crate::worker::Worker;

/// What a process is on its node: the scheduling authority or one of its
/// worker units. Assigned by rank — the node's lowest-ranked unit
/// schedules, all others work.
pub enum Role {
    Scheduler(Arc<Scheduler>),
    Worker(Worker),
}

/// Bring one processing unit up over the ZeroMQ fabric.
pub async fn init(
    config: &StellwerkConfig,
    rank: Rank,
    resolver: Arc<dyn KernelResolver>,
) -> Result<Role, StellwerkError> {
    config.validate()?;
    let fabric: Arc<dyn Fabric> = Arc::new(
        ZmqFabric::connect(&config.transport.base(), rank, config.node.units).await?,
    );
    if rank == SCHEDULER_RANK {
        Ok(Role::Scheduler(Scheduler::start(
            fabric,
            config.probe.clone(),
        )))
    } else {
        Ok(Role::Worker(Worker::new(fabric, resolver)))
    }
}

/// A whole node inside one process: the scheduler plus one control thread
/// per worker unit, connected by the in-process fabric.
///
/// Stands in for the external discovery/bootstrap collaborator in the
/// demo binary and the integration tests.
pub struct Cluster {
    scheduler: Arc<Scheduler>,
    workers: Vec<std::thread::JoinHandle<Result<(), StellwerkError>>>,
}

impl Cluster {
    pub fn launch(units: u32, resolver: Arc<dyn KernelResolver>) -> Self {
        let switch = MemSwitch::new(units);

        let workers = (1..units)
            .map(|rank| {
                let fabric: Arc<dyn Fabric> = Arc::new(switch.fabric(rank));
                let resolver = resolver.clone();
                std::thread::Builder::new()
                    .name(format!("stellwerk-unit-{rank}"))
                    .spawn(move || {
                        let rt = tokio::runtime::Builder::new_current_thread()
                            .build()
                            .expect("worker runtime");
                        let worker = Worker::new(fabric, resolver);
                        rt.block_on(worker.run())
                    })
                    .expect("spawn worker thread")
            })
            .collect();

        let scheduler = Scheduler::start(
            Arc::new(switch.fabric(SCHEDULER_RANK)),
            ProbeConfig::default(),
        );
        info!(units, "in-process cluster up");
        Self { scheduler, workers }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn spawn(&self, kernel: &str, min: u32, max: u32) -> TaskId {
        self.scheduler.spawn(kernel, min, max)
    }

    pub fn wait_for(&self, tid: TaskId) {
        self.scheduler.wait_for(tid);
    }

    /// Finalize the scheduler and join every worker unit, surfacing the
    /// first worker failure.
    pub fn shutdown(self) -> Result<(), StellwerkError> {
        self.scheduler.finalize();
        for handle in self.workers {
            handle.join().expect("worker thread panicked")?;
        }
        Ok(())
    }
}
