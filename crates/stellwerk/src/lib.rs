pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod fabric;
pub mod group;
pub mod kernel;
pub mod kernels;
pub mod message;
pub mod scheduler;
pub mod transport;
pub mod worker;

pub use api::{init, Cluster, Role};
pub use channel::{ProbeConfig, ReceiveChannel, SendChannel};
pub use config::{NodeConfig, StellwerkConfig, TransportConfig, TransportKind};
pub use error::StellwerkError;
pub use event::{Event, EventEngine, EventKind, EventPayload, Flow, HandleId};
pub use fabric::{ContextId, Fabric, Inbox, Lane, WireFrame};
pub use fabric::mem::{MemFabric, MemSwitch};
pub use fabric::zmq::ZmqFabric;
pub use group::GroupContext;
pub use kernel::{KernelFn, KernelFuture, KernelRegistry, KernelResolver, TaskContext};
pub use kernels::builtin_registry;
pub use message::{Directive, Envelope, Message, Payload, WireTag, SCHEDULER_RANK};
pub use scheduler::Scheduler;
pub use transport::Transport;
pub use worker::Worker;

pub use stellwerk_core::{ActiveTask, Rank, RankPool, Status, Task, TaskId};
