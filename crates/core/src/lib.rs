pub mod rank;
pub mod task;

pub use rank::{Rank, RankPool};
pub use task::{ActiveTask, Status, Task, TaskId};
