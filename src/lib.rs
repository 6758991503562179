pub mod buffer;
pub mod event_loop;
pub mod gather;
pub mod result;
pub mod task;
pub mod time;

pub use buffer::Buffer;
pub use event_loop::{run, EventLoop, HandleId, HandleState, LoopContext};
pub use gather::{gather, gather_with, GatherOptions};
pub use result::ResultCell;
pub use task::{schedule_task, CancelHandle, ScheduledTask, StartPolicy, Task};
pub use time::{sleep, yield_now};

pub type Result<T> = std::result::Result<T, CoroError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoroError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Failure(String),
}

impl CoroError {
    /// Failure raised inside a computation body; it is stored in the task's
    /// result and re-raised verbatim to the awaiter.
    pub fn failure(msg: impl Into<String>) -> Self {
        CoroError::Failure(msg.into())
    }
}
