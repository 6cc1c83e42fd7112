//! Blocking primitives layered on the scheduler and the timer engine

pub mod wait_queue;

pub use wait_queue::{WaitPolicy, WaitQueueId, WakeSelector};
