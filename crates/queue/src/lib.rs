//! The Queue Subsystem: a Redis-backed FIFO task queue with status/progress
//! tracking, error classification, timeout detection, and abandoned-task
//! recovery.

pub mod classifier;
pub mod consumer;
pub mod producer;
pub mod queue_manager;
pub mod recovery_manager;
pub mod timeout_manager;

pub use classifier::classify_and_decide;
pub use consumer::{ConsumerConfig, ConsumerState, TaskConsumer};
pub use producer::TaskProducer;
pub use queue_manager::{QueueManager, RedisConnectionLike};
pub use recovery_manager::{RecoveryManager, RecoveryStats};
pub use timeout_manager::TimeoutManager;
