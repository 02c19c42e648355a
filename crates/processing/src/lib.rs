//! The Parallel Processing Subsystem: per-task, splits one input file into
//! N chunks and cleans them concurrently across a fixed worker pool.

pub mod chunk_splitter;
pub mod manager;
pub mod messages;
pub mod performance_monitor;
pub mod progress_tracker;
pub mod resource_monitor;
pub mod result_collector;
pub mod worker_pool;

pub use chunk_splitter::split_file;
pub use manager::{ParallelProcessingManager, ParallelProcessingManagerConfig};
pub use performance_monitor::{PerformanceMonitor, PerformanceReport};
pub use progress_tracker::ProgressTracker;
pub use resource_monitor::ResourceMonitor;
pub use result_collector::ResultCollector;
pub use worker_pool::WorkerPool;
