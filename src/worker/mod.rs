//! Worker Pool
//!
//! Codec work (encode, decode, rebuild) is CPU bound and runs on a fixed
//! set of OS threads rather than the async runtime. Jobs are typed data
//! (`job.rs`); the pool (`pool.rs`) queues them, tracks their state and
//! survives workers that crash mid-job.

pub mod job;
pub mod pool;

pub use job::{Job, JobOutput};
pub use pool::{FaultInjector, PoolConfig, TaskHandle, TaskState, WorkerPool};
