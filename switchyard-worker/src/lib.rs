//! # Switchyard Worker
//!
//! Durable Redis job queue: producers add jobs, workers claim and run them
//! with retries, and producers can wait for a job to finish.
//!
//! ## Modules
//!
//! - `queue`: `QueueClient`, `WorkQueue` and the producer operations
//! - `worker`: `QueueProcessor` and the claim/maintenance loops
//! - `handler`: the `JobHandler` trait and `JobError`
//! - `job`: stored job data, `JobInfo`, `JobRef` and queue events
//! - `options`: queue, job, worker and per-add options
//! - `keys`: Redis key layout
//!
//! State transitions run as Lua scripts (see `scripts/`), one script per
//! transition, so every move between lists is atomic.
//!
//! ## Example
//!
//! ```no_run
//! use switchyard_shared::redis::RedisConfig;
//! use switchyard_worker::handler::handler_fn;
//! use switchyard_worker::job::JobInfo;
//! use switchyard_worker::options::{AddOptions, QueueOptions};
//! use switchyard_worker::queue::QueueClient;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = QueueClient::connect(RedisConfig::from_env()?).await?;
//! let thumbnails = client.queue::<String>(QueueOptions::new("thumbnails")).await?;
//!
//! let worker = thumbnails
//!     .process(handler_fn(|path: String, _job: JobInfo| async move {
//!         println!("resizing {}", path);
//!         Ok::<(), anyhow::Error>(())
//!     }))
//!     .start();
//!
//! thumbnails.add(&"uploads/cat.png".to_string(), AddOptions::default()).await?;
//! worker.close().await;
//! # Ok(())
//! # }
//! ```

pub mod handler;
pub mod job;
pub mod keys;
pub mod options;
pub mod queue;
mod scripts;
pub mod worker;

pub use handler::{handler_fn, JobError, JobHandler};
pub use job::{JobInfo, JobRef, JobState, QueueEvent};
pub use options::{AddOptions, Backoff, JobOptions, QueueOptions, WorkerOptions};
pub use queue::{JobCounts, QueueClient, QueueError, WorkQueue};
pub use worker::{QueueProcessor, WorkerHandle};
