//! Execution-and-delivery pipeline: intake, job queue, runner, fanout.
//!
//! Control flow is `Intake -> JobQueue -> Runner -> FanoutRouter`; the
//! runner reports through an [`EventSink`], which in production is the
//! router and in tests is whatever records the events.

pub mod artifact;
pub mod error;
pub mod events;
pub mod fanout;
pub mod intake;
pub mod languages;
pub mod queue;
pub mod runner;

pub use error::{FanoutError, QueueError, RunError};
pub use events::EventSink;
pub use fanout::{Bus, ConnectionId, FanoutRouter, LocalBus, RedisBus, RoomRegistry};
pub use intake::Intake;
pub use languages::LanguageConfigManager;
pub use queue::{Admission, JobQueue, JobStore, MemoryJobStore, QueueConfig, RedisJobStore, Rejection};
pub use runner::{RunOutcome, Runner};
