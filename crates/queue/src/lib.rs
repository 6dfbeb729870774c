//! `fleetlink-queue` — durable at-least-once job execution backed by a
//! relational store.
//!
//! Workers on every replica lease rows out of a shared `jobs` table inside
//! row-locked transactions, heartbeat while a handler runs, and a requeue
//! loop reclaims rows whose worker died mid-flight. Handlers must be
//! idempotent: a job whose final status update was lost will run again.

pub mod engine;
pub mod job;
pub mod postgres;
pub mod store;

pub use engine::{
    job_handler_fn, Enqueue, FnJobHandler, HandlerError, HandlerResult, JobHandler, QueueConfig,
    QueueEngine, QueueError,
};
pub use job::{JobId, JobRow, JobStatus};
pub use postgres::PgJobStore;
pub use store::{InMemoryJobStore, JobStore, StoreError};
