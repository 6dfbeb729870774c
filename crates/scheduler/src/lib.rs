//! `fleetlink-scheduler` — cron-driven job firing across replicated
//! scheduler instances.
//!
//! Every replica computes the same schedule. Agreement on the next fire
//! instant lives in a shared register (Redis key with a TTL of roughly one
//! interval), and a distributed mutex elects the single replica that
//! actually fires a given tick; the losers skip and converge on the next
//! refresh.

pub mod engine;
pub mod entry;
pub mod register;

pub use engine::{
    schedule_handler_fn, FnScheduleHandler, ScheduleError, ScheduleHandler, Scheduler,
};
pub use register::{
    InMemoryScheduleRegister, RedisScheduleRegister, RegisterError, ScheduleRegister,
};
