//! The compute coordination kernel: a deduplicating content store, a task
//! queue with claim/return semantics for a fleet of compute managers, a
//! record state machine with exact revert, and a service engine that drives
//! multi-step procedures to completion.

pub mod config;
pub mod datasets;
pub mod jobs;
pub mod server;
pub mod services;
pub mod status;
pub mod store;
pub mod tasks;

pub use config::{ApiLimits, AutoResetPolicy, FractalConfig};
pub use jobs::JobRunner;
pub use server::Server;
pub use store::{mem::MemStore, postgres::PgStore, Store};
