//! Shared primitives: the cooperative worker thread.

pub mod worker;

pub use worker::{Worker, WorkerState};
