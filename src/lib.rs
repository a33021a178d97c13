//! Playbook execution engine.
//!
//! A playbook is a versioned DAG of steps, each bound to a registered action. The
//! [`playbooks::ExecutionCoordinator`] drives one execution at a time through
//! `pending -> running -> (succeeded | failed | cancelled)`, dispatching ready steps to
//! a bounded worker pool, applying retry and timeout policy per step, and recording
//! every step result exactly once in an [`state::ExecutionStore`].

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod playbooks;
pub mod state;

pub use error::{AppError, Result};
