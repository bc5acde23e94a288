//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories alongside the domain records.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `lecture_ingest::db`; the repository
//! API and commonly used view models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ClaimedJob, EnqueuedJob, StatusCounts, UpsertOutcome};
