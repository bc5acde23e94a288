//! Resource-ingestion pipeline for a course dashboard.
//!
//! - [`syncer`] pulls a course's file listing and upserts one record per file.
//! - [`queue`] carries `download` jobs durably between syncer and worker.
//! - [`worker`] fetches bytes, writes them to the storage directory and
//!   records the outcome.

pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod model;
pub mod queue;
pub mod source;
pub mod syncer;
pub mod worker;
