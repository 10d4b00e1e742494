//! Infrastructure layer: shared store, configuration and the job system.

pub mod config;
pub mod jobs;
pub mod store;
