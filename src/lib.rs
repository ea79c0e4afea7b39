//! catalog-mirror - resumable, chunked mirror of a print-on-demand catalog
//!
//! Walks blueprints → print providers → variants from the upstream API into a
//! local SQLite cache. Runs are single-flight, checkpointed after every
//! blueprint and survive restarts through a persisted run record and lease.

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(test)]
mod test_utils;
