//! Hydrant: a high-throughput byte-stream ingestion pipeline that streams
//! unstructured input into a relational store via a batched bulk-copy
//! protocol, while keeping a pool of long-lived database connections
//! healthy under partial failure. See `SPEC_FULL.md` for the full
//! requirements this crate implements.

pub mod batch;
pub mod cli;
pub mod config;
pub mod consts;
pub mod copy;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod stats;
pub mod workers;
