//! # taskroom
//!
//! Task queues and the work that runs on them for a messaging flow server:
//! deduplicated campaign event firing, flow start batching under per-contact
//! locks, and serialized per-contact event handling.
//!
//! Queues, markers and locks live in Redis (with in-memory equivalents for
//! tests), durable state in Postgres, and flow execution in an external
//! engine reached over HTTP.

pub mod campaigns;
pub mod config;
pub mod contacts;
pub mod control;
pub mod cron;
pub mod db;
pub mod error;
pub mod flows;
pub mod lock;
pub mod marker;
pub mod model;
pub mod queue;
pub mod runtime;
pub mod starts;
pub mod tasks;
pub mod telemetry;

pub use error::{Error, Result};
pub use runtime::Runtime;
