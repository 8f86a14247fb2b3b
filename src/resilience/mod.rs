//! # Resilience
//!
//! Retry pacing shared by the consumer loops and the job queue poller.

pub mod backoff;

pub use backoff::Backoff;
