#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Ingestion Server
//!
//! Long-running ingestion orchestration process. A declared capability set decides
//! which subsystems one instance runs: consumer groups over partitioned event streams,
//! a durable job queue, a worker pool executing tenant plugin code, a reload bus for
//! cache invalidation, and an HTTP health surface.
//!
//! ## Architecture
//!
//! ```text
//! broker ──▶ ConsumerGroupManager (per stream) ──▶ WorkerPool / JobQueue / broker / object store
//!                       │
//!   pub/sub ──▶ ReloadBus ──▶ WorkerPool broadcasts
//!                       │
//!            HealthRegistry ◀── /_health
//!                       │
//!            Orchestrator: startup plan, fault funnel, single shutdown path
//! ```
//!
//! Expensive resources (the [`hub::Hub`] of shared clients and the
//! [`worker_pool::WorkerPool`]) are built lazily by the first startup step that needs
//! them and closed exactly once during shutdown.
//!
//! ## Module Organization
//!
//! - [`clients`] - Broker, cache, pub/sub, object store and error-tracking seams
//! - [`config`] - Layered configuration and capability sets
//! - [`consumer`] - Per-stream consumer group managers and batch processors
//! - [`jobs`] - Durable job queue and its poller
//! - [`lifecycle`] - Startup plan, shutdown sequence and fault handling
//! - [`pubsub`] - Reload bus
//! - [`worker_pool`] - Execution units for plugin tasks
//! - [`web`] - Health endpoints
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ingestion_server::clients::StandaloneConnector;
//! use ingestion_server::config::ServerConfig;
//! use ingestion_server::lifecycle::Orchestrator;
//! use ingestion_server::worker_pool::NoopTaskRunner;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::load()?;
//! let orchestrator = Orchestrator::new(
//!     config,
//!     Arc::new(StandaloneConnector::new()),
//!     Arc::new(NoopTaskRunner),
//! )?;
//! let status = orchestrator.run().await;
//! std::process::exit(status.code());
//! # }
//! ```

pub mod clients;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod health;
pub mod hub;
pub mod jobs;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod pubsub;
pub mod resilience;
pub mod schedule;
pub mod web;
pub mod worker_pool;

pub use config::{Capability, CapabilitySet, ServerConfig};
pub use consumer::{ConsumerGroupManager, ConsumerState, StreamKind};
pub use error::{BrokerError, Result, ServerError};
pub use health::HealthRegistry;
pub use hub::Hub;
pub use lifecycle::{ExitStatus, Fault, Orchestrator};
pub use worker_pool::{PoolTask, WorkerPool};
