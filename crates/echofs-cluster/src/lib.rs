//! # EchoFS Cluster
//!
//! The replication engine and adaptive consistency controller of
//! EchoFS.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        EchoFS Core                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   writes/reads            ┌──────────────────┐               │
//! │  ───────────────────────► │ Replication Mgr  │               │
//! │                           └───────┬──────────┘               │
//! │                      mode C ▼     ▼ mode A                   │
//! │               ┌────────────┐      ┌─────────────┐            │
//! │               │ Sync       │      │ Async       │            │
//! │               │ (quorum)   │      │ (primary +  │            │
//! │               │            │      │  bg queue)  │            │
//! │               └─────┬──────┘      └──────┬──────┘            │
//! │                     ▼                    ▼                   │
//! │               ┌──────────────────────────────┐               │
//! │               │        Worker Pool           │               │
//! │               └──────────────────────────────┘               │
//! │                                                              │
//! │   metrics ──► Policy Engine ──► Consistency Controller       │
//! │                                  (hysteresis, overrides,     │
//! │                                   emergency, persistence)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! - **Worker Pool**: health tracking and weighted selection over the
//!   configured storage nodes
//! - **Strategies**: synchronous quorum writes and asynchronous
//!   primary-ack writes with a bounded background queue
//! - **Policy Engine**: weighted scoring of observed conditions into a
//!   mode recommendation
//! - **Consistency Controller**: the per-object mode state machine with
//!   hysteresis, cooldowns, overrides, and durable transitions

pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod strategy;
pub mod transport;

// Re-export main types
pub use config::{EchoConfig, WorkerAddr};
pub use controller::{ConsistencyController, ControllerStatus, ModeChangeEvent, ModeInfo};
pub use error::{ClusterError, ClusterResult};
pub use manager::{ReplicationManager, WriteReceipt};
pub use policy::{MetricsSource, ObjectMetrics, PolicyEngine};
pub use pool::WorkerPool;
pub use transport::{HttpTransport, InMemoryTransport, WorkerTransport};
