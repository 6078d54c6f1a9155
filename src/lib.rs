//! testgrid: a test execution orchestrator.
//!
//! Accepts execution plans (ordered sets of tests with hardware
//! requirements), matches each test to an environment from a heterogeneous
//! pool, dispatches it to the runner for that environment's backend and
//! tracks every attempt until a terminal result is recorded.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Queue** ([`queue`]): priority+FIFO ordering of runnable tests
//! - **Resources** ([`resource`], [`pool`]): exclusive environment
//!   allocation, provisioning and quarantine
//! - **Backends** ([`provider`]): container, emulated-hardware and
//!   physical runners behind one trait
//! - **Tracker** ([`tracker`], [`store`]): per-test state machine, counters
//!   and crash-safe persistence
//! - **Orchestrator** ([`orchestrator`]): the worker pool tying them together
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use testgrid::{Orchestrator, load_config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(Path::new("testgrid.toml"))?;
//!     let orchestrator = Orchestrator::from_config(&config).await?;
//!     let handle = orchestrator.start();
//!     orchestrator.wait_idle().await;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod provider;
pub mod queue;
pub mod report;
pub mod resource;
pub mod store;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use model::{
    ExecutionPlan, ExecutionPlanStatus, PlanId, PlanState, Priority, TestKey, TestResult,
    TestSpec, TestState,
};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle};
pub use pool::{BackendType, Environment, HardwareRequirement};
pub use provider::{Backend, Dispatcher, Runner};
pub use tracker::StatusTracker;
