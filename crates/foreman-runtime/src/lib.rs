//! `foreman-runtime` – Queue, Pipeline & Executor
//!
//! The moving half of Foreman.  Tasks wait in the [`TaskQueue`], the
//! [`Executor`] pulls them one at a time and walks each through the
//! [`Pipeline`], resolving stage workers from the kernel's registry and
//! sending privileged stages through the permission gate.
//!
//! # Modules
//!
//! - [`context`] – [`OrchestrationContext`]: the registry, queue, gate, and
//!   bus every component shares, built once and passed by `Arc`.
//! - [`queue`] – FIFO [`TaskQueue`] with a coalescing work signal and the
//!   drain claim every executor must hold.
//! - [`pipeline`] – [`Pipeline`] and [`PipelineStage`]: the ordered stages and
//!   which of them are privileged.
//! - [`executor`] – [`Executor`]: the single-consumer drain loop.
//! - [`manager`] – [`ServiceManager`]: start and stop every registered
//!   service as a batch.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use foreman_kernel::{FnService, GateConfig, RolePolicy};
//! use foreman_runtime::{Executor, ExecutorConfig, OrchestrationContext, Pipeline};
//! use foreman_types::Task;
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = Arc::new(OrchestrationContext::new(
//!         Arc::new(RolePolicy::new()),
//!         GateConfig::default(),
//!     ));
//!     ctx.registry
//!         .register("developer-agent", Arc::new(FnService::noop("developer-agent")))
//!         .unwrap();
//!
//!     let executor = Arc::new(Executor::new(
//!         Arc::clone(&ctx),
//!         Pipeline::standard(),
//!         ExecutorConfig::default(),
//!     ));
//!     executor.start();
//!     ctx.queue.enqueue(Task::new("t1", "login form"));
//!     // ...
//!     executor.shutdown().await;
//! }
//! ```

pub mod context;
pub mod executor;
pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod telemetry;

pub use context::OrchestrationContext;
pub use executor::{DrainOutcome, Executor, ExecutorConfig};
pub use manager::{LifecycleReport, ServiceManager};
pub use pipeline::{Pipeline, Privilege, PipelineStage};
pub use queue::{DrainClaim, TaskQueue, WorkSignal};
