//! `foreman-kernel` – Services, Policy & Approvals
//!
//! The rule-keeping half of Foreman.  It does not run pipelines; it decides
//! who may run what and keeps track of the workers that do.
//!
//! # Modules
//!
//! - [`service`] – the [`Service`][service::Service] contract every worker
//!   implements, plus [`FnService`][service::FnService] for assembling one
//!   from closures.
//! - [`registry`] – [`ServiceRegistry`][registry::ServiceRegistry]: the
//!   name → service map that pipeline stages resolve their workers from.
//! - [`policy`] – [`PermissionPolicy`][policy::PermissionPolicy] and the
//!   allow-list based [`RolePolicy`][policy::RolePolicy].
//! - [`approval`] – [`ApprovalWorkflow`][approval::ApprovalWorkflow]: the
//!   pending set of human decisions, with expiry and explicit resolution.
//! - [`gate`] – [`PermissionGate`][gate::PermissionGate]: the single
//!   interception point a privileged action must pass through.  Combines the
//!   policy check with the approval wait in one call.

pub mod approval;
pub mod gate;
pub mod policy;
pub mod registry;
pub mod service;

pub use approval::{ApprovalWatch, ApprovalWorkflow};
pub use gate::{Authorization, GateConfig, PermissionGate};
pub use policy::{PermissionPolicy, RolePolicy};
pub use registry::ServiceRegistry;
pub use service::{FnService, Lifecycle, Service, StageRequest};
