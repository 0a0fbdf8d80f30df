//! `foreman-middleware` – orchestration event routing.
//!
//! Carries lifecycle events between the kernel, the executor, and whoever is
//! watching (operator shells, tests, log shippers) without caring about their
//! meaning.
//!
//! # Modules
//!
//! - [`bus`] – topic-partitioned publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
