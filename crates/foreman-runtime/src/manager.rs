//! [`ServiceManager`] – batch lifecycle control over every registered service.
//!
//! Services start in registration order and stop in reverse.  A failing
//! service is logged and recorded in the [`LifecycleReport`] but never stops
//! the rest of the batch; the caller decides whether a dirty report is fatal.

use std::sync::Arc;

use foreman_types::ServiceError;
use tracing::{error, info};

use crate::context::OrchestrationContext;

/// Outcome of a batch start or stop.
#[derive(Debug, Default)]
pub struct LifecycleReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, ServiceError)>,
}

impl LifecycleReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ServiceManager {
    ctx: Arc<OrchestrationContext>,
}

impl ServiceManager {
    pub fn new(ctx: Arc<OrchestrationContext>) -> Self {
        Self { ctx }
    }

    /// Start every registered service, oldest registration first.
    pub async fn start_all(&self) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for (name, service) in self.ctx.registry.entries() {
            match service.start().await {
                Ok(()) => {
                    info!(service = %name, "service started");
                    report.succeeded.push(name);
                }
                Err(e) => {
                    error!(service = %name, error = %e, "service failed to start");
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// Stop every registered service, newest registration first.
    pub async fn stop_all(&self) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for (name, service) in self.ctx.registry.entries().into_iter().rev() {
            match service.stop().await {
                Ok(()) => {
                    info!(service = %name, "service stopped");
                    report.succeeded.push(name);
                }
                Err(e) => {
                    error!(service = %name, error = %e, "service failed to stop");
                    report.failed.push((name, e));
                }
            }
        }
        report
    }
}
