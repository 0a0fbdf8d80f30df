//! Built-in simulated stage workers.
//!
//! Each one sleeps for the configured work time and reports what it would
//! have done.  They let an operator watch tasks flow through the pipeline
//! (and exercise the approval path) without real agents attached.

use std::sync::Arc;
use std::time::Duration;

use foreman_kernel::{FnService, Service};
use foreman_runtime::OrchestrationContext;
use foreman_runtime::pipeline::{DEPLOYMENT_AGENT, DEVELOPER_AGENT, QA_AGENT, TESTER_AGENT};
use tracing::warn;

use crate::config::AgentsSection;

/// Build the simulated agent registered under `name`, if there is one.
pub fn simulated(name: &str, work: Duration) -> Option<Arc<dyn Service>> {
    let verb = match name {
        DEVELOPER_AGENT => "implemented",
        TESTER_AGENT => "verified",
        QA_AGENT => "reviewed",
        DEPLOYMENT_AGENT => "deployed",
        _ => return None,
    };
    let label = name.to_string();
    let service = FnService::noop(name).on_execute(move |req| {
        let label = label.clone();
        async move {
            tokio::time::sleep(work).await;
            Ok(format!("{label} {verb} '{}'", req.feature_name))
        }
    });
    Some(Arc::new(service))
}

/// Register every enabled simulated agent.  Returns the names that were
/// registered; unknown or rejected names are logged and skipped.
pub fn register_enabled(ctx: &OrchestrationContext, agents: &AgentsSection) -> Vec<String> {
    let work = Duration::from_millis(agents.work_ms);
    let mut registered = Vec::new();
    for name in &agents.enabled {
        let Some(service) = simulated(name, work) else {
            warn!(agent = %name, "no simulated agent by that name; skipping");
            continue;
        };
        match ctx.registry.register(name, service) {
            Ok(()) => registered.push(name.clone()),
            Err(e) => warn!(agent = %name, error = %e, "could not register simulated agent"),
        }
    }
    registered
}
