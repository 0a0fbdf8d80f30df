//! [`OrchestrationContext`] – the process's shared orchestration state.
//!
//! Built once at startup and handed by `Arc` to every component that needs
//! the registry, the queue, the gate, or the bus.  There is no global state.

use std::sync::Arc;

use foreman_kernel::{ApprovalWorkflow, GateConfig, PermissionGate, PermissionPolicy, ServiceRegistry};
use foreman_middleware::EventBus;

use crate::queue::TaskQueue;

pub struct OrchestrationContext {
    pub bus: EventBus,
    pub registry: ServiceRegistry,
    pub queue: TaskQueue,
    pub gate: PermissionGate,
}

impl OrchestrationContext {
    /// Wire up an empty registry, an empty queue, and a gate over `policy`,
    /// all announcing on one fresh [`EventBus`].
    pub fn new(policy: Arc<dyn PermissionPolicy>, gate_config: GateConfig) -> Self {
        Self::with_bus(EventBus::default(), policy, gate_config)
    }

    pub fn with_bus(bus: EventBus, policy: Arc<dyn PermissionPolicy>, gate_config: GateConfig) -> Self {
        let workflow = Arc::new(ApprovalWorkflow::with_bus(
            gate_config.approval_ttl,
            bus.clone(),
        ));
        Self {
            registry: ServiceRegistry::with_bus(bus.clone()),
            queue: TaskQueue::with_bus(bus.clone()),
            gate: PermissionGate::new(policy, workflow, gate_config),
            bus,
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalWorkflow> {
        self.gate.workflow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_kernel::RolePolicy;
    use foreman_middleware::Topic;
    use foreman_types::{EventPayload, Task};

    #[tokio::test]
    async fn components_share_one_bus() {
        let ctx = OrchestrationContext::new(Arc::new(RolePolicy::new()), GateConfig::default());
        let mut tasks = ctx.bus.subscribe_to(Topic::Tasks);
        let mut approvals = ctx.bus.subscribe_to(Topic::Approvals);

        ctx.queue.enqueue(Task::new("t1", "X"));
        ctx.approvals().create_request("DEPLOY", "prod", "why", "agentA");

        assert!(matches!(tasks.recv().await.unwrap().payload, EventPayload::TaskEnqueued { .. }));
        assert!(matches!(approvals.recv().await.unwrap().payload, EventPayload::ApprovalRequested(_)));
    }

    #[test]
    fn approval_ttl_follows_gate_config() {
        let config = GateConfig {
            approval_ttl: std::time::Duration::from_secs(90),
            ..GateConfig::default()
        };
        let ctx = OrchestrationContext::new(Arc::new(RolePolicy::new()), config);
        assert_eq!(ctx.approvals().ttl().as_secs(), 90);
    }
}
