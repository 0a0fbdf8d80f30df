//! [`PermissionGate`] – single interception point for privileged actions.
//!
//! Before a privileged action (e.g. a production deployment) runs, the caller
//! must pass through [`PermissionGate::authorize`].  The gate:
//!
//! 1. **Evaluates policy** ([`PermissionPolicy`]).  `Allowed` returns at once;
//!    `Denied` fails at once with [`GateError::PermissionDenied`] and creates
//!    no request.
//! 2. **Waits for a human** when the verdict is `RequiresApproval`: it files
//!    an [`ApprovalRequest`] with the [`ApprovalWorkflow`] and suspends until
//!    the first of
//!    - the decision being pushed through the request's watch channel,
//!    - the request's expiry deadline ([`GateError::ApprovalExpired`]),
//!    - the poll-attempt bound ([`GateError::ApprovalTimeout`]).  Giving up
//!      closes the request as expired, so a late approval is refused.
//!
//!    Every `poll_interval` the gate also re-reads the request's recorded
//!    state as a fallback in case a push was missed.
//!
//! The wait is an async suspension point; it never blocks the runtime.

use std::sync::Arc;
use std::time::Duration;

use foreman_types::{ApprovalError, ApprovalRequest, ApprovalState, GateError, PermissionCheckResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalWorkflow;
use crate::policy::PermissionPolicy;

/// Timing policy for approval waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// How long a request may stay pending before it expires.
    pub approval_ttl: Duration,
    /// Interval between fallback status polls.
    pub poll_interval: Duration,
    /// Upper bound on fallback polls before the caller gives up.  `0` gives
    /// up at once.
    pub max_poll_attempts: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            approval_ttl: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 360,
        }
    }
}

/// Why a privileged action may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// Policy allowed the action outright.
    Allowed,
    /// A human approved the request.
    Approved { request_id: Uuid, by: String },
}

/// The gateway privileged actions must pass through.
///
/// Cheap to clone; clones share the policy and the approval workflow.
#[derive(Clone)]
pub struct PermissionGate {
    policy: Arc<dyn PermissionPolicy>,
    workflow: Arc<ApprovalWorkflow>,
    config: GateConfig,
}

impl PermissionGate {
    pub fn new(
        policy: Arc<dyn PermissionPolicy>,
        workflow: Arc<ApprovalWorkflow>,
        config: GateConfig,
    ) -> Self {
        Self {
            policy,
            workflow,
            config,
        }
    }

    pub fn workflow(&self) -> &Arc<ApprovalWorkflow> {
        &self.workflow
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Pure policy evaluation; no side effects.
    pub fn check_permission(&self, action: &str, resource: &str, agent: &str) -> PermissionCheckResult {
        self.policy.evaluate(action, resource, agent)
    }

    /// Run the full gating protocol for one privileged action.
    ///
    /// # Errors
    ///
    /// - [`GateError::PermissionDenied`] – policy refused the action.
    /// - [`GateError::ApprovalRejected`] – a human said no.
    /// - [`GateError::ApprovalExpired`] – the request's TTL ran out while pending.
    /// - [`GateError::ApprovalTimeout`] – the poll-attempt bound was reached first.
    /// - [`GateError::ApprovalLost`] – the request disappeared without a
    ///   recorded decision.
    pub async fn authorize(
        &self,
        action: &str,
        resource: &str,
        justification: &str,
        agent: &str,
    ) -> Result<Authorization, GateError> {
        match self.check_permission(action, resource, agent) {
            PermissionCheckResult::Allowed => {
                debug!(action, resource, agent, "permission allowed by policy");
                Ok(Authorization::Allowed)
            }
            PermissionCheckResult::Denied { reason } => {
                warn!(action, resource, agent, %reason, "permission denied by policy");
                Err(GateError::PermissionDenied { reason })
            }
            PermissionCheckResult::RequiresApproval { reason } => {
                info!(action, resource, agent, %reason, "waiting for human approval");
                let request = self
                    .workflow
                    .create_request(action, resource, justification, agent);
                self.await_decision(&request).await
            }
        }
    }

    /// Boolean client interface: `true` means proceed.  The reason for a
    /// `false` is logged.
    pub async fn request_permission(
        &self,
        action: &str,
        resource: &str,
        justification: &str,
        agent: &str,
    ) -> bool {
        match self.authorize(action, resource, justification, agent).await {
            Ok(_) => true,
            Err(e) => {
                warn!(action, resource, agent, error = %e, "privileged action refused");
                false
            }
        }
    }

    async fn await_decision(&self, request: &ApprovalRequest) -> Result<Authorization, GateError> {
        let request_id = request.id;
        let Some(watch) = self.workflow.watch(request_id) else {
            // Resolved between creation and subscription.
            return self.settled(request_id);
        };
        let mut receiver = watch.receiver;
        let expiry = tokio::time::sleep_until(watch.deadline);
        tokio::pin!(expiry);
        let mut attempts: u32 = 0;

        loop {
            if attempts >= self.config.max_poll_attempts {
                return self.give_up(request_id, attempts);
            }

            tokio::select! {
                biased;

                changed = receiver.changed() => {
                    let state = receiver.borrow_and_update().clone();
                    if state.is_terminal() {
                        return outcome(request_id, state);
                    }
                    if changed.is_err() {
                        return Err(GateError::ApprovalLost { request_id });
                    }
                }

                () = &mut expiry => {
                    return match self.workflow.expire(request_id) {
                        Ok(_) => Err(GateError::ApprovalExpired { request_id }),
                        // A decision landed at the last moment.
                        Err(ApprovalError::NotPending { state, .. }) => outcome(request_id, state),
                        Err(ApprovalError::NotFound(_)) => Err(GateError::ApprovalLost { request_id }),
                    };
                }

                () = tokio::time::sleep(self.config.poll_interval) => {
                    attempts += 1;
                    match self.workflow.status(request_id) {
                        Some(ApprovalState::Pending) => {
                            debug!(%request_id, attempts, "approval still pending");
                        }
                        Some(state) => return outcome(request_id, state),
                        None => return Err(GateError::ApprovalLost { request_id }),
                    }
                }
            }
        }
    }

    /// Stop waiting and close the request so nobody can approve an action
    /// that will no longer run.
    fn give_up(&self, request_id: Uuid, attempts: u32) -> Result<Authorization, GateError> {
        match self.workflow.expire(request_id) {
            Ok(_) => {
                warn!(%request_id, attempts, "giving up on approval request");
                Err(GateError::ApprovalTimeout { request_id, attempts })
            }
            Err(ApprovalError::NotPending { state, .. }) => outcome(request_id, state),
            Err(ApprovalError::NotFound(_)) => Err(GateError::ApprovalLost { request_id }),
        }
    }

    fn settled(&self, request_id: Uuid) -> Result<Authorization, GateError> {
        match self.workflow.status(request_id) {
            Some(state) if state.is_terminal() => outcome(request_id, state),
            _ => Err(GateError::ApprovalLost { request_id }),
        }
    }
}

fn outcome(request_id: Uuid, state: ApprovalState) -> Result<Authorization, GateError> {
    match state {
        ApprovalState::Approved { by } => {
            info!(%request_id, %by, "approval granted");
            Ok(Authorization::Approved { request_id, by })
        }
        ApprovalState::Rejected { reason, .. } => Err(GateError::ApprovalRejected { request_id, reason }),
        ApprovalState::Expired => Err(GateError::ApprovalExpired { request_id }),
        ApprovalState::Pending => Err(GateError::ApprovalLost { request_id }),
    }
}
