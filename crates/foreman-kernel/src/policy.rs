//! Permission policy – who may perform which action on which resource.
//!
//! [`PermissionPolicy::evaluate`] is pure and synchronous: it looks at an
//! `(action, resource, agent)` triple and returns a
//! [`PermissionCheckResult`] without side effects.  The gate decides what to
//! do with the verdict.

use std::collections::{HashMap, HashSet};

use foreman_types::PermissionCheckResult;

/// Matches any resource in [`RolePolicy::require_approval`], or any action in
/// [`RolePolicy::grant`].
pub const WILDCARD: &str = "*";

/// A rule set the [`PermissionGate`][crate::gate::PermissionGate] consults.
pub trait PermissionPolicy: Send + Sync {
    fn evaluate(&self, action: &str, resource: &str, agent: &str) -> PermissionCheckResult;
}

impl<F> PermissionPolicy for F
where
    F: Fn(&str, &str, &str) -> PermissionCheckResult + Send + Sync,
{
    fn evaluate(&self, action: &str, resource: &str, agent: &str) -> PermissionCheckResult {
        self(action, resource, agent)
    }
}

/// Allow-list policy.
///
/// An agent may perform only the actions it has been granted.  A granted
/// action on a resource listed via [`require_approval`][Self::require_approval]
/// additionally needs a human decision.
///
/// # Example
///
/// ```
/// use foreman_kernel::policy::{PermissionPolicy, RolePolicy};
/// use foreman_types::PermissionCheckResult;
///
/// let mut policy = RolePolicy::new();
/// policy.grant("agentA", "DEPLOY");
/// policy.require_approval("DEPLOY", "prod");
///
/// assert_eq!(policy.evaluate("DEPLOY", "staging", "agentA"), PermissionCheckResult::Allowed);
/// assert!(matches!(
///     policy.evaluate("DEPLOY", "prod", "agentA"),
///     PermissionCheckResult::RequiresApproval { .. }
/// ));
/// assert!(matches!(
///     policy.evaluate("DEPLOY", "prod", "agentB"),
///     PermissionCheckResult::Denied { .. }
/// ));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    grants: HashMap<String, HashSet<String>>,
    approval_required: HashSet<(String, String)>,
}

impl RolePolicy {
    /// Create an empty policy that denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `agent` to perform `action`.  Duplicate grants are ignored.
    pub fn grant(&mut self, agent: &str, action: &str) {
        self.grants
            .entry(agent.to_string())
            .or_default()
            .insert(action.to_string());
    }

    /// Withdraw a grant.  No-ops if it was never given.
    pub fn revoke(&mut self, agent: &str, action: &str) {
        if let Some(actions) = self.grants.get_mut(agent) {
            actions.remove(action);
        }
    }

    /// Require human sign-off for `action` on `resource` (or on every
    /// resource when `resource` is [`WILDCARD`]).
    pub fn require_approval(&mut self, action: &str, resource: &str) {
        self.approval_required
            .insert((action.to_string(), resource.to_string()));
    }

    fn is_granted(&self, agent: &str, action: &str) -> bool {
        self.grants
            .get(agent)
            .is_some_and(|actions| actions.contains(action) || actions.contains(WILDCARD))
    }

    fn needs_approval(&self, action: &str, resource: &str) -> bool {
        self.approval_required
            .contains(&(action.to_string(), resource.to_string()))
            || self
                .approval_required
                .contains(&(action.to_string(), WILDCARD.to_string()))
    }
}

impl PermissionPolicy for RolePolicy {
    fn evaluate(&self, action: &str, resource: &str, agent: &str) -> PermissionCheckResult {
        if !self.is_granted(agent, action) {
            return PermissionCheckResult::Denied {
                reason: format!("agent '{agent}' is not granted '{action}'"),
            };
        }
        if self.needs_approval(action, resource) {
            return PermissionCheckResult::RequiresApproval {
                reason: format!("'{action}' on '{resource}' requires human sign-off"),
            };
        }
        PermissionCheckResult::Allowed
    }
}
