//! [`ApprovalWorkflow`] – the pending set of human decisions.
//!
//! A request enters the pending set through
//! [`create_request`][ApprovalWorkflow::create_request] and leaves it exactly
//! once, through one of:
//!
//! - [`approve`][ApprovalWorkflow::approve] / [`reject`][ApprovalWorkflow::reject]
//!   – called by the operator (or a separate governance tool);
//! - [`expire`][ApprovalWorkflow::expire] / [`sweep_expired`][ApprovalWorkflow::sweep_expired]
//!   – once the request's time-to-live has run out.
//!
//! The terminal state is recorded and pushed to whoever is waiting on the
//! request through a per-request [`watch`] channel, so a waiter never has to
//! infer the outcome from the request's absence.
//!
//! Deadlines are tracked on the Tokio clock; `created_at`/`expires_at` on the
//! request itself are wall-clock timestamps for display.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use foreman_middleware::{EventBus, Topic};
use foreman_types::{ApprovalError, ApprovalRequest, ApprovalState, EventPayload};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const SOURCE: &str = "foreman-kernel::approval";

/// How many terminal decisions are remembered for late status queries.
const DECISION_HISTORY: usize = 1024;

/// Fallback deadline when `now + ttl` does not fit the clock (~30 years).
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

struct PendingEntry {
    seq: u64,
    request: ApprovalRequest,
    deadline: Instant,
    notify: watch::Sender<ApprovalState>,
}

#[derive(Default)]
struct Book {
    next_seq: u64,
    pending: HashMap<Uuid, PendingEntry>,
    decisions: HashMap<Uuid, ApprovalState>,
    decision_order: VecDeque<Uuid>,
}

impl Book {
    fn record_decision(&mut self, id: Uuid, state: ApprovalState) {
        self.decisions.insert(id, state);
        self.decision_order.push_back(id);
        while self.decision_order.len() > DECISION_HISTORY {
            if let Some(old) = self.decision_order.pop_front() {
                self.decisions.remove(&old);
            }
        }
    }
}

/// A waiter's handle on one pending request.
pub struct ApprovalWatch {
    pub request_id: Uuid,
    /// Receives the terminal state when the request is resolved.
    pub receiver: watch::Receiver<ApprovalState>,
    /// Tokio-clock instant at which the request expires.
    pub deadline: Instant,
}

/// Owns every pending [`ApprovalRequest`] until it reaches a terminal state.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use foreman_kernel::ApprovalWorkflow;
/// use foreman_types::ApprovalState;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let workflow = ApprovalWorkflow::new(Duration::from_secs(3600));
/// let req = workflow.create_request("DEPLOY", "prod", "release 1.4", "executor");
/// assert_eq!(workflow.list_pending().len(), 1);
///
/// workflow.approve(req.id, "oncall").unwrap();
/// assert!(workflow.list_pending().is_empty());
/// assert_eq!(
///     workflow.status(req.id),
///     Some(ApprovalState::Approved { by: "oncall".into() })
/// );
/// # }
/// ```
pub struct ApprovalWorkflow {
    ttl: Duration,
    book: Mutex<Book>,
    bus: Option<EventBus>,
}

impl ApprovalWorkflow {
    /// Create a workflow whose requests live for `ttl` while pending.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            book: Mutex::default(),
            bus: None,
        }
    }

    /// Like [`new`][Self::new], announcing requests and resolutions on `bus`.
    pub fn with_bus(ttl: Duration, bus: EventBus) -> Self {
        Self {
            ttl,
            book: Mutex::default(),
            bus: Some(bus),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Allocate a new pending request with a fresh id and the configured TTL.
    pub fn create_request(
        &self,
        action: &str,
        resource: &str,
        justification: &str,
        agent_name: &str,
    ) -> ApprovalRequest {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now = Instant::now();
        let deadline = now
            .checked_add(self.ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            action: action.to_string(),
            resource: resource.to_string(),
            justification: justification.to_string(),
            agent_name: agent_name.to_string(),
            created_at,
            expires_at,
        };

        {
            let mut book = self.lock();
            let seq = book.next_seq;
            book.next_seq += 1;
            let (notify, _) = watch::channel(ApprovalState::Pending);
            book.pending.insert(
                request.id,
                PendingEntry {
                    seq,
                    request: request.clone(),
                    deadline,
                    notify,
                },
            );
        }

        info!(
            request_id = %request.id,
            action = %request.action,
            resource = %request.resource,
            agent = %request.agent_name,
            ttl_secs = self.ttl.as_secs(),
            "approval requested"
        );
        self.announce(EventPayload::ApprovalRequested(request.clone()));
        request
    }

    /// Snapshot of every request still pending, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let book = self.lock();
        let mut entries: Vec<&PendingEntry> = book.pending.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.request.clone()).collect()
    }

    /// The pending request with this id, if it is still pending.
    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.lock().pending.get(&id).map(|e| e.request.clone())
    }

    /// Current state of a request; `None` if it was never created here (or
    /// its decision has aged out of the history).
    pub fn status(&self, id: Uuid) -> Option<ApprovalState> {
        let book = self.lock();
        if book.pending.contains_key(&id) {
            return Some(ApprovalState::Pending);
        }
        book.decisions.get(&id).cloned()
    }

    /// Subscribe to the resolution of a pending request.
    ///
    /// Returns `None` when the request is not pending.
    pub fn watch(&self, id: Uuid) -> Option<ApprovalWatch> {
        self.lock().pending.get(&id).map(|e| ApprovalWatch {
            request_id: id,
            receiver: e.notify.subscribe(),
            deadline: e.deadline,
        })
    }

    /// Approve a pending request on behalf of `by`.
    pub fn approve(&self, id: Uuid, by: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalState::Approved { by: by.to_string() })
    }

    /// Reject a pending request on behalf of `by`.
    pub fn reject(&self, id: Uuid, by: &str, reason: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(
            id,
            ApprovalState::Rejected {
                by: by.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    /// Declare a pending request expired.
    pub fn expire(&self, id: Uuid) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalState::Expired)
    }

    /// Expire every pending request whose deadline has passed and return them.
    pub fn sweep_expired(&self) -> Vec<ApprovalRequest> {
        let now = Instant::now();
        let overdue: Vec<Uuid> = {
            let book = self.lock();
            book.pending
                .values()
                .filter(|e| e.deadline <= now)
                .map(|e| e.request.id)
                .collect()
        };
        overdue
            .into_iter()
            .filter_map(|id| self.expire(id).ok())
            .collect()
    }

    fn resolve(&self, id: Uuid, state: ApprovalState) -> Result<ApprovalRequest, ApprovalError> {
        let entry = {
            let mut book = self.lock();
            match book.pending.remove(&id) {
                Some(entry) => {
                    book.record_decision(id, state.clone());
                    entry
                }
                None => {
                    return Err(match book.decisions.get(&id) {
                        Some(existing) => ApprovalError::NotPending {
                            id,
                            state: existing.clone(),
                        },
                        None => ApprovalError::NotFound(id),
                    });
                }
            }
        };

        // Waiters may already have given up; that is fine.
        entry.notify.send_replace(state.clone());

        match &state {
            ApprovalState::Expired => {
                warn!(request_id = %id, action = %entry.request.action, "approval request expired")
            }
            other => info!(request_id = %id, state = %other, "approval request resolved"),
        }
        self.announce(EventPayload::ApprovalResolved {
            request_id: id,
            state,
        });
        Ok(entry.request)
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            bus.emit(Topic::Approvals, SOURCE, payload);
        }
    }
}
