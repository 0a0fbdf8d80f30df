//! The worker-service contract.
//!
//! Every long-lived worker (developer agent, tester agent, deployer, …)
//! implements [`Service`].  `start`/`stop` form the lifecycle the
//! [`ServiceRegistry`][crate::registry::ServiceRegistry] insists on;
//! [`Service::execute`] is what a pipeline stage calls to get work done.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use foreman_types::{ServiceError, StageResult};
use futures_util::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

/// Which lifecycle operations a service actually provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub start: bool,
    pub stop: bool,
}

impl Lifecycle {
    pub const COMPLETE: Lifecycle = Lifecycle {
        start: true,
        stop: true,
    };

    pub fn is_complete(&self) -> bool {
        self.start && self.stop
    }
}

/// Everything a service needs to perform one pipeline stage for one task.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub task_id: String,
    pub feature_name: String,
    pub stage: String,
    /// Registry name the service was resolved under.
    pub service: String,
    /// Results of the stages that ran before this one.
    pub prior: Vec<StageResult>,
}

/// A named, pluggable worker.
///
/// Implementations must make `start` a no-op (with a warning) when already
/// started and `stop` a no-op when already stopped.
#[async_trait]
pub trait Service: Send + Sync {
    /// Report which lifecycle operations are implemented.  Hand-written
    /// services implement both; [`FnService`] reports what it was built with.
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::COMPLETE
    }

    async fn start(&self) -> Result<(), ServiceError>;

    async fn stop(&self) -> Result<(), ServiceError>;

    /// Perform one pipeline stage and return a short human-readable report.
    async fn execute(&self, request: &StageRequest) -> Result<String, ServiceError> {
        Err(ServiceError::Unsupported {
            service: request.service.clone(),
            operation: format!("stage '{}'", request.stage),
        })
    }
}

type LifecycleHook = Box<dyn Fn() -> BoxFuture<'static, Result<(), ServiceError>> + Send + Sync>;
type ExecuteHook =
    Box<dyn Fn(StageRequest) -> BoxFuture<'static, Result<String, ServiceError>> + Send + Sync>;

/// A [`Service`] assembled from closures.
///
/// Tracks its own running flag so repeated `start`/`stop` calls are
/// idempotent.
///
/// # Example
///
/// ```
/// use foreman_kernel::service::FnService;
///
/// let svc = FnService::noop("tester-agent")
///     .on_execute(|req| async move { Ok(format!("{} verified", req.feature_name)) });
/// assert!(svc.lifecycle_complete());
/// ```
pub struct FnService {
    label: String,
    start: Option<LifecycleHook>,
    stop: Option<LifecycleHook>,
    execute: Option<ExecuteHook>,
    running: AtomicBool,
}

impl FnService {
    /// A service with no hooks at all.  It will not pass registration until
    /// both [`on_start`][Self::on_start] and [`on_stop`][Self::on_stop] are
    /// supplied.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: None,
            stop: None,
            execute: None,
            running: AtomicBool::new(false),
        }
    }

    /// A service whose `start` and `stop` succeed without doing anything.
    pub fn noop(label: impl Into<String>) -> Self {
        Self::new(label)
            .on_start(|| async { Ok(()) })
            .on_stop(|| async { Ok(()) })
    }

    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        self.start = Some(Box::new(move || hook().boxed()));
        self
    }

    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        self.stop = Some(Box::new(move || hook().boxed()));
        self
    }

    pub fn on_execute<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(StageRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ServiceError>> + Send + 'static,
    {
        self.execute = Some(Box::new(move |req| hook(req).boxed()));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn lifecycle_complete(&self) -> bool {
        self.lifecycle().is_complete()
    }
}

#[async_trait]
impl Service for FnService {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            start: self.start.is_some(),
            stop: self.stop.is_some(),
        }
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let Some(hook) = &self.start else {
            return Err(ServiceError::Unsupported {
                service: self.label.clone(),
                operation: "start".to_string(),
            });
        };
        if self.is_running() {
            warn!(service = %self.label, "start called on a running service; ignoring");
            return Ok(());
        }
        hook().await?;
        self.running.store(true, Ordering::Release);
        debug!(service = %self.label, "service started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let Some(hook) = &self.stop else {
            return Err(ServiceError::Unsupported {
                service: self.label.clone(),
                operation: "stop".to_string(),
            });
        };
        if !self.is_running() {
            warn!(service = %self.label, "stop called on a stopped service; ignoring");
            return Ok(());
        }
        hook().await?;
        self.running.store(false, Ordering::Release);
        debug!(service = %self.label, "service stopped");
        Ok(())
    }

    async fn execute(&self, request: &StageRequest) -> Result<String, ServiceError> {
        match &self.execute {
            Some(hook) => hook(request.clone()).await,
            None => Ok(format!("{} finished {}", self.label, request.stage)),
        }
    }
}
