use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use cascade_types::{BoxError, Failure, GetError, StageId, StagePhase};

use crate::deps::{CancelTarget, DepGraph};
use crate::executor::{Exec, Executor, Job};
use crate::export::StageFuture;
use crate::registry::{Outcome, Registry};
use crate::task::{self, TaskState};

/// A value-producing, cancellable asynchronous computation exposing a
/// combinator surface.
///
/// `Stage` is a cheap clonable handle; every clone observes the same
/// underlying stage. After termination the outcome remains queryable
/// indefinitely through [`Stage::get`] and late callbacks.
///
/// Cancellation is recursive: `cancel` transitively cancels the recorded
/// upstream producers and composed inner stages, carrying the same
/// interrupt intent to each.
pub struct Stage<T> {
    pub(crate) core: Arc<Core<T>>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

pub(crate) struct Core<T> {
    pub(crate) id: StageId,
    pub(crate) registry: Registry<T>,
    pub(crate) task: TaskState,
    pub(crate) default_exec: Arc<dyn Executor>,
    pub(crate) deps: DepGraph,
}

impl<T: Clone + Send + 'static> Core<T> {
    pub(crate) fn new(default_exec: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            id: StageId::next(),
            registry: Registry::new(),
            task: TaskState::new(),
            default_exec,
            deps: DepGraph::new(),
        })
    }

    fn settled(default_exec: Arc<dyn Executor>, outcome: Outcome<T>) -> Arc<Self> {
        let core = Arc::new(Self {
            id: StageId::next(),
            registry: Registry::new(),
            task: TaskState::settled(outcome.is_ok()),
            default_exec,
            deps: DepGraph::new(),
        });
        match outcome {
            Ok(value) => core.registry.success(value),
            Err(failure) => core.registry.failure(failure),
        }
        core
    }

    /// Run `compute` through the task state machine, feeding the registry.
    ///
    /// A task that lost to cancellation before starting never runs; one
    /// cancelled in flight has its result dropped; the registry already
    /// carries the cancellation by then.
    fn run_task(&self, compute: impl FnOnce() -> Result<T, BoxError>) {
        let Some(interrupt) = self.task.try_start() else {
            tracing::trace!(stage = %self.id, "task skipped, cancelled before start");
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| {
            task::run_with_interrupt(interrupt, compute)
        }));
        match result {
            Ok(Ok(value)) => {
                if self.task.finish_success() {
                    self.registry.success(value);
                }
            }
            Ok(Err(err)) => {
                if self.task.finish_error() {
                    self.registry.failure(Failure::user(err));
                }
            }
            Err(payload) => {
                if self.task.finish_error() {
                    self.registry.failure(Failure::from_panic(payload));
                }
            }
        }
    }

    /// Schedule `compute` as `core`'s task on `exec`. Rejection settles the
    /// stage as Failed with the rejection as cause.
    pub(crate) fn schedule(
        core: &Arc<Self>,
        exec: &Exec,
        compute: impl FnOnce() -> Result<T, BoxError> + Send + 'static,
    ) {
        let task_core = core.clone();
        let job: Job = Box::new(move || task_core.run_task(compute));
        if let Err(rejected) = exec.run(job) {
            tracing::debug!(stage = %core.id, %rejected, "task submission rejected");
            core.deliver(Err(Failure::Rejected(rejected)));
        }
    }

    /// Deliver an outcome decided by a registry bridge rather than a task
    /// run.
    ///
    /// The task is settled before the registry fires, so this counts as
    /// the stage's one terminal transition and a later `cancel` loses the
    /// race. When cancellation already claimed the task, the outcome is
    /// dropped; the cancelling call fires the registry itself.
    pub(crate) fn deliver(&self, outcome: Outcome<T>) {
        let settled = match &outcome {
            Ok(_) => self.task.settle_success(),
            Err(_) => self.task.settle_failure(),
        };
        if !settled {
            return;
        }
        match outcome {
            Ok(value) => self.registry.success(value),
            Err(failure) => self.registry.failure(failure),
        }
    }

    /// The cancelling transition and its propagation.
    ///
    /// Only the winning call walks the dependency graph and fails the
    /// registry; every later call is a no-op returning false.
    pub(crate) fn cancel_core(&self, interrupt: bool) -> bool {
        if !self.task.try_cancel(interrupt) {
            return false;
        }
        tracing::debug!(stage = %self.id, interrupt, "stage cancelled");
        self.deps.cancel_walk(interrupt);
        self.registry.failure(Failure::Cancelled);
        true
    }
}

impl<T: Clone + Send + 'static> CancelTarget for Core<T> {
    fn cancel_target(&self, interrupt: bool) -> bool {
        self.cancel_core(interrupt)
    }
}

impl<T: Clone + Send + 'static> Stage<T> {
    /// Root stage: `compute` is scheduled on `executor` immediately, and
    /// `executor` becomes the stage's default for `*_async` combinators.
    pub fn submit(
        executor: &Arc<dyn Executor>,
        compute: impl FnOnce() -> Result<T, BoxError> + Send + 'static,
    ) -> Self {
        let core = Core::new(executor.clone());
        tracing::trace!(stage = %core.id, "root stage submitted");
        Core::schedule(&core, &Exec::On(executor.clone()), compute);
        Stage { core }
    }

    /// A stage already settled with `value`. Cannot be cancelled.
    pub fn completed(executor: &Arc<dyn Executor>, value: T) -> Self {
        Stage {
            core: Core::settled(executor.clone(), Ok(value)),
        }
    }

    /// A stage already settled with `failure`. Cannot be cancelled.
    pub fn failed(executor: &Arc<dyn Executor>, failure: Failure) -> Self {
        Stage {
            core: Core::settled(executor.clone(), Err(failure)),
        }
    }

    /// Attempt the Pending/Running → Cancelled transition.
    ///
    /// Returns true only for the call that performed the transition; that
    /// call alone propagates to the recorded dependencies, cancelling each
    /// with the same `interrupt` flag. With `interrupt` set, a running
    /// computation is asked to stop (see [`crate::interrupted`]); one that
    /// ignores the request keeps its thread, but the stage is cancelled
    /// regardless and the computation's eventual result is dropped.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.core.cancel_core(interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.task.is_cancelled()
    }

    /// True once the stage has a terminal outcome observable by callbacks
    /// and the blocking accessors.
    pub fn is_done(&self) -> bool {
        self.core.registry.is_done()
    }

    /// Current observable phase. Registry-driven stages settle their task
    /// when their outcome is delivered, so the task state is authoritative
    /// even for a task that never ran.
    pub fn phase(&self) -> StagePhase {
        self.core.task.phase()
    }

    pub fn id(&self) -> StageId {
        self.core.id
    }

    /// Block until terminal.
    ///
    /// A failure is surfaced with one composition-envelope level stripped,
    /// so callers see the original cause. Stable: every call after
    /// termination returns the same outcome.
    pub fn get(&self) -> Result<T, Failure> {
        self.core.registry.wait().map_err(Failure::unwrap_composed)
    }

    /// Block until terminal or `timeout` elapses.
    pub fn get_within(&self, timeout: Duration) -> Result<T, GetError> {
        match self.core.registry.wait_timeout(timeout) {
            Some(outcome) => outcome.map_err(|failure| GetError::Failed(failure.unwrap_composed())),
            None => Err(GetError::TimedOut(timeout)),
        }
    }

    /// One-way export: a plain [`std::future::Future`] mirroring this
    /// stage's terminal outcome. The future has no back-channel: dropping
    /// or never polling it does not cancel the stage.
    pub fn to_future(&self) -> StageFuture<T> {
        StageFuture::subscribe(self)
    }

    pub(crate) fn as_cancel_target(&self) -> Arc<dyn CancelTarget> {
        self.core.clone()
    }

    /// Successor stage for a combinator: inherits this stage's default
    /// executor unless an explicit one was chosen, and records this stage
    /// for the cancellation walk.
    pub(crate) fn successor<U: Clone + Send + 'static>(&self, exec: &Exec) -> Stage<U> {
        let default_exec = match exec {
            Exec::Inline => self.core.default_exec.clone(),
            Exec::On(executor) => executor.clone(),
        };
        let next = Stage {
            core: Core::new(default_exec),
        };
        next.core.deps.record(self.as_cancel_target());
        next
    }
}
