use std::sync::Arc;

use cascade_types::RejectedError;

/// Unit of work accepted by an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sink of runnables backing stage computations and callback dispatch.
///
/// Implementations may run jobs concurrently and in any order; the engine
/// makes no fairness assumptions. A rejected submission is reported to the
/// caller. When the rejected job was a stage's own task, the stage
/// transitions to `Failed` with the rejection as cause.
pub trait Executor: Send + Sync {
    /// Submit a job for eventual execution.
    fn execute(&self, job: Job) -> Result<(), RejectedError>;
}

/// Dispatch target for a callback or a forwarding computation.
///
/// `Inline` runs the job synchronously on the calling thread. It is used
/// for short internal bridges and for the inline-on-completer combinator
/// variants, and is deliberately unrepresentable as a stage's default
/// executor: defaults are always a real `Arc<dyn Executor>`.
#[derive(Clone)]
pub(crate) enum Exec {
    Inline,
    On(Arc<dyn Executor>),
}

impl Exec {
    pub(crate) fn run(&self, job: Job) -> Result<(), RejectedError> {
        match self {
            Exec::Inline => {
                job();
                Ok(())
            }
            Exec::On(executor) => executor.execute(job),
        }
    }
}
