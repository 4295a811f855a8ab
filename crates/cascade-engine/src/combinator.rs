//! The derivation surface of [`Stage`].
//!
//! Every combinator follows one template: create a successor, subscribe to
//! the current registry, record cancellation edges, return the successor.
//! Successors come in two kinds:
//! - **task-backed** (map/accept/run): the forwarding computation runs
//!   through the successor's own task on the chosen executor, so
//!   cancelling the successor mid-computation can interrupt it;
//! - **registry-driven** (compose's exposed stage, either's funnel, the
//!   failure-observing family): the successor's task never runs; the
//!   subscription hands the outcome to `Core::deliver`, which settles the
//!   task and then drives the registry, so blocking accessors and a late
//!   `cancel` behave exactly as they do for task-backed stages.
//!
//! Each operation exists in three variants: inline-on-completer
//! (`then_apply`), default executor (`then_apply_async`), and explicit
//! executor (`then_apply_async_on`). `exceptionally` is inline-only.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use cascade_types::{BoxError, Failure};

use crate::executor::{Exec, Executor, Job};
use crate::stage::{Core, Stage};

/// Run a user callable, folding an `Err` return and a panic into the same
/// failure channel.
fn run_user<R>(f: impl FnOnce() -> Result<R, BoxError>) -> Result<R, Failure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Failure::user(err)),
        Err(payload) => Err(Failure::from_panic(payload)),
    }
}

impl<T: Clone + Send + 'static> Stage<T> {
    // ---- map / accept / run -------------------------------------------------

    fn apply_exec<U: Clone + Send + 'static>(
        &self,
        exec: Exec,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        let next = self.successor::<U>(&exec);
        let target = next.core.clone();
        self.core.registry.subscribe(
            Exec::Inline,
            Box::new(move |outcome| match outcome {
                // The forwarding computation goes through the successor's
                // task, so the successor is interruptible while it runs.
                Ok(value) => Core::schedule(&target, &exec, move || f(value)),
                Err(failure) => target.deliver(Err(failure.into_composed())),
            }),
        );
        next
    }

    /// Map the success value on the completing thread.
    pub fn then_apply<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.apply_exec(Exec::Inline, f)
    }

    /// Map the success value on this stage's default executor.
    pub fn then_apply_async<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.apply_exec(Exec::On(self.core.default_exec.clone()), f)
    }

    /// Map the success value on `executor`.
    pub fn then_apply_async_on<U: Clone + Send + 'static>(
        &self,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.apply_exec(Exec::On(executor.clone()), f)
    }

    /// Consume the success value on the completing thread.
    pub fn then_accept(
        &self,
        f: impl FnOnce(T) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.apply_exec(Exec::Inline, f)
    }

    /// Consume the success value on this stage's default executor.
    pub fn then_accept_async(
        &self,
        f: impl FnOnce(T) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.apply_exec(Exec::On(self.core.default_exec.clone()), f)
    }

    /// Consume the success value on `executor`.
    pub fn then_accept_async_on(
        &self,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.apply_exec(Exec::On(executor.clone()), f)
    }

    /// Run `action` after success, on the completing thread.
    pub fn then_run(
        &self,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.apply_exec(Exec::Inline, move |_| action())
    }

    /// Run `action` after success, on this stage's default executor.
    pub fn then_run_async(
        &self,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.apply_exec(Exec::On(self.core.default_exec.clone()), move |_| action())
    }

    /// Run `action` after success, on `executor`.
    pub fn then_run_async_on(
        &self,
        executor: &Arc<dyn Executor>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.apply_exec(Exec::On(executor.clone()), move |_| action())
    }

    // ---- compose ------------------------------------------------------------

    fn compose_exec<U: Clone + Send + 'static>(
        &self,
        exec: Exec,
        f: impl FnOnce(T) -> Result<Stage<U>, BoxError> + Send + 'static,
    ) -> Stage<U> {
        let next = self.successor::<U>(&exec);
        let target = next.core.clone();
        self.core.registry.subscribe(
            Exec::Inline,
            Box::new(move |outcome| match outcome {
                Ok(value) => {
                    // The user function runs on the chosen executor. It is
                    // not task-backed: a cancel reaching `next` while it
                    // runs latches the interrupt intent, which is applied
                    // to the inner stage at install time.
                    let install_on = target.clone();
                    let job: Job = Box::new(move || match run_user(move || f(value)) {
                        Ok(inner) => {
                            let forward = install_on.clone();
                            inner.core.registry.subscribe(
                                Exec::Inline,
                                Box::new(move |outcome| {
                                    forward.deliver(outcome.map_err(Failure::into_composed));
                                }),
                            );
                            install_on.deps.install_inner(inner.core.clone());
                        }
                        Err(failure) => install_on.deliver(Err(failure)),
                    });
                    if let Err(rejected) = exec.run(job) {
                        target.deliver(Err(Failure::Rejected(rejected)));
                    }
                }
                Err(failure) => target.deliver(Err(failure.into_composed())),
            }),
        );
        next
    }

    /// Chain a stage-returning function on the completing thread.
    ///
    /// The inner stage becomes the successor's sole cancellation
    /// dependency the moment it exists; a cancel that arrives earlier is
    /// latched and applied to the inner stage at install time, preserving
    /// the interrupt intent.
    pub fn then_compose<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Result<Stage<U>, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.compose_exec(Exec::Inline, f)
    }

    /// Chain a stage-returning function on this stage's default executor.
    pub fn then_compose_async<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(T) -> Result<Stage<U>, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.compose_exec(Exec::On(self.core.default_exec.clone()), f)
    }

    /// Chain a stage-returning function on `executor`.
    pub fn then_compose_async_on<U: Clone + Send + 'static>(
        &self,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T) -> Result<Stage<U>, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.compose_exec(Exec::On(executor.clone()), f)
    }

    // ---- combine ------------------------------------------------------------

    fn combine_exec<U: Clone + Send + 'static, V: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        exec: Exec,
        f: impl FnOnce(T, U) -> Result<V, BoxError> + Send + 'static,
    ) -> Stage<V> {
        // Compose over the first upstream, map on the second; the bridge
        // between them is inline, the user function runs on `exec`.
        let second = other.clone();
        let map_exec = exec;
        let next = self.compose_exec(Exec::Inline, move |first| {
            Ok(second.apply_exec(map_exec, move |second_value| f(first, second_value)))
        });

        // The compose path only reaches the first upstream when the
        // combined stage is cancelled before the inner map exists; watch
        // for that and cancel the other upstream with the latched intent.
        let watcher = next.core.clone();
        let other_core = other.core.clone();
        next.core.registry.subscribe(
            Exec::Inline,
            Box::new(move |outcome: Result<V, Failure>| {
                if outcome.is_err() && watcher.task.is_cancelled() {
                    other_core.cancel_core(watcher.deps.interrupt_intent());
                }
            }),
        );
        next
    }

    /// Combine with `other`'s value on the completing thread.
    pub fn then_combine<U: Clone + Send + 'static, V: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        f: impl FnOnce(T, U) -> Result<V, BoxError> + Send + 'static,
    ) -> Stage<V> {
        self.combine_exec(other, Exec::Inline, f)
    }

    /// Combine with `other`'s value on this stage's default executor.
    pub fn then_combine_async<U: Clone + Send + 'static, V: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        f: impl FnOnce(T, U) -> Result<V, BoxError> + Send + 'static,
    ) -> Stage<V> {
        self.combine_exec(other, Exec::On(self.core.default_exec.clone()), f)
    }

    /// Combine with `other`'s value on `executor`.
    pub fn then_combine_async_on<U: Clone + Send + 'static, V: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T, U) -> Result<V, BoxError> + Send + 'static,
    ) -> Stage<V> {
        self.combine_exec(other, Exec::On(executor.clone()), f)
    }

    /// Consume both values on the completing thread.
    pub fn then_accept_both<U: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        f: impl FnOnce(T, U) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.combine_exec(other, Exec::Inline, f)
    }

    /// Consume both values on this stage's default executor.
    pub fn then_accept_both_async<U: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        f: impl FnOnce(T, U) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.combine_exec(other, Exec::On(self.core.default_exec.clone()), f)
    }

    /// Consume both values on `executor`.
    pub fn then_accept_both_async_on<U: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T, U) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.combine_exec(other, Exec::On(executor.clone()), f)
    }

    /// Run `action` once both stages succeed, on the completing thread.
    pub fn run_after_both<U: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.combine_exec(other, Exec::Inline, move |_, _| action())
    }

    /// Run `action` once both stages succeed, on this stage's default
    /// executor.
    pub fn run_after_both_async<U: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.combine_exec(other, Exec::On(self.core.default_exec.clone()), move |_, _| {
            action()
        })
    }

    /// Run `action` once both stages succeed, on `executor`.
    pub fn run_after_both_async_on<U: Clone + Send + 'static>(
        &self,
        other: &Stage<U>,
        executor: &Arc<dyn Executor>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.combine_exec(other, Exec::On(executor.clone()), move |_, _| action())
    }

    // ---- either -------------------------------------------------------------

    /// Registry-driven funnel: the first terminal outcome of either
    /// upstream wins; the idempotent fire absorbs the second. Both
    /// producers are recorded so cancelling the funnel aborts both.
    fn either_funnel(&self, other: &Stage<T>) -> Stage<T> {
        let funnel = Stage {
            core: Core::new(self.core.default_exec.clone()),
        };
        funnel.core.deps.record(self.as_cancel_target());
        funnel.core.deps.record(other.as_cancel_target());
        for upstream in [self, other] {
            let target = funnel.core.clone();
            upstream.core.registry.subscribe(
                Exec::Inline,
                Box::new(move |outcome| {
                    target.deliver(outcome.map_err(Failure::into_composed));
                }),
            );
        }
        funnel
    }

    /// Map whichever of the two stages settles first, on the completing
    /// thread.
    pub fn apply_to_either<U: Clone + Send + 'static>(
        &self,
        other: &Stage<T>,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.either_funnel(other).apply_exec(Exec::Inline, f)
    }

    /// Map whichever of the two stages settles first, on this stage's
    /// default executor.
    pub fn apply_to_either_async<U: Clone + Send + 'static>(
        &self,
        other: &Stage<T>,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.either_funnel(other)
            .apply_exec(Exec::On(self.core.default_exec.clone()), f)
    }

    /// Map whichever of the two stages settles first, on `executor`.
    pub fn apply_to_either_async_on<U: Clone + Send + 'static>(
        &self,
        other: &Stage<T>,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.either_funnel(other)
            .apply_exec(Exec::On(executor.clone()), f)
    }

    /// Consume whichever value arrives first, on the completing thread.
    pub fn accept_either(
        &self,
        other: &Stage<T>,
        f: impl FnOnce(T) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.either_funnel(other).apply_exec(Exec::Inline, f)
    }

    /// Consume whichever value arrives first, on this stage's default
    /// executor.
    pub fn accept_either_async(
        &self,
        other: &Stage<T>,
        f: impl FnOnce(T) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.either_funnel(other)
            .apply_exec(Exec::On(self.core.default_exec.clone()), f)
    }

    /// Consume whichever value arrives first, on `executor`.
    pub fn accept_either_async_on(
        &self,
        other: &Stage<T>,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(T) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.either_funnel(other)
            .apply_exec(Exec::On(executor.clone()), f)
    }

    /// Run `action` after the first of the two stages succeeds, on the
    /// completing thread.
    pub fn run_after_either(
        &self,
        other: &Stage<T>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.either_funnel(other)
            .apply_exec(Exec::Inline, move |_| action())
    }

    /// Run `action` after the first of the two stages succeeds, on this
    /// stage's default executor.
    pub fn run_after_either_async(
        &self,
        other: &Stage<T>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.either_funnel(other)
            .apply_exec(Exec::On(self.core.default_exec.clone()), move |_| action())
    }

    /// Run `action` after the first of the two stages succeeds, on
    /// `executor`.
    pub fn run_after_either_async_on(
        &self,
        other: &Stage<T>,
        executor: &Arc<dyn Executor>,
        action: impl FnOnce() -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<()> {
        self.either_funnel(other)
            .apply_exec(Exec::On(executor.clone()), move |_| action())
    }

    // ---- recover / finalize / handle ---------------------------------------

    /// Recover from a failure on the completing thread; success passes
    /// through untouched. The recovery function receives the upstream
    /// failure as stored (enveloped only if it crossed an earlier
    /// boundary), and its own error fails the successor.
    pub fn exceptionally(
        &self,
        f: impl FnOnce(Failure) -> Result<T, BoxError> + Send + 'static,
    ) -> Stage<T> {
        let next = self.successor::<T>(&Exec::Inline);
        let target = next.core.clone();
        self.core.registry.subscribe(
            Exec::Inline,
            Box::new(move |outcome| match outcome {
                Ok(value) => target.deliver(Ok(value)),
                Err(failure) => match run_user(move || f(failure)) {
                    Ok(recovered) => target.deliver(Ok(recovered)),
                    Err(failure) => target.deliver(Err(failure)),
                },
            }),
        );
        next
    }

    fn when_complete_exec(
        &self,
        exec: Exec,
        action: impl FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<T> {
        let next = self.successor::<T>(&exec);
        let target = next.core.clone();
        self.core.registry.subscribe(
            exec,
            Box::new(move |outcome| match outcome {
                Ok(value) => match run_user(|| action(Some(&value), None)) {
                    Ok(()) => target.deliver(Ok(value)),
                    Err(failure) => target.deliver(Err(failure)),
                },
                Err(failure) => match run_user(|| action(None, Some(&failure))) {
                    // The action completed normally: re-raise the original.
                    Ok(()) => target.deliver(Err(failure.into_composed())),
                    // The action's own error replaces the original.
                    Err(replacement) => target.deliver(Err(replacement)),
                },
            }),
        );
        next
    }

    /// Observe the outcome without changing it, on the completing thread.
    ///
    /// On failure the action sees `(None, Some(failure))`; if the action
    /// itself errors, its error replaces the original, otherwise the
    /// original is re-raised.
    pub fn when_complete(
        &self,
        action: impl FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<T> {
        self.when_complete_exec(Exec::Inline, action)
    }

    /// Observe the outcome on this stage's default executor.
    pub fn when_complete_async(
        &self,
        action: impl FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<T> {
        self.when_complete_exec(Exec::On(self.core.default_exec.clone()), action)
    }

    /// Observe the outcome on `executor`.
    pub fn when_complete_async_on(
        &self,
        executor: &Arc<dyn Executor>,
        action: impl FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    ) -> Stage<T> {
        self.when_complete_exec(Exec::On(executor.clone()), action)
    }

    fn handle_exec<U: Clone + Send + 'static>(
        &self,
        exec: Exec,
        f: impl FnOnce(Option<T>, Option<Failure>) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        let next = self.successor::<U>(&exec);
        let target = next.core.clone();
        self.core.registry.subscribe(
            exec,
            Box::new(move |outcome| {
                let (value, failure) = match outcome {
                    Ok(value) => (Some(value), None),
                    Err(failure) => (None, Some(failure)),
                };
                match run_user(move || f(value, failure)) {
                    Ok(mapped) => target.deliver(Ok(mapped)),
                    Err(failure) => target.deliver(Err(failure)),
                }
            }),
        );
        next
    }

    /// Map both outcomes through `f` on the completing thread; `f`'s
    /// return value is the successor's success, its error the successor's
    /// failure.
    pub fn handle<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(Option<T>, Option<Failure>) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.handle_exec(Exec::Inline, f)
    }

    /// Map both outcomes through `f` on this stage's default executor.
    pub fn handle_async<U: Clone + Send + 'static>(
        &self,
        f: impl FnOnce(Option<T>, Option<Failure>) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.handle_exec(Exec::On(self.core.default_exec.clone()), f)
    }

    /// Map both outcomes through `f` on `executor`.
    pub fn handle_async_on<U: Clone + Send + 'static>(
        &self,
        executor: &Arc<dyn Executor>,
        f: impl FnOnce(Option<T>, Option<Failure>) -> Result<U, BoxError> + Send + 'static,
    ) -> Stage<U> {
        self.handle_exec(Exec::On(executor.clone()), f)
    }
}
