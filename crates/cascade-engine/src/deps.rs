use std::sync::{Arc, Mutex, MutexGuard};

/// A stage that can be cancelled through the dependency graph without
/// knowing its value type.
pub(crate) trait CancelTarget: Send + Sync {
    /// Attempt the cancelling transition; true only for the winning call.
    fn cancel_target(&self, interrupt: bool) -> bool;
}

/// Cancellation-graph node for one stage: the targets to cancel when the
/// stage is cancelled, plus the latched intent of the winning cancel.
///
/// Everything sits under one mutex so that installing a compose inner
/// stage and the cancelling walk are totally ordered: whichever comes
/// second observes the first. The recorded edges form a DAG anchored at
/// the cancelled node (no stage is its own dependency), so holding the
/// lock across the walk cannot deadlock.
pub(crate) struct DepGraph {
    inner: Mutex<DepState>,
}

struct DepState {
    targets: Vec<Arc<dyn CancelTarget>>,
    cancelled: bool,
    interrupt_on_cancel: bool,
}

impl DepGraph {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DepState {
                targets: Vec::new(),
                cancelled: false,
                interrupt_on_cancel: false,
            }),
        }
    }

    /// Record `target` for the cancellation walk.
    pub fn record(&self, target: Arc<dyn CancelTarget>) {
        self.lock().targets.push(target);
    }

    /// Install a compose inner stage as the sole remaining target.
    ///
    /// The inner stage is produced asynchronously, so installation races a
    /// user-initiated cancel. If the cancel already won, the edge is not
    /// recorded; the inner stage is cancelled right here with the latched
    /// interrupt intent of the winning call.
    pub fn install_inner(&self, target: Arc<dyn CancelTarget>) {
        let mut state = self.lock();
        if state.cancelled {
            let interrupt = state.interrupt_on_cancel;
            drop(state);
            target.cancel_target(interrupt);
        } else {
            state.targets = vec![target];
        }
    }

    /// The winning cancel's walk: latch the intent, then cancel every
    /// recorded target with the same flag, holding the lock so a racing
    /// [`install_inner`] cannot slip an edge past the walk.
    pub fn cancel_walk(&self, interrupt: bool) {
        let mut state = self.lock();
        state.cancelled = true;
        state.interrupt_on_cancel = interrupt;
        let targets = std::mem::take(&mut state.targets);
        for target in &targets {
            target.cancel_target(interrupt);
        }
    }

    /// Latched interrupt intent of the winning cancel; false before one.
    pub fn interrupt_intent(&self) -> bool {
        self.lock().interrupt_on_cancel
    }

    fn lock(&self) -> MutexGuard<'_, DepState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Probe {
        cancels: AtomicUsize,
        interrupt: AtomicBool,
    }

    impl CancelTarget for Probe {
        fn cancel_target(&self, interrupt: bool) -> bool {
            self.interrupt.store(interrupt, Ordering::SeqCst);
            self.cancels.fetch_add(1, Ordering::SeqCst) == 0
        }
    }

    #[test]
    fn walk_cancels_every_recorded_target_with_the_same_flag() {
        let graph = DepGraph::new();
        let a = Arc::new(Probe::default());
        let b = Arc::new(Probe::default());
        graph.record(a.clone());
        graph.record(b.clone());

        graph.cancel_walk(true);

        assert_eq!(a.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(b.cancels.load(Ordering::SeqCst), 1);
        assert!(a.interrupt.load(Ordering::SeqCst));
        assert!(b.interrupt.load(Ordering::SeqCst));
        assert!(graph.interrupt_intent());
    }

    #[test]
    fn install_after_cancel_cancels_the_inner_stage_with_the_latch() {
        let graph = DepGraph::new();
        graph.cancel_walk(true);

        let inner = Arc::new(Probe::default());
        graph.install_inner(inner.clone());

        assert_eq!(inner.cancels.load(Ordering::SeqCst), 1);
        assert!(inner.interrupt.load(Ordering::SeqCst));
    }

    #[test]
    fn install_before_cancel_replaces_the_wiring_edge() {
        let graph = DepGraph::new();
        let upstream = Arc::new(Probe::default());
        graph.record(upstream.clone());

        let inner = Arc::new(Probe::default());
        graph.install_inner(inner.clone());
        graph.cancel_walk(false);

        // The inner stage is the sole dependency once installed.
        assert_eq!(upstream.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(inner.cancels.load(Ordering::SeqCst), 1);
        assert!(!inner.interrupt.load(Ordering::SeqCst));
    }
}
