use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use cascade_types::{Interrupted, StagePhase};

thread_local! {
    /// Interrupt flag of the stage computation currently running on this
    /// thread, if any. Installed by `run_with_interrupt`.
    static CURRENT_INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// One-shot cancellable lifecycle around a stage computation.
///
/// Terminal transitions are race-checked under the state mutex and
/// irreversible. `Running` records enough of the running thread to request
/// interruption from a concurrent `cancel(true)`.
pub(crate) struct TaskState {
    state: Mutex<Lifecycle>,
}

enum Lifecycle {
    Pending,
    Running {
        interrupt: Arc<AtomicBool>,
        thread: Thread,
    },
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Lifecycle::Pending),
        }
    }

    /// A task born terminal, for pre-settled stages. It never runs and can
    /// never be cancelled.
    pub fn settled(success: bool) -> Self {
        Self {
            state: Mutex::new(if success {
                Lifecycle::Succeeded
            } else {
                Lifecycle::Failed
            }),
        }
    }

    pub fn phase(&self) -> StagePhase {
        match &*self.lock() {
            Lifecycle::Pending => StagePhase::Pending,
            Lifecycle::Running { .. } => StagePhase::Running,
            Lifecycle::Succeeded => StagePhase::Succeeded,
            Lifecycle::Failed => StagePhase::Failed,
            Lifecycle::Cancelled => StagePhase::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.lock(), Lifecycle::Cancelled)
    }

    /// Pending → Running, installing a fresh interrupt flag.
    ///
    /// Returns `None` when the task is already terminal: a job that lost to
    /// cancellation simply never runs (the registry has already failed).
    pub fn try_start(&self) -> Option<Arc<AtomicBool>> {
        let mut state = self.lock();
        match &*state {
            Lifecycle::Pending => {
                let interrupt = Arc::new(AtomicBool::new(false));
                *state = Lifecycle::Running {
                    interrupt: interrupt.clone(),
                    thread: thread::current(),
                };
                Some(interrupt)
            }
            _ => None,
        }
    }

    /// Running → Succeeded. False when cancellation won in flight; the
    /// computation's value is then dropped.
    pub fn finish_success(&self) -> bool {
        self.finish(Lifecycle::Succeeded)
    }

    /// Running → Failed. False when cancellation won in flight; the
    /// computation's error is then dropped.
    pub fn finish_error(&self) -> bool {
        self.finish(Lifecycle::Failed)
    }

    fn finish(&self, terminal: Lifecycle) -> bool {
        let mut state = self.lock();
        match &*state {
            Lifecycle::Running { .. } => {
                *state = terminal;
                true
            }
            _ => false,
        }
    }

    /// Pending → Succeeded, for a stage whose outcome arrives through a
    /// registry bridge rather than its own task run. False when the task
    /// already reached a terminal state, so a later `cancel` cannot win a
    /// second terminal transition against a delivered outcome.
    pub fn settle_success(&self) -> bool {
        self.settle(Lifecycle::Succeeded)
    }

    /// Pending → Failed, for a bridge-delivered failure or a submission
    /// the executor refused.
    pub fn settle_failure(&self) -> bool {
        self.settle(Lifecycle::Failed)
    }

    fn settle(&self, terminal: Lifecycle) -> bool {
        let mut state = self.lock();
        match &*state {
            Lifecycle::Pending => {
                *state = terminal;
                true
            }
            _ => false,
        }
    }

    /// Pending|Running → Cancelled.
    ///
    /// On a running victim with `interrupt` set, the flag installed by
    /// [`try_start`] is raised and the thread unparked, so an
    /// [`sleep_interruptibly`] inside the computation returns early. False
    /// when the transition was lost to any terminal state.
    pub fn try_cancel(&self, interrupt: bool) -> bool {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, Lifecycle::Cancelled) {
            Lifecycle::Pending => true,
            Lifecycle::Running {
                interrupt: flag,
                thread,
            } => {
                if interrupt {
                    flag.store(true, Ordering::SeqCst);
                    thread.unpark();
                }
                true
            }
            terminal => {
                // Lost the race; restore the terminal state.
                *state = terminal;
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Run `compute` with `flag` installed as this thread's interrupt flag.
///
/// The previous flag is restored on exit, including on unwind, so nested
/// inline computations observe their own flag.
pub(crate) fn run_with_interrupt<R>(flag: Arc<AtomicBool>, compute: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<AtomicBool>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT_INTERRUPT.with(|current| *current.borrow_mut() = previous);
        }
    }

    let previous = CURRENT_INTERRUPT.with(|current| current.borrow_mut().replace(flag));
    let _restore = Restore(previous);
    compute()
}

/// True when the stage computation running on this thread has been asked to
/// stop via `cancel(true)`.
///
/// Cooperative: a computation that never checks still gets cancelled at the
/// stage level, but its thread keeps running and its eventual result is
/// dropped.
pub fn interrupted() -> bool {
    CURRENT_INTERRUPT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    })
}

/// Sleep that honors interruption requests.
///
/// Returns `Err(Interrupted)` as soon as `cancel(true)` targets the stage
/// computation running on this thread. Outside a stage computation this is
/// a plain sleep. Tolerates spurious unparks.
pub fn sleep_interruptibly(duration: Duration) -> Result<(), Interrupted> {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return Err(Interrupted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_finish_success_is_the_happy_path() {
        let task = TaskState::new();
        assert_eq!(task.phase(), StagePhase::Pending);
        let _flag = task.try_start().expect("pending task starts");
        assert_eq!(task.phase(), StagePhase::Running);
        assert!(task.finish_success());
        assert_eq!(task.phase(), StagePhase::Succeeded);
    }

    #[test]
    fn cancel_wins_exactly_once() {
        let task = TaskState::new();
        assert!(task.try_cancel(false));
        assert!(!task.try_cancel(true));
        assert!(!task.try_cancel(false));
        assert_eq!(task.phase(), StagePhase::Cancelled);
    }

    #[test]
    fn cancelled_task_never_starts() {
        let task = TaskState::new();
        assert!(task.try_cancel(false));
        assert!(task.try_start().is_none());
    }

    #[test]
    fn finish_after_cancel_reports_the_lost_race() {
        let task = TaskState::new();
        let _flag = task.try_start().unwrap();
        assert!(task.try_cancel(true));
        assert!(!task.finish_success());
        assert!(!task.finish_error());
        assert_eq!(task.phase(), StagePhase::Cancelled);
    }

    #[test]
    fn settled_task_rejects_every_transition() {
        let task = TaskState::settled(true);
        assert_eq!(task.phase(), StagePhase::Succeeded);
        assert!(task.try_start().is_none());
        assert!(!task.try_cancel(true));
        assert!(!task.settle_failure());
    }

    #[test]
    fn settle_makes_a_bridge_delivered_outcome_terminal() {
        let task = TaskState::new();
        assert!(task.settle_success());
        assert_eq!(task.phase(), StagePhase::Succeeded);
        // Terminal exactly once: neither cancel nor a second settle wins.
        assert!(!task.try_cancel(true));
        assert!(!task.settle_failure());
        assert!(task.try_start().is_none());
    }

    #[test]
    fn cancel_beats_settle_when_it_arrives_first() {
        let task = TaskState::new();
        assert!(task.try_cancel(false));
        assert!(!task.settle_success());
        assert!(!task.settle_failure());
        assert_eq!(task.phase(), StagePhase::Cancelled);
    }

    #[test]
    fn interrupt_flag_is_scoped_to_the_computation() {
        assert!(!interrupted());
        let flag = Arc::new(AtomicBool::new(true));
        run_with_interrupt(flag, || assert!(interrupted()));
        assert!(!interrupted());
    }

    #[test]
    fn sleep_returns_early_when_interrupted() {
        let task = Arc::new(TaskState::new());
        let worker = {
            let task = task.clone();
            thread::spawn(move || {
                let flag = task.try_start().unwrap();
                let slept = run_with_interrupt(flag, || {
                    let started = Instant::now();
                    let result = sleep_interruptibly(Duration::from_secs(5));
                    (result, started.elapsed())
                });
                slept
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(task.try_cancel(true));

        let (result, elapsed) = worker.join().unwrap();
        assert_eq!(result, Err(Interrupted));
        assert!(elapsed < Duration::from_secs(5));
    }
}
