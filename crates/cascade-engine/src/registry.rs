use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cascade_types::Failure;

use crate::executor::{Exec, Job};

/// Terminal outcome shared with every subscriber.
pub(crate) type Outcome<T> = Result<T, Failure>;

type Consumer<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

struct Subscriber<T> {
    exec: Exec,
    consumer: Consumer<T>,
}

/// Per-stage fan-out mailbox.
///
/// The first of `success`/`failure` wins and latches the outcome; the loser
/// is ignored. A subscriber racing the terminal transition either enqueues
/// for the fan-out or is dispatched immediately with the stored outcome,
/// never both and never neither. Each subscriber sees the outcome exactly
/// once, on its chosen executor; ordering between subscribers is
/// unspecified.
///
/// Subscribers are drained outside the state lock so a consumer may
/// re-enter the registry (inline bridges chain through here).
pub(crate) struct Registry<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
}

enum State<T> {
    Open(Vec<Subscriber<T>>),
    Done(Outcome<T>),
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Open(Vec::new())),
            settled: Condvar::new(),
        }
    }

    /// Record a consumer, or dispatch it immediately when already terminal.
    pub fn subscribe(&self, exec: Exec, consumer: Consumer<T>) {
        let mut state = self.lock_state();
        match &mut *state {
            State::Open(subscribers) => {
                subscribers.push(Subscriber { exec, consumer });
            }
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                dispatch(exec, consumer, outcome);
            }
        }
    }

    /// Latch a success outcome and fan out.
    pub fn success(&self, value: T) {
        self.fire(Ok(value));
    }

    /// Latch a failure outcome and fan out.
    pub fn failure(&self, failure: Failure) {
        self.fire(Err(failure));
    }

    fn fire(&self, outcome: Outcome<T>) {
        let drained = {
            let mut state = self.lock_state();
            match &mut *state {
                State::Open(subscribers) => {
                    let drained = std::mem::take(subscribers);
                    *state = State::Done(outcome.clone());
                    self.settled.notify_all();
                    drained
                }
                // Second terminal call; idempotent fire drops it.
                State::Done(_) => return,
            }
        };
        for Subscriber { exec, consumer } in drained {
            dispatch(exec, consumer, outcome.clone());
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.lock_state(), State::Done(_))
    }

    /// Block until terminal.
    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.lock_state();
        loop {
            if let State::Done(outcome) = &*state {
                return outcome.clone();
            }
            state = match self.settled.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Block until terminal or `timeout` elapses; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if let State::Done(outcome) = &*state {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.settled.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        // A poisoning panic cannot leave the state half-written; recover.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn dispatch<T: Send + 'static>(exec: Exec, consumer: Consumer<T>, outcome: Outcome<T>) {
    let job: Job = Box::new(move || consumer(outcome));
    if let Err(rejected) = exec.run(job) {
        // The callback is dropped; the stage outcome itself is unaffected.
        tracing::warn!(%rejected, "callback dispatch rejected by executor");
    }
}
