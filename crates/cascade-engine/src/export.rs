use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use cascade_types::Failure;

use crate::executor::Exec;
use crate::stage::Stage;

/// One-way export of a stage outcome as a plain [`std::future::Future`].
///
/// Completion is driven by the stage's registry through an inline
/// subscriber. There is no back-channel: dropping or never polling the
/// future has no effect on the originating stage. Polling after completion
/// keeps returning the same outcome.
pub struct StageFuture<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

struct Shared<T> {
    outcome: Option<Result<T, Failure>>,
    waker: Option<Waker>,
}

impl<T: Clone + Send + 'static> StageFuture<T> {
    pub(crate) fn subscribe(stage: &Stage<T>) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            outcome: None,
            waker: None,
        }));
        let slot = shared.clone();
        stage.core.registry.subscribe(
            Exec::Inline,
            Box::new(move |outcome| {
                let waker = {
                    let mut guard = lock(&slot);
                    guard.outcome = Some(outcome);
                    guard.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            }),
        );
        StageFuture { shared }
    }
}

impl<T: Clone + Send + 'static> Future for StageFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = lock(&self.shared);
        match &guard.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                guard.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

fn lock<T>(shared: &Arc<Mutex<Shared<T>>>) -> MutexGuard<'_, Shared<T>> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
