//! Fixed-size worker pool implementing the engine's [`Executor`] contract.
//!
//! Workers pull jobs from one shared injector queue in submission order and
//! run them to completion; a panicking job is contained and the worker
//! keeps serving. Shutting the pool down closes the queue and joins the
//! workers: already-queued jobs still run, new submissions are rejected.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use cascade_engine::{Executor, Job};
use cascade_types::RejectedError;

/// Fixed-size thread pool over a shared FIFO queue.
///
/// A stage task that was cancelled before a worker dequeued it simply
/// never starts; the queue slot is consumed and discarded by the engine.
pub struct FixedPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FixedPool {
    /// Spawn `size` workers. Panics if `size` is zero.
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size > 0, "pool must have at least one worker");
        let (sender, receiver) = mpsc::channel::<Job>();
        let queue = Arc::new(Mutex::new(receiver));
        let workers = (0..size)
            .map(|index| {
                let queue = queue.clone();
                thread::spawn(move || worker_loop(index, queue))
            })
            .collect();
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Close the queue and wait for the workers to drain and exit.
    ///
    /// Idempotent. Jobs already queued still run; `execute` afterwards is
    /// rejected.
    pub fn shutdown(&self) {
        drop(self.lock_sender().take());
        let workers = {
            let mut guard = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("pool worker exited via panic");
            }
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<Sender<Job>>> {
        match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Executor for FixedPool {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        match &*self.lock_sender() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| RejectedError::new("pool queue closed")),
            None => Err(RejectedError::new("pool is shut down")),
        }
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, queue: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = match queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            receiver.recv()
        };
        let Ok(job) = job else {
            // Queue closed and drained.
            break;
        };
        tracing::trace!(worker = index, "job start");
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!(worker = index, "job panicked; worker continues");
        }
    }
    tracing::trace!(worker = index, "worker exit");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use cascade_engine::{Stage, sleep_interruptibly};
    use cascade_types::{BoxError, Interrupted};
    use similar_asserts::assert_eq;

    use super::*;

    // ---- pool behavior ------------------------------------------------------

    #[test]
    fn queued_jobs_all_run() {
        let pool = FixedPool::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let hits = hits.clone();
            pool.execute(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn workers_run_jobs_concurrently() {
        let pool = FixedPool::new(4);
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let started = started.clone();
            pool.execute(Box::new(move || {
                started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
            }))
            .unwrap();
        }
        thread::sleep(Duration::from_millis(100));
        // All four are in flight at once; none has finished yet.
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn shutdown_rejects_new_submissions() {
        let pool = FixedPool::new(1);
        pool.shutdown();
        let rejected = pool.execute(Box::new(|| {})).unwrap_err();
        assert!(rejected.reason.contains("shut down"));
    }

    #[test]
    fn a_panicking_job_does_not_kill_the_worker() {
        let pool = FixedPool::new(1);
        pool.execute(Box::new(|| panic!("contained"))).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let witness = ran.clone();
        pool.execute(Box::new(move || {
            witness.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    // ---- end-to-end cancellation across composed stages ---------------------

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Progress {
        NotStarted,
        Done,
        Cancelled,
    }

    type ProgressCell = Arc<Mutex<Progress>>;

    fn progress_cell() -> ProgressCell {
        Arc::new(Mutex::new(Progress::NotStarted))
    }

    fn read(cell: &ProgressCell) -> Progress {
        *cell.lock().unwrap()
    }

    fn mark(cell: &ProgressCell, progress: Progress) {
        *cell.lock().unwrap() = progress;
    }

    /// Half a second of work in 100ms slices, noting how it ended.
    fn staged_work(progress: ProgressCell) -> impl FnOnce() -> Result<u32, BoxError> + Send + 'static
    {
        move || {
            for _ in 0..5 {
                if sleep_interruptibly(Duration::from_millis(100)).is_err() {
                    mark(&progress, Progress::Cancelled);
                    return Err(Box::new(Interrupted) as BoxError);
                }
            }
            mark(&progress, Progress::Done);
            Ok(1)
        }
    }

    fn pool_of(size: usize) -> Arc<dyn Executor> {
        FixedPool::new(size)
    }

    #[test_log::test]
    fn cancel_propagates_backwards_through_a_mapped_chain() {
        let pool = pool_of(4);
        let s1 = progress_cell();
        let s2 = progress_cell();

        let downstream = s2.clone();
        let tail = Stage::submit(&pool, staged_work(s1.clone())).then_run(move || {
            mark(&downstream, Progress::Done);
            Ok(())
        });

        thread::sleep(Duration::from_millis(200));
        assert!(tail.cancel(true));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(read(&s1), Progress::Cancelled);
        assert_eq!(read(&s2), Progress::NotStarted);
    }

    #[test_log::test]
    fn cancel_reaches_a_composed_inner_stage_that_does_not_exist_yet() {
        let pool = pool_of(4);
        let s1 = progress_cell();
        let s2 = progress_cell();

        let inner_pool = pool.clone();
        let inner_progress = s2.clone();
        let tail = Stage::submit(&pool, staged_work(s1.clone()))
            .then_compose_async(move |_| {
                Ok(Stage::submit(&inner_pool, staged_work(inner_progress)))
            })
            .then_run(|| Ok(()));

        thread::sleep(Duration::from_millis(200));
        assert!(tail.cancel(true));
        thread::sleep(Duration::from_millis(100));

        // The first task was interrupted before the compose function ran,
        // so the inner task was never created.
        assert_eq!(read(&s1), Progress::Cancelled);
        assert_eq!(read(&s2), Progress::NotStarted);
    }

    #[test_log::test]
    fn cancel_reaches_a_composed_inner_stage_in_flight() {
        let pool = pool_of(4);
        let s1 = progress_cell();
        let s2 = progress_cell();

        let inner_pool = pool.clone();
        let inner_progress = s2.clone();
        let tail = Stage::submit(&pool, staged_work(s1.clone()))
            .then_compose_async(move |_| {
                Ok(Stage::submit(&inner_pool, staged_work(inner_progress)))
            })
            .then_run(|| Ok(()));

        // First task finishes around 500ms; by 800ms the inner one runs.
        thread::sleep(Duration::from_millis(800));
        assert!(tail.cancel(true));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(read(&s1), Progress::Done);
        assert_eq!(read(&s2), Progress::Cancelled);
    }

    #[test_log::test]
    fn cancelling_a_combined_chain_cancels_both_upstreams() {
        let pool = pool_of(4);
        let s1 = progress_cell();
        let s2 = progress_cell();

        let a = Stage::submit(&pool, staged_work(s1.clone()));
        let b = Stage::submit(&pool, staged_work(s2.clone()));
        let tail = a.then_combine_async(&b, |x, y| Ok(x + y)).then_run(|| Ok(()));

        thread::sleep(Duration::from_millis(200));
        assert!(tail.cancel(true));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(read(&s1), Progress::Cancelled);
        assert_eq!(read(&s2), Progress::Cancelled);
    }

    #[test_log::test]
    fn cancelling_an_either_chain_cancels_both_producers() {
        let pool = pool_of(4);
        let s1 = progress_cell();
        let s2 = progress_cell();

        let a = Stage::submit(&pool, staged_work(s1.clone()));
        let b = Stage::submit(&pool, staged_work(s2.clone()));
        let tail = a.run_after_either_async(&b, || Ok(())).then_run(|| Ok(()));

        thread::sleep(Duration::from_millis(200));
        assert!(tail.cancel(true));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(read(&s1), Progress::Cancelled);
        assert_eq!(read(&s2), Progress::Cancelled);
    }

    #[test_log::test]
    fn when_complete_observes_cancellation_and_can_fan_it_out() {
        let pool = pool_of(4);
        let s1 = progress_cell();
        let s2 = progress_cell();

        let sibling = Stage::submit(&pool, staged_work(s2.clone()));
        let watched =
            Stage::submit(&pool, staged_work(s1.clone())).when_complete(move |_, failure| {
                if failure.is_some() {
                    sibling.cancel(true);
                }
                Ok(())
            });

        thread::sleep(Duration::from_millis(200));
        assert!(watched.cancel(true));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(read(&s1), Progress::Cancelled);
        assert_eq!(read(&s2), Progress::Cancelled);
    }

    #[test_log::test]
    fn completed_chains_refuse_late_cancellation() {
        let pool = pool_of(2);
        let a = Stage::submit(&pool, || Ok(20));
        let b = Stage::submit(&pool, || Ok(22));
        let tail = a
            .then_combine_async(&b, |x, y| Ok(x + y))
            .then_run(|| Ok(()));
        tail.get().unwrap();

        assert!(!tail.cancel(true));
        assert!(!tail.is_cancelled());
        assert!(tail.get().is_ok());
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn cancel_reports_true_exactly_once_across_threads() {
        let pool = pool_of(2);
        let s1 = progress_cell();
        let stage = Stage::submit(&pool, staged_work(s1));

        thread::sleep(Duration::from_millis(100));
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| stage.cancel(true) as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
        assert!(stage.is_cancelled());
    }
}
