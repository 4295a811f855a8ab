use std::any::Any;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error returned by user computations and callbacks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Shared, clonable cause carried inside a [`Failure`].
///
/// Causes are reference-counted because a stage fans its terminal outcome
/// out to every subscriber, each of which receives its own copy.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// Marker error for a stage that was cancelled before producing a value.
///
/// Survives enveloping: [`Failure::is_cancellation`] detects it by downcast
/// after the failure has crossed a combinator boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, thiserror::Error)]
#[error("stage cancelled")]
pub struct Cancelled;

/// Returned by an interruptible wait when `cancel(true)` reached the stage
/// computation running on the waiting thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, thiserror::Error)]
#[error("interrupted while waiting")]
pub struct Interrupted;

/// Rejection reported by an executor that refused a job.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("executor rejected job: {reason}")]
pub struct RejectedError {
    pub reason: String,
}

impl RejectedError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Stand-in error for a panic unwound out of user code.
#[derive(Clone, Debug, thiserror::Error)]
#[error("computation panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

/// Terminal failure of a stage, fanned out to every subscriber.
///
/// The variants map 1:1 to the propagation policy:
/// - [`Failure::Cancelled`] is produced by `cancel` and is distinguishable
///   from ordinary failures.
/// - [`Failure::Composed`] is the envelope around an error that crossed a
///   combinator boundary. Already-enveloped failures are never re-enveloped.
/// - [`Failure::Rejected`] is raised when the executor refuses the stage's
///   own task; downstream it propagates like a user failure.
/// - [`Failure::User`] carries an error returned by (or a panic raised in)
///   a user computation or callback.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Failure {
    /// The stage was cancelled before it produced a value.
    #[error("stage cancelled")]
    Cancelled,
    /// Envelope around an error propagated through the combinator chain.
    #[error("composition failed: {0}")]
    Composed(#[source] SharedError),
    /// The executor refused to accept the stage's work.
    #[error(transparent)]
    Rejected(#[from] RejectedError),
    /// Error produced by a user computation or callback.
    #[error(transparent)]
    User(SharedError),
}

impl Failure {
    /// Wrap an error returned by user code.
    pub fn user(err: BoxError) -> Self {
        Failure::User(Arc::from(err))
    }

    /// Failure standing in for a panic unwound from user code.
    ///
    /// `&str` and `String` payloads keep their message; anything else is
    /// reported generically.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_owned());
        Failure::User(Arc::new(PanicError { message }))
    }

    /// Envelope this failure for crossing a combinator boundary.
    ///
    /// Idempotent: an already-composed failure is returned unchanged, so a
    /// cause is wrapped at most once no matter how long the chain is.
    pub fn into_composed(self) -> Self {
        match self {
            Failure::Composed(_) => self,
            Failure::Cancelled => Failure::Composed(Arc::new(Cancelled)),
            Failure::Rejected(rejected) => Failure::Composed(Arc::new(rejected)),
            Failure::User(cause) => Failure::Composed(cause),
        }
    }

    /// Strip one envelope level.
    ///
    /// Blocking accessors use this so callers see the original cause rather
    /// than the composition wrapper. Exactly one level is removed; a
    /// non-enveloped failure is returned unchanged.
    pub fn unwrap_composed(self) -> Self {
        match self {
            Failure::Composed(cause) => Failure::User(cause),
            other => other,
        }
    }

    /// True when this failure originated from a cancellation, including a
    /// cancellation that has since been enveloped.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Failure::Cancelled => true,
            Failure::Composed(cause) => cause.downcast_ref::<Cancelled>().is_some(),
            Failure::Rejected(_) | Failure::User(_) => false,
        }
    }
}

/// Error returned by the timed blocking accessor.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GetError {
    /// The stage did not reach a terminal state within the allotted wait.
    #[error("stage not terminal after {0:?}")]
    TimedOut(Duration),
    /// The stage terminated with a failure.
    #[error(transparent)]
    Failed(#[from] Failure),
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn boom() -> BoxError {
        BoxError::from("boom")
    }

    #[test]
    fn compose_wraps_user_failure_once() {
        let once = Failure::user(boom()).into_composed();
        let twice = once.clone().into_composed();

        let Failure::Composed(first) = &once else {
            panic!("expected envelope, got {once:?}");
        };
        let Failure::Composed(second) = &twice else {
            panic!("expected envelope, got {twice:?}");
        };
        assert!(Arc::ptr_eq(first, second));
    }

    #[test]
    fn unwrap_composed_strips_exactly_one_level() {
        let unwrapped = Failure::user(boom()).into_composed().unwrap_composed();
        match unwrapped {
            Failure::User(cause) => assert_eq!(cause.to_string(), "boom"),
            other => panic!("expected original cause, got {other:?}"),
        }

        let untouched = Failure::Cancelled.unwrap_composed();
        assert!(matches!(untouched, Failure::Cancelled));
    }

    #[test]
    fn cancellation_is_detected_through_the_envelope() {
        assert!(Failure::Cancelled.is_cancellation());
        assert!(Failure::Cancelled.into_composed().is_cancellation());
        assert!(!Failure::user(boom()).into_composed().is_cancellation());
    }

    #[test]
    fn rejection_propagates_like_a_user_failure() {
        let composed = Failure::Rejected(RejectedError::new("queue closed")).into_composed();
        let Failure::Composed(cause) = &composed else {
            panic!("expected envelope, got {composed:?}");
        };
        assert!(cause.downcast_ref::<RejectedError>().is_some());
        assert!(!composed.is_cancellation());
    }

    #[test]
    fn panic_payload_message_is_preserved() {
        let failure = Failure::from_panic(Box::new("index out of range".to_owned()));
        assert!(failure.to_string().contains("index out of range"));
    }
}
