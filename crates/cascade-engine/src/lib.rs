//! Stage composition engine with recursive, interruption-aware cancellation.
//!
//! A [`Stage`] is a value-producing, cancellable asynchronous computation.
//! Combinators derive new stages from existing ones; every derivation also
//! records a cancellation edge, so cancelling a derived stage transitively
//! cancels the stages that would have produced its input, including inner
//! stages that only come into existence after the cancel was requested
//! (`then_compose`).
//!
//! Module map:
//! - [`executor`]: the contract stages schedule work through.
//! - `registry`: per-stage fan-out of the terminal outcome (internal).
//! - `task`: the one-shot cancellable lifecycle plus the interrupt
//!   plumbing exposed as [`interrupted`] / [`sleep_interruptibly`].
//! - `deps`: the cancellation graph walked by `cancel` (internal).
//! - [`stage`]: the stage handle, factories, and blocking accessors.
//! - `combinator`: the derivation surface (`then_apply` .. `handle`).
//! - [`export`]: one-way bridge to a plain [`std::future::Future`].

mod combinator;
mod deps;
pub mod executor;
pub mod export;
mod registry;
pub mod stage;
mod task;

pub use executor::{Executor, Job};
pub use export::StageFuture;
pub use stage::Stage;
pub use task::{interrupted, sleep_interruptibly};
