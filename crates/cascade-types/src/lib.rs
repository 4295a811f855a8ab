pub mod failure;
pub mod phase;
pub mod stage_id;

pub use failure::{
    BoxError, Cancelled, Failure, GetError, Interrupted, PanicError, RejectedError, SharedError,
};
pub use phase::StagePhase;
pub use stage_id::StageId;
