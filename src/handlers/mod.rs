//! The stage handler contract and the per-cloud factory.
//!
//! A handler performs one stage's side effects for one cloud. The
//! framework builds it from the persisted job document (construction is
//! where stage-specific keys are validated), runs it at most once per
//! listener trigger, and reads its status, accumulated outputs, and error
//! messages afterwards.

mod context;
mod factory;
mod noop;
mod traits;

pub use context::HandlerContext;
pub use factory::JobFactory;
pub use noop::NoOpHandler;
pub use traits::{HandlerError, StageHandler};
