//! Activity definitions and the handler lookup table
//!
//! Activities are units of work that:
//! - Execute outside the replay engine
//! - May perform I/O or other side effects
//! - Are retried by the orchestrator on failure
//! - Can send heartbeats and observe cancellation

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError, ActivityErrorKind};
pub use registry::{ActivityExecutor, ActivityHandler, ActivityRegistry, ActivityTask};
