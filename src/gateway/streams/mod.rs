//! Usage: Response-body relay adapters (usage tees, finalization, gunzip helpers).

mod finalize;
mod tee;

pub(crate) use finalize::{gunzip_with_limit, FinalizeCtx, StreamOutcome};
pub(crate) use tee::{BodyBufferTeeStream, SseUsageTeeStream};
