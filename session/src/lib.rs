//! Generation session orchestration.
//!
//! Drives one streaming completion per message: the gateway stream is
//! decoded into chunks, accumulated in a per-message [`buffer::ChunkBuffer`],
//! persisted through a caller-supplied [`persist::PersistenceSink`] on a
//! dual size/time trigger, and surfaced to the UI through a
//! [`session::ChunkNotification`] channel on every accepted delta.
//!
//! Interrupted generations are resumable: the gateway-assigned generation
//! id is persisted as soon as it is known, and [`session::resume_incomplete`]
//! re-opens each interrupted stream and appends to the already-persisted
//! content.

pub mod buffer;
pub mod persist;
pub mod session;

pub use buffer::{ChunkBuffer, FlushPolicy};
pub use persist::{MessagePatch, PersistenceSink, ResumableMessage};
pub use session::{
    ChunkNotification, GenerationSession, ResumeOutcome, ResumeReport, SessionError,
    SessionOutcome, resume_incomplete,
};
