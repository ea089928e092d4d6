pub mod activity;
pub mod api;
pub mod attempt;
pub mod batch;
pub mod sync;

pub use attempt::{AnswerMap, AnswerValue, AttemptState, CompletionStatus, StatePatch};
pub use sync::{ChangeEvent, ConflictStrategy, SessionState, SyncOutcome, SyncSession};
