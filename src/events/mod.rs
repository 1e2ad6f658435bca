//! Per-job event streams.
//!
//! Each job owns an append-only [`EventLog`]. Subscribers replay the log from
//! any point and then follow new events until the job's history is closed.

pub mod event;
pub mod publisher;

pub use event::{Event, EventName, EventPayload, VoteStatus};
pub use publisher::{EventLog, EventPublisher, Subscription};
