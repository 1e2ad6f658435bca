//! Node-facing side of the server: liveness tracking and per-node sessions.

pub mod registry;
pub mod session;
pub mod state;

pub use registry::{DownReason, NodeDown, NodeRegistry};
pub use session::{Disposition, MessageKind, NodeMessage, NodeReport, NodeSessions, RunResult};
pub use state::{Availability, Liveness, NodeRecord, NodeView};
