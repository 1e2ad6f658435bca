pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod timer;
pub mod transport;

pub use error::{PushyError, Result};
pub use server::PushServer;
