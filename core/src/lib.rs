pub mod config;
pub mod errors;
pub mod handler;
pub mod pump;
pub mod source;
pub mod telemetry;

pub use config::{PumpConfig, PumpOptions};
pub use errors::{HandlerError, PumpError, SourceError};
pub use handler::{EventHandler, handler_fn};
pub use pump::{PumpState, ReceivePump};
pub use source::{MessageBatch, PartitionSource, SourceMessage};
