pub mod config;
pub mod runtime;

pub use config::{Mode, WorkerConfig};
pub use runtime::Runtime;
