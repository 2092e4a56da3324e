pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod store;
pub mod transform;
pub mod watcher;

pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use orchestrator::{EngineState, HealthSnapshot, Orchestrator};
pub use store::{MirrorStore, StoreExecutor};
