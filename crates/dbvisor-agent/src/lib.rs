pub mod config;
pub mod diagnostics;
pub mod download;
pub mod engine;
pub mod error;
pub mod health;
pub mod host_lock;
pub mod installer;
pub mod launcher;
pub mod lifecycle;
pub mod port_alloc;
pub mod process_table;
pub mod store;
pub mod templates;

pub use config::AgentConfig;
pub use error::{LifecycleError, Result};
pub use lifecycle::{HostServices, LifecycleController, StartOutcome};
