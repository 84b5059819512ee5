//! Infrastructure layer: document store adapters, the task scheduler, retention,
//! auditing, notifications and engine configuration.

pub mod audit;
pub mod config;
pub mod engine;
pub mod notification;
pub mod retention;
pub mod store;

pub use config::EngineConfig;
pub use engine::{BackupEngine, EngineControl, EngineError, TaskQueueProcessor};
pub use store::{Collection, Filter, InMemoryCollection, StoreError, TaskCollection};

mod scheduling_tests;
