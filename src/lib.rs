// Core modules
pub mod api;
pub mod commands;
pub mod config;
pub mod error;
pub mod execution;
pub mod models;
pub mod notifier;

// Re-export commonly used types
pub use error::{EngineError, ExchangeError};
pub use execution::{PositionEngine, PositionSnapshot, PositionState};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
