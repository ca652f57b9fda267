//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, all errors at once)
//!     → GuardConfig (validated)
//!     → composition root builds breakers, locks, limiter from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads and validates new config
//!     → rate limit policy swapped atomically in the limiter
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - An invalid reload never replaces a working policy
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, CompoundLimitConfig, GuardConfig, LimitConfig, LoadThrottleConfig,
    ObservabilityConfig, RateLimitConfig, RouteLimitConfig, ServerConfig, StoreBackend,
    StoreConfig, WindowStrategy,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
