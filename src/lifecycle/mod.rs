//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! SIGINT / SIGTERM
//!     → shutdown_signal() resolves
//!     → Shutdown::trigger() broadcasts
//!     → load monitor, config reload loop, servers exit
//! ```

pub mod shutdown;

pub use shutdown::{shutdown_signal, Shutdown};
