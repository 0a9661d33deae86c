//! Runtime module - Task supervision, shutdown and shared registries
//!
//! Provides:
//! - A supervisor that counts, tracks and panic-isolates every task
//! - Re-arming timers built on cancellable tasks
//! - The one-way shutdown flag, slow-operation registry and drain watchdog
//! - The process context that owns the queue registries

mod context;
mod registry;
mod shutdown;
mod stats;
mod supervisor;
mod timer;

pub use context::*;
pub use registry::*;
pub use shutdown::*;
pub use stats::*;
pub use supervisor::*;
