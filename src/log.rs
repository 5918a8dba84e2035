//! Conditional logging macros.
//!
//! When the `tracing` feature is enabled, these re-export `tracing` macros.
//! When disabled, they expand to no-ops for zero runtime overhead.
//!
//! Whether a component logs at all is decided by its [`Verbosity`], which is
//! carried in its configuration rather than in any process-wide switch.

#[cfg(feature = "tracing")]
pub use tracing::{debug, error, info, warn};

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub use crate::{debug, error, info, warn};

/// How chatty a component is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Only errors are logged; progress messages to the operator are suppressed.
    Quiet,
    /// Info-level progress and warnings.
    #[default]
    Normal,
    /// Everything, including per-node and per-attempt debug lines.
    Verbose,
}

impl Verbosity {
    /// Whether info/warn lines and operator progress messages should be emitted.
    pub fn shows_progress(self) -> bool {
        self >= Verbosity::Normal
    }

    /// Whether debug lines should be emitted.
    pub fn shows_debug(self) -> bool {
        self >= Verbosity::Verbose
    }
}
