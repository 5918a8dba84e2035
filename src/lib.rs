//! Clip detection and application for nested symbol instances.
//!
//! The host drawing is reached through two traits: [`DocumentGraph`] for
//! reading objects and toggling layers, and [`CommandSurface`] for selection,
//! command submission and lifecycle events. On top of those:
//!
//! - [`ClipDetector`] decides whether an instance already carries a clip.
//! - [`SceneGraphTraverser`] walks instances and their nested instances,
//!   collecting the clipped ones.
//! - [`ClipApplier`] clips one instance through the command surface and
//!   verifies the result.
//! - [`BatchCoordinator`] applies clips to many instances in sequence.
//! - [`IsolationProjector`] shows only the layers clipped instances use.
//!
//! Every operation reports an [`Outcome`] instead of failing.
//!
//! With the `sim` feature, `sim` provides an in-memory document and a
//! scripted command surface driven by a [`ManualClock`].

pub mod apply;
pub mod batch;
pub mod clock;
pub mod command;
pub mod config;
pub mod defaults;
pub mod detect;
pub mod document;
pub mod errors;
pub mod host;
pub mod isolate;
pub mod log;
pub mod outcome;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod traverse;
pub mod types;

pub use apply::{Application, ApplyOptions, ApplyState, Applied, ClipApplier, PriorState};
pub use batch::{BatchCoordinator, BatchTally};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClipConfig;
pub use detect::{ClipDetection, ClipDetector, DetectionMethod};
pub use document::{DocumentGraph, InstanceId};
pub use errors::{ClipError, ErrorKind, HostError};
pub use host::{CommandEvent, CommandSurface, SubmitOptions};
pub use isolate::IsolationProjector;
pub use log::Verbosity;
pub use outcome::{Outcome, Status};
pub use traverse::{ClippedInstanceRecord, SceneGraphTraverser, Traversal};
pub use types::{ClipBoundary, Extents};
