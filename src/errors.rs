//! Error types with diagnostics using miette
//!
//! [`HostError`] is what the document and command-surface collaborators
//! report. [`ClipError`] is the crate's own taxonomy; components convert it
//! into an [`Outcome`](crate::outcome::Outcome) instead of returning it.

use miette::Diagnostic;
use thiserror::Error;

use crate::document::InstanceId;
use crate::outcome::Status;

// ============================================================================
// Host Errors
// ============================================================================

/// Failures reported by a host binding.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("object {0} not found")]
    #[diagnostic(code(blockclip::host::not_found))]
    NotFound(InstanceId),

    #[error("object {0} has been erased")]
    #[diagnostic(code(blockclip::host::erased))]
    Erased(InstanceId),

    #[error("unexpected data shape: expected {expected}, got {got}")]
    #[diagnostic(code(blockclip::host::type_mismatch))]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("layer {0:?} does not exist")]
    #[diagnostic(code(blockclip::host::unknown_layer))]
    UnknownLayer(String),

    #[error("access scope violation: {0}")]
    #[diagnostic(
        code(blockclip::host::scope),
        help("open a write scope before mutating the document")
    )]
    Scope(String),

    #[error("command surface: {0}")]
    #[diagnostic(code(blockclip::host::surface))]
    Surface(String),

    #[error("host call panicked: {0}")]
    #[diagnostic(code(blockclip::host::panicked))]
    Panicked(String),
}

// ============================================================================
// Clip Errors
// ============================================================================

/// Coarse classification of a failure, deciding how it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reference cannot be resolved. The caller skips the node.
    NotFound,
    /// Already clipped. Not a failure at all.
    AlreadyInDesiredState,
    /// Selection mismatch, unverifiable effect, timeout.
    Transient,
    /// Explicit break from the operator.
    UserCancelled,
    /// Anything else.
    Fatal,
}

impl ErrorKind {
    /// Outcome status this kind is reported with.
    pub fn status(self) -> Status {
        match self {
            ErrorKind::AlreadyInDesiredState => Status::Success,
            ErrorKind::Transient | ErrorKind::UserCancelled => Status::Warning,
            ErrorKind::NotFound | ErrorKind::Fatal => Status::Error,
        }
    }
}

/// Errors raised inside the clip pipeline.
#[derive(Error, Diagnostic, Debug)]
pub enum ClipError {
    #[error("instance {instance} could not be resolved")]
    #[diagnostic(code(blockclip::not_found))]
    NotFound {
        instance: InstanceId,
        #[source]
        cause: HostError,
    },

    #[error("instance {instance} is already clipped ({method})")]
    #[diagnostic(code(blockclip::already_clipped))]
    AlreadyClipped {
        instance: InstanceId,
        method: &'static str,
    },

    #[error("cannot compute boundary: {reason}")]
    #[diagnostic(
        code(blockclip::boundary),
        help("the host reported no usable geometric extents for this instance")
    )]
    Boundary { reason: String },

    #[error("selection failed: expected exactly [{expected}], host reports {actual:?}")]
    #[diagnostic(code(blockclip::selection))]
    Selection {
        expected: InstanceId,
        actual: Vec<InstanceId>,
    },

    #[error("timed out after {seconds:.1}s, auto-cancelled")]
    #[diagnostic(
        code(blockclip::timeout),
        help("the command did not report completion; retry once the host is idle")
    )]
    Timeout { seconds: f64 },

    #[error("cancelled by user")]
    #[diagnostic(code(blockclip::cancelled))]
    Cancelled,

    #[error("command cancelled by host")]
    #[diagnostic(code(blockclip::host_cancelled))]
    HostCancelled,

    #[error("clip not observed after {attempts} verification attempts (last method: {last_method})")]
    #[diagnostic(
        code(blockclip::unverified),
        help("the command may have succeeded without being observable; inspect the instance manually")
    )]
    Unverified {
        attempts: u32,
        last_method: &'static str,
    },

    #[error("invalid argument: {0}")]
    #[diagnostic(code(blockclip::invalid_argument))]
    InvalidArgument(String),

    #[error("{context}: {cause}")]
    #[diagnostic(code(blockclip::host))]
    Host {
        context: &'static str,
        #[source]
        cause: HostError,
    },

    #[error("unexpected failure: {0}")]
    #[diagnostic(code(blockclip::fatal))]
    Fatal(String),
}

impl ClipError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClipError::NotFound { .. } => ErrorKind::NotFound,
            ClipError::AlreadyClipped { .. } => ErrorKind::AlreadyInDesiredState,
            ClipError::Selection { .. } | ClipError::Timeout { .. } | ClipError::Unverified { .. } => {
                ErrorKind::Transient
            }
            ClipError::Cancelled | ClipError::HostCancelled => ErrorKind::UserCancelled,
            ClipError::Boundary { .. }
            | ClipError::InvalidArgument(_)
            | ClipError::Host { .. }
            | ClipError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Status this error is reported with.
    ///
    /// Follows [`ErrorKind::status`], except that a selection mismatch is an
    /// error: it stops the applier before any command reaches the host.
    pub fn status(&self) -> Status {
        match self {
            ClipError::Selection { .. } => Status::Error,
            other => other.kind().status(),
        }
    }

    /// Wrap a host failure with the step that hit it.
    pub fn host(context: &'static str) -> impl FnOnce(HostError) -> ClipError {
        move |cause| ClipError::Host { context, cause }
    }
}

/// Render the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
