//! Host command surface: selection, command submission and lifecycle events.
//!
//! The host runs one interactive command at a time per document and signals
//! its progress asynchronously. Events arrive on an `mpsc` channel handed out
//! by [`CommandSurface::subscribe`].

use std::sync::mpsc::Receiver;

use crate::document::InstanceId;
use crate::errors::HostError;

/// Command lifecycle notification, carrying the global command name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    WillStart(String),
    Ended(String),
    Cancelled(String),
}

impl CommandEvent {
    pub fn command_name(&self) -> &str {
        match self {
            CommandEvent::WillStart(n) | CommandEvent::Ended(n) | CommandEvent::Cancelled(n) => n,
        }
    }
}

/// How a submission is executed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Run the string as if typed at the command line.
    pub activate: bool,
    /// Wrap in an undo group.
    pub wrap_undo_group: bool,
    /// Do not echo the string on the command line.
    pub silent: bool,
}

impl SubmitOptions {
    /// Options for an interactive command the operator can see.
    pub const fn interactive() -> Self {
        Self {
            activate: true,
            wrap_undo_group: true,
            silent: false,
        }
    }

    /// Options for the escape sequence sent after a cancel or timeout.
    pub const fn silent() -> Self {
        Self {
            activate: true,
            wrap_undo_group: false,
            silent: true,
        }
    }
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self::interactive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// The interactive, text-command-driven side of the host.
pub trait CommandSurface {
    /// Replace the current (pickfirst) selection. An empty slice clears it.
    fn set_selection(&self, ids: &[InstanceId]) -> Result<(), HostError>;

    /// Read back the current selection.
    fn select_current(&self) -> Result<Vec<InstanceId>, HostError>;

    /// Submit a complete command string as one unit.
    fn submit(&self, command: &str, options: SubmitOptions) -> Result<(), HostError>;

    /// Start receiving lifecycle events. Pair with [`CommandSurface::unsubscribe`],
    /// or use [`Subscription`].
    fn subscribe(&self) -> Result<(SubscriptionId, Receiver<CommandEvent>), HostError>;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Best-effort poll of the operator's break key.
    fn user_break_requested(&self) -> bool;

    /// Write a line to the operator.
    fn message(&self, text: &str);
}

/// RAII lifecycle subscription: unsubscribed when dropped.
pub struct Subscription<'a> {
    surface: &'a dyn CommandSurface,
    id: SubscriptionId,
    events: Receiver<CommandEvent>,
}

impl<'a> Subscription<'a> {
    pub fn open(surface: &'a dyn CommandSurface) -> Result<Self, HostError> {
        let (id, events) = surface.subscribe()?;
        Ok(Self {
            surface,
            id,
            events,
        })
    }

    pub fn events(&self) -> &Receiver<CommandEvent> {
        &self.events
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.surface.unsubscribe(self.id);
    }
}
