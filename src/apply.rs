//! Applying a clip boundary through the host command surface.
//!
//! The host offers no direct call for creating a clip; the only way is to
//! select the instance and run the clip command, then wait for the host to
//! say the command ended. Completion arrives as an asynchronous lifecycle
//! event, the operator may break in at any time, and the resulting clip
//! state is not always observable right away. [`ClipApplier::apply`] walks
//! one instance through:
//!
//! ```text
//! Idle -> PreCheck -> ComputeBoundary -> SelectionPrepared -> CommandIssued
//!      -> AwaitingCompletion -> Verifying -> Verified | Unverified
//!                            \-> Cancelled | TimedOut
//! PreCheck -> Skipped            (already clipped)
//! any      -> Failed             (unexpected error)
//! ```
//!
//! The selection is cleared on every exit path once it has been touched,
//! and the lifecycle subscription is released on every exit path.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::command::CANCEL_SEQUENCE;
use crate::config::ClipConfig;
use crate::detect::{ClipDetector, DetectionMethod};
use crate::document::{DocumentGraph, InstanceId, Scope};
use crate::errors::{ClipError, panic_message};
use crate::host::{CommandEvent, CommandSurface, SubmitOptions, Subscription};
use crate::outcome::Outcome;
use crate::types::{ClipBoundary, Extents};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyState {
    Idle,
    PreCheck,
    ComputeBoundary,
    SelectionPrepared,
    CommandIssued,
    AwaitingCompletion,
    Verifying,
    Verified,
    Unverified,
    Cancelled,
    TimedOut,
    Failed,
    /// Already clipped; nothing was sent to the host.
    Skipped,
}

impl ApplyState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplyState::Verified
                | ApplyState::Unverified
                | ApplyState::Cancelled
                | ApplyState::TimedOut
                | ApplyState::Failed
                | ApplyState::Skipped
        )
    }
}

/// Clip state found by the pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorState {
    AlreadyClipped(DetectionMethod),
    NotClipped,
}

/// Payload of a successful application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Applied {
    /// The command ran and the clip was observed.
    Clipped {
        boundary: ClipBoundary,
        method: DetectionMethod,
        /// Verification attempt (1-based) that observed the clip.
        attempt: u32,
    },
    /// The instance was already clipped.
    Skipped { method: DetectionMethod },
}

/// Everything known about one application attempt.
#[derive(Debug, Clone)]
pub struct Application {
    pub instance: InstanceId,
    pub boundary: Option<ClipBoundary>,
    pub prior_state: PriorState,
    pub final_state: ApplyState,
    /// States entered, in order, starting at `Idle`.
    pub transitions: Vec<ApplyState>,
    pub result: Outcome<Applied>,
}

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Issue the command even when the pre-check finds an existing clip.
    pub overwrite: bool,
}

/// How the wait for the command ended.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Wait {
    Ended,
    UserBreak,
    HostCancelled,
    TimedOut(Duration),
}

/// Mutable bookkeeping for one run.
struct Run {
    state: ApplyState,
    transitions: Vec<ApplyState>,
    boundary: Option<ClipBoundary>,
    prior: PriorState,
    selection_dirty: bool,
}

impl Run {
    fn new() -> Self {
        Self {
            state: ApplyState::Idle,
            transitions: vec![ApplyState::Idle],
            boundary: None,
            prior: PriorState::NotClipped,
            selection_dirty: false,
        }
    }

    fn enter(&mut self, state: ApplyState) {
        self.state = state;
        self.transitions.push(state);
    }
}

pub struct ClipApplier {
    config: ClipConfig,
    detector: ClipDetector,
    clock: Arc<dyn Clock>,
    options: ApplyOptions,
}

impl ClipApplier {
    pub fn new(config: ClipConfig) -> Self {
        let detector = ClipDetector::new(config.verbosity);
        Self {
            config,
            detector,
            clock: Arc::new(SystemClock::new()),
            options: ApplyOptions::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_detector(mut self, detector: ClipDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &ClipConfig {
        &self.config
    }

    pub fn detector(&self) -> &ClipDetector {
        &self.detector
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Clip `instance`, or confirm it already is. Never panics, never returns `Err`.
    pub fn apply(
        &self,
        doc: &dyn DocumentGraph,
        surface: &dyn CommandSurface,
        instance: InstanceId,
    ) -> Application {
        let start = self.clock.now();

        if let Err(err) = self.config.validate() {
            crate::log::error!(instance = %instance, error = %err, "apply: rejected before start");
            return Application {
                instance,
                boundary: None,
                prior_state: PriorState::NotClipped,
                final_state: ApplyState::Failed,
                transitions: vec![ApplyState::Idle, ApplyState::Failed],
                result: Outcome::from_error(&err, None, Duration::ZERO),
            };
        }

        let mut run = Run::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.run(doc, surface, instance, &mut run)
        }))
        .unwrap_or_else(|payload| Err(ClipError::Fatal(panic_message(payload.as_ref()))));

        if run.selection_dirty {
            if let Err(err) = surface.set_selection(&[]) {
                crate::log::warn!(instance = %instance, error = %err, "apply: could not clear selection");
            }
        }

        let elapsed = self.clock.now().saturating_sub(start);
        let outcome = match result {
            Ok(applied) => Outcome::success(applied, self.success_message(instance, &applied), elapsed),
            Err(err) => {
                if !run.state.is_terminal() {
                    run.enter(ApplyState::Failed);
                }
                match err.status() {
                    crate::outcome::Status::Error => {
                        crate::log::error!(instance = %instance, state = ?run.state, error = %err, "apply: failed");
                    }
                    _ => {
                        if self.config.verbosity.shows_progress() {
                            crate::log::warn!(instance = %instance, state = ?run.state, error = %err, "apply: not completed");
                        }
                    }
                }
                Outcome::from_error(&err, None, elapsed)
            }
        };

        Application {
            instance,
            boundary: run.boundary,
            prior_state: run.prior,
            final_state: run.state,
            transitions: run.transitions,
            result: outcome,
        }
    }

    fn success_message(&self, instance: InstanceId, applied: &Applied) -> String {
        match applied {
            Applied::Skipped { method } => {
                format!("{instance} is already clipped (detected by {method}); no command issued")
            }
            Applied::Clipped {
                boundary,
                method,
                attempt,
            } => {
                let fallback = if boundary.fallback {
                    " (fallback square around insertion point)"
                } else {
                    ""
                };
                format!(
                    "{instance} clipped to {boundary}{fallback}; verified by {method} on attempt {attempt}"
                )
            }
        }
    }

    fn run(
        &self,
        doc: &dyn DocumentGraph,
        surface: &dyn CommandSurface,
        instance: InstanceId,
        run: &mut Run,
    ) -> Result<Applied, ClipError> {
        run.enter(ApplyState::PreCheck);
        let pre = self.detector.detect(doc, instance);
        if pre.is_clipped {
            run.prior = PriorState::AlreadyClipped(pre.method);
            if !self.options.overwrite {
                run.enter(ApplyState::Skipped);
                return Ok(Applied::Skipped { method: pre.method });
            }
        }

        run.enter(ApplyState::ComputeBoundary);
        let boundary = self.compute_boundary(doc, instance)?;
        run.boundary = Some(boundary);

        run.enter(ApplyState::SelectionPrepared);
        run.selection_dirty = true;
        self.prepare_selection(surface, instance)?;

        run.enter(ApplyState::CommandIssued);
        let subscription =
            Subscription::open(surface).map_err(ClipError::host("subscribing to command events"))?;
        let command = self.config.tokens.compose(&boundary);
        if self.config.verbosity.shows_debug() {
            crate::log::debug!(instance = %instance, command = %command.trim_end(), "apply: submitting");
        }
        surface
            .submit(&command, SubmitOptions::interactive())
            .map_err(ClipError::host("submitting clip command"))?;

        run.enter(ApplyState::AwaitingCompletion);
        let wait = self.await_completion(surface, subscription.events())?;
        drop(subscription);
        match wait {
            Wait::Ended => {}
            Wait::UserBreak => {
                run.enter(ApplyState::Cancelled);
                self.send_cancel(surface);
                return Err(ClipError::Cancelled);
            }
            Wait::HostCancelled => {
                run.enter(ApplyState::Cancelled);
                self.send_cancel(surface);
                return Err(ClipError::HostCancelled);
            }
            Wait::TimedOut(waited) => {
                run.enter(ApplyState::TimedOut);
                self.send_cancel(surface);
                return Err(ClipError::Timeout {
                    seconds: waited.as_secs_f64(),
                });
            }
        }

        run.enter(ApplyState::Verifying);
        match surface.set_selection(&[]) {
            Ok(()) => run.selection_dirty = false,
            Err(err) => {
                crate::log::warn!(instance = %instance, error = %err, "apply: could not clear selection before verifying");
            }
        }

        let attempts = self.config.verify_attempts;
        let mut last = DetectionMethod::None;
        for attempt in 1..=attempts {
            let detection = self.detector.detect(doc, instance);
            if detection.is_clipped {
                run.enter(ApplyState::Verified);
                return Ok(Applied::Clipped {
                    boundary,
                    method: detection.method,
                    attempt,
                });
            }
            last = detection.method;
            if self.config.verbosity.shows_debug() {
                crate::log::debug!(instance = %instance, attempt, "apply: clip not yet observable");
            }
            if attempt < attempts {
                self.clock.sleep(self.config.verify_delay(attempt));
            }
        }

        run.enter(ApplyState::Unverified);
        Err(ClipError::Unverified {
            attempts,
            last_method: last.as_str(),
        })
    }

    /// Inset extents, or the fallback square when they collapse.
    pub fn compute_boundary(
        &self,
        doc: &dyn DocumentGraph,
        instance: InstanceId,
    ) -> Result<ClipBoundary, ClipError> {
        let (placed, extents) = {
            let _scope = Scope::read(doc).map_err(ClipError::host("opening read scope"))?;
            let placed = doc
                .instance(instance)
                .map_err(|cause| ClipError::NotFound { instance, cause })?;
            let extents = doc
                .geometric_extents(instance)
                .map_err(ClipError::host("reading extents"))?;
            (placed, extents)
        };

        let extents = extents.ok_or_else(|| ClipError::Boundary {
            reason: format!("no geometric extents for {instance}"),
        })?;
        let extents = Extents::try_new(extents.min, extents.max).map_err(|e| ClipError::Boundary {
            reason: e.to_string(),
        })?;

        Ok(ClipBoundary::from_extents(
            &extents,
            self.config.margin_ratio,
            self.config.degenerate_threshold,
            placed.placement.insertion,
            self.config.fallback_half_size,
        ))
    }

    fn prepare_selection(
        &self,
        surface: &dyn CommandSurface,
        instance: InstanceId,
    ) -> Result<(), ClipError> {
        surface
            .set_selection(&[])
            .map_err(ClipError::host("clearing selection"))?;
        surface
            .set_selection(&[instance])
            .map_err(ClipError::host("selecting instance"))?;
        let current = surface
            .select_current()
            .map_err(ClipError::host("reading selection back"))?;
        if current.as_slice() != [instance] {
            return Err(ClipError::Selection {
                expected: instance,
                actual: current,
            });
        }
        Ok(())
    }

    fn await_completion(
        &self,
        surface: &dyn CommandSurface,
        events: &Receiver<CommandEvent>,
    ) -> Result<Wait, ClipError> {
        let tokens = &self.config.tokens;
        let start = self.clock.now();
        let mut next_progress = self.config.progress_interval;

        loop {
            if surface.user_break_requested() {
                return Ok(Wait::UserBreak);
            }

            match self.clock.recv_event(events, self.config.poll_interval) {
                Ok(CommandEvent::Ended(name)) if tokens.matches_command(&name) => {
                    return Ok(Wait::Ended);
                }
                Ok(CommandEvent::Cancelled(name)) if tokens.matches_command(&name) => {
                    return Ok(Wait::HostCancelled);
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClipError::Fatal(
                        "command event channel closed by host".to_string(),
                    ));
                }
            }

            let waited = self.clock.now().saturating_sub(start);
            if waited >= self.config.command_timeout {
                return Ok(Wait::TimedOut(waited));
            }
            if waited >= next_progress {
                if self.config.verbosity.shows_progress() {
                    surface.message(&format!(
                        "Waiting for {}... {:.1}s elapsed (press Esc to cancel)",
                        tokens.command_name(),
                        waited.as_secs_f64()
                    ));
                }
                next_progress += self.config.progress_interval;
            }
        }
    }

    /// Escape out of whatever the host has active. Best effort.
    fn send_cancel(&self, surface: &dyn CommandSurface) {
        if let Err(err) = surface.submit(CANCEL_SEQUENCE, SubmitOptions::silent()) {
            crate::log::warn!(error = %err, "apply: cancel sequence rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::document::Entity;
    use crate::outcome::Status;
    use crate::sim::{Behavior, Completion, Effect, SimDocument, SimHost};
    use glam::dvec2;

    struct Fixture {
        clock: ManualClock,
        host: SimHost,
        id: InstanceId,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new();
            let doc = SimDocument::with_clock(clock.clone());
            doc.add_definition("TANK", vec![Entity::geometry("EQUIP")]);
            let id = doc.add_top_level("TANK", "0");
            doc.set_extents(id, Some(Extents::from_coords(0.0, 0.0, 10.0, 10.0)));
            let host = SimHost::new(doc);
            Self { clock, host, id }
        }

        fn doc(&self) -> &SimDocument {
            self.host.document()
        }

        fn applier(&self) -> ClipApplier {
            ClipApplier::new(ClipConfig::default()).with_clock(Arc::new(self.clock.clone()))
        }

        fn apply(&self) -> Application {
            self.applier().apply(self.doc(), &self.host, self.id)
        }
    }

    #[test]
    fn clips_and_verifies_first_try() {
        let f = Fixture::new();
        let app = f.apply();
        assert_eq!(app.result.status, Status::Success, "{}", app.result.message);
        assert_eq!(app.final_state, ApplyState::Verified);
        assert_eq!(
            app.transitions,
            vec![
                ApplyState::Idle,
                ApplyState::PreCheck,
                ApplyState::ComputeBoundary,
                ApplyState::SelectionPrepared,
                ApplyState::CommandIssued,
                ApplyState::AwaitingCompletion,
                ApplyState::Verifying,
                ApplyState::Verified,
            ]
        );
        let b = app.boundary.unwrap();
        assert_eq!((b.min, b.max), (dvec2(0.5, 0.5), dvec2(9.5, 9.5)));
        assert_eq!(f.doc().clip_boundary(f.id).map(|b| (b.min, b.max)), Some((b.min, b.max)));
        assert!(matches!(
            app.result.data,
            Some(Applied::Clipped {
                method: DetectionMethod::FilterSpatialEntry,
                attempt: 1,
                ..
            })
        ));
        assert!(f.host.selection().is_empty());
        assert_eq!(f.host.subscriber_count(), 0);
        assert_eq!(f.doc().open_scopes(), 0);
        assert!(f.clock.sleeps().is_empty());
    }

    #[test]
    fn already_clipped_short_circuits() {
        let f = Fixture::new();
        f.doc().mark_clipped(f.id);
        let app = f.apply();
        assert!(app.result.is_success());
        assert_eq!(app.final_state, ApplyState::Skipped);
        assert_eq!(
            app.prior_state,
            PriorState::AlreadyClipped(DetectionMethod::FilterSpatialEntry)
        );
        assert!(app.result.message.contains("FilterSpatialEntry"));
        assert!(f.host.submissions().is_empty());
        assert_eq!(app.boundary, None);
    }

    #[test]
    fn overwrite_issues_command_anyway() {
        let f = Fixture::new();
        f.doc().mark_clipped(f.id);
        let app = f
            .applier()
            .with_options(ApplyOptions { overwrite: true })
            .apply(f.doc(), &f.host, f.id);
        assert!(app.result.is_success());
        assert_eq!(app.final_state, ApplyState::Verified);
        assert_eq!(f.host.commands().len(), 1);
    }

    #[test]
    fn missing_extents_is_error_without_command() {
        let f = Fixture::new();
        f.doc().set_extents(f.id, None);
        let app = f.apply();
        assert_eq!(app.result.status, Status::Error);
        assert!(app.result.message.starts_with("cannot compute boundary"));
        assert_eq!(app.final_state, ApplyState::Failed);
        assert!(f.host.submissions().is_empty());
    }

    #[test]
    fn degenerate_extents_use_insertion_square() {
        let f = Fixture::new();
        f.doc().set_extents(f.id, Some(Extents::from_coords(5.0, 5.0, 5.0, 5.0)));
        f.doc().set_insertion(f.id, dvec2(20.0, 30.0));
        let app = f.apply();
        let b = app.boundary.unwrap();
        assert!(b.fallback);
        assert_eq!((b.min, b.max), (dvec2(15.0, 25.0), dvec2(25.0, 35.0)));
        assert_eq!(
            f.host.commands(),
            vec!["_.XCLIP _P _N _R 15.000000,25.000000 25.000000,35.000000 \n".to_string()]
        );
    }

    #[test]
    fn selection_mismatch_stops_before_command() {
        let f = Fixture::new();
        f.host.set_behavior(
            f.id,
            Behavior {
                selectable: false,
                ..Behavior::default()
            },
        );
        let app = f.apply();
        assert_eq!(app.result.status, Status::Error);
        assert!(app.result.message.starts_with("selection failed"));
        assert_eq!(app.final_state, ApplyState::Failed);
        assert!(f.host.submissions().is_empty());
        assert!(f.host.selection().is_empty());
    }

    #[test]
    fn user_break_cancels_once() {
        let f = Fixture::new();
        f.host.set_default_behavior(Behavior {
            completion: Completion::Never,
            break_on_poll: Some(3),
            ..Behavior::default()
        });
        let app = f.apply();
        assert_eq!(app.result.status, Status::Warning);
        assert_eq!(app.result.message, "cancelled by user");
        assert_eq!(app.final_state, ApplyState::Cancelled);
        assert_eq!(f.host.cancel_count(), 1);
        assert!(!f.host.has_active_command());
        assert_eq!(f.host.subscriber_count(), 0);
        assert!(f.host.selection().is_empty());
    }

    #[test]
    fn host_cancel_is_warning() {
        let f = Fixture::new();
        f.host.set_default_behavior(Behavior {
            completion: Completion::HostCancel,
            ..Behavior::default()
        });
        let app = f.apply();
        assert_eq!(app.result.status, Status::Warning);
        assert_eq!(app.final_state, ApplyState::Cancelled);
        assert_eq!(f.host.cancel_count(), 1);
    }

    #[test]
    fn hung_command_times_out_with_progress() {
        let f = Fixture::new();
        f.host.set_default_behavior(Behavior {
            completion: Completion::Never,
            ..Behavior::default()
        });
        let app = f.apply();
        assert_eq!(app.result.status, Status::Warning);
        assert!(app.result.message.contains("timed out"), "{}", app.result.message);
        assert!(app.result.message.contains("auto-cancelled"));
        assert_eq!(app.final_state, ApplyState::TimedOut);
        assert_eq!(f.host.cancel_count(), 1);
        assert!(!f.host.has_active_command());
        assert!(app.result.elapsed >= Duration::from_secs(10));

        // 2s, 4s, 6s, 8s; the 10s tick times out instead.
        let progress = f.host.messages();
        assert_eq!(progress.len(), 4, "{progress:?}");
        assert!(progress[0].contains("2.0s elapsed"));
        assert!(progress.iter().all(|m| m.contains("Esc to cancel")));
    }

    #[test]
    fn quiet_suppresses_progress() {
        let f = Fixture::new();
        f.host.set_default_behavior(Behavior {
            completion: Completion::Never,
            ..Behavior::default()
        });
        let applier = ClipApplier::new(
            ClipConfig::default().with_verbosity(crate::log::Verbosity::Quiet),
        )
        .with_clock(Arc::new(f.clock.clone()));
        let app = applier.apply(f.doc(), &f.host, f.id);
        assert_eq!(app.final_state, ApplyState::TimedOut);
        assert!(f.host.messages().is_empty());
    }

    #[test]
    fn late_completion_within_timeout() {
        let f = Fixture::new();
        f.host.set_default_behavior(Behavior {
            completion: Completion::After(Duration::from_millis(2500)),
            ..Behavior::default()
        });
        let app = f.apply();
        assert!(app.result.is_success(), "{}", app.result.message);
        assert_eq!(f.host.messages().len(), 1);
        assert_eq!(f.host.cancel_count(), 0);
    }

    #[test]
    fn verification_backoff_until_fifth_attempt() {
        let f = Fixture::new();
        // Observable only after 4.8s: attempts run at 0, 0.5, 1.5, 3.0 and 5.0s.
        f.host.set_default_behavior(Behavior {
            effect: Effect::Delayed(Duration::from_millis(4800)),
            ..Behavior::default()
        });
        let app = f.apply();
        assert!(app.result.is_success(), "{}", app.result.message);
        assert!(matches!(
            app.result.data,
            Some(Applied::Clipped { attempt: 5, .. })
        ));
        assert_eq!(
            f.clock.sleeps(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
                Duration::from_millis(2000),
            ]
        );
        assert!(app.result.elapsed >= Duration::from_millis(5000));
    }

    #[test]
    fn invisible_effect_is_unverified_warning() {
        let f = Fixture::new();
        f.host.set_default_behavior(Behavior {
            effect: Effect::Invisible,
            ..Behavior::default()
        });
        let app = f.apply();
        assert_eq!(app.result.status, Status::Warning);
        assert_eq!(app.final_state, ApplyState::Unverified);
        assert!(app.result.message.contains("5 verification attempts"));
        assert!(app.result.message.contains("last method: None"));
        assert_eq!(f.clock.sleeps().len(), 4);
    }

    #[test]
    fn host_panic_becomes_error() {
        let f = Fixture::new();
        f.doc().panic_on_read(f.id);
        let app = f.apply();
        assert_eq!(app.result.status, Status::Error);
        assert_eq!(app.final_state, ApplyState::Failed);
        assert!(app.result.message.contains("simulated host fault"));
        assert_eq!(f.doc().open_scopes(), 0);
    }

    #[test]
    fn invalid_config_rejected_before_any_call() {
        let f = Fixture::new();
        let applier = ClipApplier::new(ClipConfig::default().with_verify(0, Duration::ZERO));
        let app = applier.apply(f.doc(), &f.host, f.id);
        assert_eq!(app.result.status, Status::Error);
        assert!(app.result.message.starts_with("invalid argument"));
        assert!(f.doc().scope_history().is_empty());
    }

    #[test]
    fn erased_instance_is_error() {
        let f = Fixture::new();
        f.doc().erase(f.id);
        let app = f.apply();
        assert_eq!(app.result.status, Status::Error);
        assert!(app.result.message.contains("could not be resolved"));
    }
}
