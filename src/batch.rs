//! Sequential clip application over many instances.
//!
//! The host allows a single interactive command in flight per document, so
//! instances are processed strictly one after the other. A failure, warning
//! or panic on one instance is tallied and the loop moves on.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use crate::apply::ClipApplier;
use crate::clock::Clock;
use crate::document::{DocumentGraph, InstanceId, Scope};
use crate::errors::{ClipError, HostError, panic_message};
use crate::host::CommandSurface;
use crate::outcome::{Aggregate, Outcome};

/// Per-batch counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub succeeded: usize,
    pub failed: usize,
    /// Definition name of every failed instance, in processing order.
    pub failed_names: Vec<String>,
}

impl BatchTally {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    fn headline(&self) -> String {
        format!(
            "{} of {} instance(s) clipped, {} failed",
            self.succeeded,
            self.total(),
            self.failed
        )
    }
}

pub struct BatchCoordinator {
    applier: ClipApplier,
}

impl BatchCoordinator {
    pub fn new(applier: ClipApplier) -> Self {
        Self { applier }
    }

    pub fn applier(&self) -> &ClipApplier {
        &self.applier
    }

    /// Apply to every instance in order.
    ///
    /// The returned status is `Success` whenever the batch ran; partial
    /// failure shows in [`BatchTally::failed`], and the message names each
    /// failed definition with its cause. An empty list is rejected.
    pub fn apply_all(
        &self,
        doc: &dyn DocumentGraph,
        surface: &dyn CommandSurface,
        instances: &[InstanceId],
    ) -> Outcome<BatchTally> {
        if instances.is_empty() {
            let err = ClipError::InvalidArgument("no instances to clip".to_string());
            crate::log::error!(error = %err, "batch: rejected");
            return Outcome::from_error(&err, None, Duration::ZERO);
        }
        self.run(doc, surface, instances)
    }

    fn run(
        &self,
        doc: &dyn DocumentGraph,
        surface: &dyn CommandSurface,
        instances: &[InstanceId],
    ) -> Outcome<BatchTally> {
        let clock = self.applier.clock();
        let start = clock.now();
        let verbosity = self.applier.config().verbosity;

        let mut tally = BatchTally::default();
        let mut failures = Aggregate::new();
        for (index, &id) in instances.iter().enumerate() {
            let applied = catch_unwind(AssertUnwindSafe(|| {
                self.applier.apply(doc, surface, id).result
            }));
            let mut result = match applied {
                Ok(result) => result,
                Err(payload) => {
                    let err = ClipError::Fatal(panic_message(payload.as_ref()));
                    Outcome::from_error(&err, None, Duration::ZERO)
                }
            };

            if verbosity.shows_progress() {
                crate::log::info!(
                    instance = %id,
                    position = index + 1,
                    of = instances.len(),
                    status = %result.status,
                    message = %result.message,
                    "batch: instance done"
                );
            }
            if result.is_success() {
                tally.succeeded += 1;
            } else {
                let name = definition_name(doc, id);
                result.message = format!("{name}: {}", result.message);
                tally.failed += 1;
                tally.failed_names.push(name);
            }
            failures.push(&result);
        }

        let mut message = tally.headline();
        if !failures.failures().is_empty() {
            message.push_str(": ");
            message.push_str(&failures.failure_summary());
        }
        if verbosity.shows_progress() {
            crate::log::info!(
                succeeded = tally.succeeded,
                failed = tally.failed,
                "batch: done"
            );
        }
        Outcome::success(tally, message, clock.now().saturating_sub(start))
    }

    /// Apply to the instances whose definition name satisfies `predicate`.
    ///
    /// A predicate that matches nothing is a Success with zero counts.
    pub fn apply_by_name(
        &self,
        doc: &dyn DocumentGraph,
        surface: &dyn CommandSurface,
        instances: &[InstanceId],
        predicate: impl Fn(&str) -> bool,
    ) -> Outcome<BatchTally> {
        let selected = filter(doc, instances, |doc, id| {
            doc.definition_of(id).map(|d| predicate(&d.name))
        });
        self.run(doc, surface, &selected)
    }

    /// Apply to the instances whose owning layer satisfies `predicate`.
    pub fn apply_by_layer(
        &self,
        doc: &dyn DocumentGraph,
        surface: &dyn CommandSurface,
        instances: &[InstanceId],
        predicate: impl Fn(&str) -> bool,
    ) -> Outcome<BatchTally> {
        let selected = filter(doc, instances, |doc, id| {
            doc.instance(id).map(|i| predicate(&i.layer))
        });
        self.run(doc, surface, &selected)
    }
}

/// Keep the instances `keep` accepts. Unreadable instances are dropped.
fn filter(
    doc: &dyn DocumentGraph,
    instances: &[InstanceId],
    keep: impl Fn(&dyn DocumentGraph, InstanceId) -> Result<bool, HostError>,
) -> Vec<InstanceId> {
    let Ok(_scope) = Scope::read(doc) else {
        return Vec::new();
    };
    instances
        .iter()
        .copied()
        .filter(|&id| {
            catch_unwind(AssertUnwindSafe(|| keep(doc, id)))
                .ok()
                .and_then(Result::ok)
                .unwrap_or(false)
        })
        .collect()
}

/// Definition name for the failure list, or the id when it cannot be read.
fn definition_name(doc: &dyn DocumentGraph, id: InstanceId) -> String {
    catch_unwind(AssertUnwindSafe(|| {
        let _scope = Scope::read(doc).ok()?;
        doc.definition_of(id).ok().map(|d| d.name)
    }))
    .ok()
    .flatten()
    .unwrap_or_else(|| id.to_string())
}
