//! Depth-bounded walk of nested symbol instances.
//!
//! Definitions can nest instances of other definitions, and nothing stops a
//! drawing from (indirectly) placing a definition inside itself. Rather than
//! tracking visited definitions (the same definition legitimately appears at
//! many independent positions), the walk is cut off at a fixed nest level:
//! nodes at or beyond `max_nest_depth` are counted as skipped and not
//! entered.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::ClipConfig;
use crate::detect::{ClipDetector, DetectionMethod};
use crate::document::{DocumentGraph, InstanceId, Scope};
use crate::errors::{ClipError, HostError, panic_message};
use crate::log::Verbosity;
use crate::outcome::Outcome;

/// A clipped instance found during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClippedInstanceRecord {
    pub instance: InstanceId,
    pub definition_name: String,
    pub nest_level: usize,
    pub method: DetectionMethod,
}

/// Result of one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traversal {
    pub records: Vec<ClippedInstanceRecord>,
    /// Instances reached: every top-level instance plus every nested one recursed into.
    pub processed: usize,
    /// Nodes not examined: too deep, unresolvable, or failed while processing.
    pub skipped: usize,
}

impl Traversal {
    /// Record count per detection method.
    pub fn by_method(&self) -> BTreeMap<DetectionMethod, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.records {
            *counts.entry(r.method).or_insert(0) += 1;
        }
        counts
    }

    /// One line per definition: `NAME: count (levels a,b,..)`.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut by_name: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for r in &self.records {
            by_name.entry(&r.definition_name).or_default().push(r.nest_level);
        }
        by_name
            .into_iter()
            .map(|(name, mut levels)| {
                let count = levels.len();
                levels.sort_unstable();
                levels.dedup();
                let levels = levels
                    .iter()
                    .map(usize::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{name}: {count} (levels {levels})")
            })
            .collect()
    }

    fn message(&self) -> String {
        let mut msg = format!(
            "found {} clipped instance(s); processed {}, skipped {}",
            self.records.len(),
            self.processed,
            self.skipped
        );
        if self.records.is_empty() {
            msg.push_str(
                ". No clipped instances exist yet; clip an instance first, then scan again",
            );
        }
        msg
    }
}

pub struct SceneGraphTraverser {
    detector: ClipDetector,
    max_nest_depth: usize,
    verbosity: Verbosity,
    clock: Arc<dyn Clock>,
}

impl SceneGraphTraverser {
    pub fn new(config: &ClipConfig) -> Self {
        Self {
            detector: ClipDetector::new(config.verbosity),
            max_nest_depth: config.max_nest_depth,
            verbosity: config.verbosity,
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_detector(mut self, detector: ClipDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Walk the document's top-level collection.
    pub fn traverse_document(&self, doc: &dyn DocumentGraph) -> Outcome<Traversal> {
        let start = self.clock.now();
        let top = {
            let scope = Scope::read(doc);
            scope.and_then(|_scope| doc.top_level_instances())
        };
        match top {
            Ok(top) => self.traverse(doc, &top),
            Err(err) => {
                let err = ClipError::host("listing top-level instances")(err);
                crate::log::error!(error = %err, "traverse: cannot list instances");
                Outcome::from_error(&err, None, self.clock.now().saturating_sub(start))
            }
        }
    }

    /// Walk `top_level` and everything nested inside, detecting clips at every node.
    pub fn traverse(&self, doc: &dyn DocumentGraph, top_level: &[InstanceId]) -> Outcome<Traversal> {
        let start = self.clock.now();
        let _scope = match Scope::read(doc) {
            Ok(scope) => scope,
            Err(err) => {
                let err = ClipError::host("opening read scope")(err);
                crate::log::error!(error = %err, "traverse: no read access");
                return Outcome::from_error(&err, None, self.clock.now().saturating_sub(start));
            }
        };

        let mut acc = Traversal::default();
        for &id in top_level {
            acc.processed += 1;
            self.visit(doc, id, 0, &mut acc);
        }

        let message = acc.message();
        if self.verbosity.shows_progress() {
            crate::log::info!(
                clipped = acc.records.len(),
                processed = acc.processed,
                skipped = acc.skipped,
                "traverse: done"
            );
        }
        Outcome::success(acc, message, self.clock.now().saturating_sub(start))
    }

    /// Visit one node, isolating any failure to it.
    fn visit(&self, doc: &dyn DocumentGraph, id: InstanceId, level: usize, acc: &mut Traversal) {
        if level >= self.max_nest_depth {
            if self.verbosity.shows_debug() {
                crate::log::debug!(instance = %id, level, "traverse: depth limit, skipped");
            }
            acc.skipped += 1;
            return;
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.visit_node(doc, id, level, acc)));
        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        acc.skipped += 1;
        if self.verbosity.shows_progress() {
            crate::log::warn!(instance = %id, level, error = %failure, "traverse: node skipped");
        }
    }

    fn visit_node(
        &self,
        doc: &dyn DocumentGraph,
        id: InstanceId,
        level: usize,
        acc: &mut Traversal,
    ) -> Result<(), HostError> {
        let definition = doc.definition_of(id)?;

        let detection = self.detector.detect(doc, id);
        if detection.is_clipped {
            if self.verbosity.shows_debug() {
                crate::log::debug!(
                    instance = %id,
                    definition = %definition.name,
                    level,
                    method = %detection.method,
                    "traverse: clipped instance"
                );
            }
            acc.records.push(ClippedInstanceRecord {
                instance: id,
                definition_name: definition.name.clone(),
                nest_level: level,
                method: detection.method,
            });
        }

        for child in definition.nested_instances() {
            acc.processed += 1;
            self.visit(doc, child, level + 1, acc);
        }
        Ok(())
    }
}
