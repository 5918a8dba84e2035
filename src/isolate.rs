//! Show only the layers clipped instances draw on.
//!
//! Layers are gathered from each instance and from the entities directly in
//! its definition; nested instances are not followed. Every layer is then
//! switched off and the gathered ones back on, inside one write scope.
//! Previous visibility is not recorded.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::document::{DocumentGraph, Scope};
use crate::errors::ClipError;
use crate::log::Verbosity;
use crate::outcome::Outcome;
use crate::traverse::ClippedInstanceRecord;

pub struct IsolationProjector {
    verbosity: Verbosity,
    clock: Arc<dyn Clock>,
}

impl IsolationProjector {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Layers referenced by `records`, one definition level deep.
    pub fn referenced_layers(
        &self,
        doc: &dyn DocumentGraph,
        records: &[ClippedInstanceRecord],
    ) -> Result<BTreeSet<String>, ClipError> {
        let _scope = Scope::read(doc).map_err(ClipError::host("opening read scope"))?;
        let mut layers = BTreeSet::new();
        for record in records {
            match doc.instance(record.instance) {
                Ok(instance) => {
                    layers.insert(instance.layer);
                }
                Err(err) => {
                    if self.verbosity.shows_progress() {
                        crate::log::warn!(instance = %record.instance, error = %err, "isolate: instance unreadable");
                    }
                    continue;
                }
            }
            match doc.definition_of(record.instance) {
                Ok(definition) => layers.extend(definition.entities.into_iter().map(|e| e.layer)),
                Err(err) => {
                    if self.verbosity.shows_progress() {
                        crate::log::warn!(instance = %record.instance, error = %err, "isolate: definition unreadable");
                    }
                }
            }
        }
        Ok(layers)
    }

    /// Turn off every layer, then turn on the ones `records` use.
    /// Returns how many layers were turned on.
    ///
    /// An empty `records` is a `Warning` with `Some(0)`; no layer is
    /// touched and the document is not opened for writing.
    pub fn isolate(
        &self,
        doc: &dyn DocumentGraph,
        records: &[ClippedInstanceRecord],
    ) -> Outcome<usize> {
        let start = self.clock.now();
        let elapsed = |clock: &dyn Clock| clock.now().saturating_sub(start);

        if records.is_empty() {
            return Outcome::warning(
                Some(0),
                "no clipped instances to isolate; layers left unchanged",
                elapsed(self.clock.as_ref()),
            );
        }

        let result = self
            .referenced_layers(doc, records)
            .and_then(|wanted| self.project(doc, &wanted));
        match result {
            Ok(turned_on) => {
                if self.verbosity.shows_progress() {
                    crate::log::info!(layers = turned_on, "isolate: done");
                }
                Outcome::success(
                    turned_on,
                    format!(
                        "isolated {} clipped instance(s) on {turned_on} layer(s)",
                        records.len()
                    ),
                    elapsed(self.clock.as_ref()),
                )
            }
            Err(err) => {
                crate::log::error!(error = %err, "isolate: failed");
                Outcome::from_error(&err, None, elapsed(self.clock.as_ref()))
            }
        }
    }

    fn project(&self, doc: &dyn DocumentGraph, wanted: &BTreeSet<String>) -> Result<usize, ClipError> {
        let _scope = Scope::write(doc).map_err(ClipError::host("opening write scope"))?;
        let all = doc.layers().map_err(ClipError::host("listing layers"))?;

        for layer in &all {
            doc.set_layer_visible(&layer.name, false)
                .map_err(ClipError::host("hiding layer"))?;
        }

        let mut turned_on = 0;
        for layer in all.iter().filter(|l| wanted.contains(&l.name)) {
            doc.set_layer_visible(&layer.name, true)
                .map_err(ClipError::host("showing layer"))?;
            turned_on += 1;
        }

        if self.verbosity.shows_debug() {
            for missing in wanted.iter().filter(|w| !all.iter().any(|l| &l.name == *w)) {
                crate::log::debug!(layer = %missing, "isolate: referenced layer not in document");
            }
        }
        Ok(turned_on)
    }
}
