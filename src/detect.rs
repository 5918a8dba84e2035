//! Clip detection heuristics.
//!
//! The host keeps clip state in an undocumented side table, so presence is
//! inferred from several signals, tried in a fixed order; the first match
//! wins. Reading a signal can fail (erased object, unexpected record shape)
//! or even panic inside the host binding; either only means that heuristic
//! does not match.
//!
//! | order | signal                                              | method                 |
//! |-------|-----------------------------------------------------|------------------------|
//! | 1     | extension record `FILTER` sub-record has `SPATIAL`  | `FilterSpatialEntry`   |
//! | 2     | an extension record key contains `CLIP`/`SPATIAL`   | `DictionaryKeywordMatch` |
//! | 3     | extended data text contains `ACAD_FILTER`           | `ExtendedDataMarker`   |
//! | 4     | extents present and an extension record present     | `BoundsHeuristic`      |
//!
//! `BoundsHeuristic` is the weakest: extension records exist for plenty of
//! unrelated reasons. Callers that need certainty should use
//! [`ClipDetector::without_bounds_heuristic`] or check
//! [`DetectionMethod::confidence`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use enum_dispatch::enum_dispatch;

use crate::document::{DocumentGraph, InstanceId, Scope};
use crate::errors::{HostError, panic_message};
use crate::log::Verbosity;

pub const FILTER_KEY: &str = "FILTER";
pub const SPATIAL_KEY: &str = "SPATIAL";
pub const CLIP_KEYWORDS: [&str; 2] = ["CLIP", "SPATIAL"];
pub const XDATA_MARKER: &str = "ACAD_FILTER";

/// Which heuristic produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DetectionMethod {
    FilterSpatialEntry,
    DictionaryKeywordMatch,
    ExtendedDataMarker,
    BoundsHeuristic,
    None,
}

impl DetectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::FilterSpatialEntry => "FilterSpatialEntry",
            DetectionMethod::DictionaryKeywordMatch => "DictionaryKeywordMatch",
            DetectionMethod::ExtendedDataMarker => "ExtendedDataMarker",
            DetectionMethod::BoundsHeuristic => "BoundsHeuristic",
            DetectionMethod::None => "None",
        }
    }

    /// 3 = authoritative, 0 = nothing detected.
    pub fn confidence(self) -> u8 {
        match self {
            DetectionMethod::FilterSpatialEntry => 3,
            DetectionMethod::DictionaryKeywordMatch | DetectionMethod::ExtendedDataMarker => 2,
            DetectionMethod::BoundsHeuristic => 1,
            DetectionMethod::None => 0,
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipDetection {
    pub is_clipped: bool,
    pub method: DetectionMethod,
}

impl ClipDetection {
    pub const NOT_CLIPPED: ClipDetection = ClipDetection {
        is_clipped: false,
        method: DetectionMethod::None,
    };

    pub fn clipped(method: DetectionMethod) -> Self {
        Self {
            is_clipped: true,
            method,
        }
    }
}

/// One detection signal.
#[enum_dispatch]
pub trait ClipHeuristic {
    fn method(&self) -> DetectionMethod;

    /// `Ok(true)` when the signal is present on `id`.
    fn check(&self, doc: &dyn DocumentGraph, id: InstanceId) -> Result<bool, HostError>;
}

/// `FILTER` sub-record holding a `SPATIAL` entry, where the host keeps
/// rectangular and polygonal boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterSpatial;

impl ClipHeuristic for FilterSpatial {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::FilterSpatialEntry
    }

    fn check(&self, doc: &dyn DocumentGraph, id: InstanceId) -> Result<bool, HostError> {
        let Some(record) = doc.extension_record(id)? else {
            return Ok(false);
        };
        let Some(filter) = record.get(FILTER_KEY) else {
            return Ok(false);
        };
        Ok(filter.as_record()?.contains_key(SPATIAL_KEY))
    }
}

/// Any top-level extension key mentioning a clip, for host versions that
/// moved the entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordScan;

impl ClipHeuristic for KeywordScan {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::DictionaryKeywordMatch
    }

    fn check(&self, doc: &dyn DocumentGraph, id: InstanceId) -> Result<bool, HostError> {
        let Some(record) = doc.extension_record(id)? else {
            return Ok(false);
        };
        Ok(record
            .keys()
            .any(|key| CLIP_KEYWORDS.iter().any(|kw| key.contains(kw))))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XDataMarker;

impl ClipHeuristic for XDataMarker {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::ExtendedDataMarker
    }

    fn check(&self, doc: &dyn DocumentGraph, id: InstanceId) -> Result<bool, HostError> {
        let Some(entries) = doc.extended_data(id)? else {
            return Ok(false);
        };
        Ok(entries
            .iter()
            .any(|entry| entry.texts().any(|t| t.contains(XDATA_MARKER))))
    }
}

/// Extents plus any extension record. Lowest confidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundsFallback;

impl ClipHeuristic for BoundsFallback {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::BoundsHeuristic
    }

    fn check(&self, doc: &dyn DocumentGraph, id: InstanceId) -> Result<bool, HostError> {
        if doc.geometric_extents(id)?.is_none() {
            return Ok(false);
        }
        Ok(doc.extension_record(id)?.is_some())
    }
}

#[enum_dispatch(ClipHeuristic)]
#[derive(Debug, Clone, Copy)]
pub enum Heuristic {
    FilterSpatial,
    KeywordScan,
    XDataMarker,
    BoundsFallback,
}

/// Decides whether an instance already carries a clipping region.
#[derive(Debug, Clone)]
pub struct ClipDetector {
    heuristics: Vec<Heuristic>,
    verbosity: Verbosity,
}

impl Default for ClipDetector {
    fn default() -> Self {
        Self::new(Verbosity::default())
    }
}

impl ClipDetector {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            heuristics: vec![
                FilterSpatial.into(),
                KeywordScan.into(),
                XDataMarker.into(),
                BoundsFallback.into(),
            ],
            verbosity,
        }
    }

    /// Drop the extents-plus-record heuristic.
    pub fn without_bounds_heuristic(mut self) -> Self {
        self.heuristics
            .retain(|h| h.method() != DetectionMethod::BoundsHeuristic);
        self
    }

    pub fn heuristics(&self) -> &[Heuristic] {
        &self.heuristics
    }

    /// Run the heuristics in order under a read scope. Never fails.
    pub fn detect(&self, doc: &dyn DocumentGraph, id: InstanceId) -> ClipDetection {
        let _scope = match Scope::read(doc) {
            Ok(scope) => scope,
            Err(err) => {
                if self.verbosity.shows_debug() {
                    crate::log::debug!(instance = %id, error = %err, "detect: cannot open read scope");
                }
                return ClipDetection::NOT_CLIPPED;
            }
        };

        for heuristic in &self.heuristics {
            let checked = catch_unwind(AssertUnwindSafe(|| heuristic.check(doc, id)))
                .unwrap_or_else(|payload| Err(HostError::Panicked(panic_message(payload.as_ref()))));
            match checked {
                Ok(true) => {
                    if self.verbosity.shows_debug() {
                        crate::log::debug!(instance = %id, method = %heuristic.method(), "detect: clipped");
                    }
                    return ClipDetection::clipped(heuristic.method());
                }
                Ok(false) => {}
                Err(err) => {
                    if self.verbosity.shows_debug() {
                        crate::log::debug!(
                            instance = %id,
                            method = %heuristic.method(),
                            error = %err,
                            "detect: heuristic unreadable, treated as no match"
                        );
                    }
                }
            }
        }
        ClipDetection::NOT_CLIPPED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ExtensionRecord, RecordValue, XDataEntry, XDataValue};
    use crate::sim::SimDocument;
    use crate::types::Extents;

    fn spatial_filter() -> ExtensionRecord {
        ExtensionRecord::new().with(
            FILTER_KEY,
            RecordValue::Record(
                ExtensionRecord::new().with(SPATIAL_KEY, RecordValue::Data("boundary".into())),
            ),
        )
    }

    fn doc_with_one() -> (SimDocument, InstanceId) {
        let doc = SimDocument::new();
        doc.add_definition("PUMP", vec![]);
        let id = doc.add_top_level("PUMP", "0");
        (doc, id)
    }

    #[test]
    fn filter_spatial_wins() {
        let (doc, id) = doc_with_one();
        // Both rule 1 and rule 4 would match; rule 1 has precedence.
        doc.set_extents(id, Some(Extents::from_coords(0.0, 0.0, 1.0, 1.0)));
        doc.set_extension_record(id, Some(spatial_filter()));
        let d = ClipDetector::default().detect(&doc, id);
        assert_eq!(d, ClipDetection::clipped(DetectionMethod::FilterSpatialEntry));
    }

    #[test]
    fn keyword_scan_is_case_sensitive() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(
            id,
            Some(ExtensionRecord::new().with("MY_CLIP_DATA", RecordValue::Data(String::new()))),
        );
        let d = ClipDetector::default().detect(&doc, id);
        assert_eq!(d.method, DetectionMethod::DictionaryKeywordMatch);

        doc.set_extension_record(
            id,
            Some(ExtensionRecord::new().with("my_clip_data", RecordValue::Data(String::new()))),
        );
        assert_eq!(ClipDetector::default().detect(&doc, id), ClipDetection::NOT_CLIPPED);
    }

    #[test]
    fn spatial_key_without_filter_is_keyword_match() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(
            id,
            Some(ExtensionRecord::new().with("SPATIAL_INDEX", RecordValue::Data(String::new()))),
        );
        let d = ClipDetector::default().detect(&doc, id);
        assert_eq!(d, ClipDetection::clipped(DetectionMethod::DictionaryKeywordMatch));
    }

    #[test]
    fn panicking_host_read_is_not_clipped() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(id, Some(spatial_filter()));
        doc.panic_on_read(id);
        assert_eq!(ClipDetector::default().detect(&doc, id), ClipDetection::NOT_CLIPPED);
        assert_eq!(doc.open_scopes(), 0);
    }

    #[test]
    fn filter_without_spatial_is_not_rule_one() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(
            id,
            Some(ExtensionRecord::new().with(
                FILTER_KEY,
                RecordValue::Record(
                    ExtensionRecord::new().with("INDEX", RecordValue::Data(String::new())),
                ),
            )),
        );
        assert_eq!(ClipDetector::default().detect(&doc, id), ClipDetection::NOT_CLIPPED);
    }

    #[test]
    fn filter_as_leaf_is_type_mismatch_not_error() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(
            id,
            Some(ExtensionRecord::new().with(FILTER_KEY, RecordValue::Data("?".into()))),
        );
        // Rule 1 fails to read; no other rule matches.
        assert_eq!(ClipDetector::default().detect(&doc, id), ClipDetection::NOT_CLIPPED);
    }

    #[test]
    fn xdata_marker() {
        let (doc, id) = doc_with_one();
        doc.set_extended_data(
            id,
            Some(vec![XDataEntry {
                app_name: "ACAD".into(),
                values: vec![XDataValue::Text("has ACAD_FILTER here".into())],
            }]),
        );
        let d = ClipDetector::default().detect(&doc, id);
        assert_eq!(d, ClipDetection::clipped(DetectionMethod::ExtendedDataMarker));
    }

    #[test]
    fn bounds_heuristic_needs_a_record() {
        let (doc, id) = doc_with_one();
        doc.set_extents(id, Some(Extents::from_coords(0.0, 0.0, 1.0, 1.0)));
        assert_eq!(ClipDetector::default().detect(&doc, id), ClipDetection::NOT_CLIPPED);

        doc.set_extension_record(id, Some(ExtensionRecord::new()));
        let d = ClipDetector::default().detect(&doc, id);
        assert_eq!(d, ClipDetection::clipped(DetectionMethod::BoundsHeuristic));
        assert_eq!(d.method.confidence(), 1);

        let strict = ClipDetector::default().without_bounds_heuristic();
        assert_eq!(strict.heuristics().len(), 3);
        assert_eq!(strict.detect(&doc, id), ClipDetection::NOT_CLIPPED);
    }

    #[test]
    fn erased_instance_is_not_clipped() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(id, Some(spatial_filter()));
        doc.erase(id);
        assert_eq!(ClipDetector::default().detect(&doc, id), ClipDetection::NOT_CLIPPED);
    }

    #[test]
    fn detect_is_stable_and_closes_its_scope() {
        let (doc, id) = doc_with_one();
        doc.set_extension_record(id, Some(spatial_filter()));
        let detector = ClipDetector::default();
        let first = detector.detect(&doc, id);
        let second = detector.detect(&doc, id);
        assert_eq!(first, second);
        assert_eq!(doc.open_scopes(), 0);
    }
}
