//! Document graph boundary: the data model and the trait a host binding implements.
//!
//! The document owns every object; this crate only holds [`InstanceId`]
//! handles and reads or writes attributes through [`DocumentGraph`].

use std::collections::BTreeMap;
use std::fmt;

use glam::DVec2;

use crate::errors::HostError;
use crate::types::Extents;

/// Opaque handle to a symbol instance, stable for the document session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Placement transform of an instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub insertion: DVec2,
    /// Rotation in radians.
    pub rotation: f64,
    pub scale: DVec2,
}

impl Placement {
    pub fn at(insertion: DVec2) -> Self {
        Self {
            insertion,
            ..Self::default()
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            insertion: DVec2::ZERO,
            rotation: 0.0,
            scale: DVec2::ONE,
        }
    }
}

/// A placed occurrence of a symbol definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInstance {
    pub id: InstanceId,
    /// Name of the definition this instance places.
    pub definition: String,
    pub layer: String,
    pub placement: Placement,
}

/// What an entity inside a definition is.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    /// Plain geometry (lines, arcs, text...). Only its layer matters here.
    Geometry,
    /// A nested instance.
    Instance(InstanceId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub layer: String,
    pub kind: EntityKind,
}

impl Entity {
    pub fn geometry(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            kind: EntityKind::Geometry,
        }
    }

    pub fn instance(layer: impl Into<String>, id: InstanceId) -> Self {
        Self {
            layer: layer.into(),
            kind: EntityKind::Instance(id),
        }
    }

    pub fn as_instance(&self) -> Option<InstanceId> {
        match self.kind {
            EntityKind::Instance(id) => Some(id),
            EntityKind::Geometry => None,
        }
    }
}

/// Named template referenced by instances.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDefinition {
    pub name: String,
    pub entities: Vec<Entity>,
}

impl SymbolDefinition {
    /// Nested instances placed directly inside this definition.
    pub fn nested_instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.entities.iter().filter_map(Entity::as_instance)
    }
}

/// Value stored under a key of an [`ExtensionRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Record(ExtensionRecord),
    Data(String),
}

impl RecordValue {
    pub fn as_record(&self) -> Result<&ExtensionRecord, HostError> {
        match self {
            RecordValue::Record(r) => Ok(r),
            RecordValue::Data(_) => Err(HostError::TypeMismatch {
                expected: "record",
                got: "data",
            }),
        }
    }
}

/// Per-object side table of named sub-records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionRecord {
    entries: BTreeMap<String, RecordValue>,
}

impl ExtensionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: RecordValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: RecordValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One typed value of an extended-data entry.
#[derive(Debug, Clone, PartialEq)]
pub enum XDataValue {
    Text(String),
    Real(f64),
    Integer(i64),
}

/// Legacy (application-name, payload) pair attached to an object.
#[derive(Debug, Clone, PartialEq)]
pub struct XDataEntry {
    pub app_name: String,
    pub values: Vec<XDataValue>,
}

impl XDataEntry {
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(|v| match v {
            XDataValue::Text(s) => Some(s.as_str()),
            _ => None,
        })
    }
}

/// A drawing layer and its visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Host-issued token for an open access scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken {
    pub id: u64,
    pub mode: AccessMode,
}

/// The host document, seen through the calls this crate needs.
///
/// Every call may fail (erased object, invalid handle). Implementations use
/// interior mutability; the crate never holds two scopes of which one writes.
pub trait DocumentGraph {
    /// Open an access scope. Pair with [`DocumentGraph::end`], or use [`Scope`].
    fn begin(&self, mode: AccessMode) -> Result<ScopeToken, HostError>;

    /// Close a scope opened by [`DocumentGraph::begin`].
    fn end(&self, token: ScopeToken);

    /// The top-level collection of instances (model space).
    fn top_level_instances(&self) -> Result<Vec<InstanceId>, HostError>;

    fn instance(&self, id: InstanceId) -> Result<SymbolInstance, HostError>;

    /// Resolve the definition an instance places.
    fn definition_of(&self, id: InstanceId) -> Result<SymbolDefinition, HostError>;

    /// `Ok(None)` when the object has no extension record.
    fn extension_record(&self, id: InstanceId) -> Result<Option<ExtensionRecord>, HostError>;

    /// `Ok(None)` when the object carries no extended data.
    fn extended_data(&self, id: InstanceId) -> Result<Option<Vec<XDataEntry>>, HostError>;

    /// `Ok(None)` when the host cannot compute extents for the object.
    fn geometric_extents(&self, id: InstanceId) -> Result<Option<Extents>, HostError>;

    fn layers(&self) -> Result<Vec<Layer>, HostError>;

    /// Requires an open write scope.
    fn set_layer_visible(&self, name: &str, visible: bool) -> Result<(), HostError>;
}

/// RAII access scope: closed when dropped, on every exit path.
pub struct Scope<'a> {
    doc: &'a dyn DocumentGraph,
    token: ScopeToken,
}

impl<'a> Scope<'a> {
    pub fn open(doc: &'a dyn DocumentGraph, mode: AccessMode) -> Result<Self, HostError> {
        let token = doc.begin(mode)?;
        Ok(Self { doc, token })
    }

    pub fn read(doc: &'a dyn DocumentGraph) -> Result<Self, HostError> {
        Self::open(doc, AccessMode::Read)
    }

    pub fn write(doc: &'a dyn DocumentGraph) -> Result<Self, HostError> {
        Self::open(doc, AccessMode::Write)
    }

    pub fn mode(&self) -> AccessMode {
        self.token.mode
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.doc.end(self.token);
    }
}
