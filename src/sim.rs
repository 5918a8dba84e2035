//! In-memory document and scripted command surface.
//!
//! [`SimDocument`] implements [`DocumentGraph`] over plain maps and
//! [`SimHost`] implements [`CommandSurface`] on top of it: submitted clip
//! commands are parsed with the command grammar and, depending on the
//! scripted [`Behavior`], realized as a `FILTER`/`SPATIAL` extension entry,
//! delayed, never completed, or cancelled by the host. Time comes from a
//! shared [`ManualClock`], so scheduled events and delayed effects line up
//! with what the applier observes.
//!
//! Both types are cheap handles (`Rc`) over shared state; clone them to
//! inspect the document after the host has mutated it.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use glam::DVec2;

use crate::clock::{Clock, ManualClock};
use crate::command::{self, CANCEL_SEQUENCE, CommandTokens};
use crate::detect::{FILTER_KEY, SPATIAL_KEY};
use crate::document::{
    AccessMode, DocumentGraph, Entity, ExtensionRecord, InstanceId, Layer, Placement, RecordValue,
    ScopeToken, SymbolDefinition, SymbolInstance, XDataEntry,
};
use crate::errors::HostError;
use crate::host::{CommandEvent, CommandSurface, SubmitOptions, SubscriptionId};
use crate::types::{ClipBoundary, Extents};

// ============================================================================
// Document
// ============================================================================

#[derive(Debug, Clone)]
struct InstanceState {
    instance: SymbolInstance,
    extension: Option<ExtensionRecord>,
    xdata: Option<Vec<XDataEntry>>,
    extents: Option<Extents>,
    erased: bool,
    panics: bool,
}

#[derive(Debug, Default)]
struct DocState {
    next_id: u64,
    instances: BTreeMap<InstanceId, InstanceState>,
    definitions: BTreeMap<String, Vec<Entity>>,
    top_level: Vec<InstanceId>,
    layers: BTreeMap<String, bool>,
    next_scope: u64,
    open_scopes: Vec<ScopeToken>,
    scope_history: Vec<AccessMode>,
    /// Clips written by the host but not yet observable, with the time they become so.
    pending_clips: Vec<(InstanceId, Duration, ClipBoundary)>,
    clip_boundaries: BTreeMap<InstanceId, ClipBoundary>,
}

impl DocState {
    fn live(&self, id: InstanceId) -> Result<&InstanceState, HostError> {
        let state = self.instances.get(&id).ok_or(HostError::NotFound(id))?;
        if state.erased {
            return Err(HostError::Erased(id));
        }
        if state.panics {
            panic!("simulated host fault reading {id}");
        }
        Ok(state)
    }

    fn write_clip(&mut self, id: InstanceId, boundary: ClipBoundary) {
        if let Some(state) = self.instances.get_mut(&id) {
            let record = state.extension.get_or_insert_with(ExtensionRecord::new);
            let spatial = ExtensionRecord::new().with(
                SPATIAL_KEY,
                RecordValue::Data(boundary.to_string()),
            );
            record.insert(FILTER_KEY, RecordValue::Record(spatial));
            self.clip_boundaries.insert(id, boundary);
        }
    }

    fn materialize(&mut self, now: Duration) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_clips)
            .into_iter()
            .partition(|(_, at, _)| *at <= now);
        self.pending_clips = waiting;
        for (id, _, boundary) in due {
            self.write_clip(id, boundary);
        }
    }

    fn touch_layer(&mut self, layer: &str) {
        self.layers.entry(layer.to_string()).or_insert(true);
    }
}

/// In-memory drawing.
#[derive(Debug, Clone)]
pub struct SimDocument {
    state: Rc<RefCell<DocState>>,
    clock: ManualClock,
}

impl Default for SimDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDocument {
    pub fn new() -> Self {
        Self::with_clock(ManualClock::new())
    }

    /// A document whose delayed effects follow `clock`.
    pub fn with_clock(clock: ManualClock) -> Self {
        let mut state = DocState::default();
        state.layers.insert("0".to_string(), true);
        Self {
            state: Rc::new(RefCell::new(state)),
            clock,
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn add_definition(&self, name: &str, entities: Vec<Entity>) {
        let mut st = self.state.borrow_mut();
        for e in &entities {
            st.touch_layer(&e.layer);
        }
        st.definitions.insert(name.to_string(), entities);
    }

    /// Append plain geometry on `layer` to an existing definition.
    pub fn add_geometry(&self, definition: &str, layer: &str) {
        let mut st = self.state.borrow_mut();
        st.touch_layer(layer);
        st.definitions
            .entry(definition.to_string())
            .or_default()
            .push(Entity::geometry(layer));
    }

    pub fn add_layer(&self, name: &str, visible: bool) {
        self.state
            .borrow_mut()
            .layers
            .insert(name.to_string(), visible);
    }

    fn new_instance(&self, definition: &str, layer: &str) -> InstanceId {
        let mut st = self.state.borrow_mut();
        st.next_id += 1;
        let id = InstanceId(st.next_id);
        st.touch_layer(layer);
        st.instances.insert(
            id,
            InstanceState {
                instance: SymbolInstance {
                    id,
                    definition: definition.to_string(),
                    layer: layer.to_string(),
                    placement: Placement::default(),
                },
                extension: None,
                xdata: None,
                extents: None,
                erased: false,
                panics: false,
            },
        );
        id
    }

    /// Place `definition` in model space.
    pub fn add_top_level(&self, definition: &str, layer: &str) -> InstanceId {
        let id = self.new_instance(definition, layer);
        self.state.borrow_mut().top_level.push(id);
        id
    }

    /// Place `definition` inside `parent_definition`.
    pub fn add_nested(&self, parent_definition: &str, definition: &str, layer: &str) -> InstanceId {
        let id = self.new_instance(definition, layer);
        self.state
            .borrow_mut()
            .definitions
            .entry(parent_definition.to_string())
            .or_default()
            .push(Entity::instance(layer, id));
        id
    }

    fn with_instance(&self, id: InstanceId, f: impl FnOnce(&mut InstanceState)) {
        if let Some(state) = self.state.borrow_mut().instances.get_mut(&id) {
            f(state);
        }
    }

    pub fn set_insertion(&self, id: InstanceId, insertion: DVec2) {
        self.with_instance(id, |s| s.instance.placement.insertion = insertion);
    }

    pub fn set_extents(&self, id: InstanceId, extents: Option<Extents>) {
        self.with_instance(id, |s| s.extents = extents);
    }

    pub fn set_extension_record(&self, id: InstanceId, record: Option<ExtensionRecord>) {
        self.with_instance(id, |s| s.extension = record);
    }

    pub fn set_extended_data(&self, id: InstanceId, xdata: Option<Vec<XDataEntry>>) {
        self.with_instance(id, |s| s.xdata = xdata);
    }

    /// Mark the instance clipped the way the host does.
    pub fn mark_clipped(&self, id: InstanceId) {
        let boundary = ClipBoundary::around(DVec2::ZERO, 1.0);
        self.state.borrow_mut().write_clip(id, boundary);
    }

    pub fn erase(&self, id: InstanceId) {
        self.with_instance(id, |s| s.erased = true);
    }

    /// Make every read of `id` panic, like a host API throwing mid-call.
    pub fn panic_on_read(&self, id: InstanceId) {
        self.with_instance(id, |s| s.panics = true);
    }

    pub fn open_scopes(&self) -> usize {
        self.state.borrow().open_scopes.len()
    }

    /// Modes of every scope opened so far, in order.
    pub fn scope_history(&self) -> Vec<AccessMode> {
        self.state.borrow().scope_history.clone()
    }

    pub fn layer_visible(&self, name: &str) -> Option<bool> {
        self.state.borrow().layers.get(name).copied()
    }

    /// Boundary the host realized for `id`, if any.
    pub fn clip_boundary(&self, id: InstanceId) -> Option<ClipBoundary> {
        self.state.borrow().clip_boundaries.get(&id).copied()
    }

    fn schedule_clip(&self, id: InstanceId, visible_at: Duration, boundary: ClipBoundary) {
        self.state
            .borrow_mut()
            .pending_clips
            .push((id, visible_at, boundary));
    }

    fn write_clip(&self, id: InstanceId, boundary: ClipBoundary) {
        self.state.borrow_mut().write_clip(id, boundary);
    }
}

impl DocumentGraph for SimDocument {
    fn begin(&self, mode: AccessMode) -> Result<ScopeToken, HostError> {
        let mut st = self.state.borrow_mut();
        if st.open_scopes.iter().any(|t| t.mode == AccessMode::Write) {
            return Err(HostError::Scope(
                "a write scope is already open".to_string(),
            ));
        }
        if mode == AccessMode::Write && !st.open_scopes.is_empty() {
            return Err(HostError::Scope(
                "cannot upgrade to write while other scopes are open".to_string(),
            ));
        }
        st.next_scope += 1;
        let token = ScopeToken {
            id: st.next_scope,
            mode,
        };
        st.open_scopes.push(token);
        st.scope_history.push(mode);
        Ok(token)
    }

    fn end(&self, token: ScopeToken) {
        self.state
            .borrow_mut()
            .open_scopes
            .retain(|t| t.id != token.id);
    }

    fn top_level_instances(&self) -> Result<Vec<InstanceId>, HostError> {
        let st = self.state.borrow();
        Ok(st
            .top_level
            .iter()
            .copied()
            .filter(|id| st.instances.get(id).is_some_and(|s| !s.erased))
            .collect())
    }

    fn instance(&self, id: InstanceId) -> Result<SymbolInstance, HostError> {
        let st = self.state.borrow();
        Ok(st.live(id)?.instance.clone())
    }

    fn definition_of(&self, id: InstanceId) -> Result<SymbolDefinition, HostError> {
        let st = self.state.borrow();
        let name = st.live(id)?.instance.definition.clone();
        let entities = st
            .definitions
            .get(&name)
            .cloned()
            .ok_or(HostError::NotFound(id))?;
        Ok(SymbolDefinition { name, entities })
    }

    fn extension_record(&self, id: InstanceId) -> Result<Option<ExtensionRecord>, HostError> {
        let now = self.clock.now();
        let mut st = self.state.borrow_mut();
        st.materialize(now);
        Ok(st.live(id)?.extension.clone())
    }

    fn extended_data(&self, id: InstanceId) -> Result<Option<Vec<XDataEntry>>, HostError> {
        let st = self.state.borrow();
        Ok(st.live(id)?.xdata.clone())
    }

    fn geometric_extents(&self, id: InstanceId) -> Result<Option<Extents>, HostError> {
        let st = self.state.borrow();
        Ok(st.live(id)?.extents)
    }

    fn layers(&self) -> Result<Vec<Layer>, HostError> {
        Ok(self
            .state
            .borrow()
            .layers
            .iter()
            .map(|(name, visible)| Layer {
                name: name.clone(),
                visible: *visible,
            })
            .collect())
    }

    fn set_layer_visible(&self, name: &str, visible: bool) -> Result<(), HostError> {
        let mut st = self.state.borrow_mut();
        if !st.open_scopes.iter().any(|t| t.mode == AccessMode::Write) {
            return Err(HostError::Scope("layer change outside a write scope".to_string()));
        }
        match st.layers.get_mut(name) {
            Some(v) => {
                *v = visible;
                Ok(())
            }
            None => Err(HostError::UnknownLayer(name.to_string())),
        }
    }
}

// ============================================================================
// Command surface
// ============================================================================

/// When the host reports the clip command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `Ended` is sent during the submission itself.
    Immediate,
    /// `Ended` is sent once the clock has advanced this far past submission.
    After(Duration),
    /// Only `WillStart` is ever sent.
    Never,
    /// The host aborts the command and sends `Cancelled`.
    HostCancel,
}

/// Whether and when the clip becomes observable once the command ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Visible,
    /// Written, but only observable this long after the command ended.
    Delayed(Duration),
    /// The command ends without leaving any trace.
    Invisible,
}

/// Scripted reaction of the host to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Behavior {
    pub completion: Completion,
    pub effect: Effect,
    /// Whether `set_selection` actually selects this instance.
    pub selectable: bool,
    /// Report a break on this poll of `user_break_requested` (1-based).
    pub break_on_poll: Option<u32>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            completion: Completion::Immediate,
            effect: Effect::Visible,
            selectable: true,
            break_on_poll: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveCommand {
    instance: InstanceId,
    boundary: ClipBoundary,
    behavior: Behavior,
}

#[derive(Debug, Default)]
struct HostState {
    default_behavior: Behavior,
    behaviors: HashMap<InstanceId, Behavior>,
    selection: Vec<InstanceId>,
    next_subscription: u64,
    subscribers: BTreeMap<u64, Sender<CommandEvent>>,
    submissions: Vec<(String, SubmitOptions)>,
    messages: Vec<String>,
    cancels: usize,
    polls: u32,
    active: Option<ActiveCommand>,
    scheduled: Vec<(Duration, CommandEvent)>,
}

/// Scripted command surface over a [`SimDocument`].
#[derive(Debug, Clone)]
pub struct SimHost {
    doc: SimDocument,
    tokens: CommandTokens,
    state: Rc<RefCell<HostState>>,
}

impl SimHost {
    pub fn new(doc: SimDocument) -> Self {
        Self::with_tokens(doc, CommandTokens::default())
    }

    pub fn with_tokens(doc: SimDocument, tokens: CommandTokens) -> Self {
        Self {
            doc,
            tokens,
            state: Rc::new(RefCell::new(HostState::default())),
        }
    }

    pub fn document(&self) -> &SimDocument {
        &self.doc
    }

    pub fn set_default_behavior(&self, behavior: Behavior) {
        self.state.borrow_mut().default_behavior = behavior;
    }

    pub fn set_behavior(&self, id: InstanceId, behavior: Behavior) {
        self.state.borrow_mut().behaviors.insert(id, behavior);
    }

    /// Clip commands submitted so far (cancel sequences excluded).
    pub fn commands(&self) -> Vec<String> {
        self.state
            .borrow()
            .submissions
            .iter()
            .filter(|(s, _)| s != CANCEL_SEQUENCE)
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub fn submissions(&self) -> Vec<(String, SubmitOptions)> {
        self.state.borrow().submissions.clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.state.borrow().cancels
    }

    pub fn messages(&self) -> Vec<String> {
        self.state.borrow().messages.clone()
    }

    pub fn selection(&self) -> Vec<InstanceId> {
        self.state.borrow().selection.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.borrow().subscribers.len()
    }

    pub fn has_active_command(&self) -> bool {
        self.state.borrow().active.is_some()
    }

    fn behavior_for(&self, id: InstanceId) -> Behavior {
        let st = self.state.borrow();
        st.behaviors.get(&id).copied().unwrap_or(st.default_behavior)
    }

    fn broadcast(&self, event: CommandEvent) {
        let st = self.state.borrow();
        for tx in st.subscribers.values() {
            let _ = tx.send(event.clone());
        }
    }

    /// Finish the active command: realize its effect and report `Ended`.
    fn finish(&self, active: ActiveCommand) {
        let now = self.doc.clock().now();
        match active.behavior.effect {
            Effect::Visible => self.doc.write_clip(active.instance, active.boundary),
            Effect::Delayed(d) => self.doc.schedule_clip(active.instance, now + d, active.boundary),
            Effect::Invisible => {}
        }
        self.state.borrow_mut().active = None;
        self.broadcast(CommandEvent::Ended(self.tokens.command_name()));
    }

    /// Deliver scheduled events that are due.
    fn pump(&self) {
        let now = self.doc.clock().now();
        let due = {
            let mut st = self.state.borrow_mut();
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut st.scheduled)
                .into_iter()
                .partition(|(at, _)| *at <= now);
            st.scheduled = waiting;
            due
        };
        for (_, event) in due {
            if matches!(event, CommandEvent::Ended(_)) {
                let active = self.state.borrow().active;
                if let Some(active) = active {
                    self.finish(active);
                }
            } else {
                self.broadcast(event);
            }
        }
    }

    fn cancel_active(&self) {
        let had_active = {
            let mut st = self.state.borrow_mut();
            st.cancels += 1;
            st.scheduled.clear();
            st.active.take().is_some()
        };
        if had_active {
            self.broadcast(CommandEvent::Cancelled(self.tokens.command_name()));
        }
    }
}

impl CommandSurface for SimHost {
    fn set_selection(&self, ids: &[InstanceId]) -> Result<(), HostError> {
        let selected: Vec<InstanceId> = ids
            .iter()
            .copied()
            .filter(|id| self.behavior_for(*id).selectable)
            .collect();
        self.state.borrow_mut().selection = selected;
        Ok(())
    }

    fn select_current(&self) -> Result<Vec<InstanceId>, HostError> {
        Ok(self.state.borrow().selection.clone())
    }

    fn submit(&self, source: &str, options: SubmitOptions) -> Result<(), HostError> {
        self.state
            .borrow_mut()
            .submissions
            .push((source.to_string(), options));

        if source == CANCEL_SEQUENCE {
            self.cancel_active();
            return Ok(());
        }

        if self.has_active_command() {
            return Err(HostError::Surface("another command is active".to_string()));
        }

        let parsed = command::parse(source)
            .map_err(|e| HostError::Surface(format!("unknown command: {e}")))?;
        if !parsed.uses(&self.tokens) {
            return Err(HostError::Surface(format!(
                "unexpected keywords in {:?}",
                source.trim_end()
            )));
        }

        let selection = self.select_current()?;
        let [instance] = selection.as_slice() else {
            return Err(HostError::Surface(format!(
                "clip needs exactly one selected object, got {}",
                selection.len()
            )));
        };
        let instance = *instance;
        let behavior = self.behavior_for(instance);
        let active = ActiveCommand {
            instance,
            boundary: ClipBoundary {
                min: parsed.corner1.min(parsed.corner2),
                max: parsed.corner1.max(parsed.corner2),
                fallback: false,
            },
            behavior,
        };
        {
            let mut st = self.state.borrow_mut();
            st.active = Some(active);
            st.polls = 0;
        }
        self.broadcast(CommandEvent::WillStart(self.tokens.command_name()));

        match behavior.completion {
            Completion::Immediate => self.finish(active),
            Completion::After(d) => {
                let at = self.doc.clock().now() + d;
                self.state
                    .borrow_mut()
                    .scheduled
                    .push((at, CommandEvent::Ended(self.tokens.command_name())));
            }
            Completion::Never => {}
            Completion::HostCancel => {
                self.state.borrow_mut().active = None;
                self.broadcast(CommandEvent::Cancelled(self.tokens.command_name()));
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<(SubscriptionId, Receiver<CommandEvent>), HostError> {
        let (tx, rx) = mpsc::channel();
        let mut st = self.state.borrow_mut();
        st.next_subscription += 1;
        let id = st.next_subscription;
        st.subscribers.insert(id, tx);
        Ok((SubscriptionId(id), rx))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state.borrow_mut().subscribers.remove(&id.0);
    }

    fn user_break_requested(&self) -> bool {
        self.pump();
        let mut st = self.state.borrow_mut();
        st.polls += 1;
        let polls = st.polls;
        st.active
            .and_then(|a| a.behavior.break_on_poll)
            .is_some_and(|n| polls >= n)
    }

    fn message(&self, text: &str) {
        self.state.borrow_mut().messages.push(text.to_string());
    }
}
