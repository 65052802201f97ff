mod registry;

use bitflags::bitflags;

use crate::command::Command;
use crate::scheduler::Priority;
use crate::session::WireId;
use crate::sim::Frame;
use crate::state::EntityState;

pub use registry::{BasicEntityFactory, EntityFactory, EntityRegistry, EntityTypeId};

/// Session-unique entity identifier. The least-significant bit records the
/// creating side: 0 for server-created (replicated) entities, 1 for
/// client-only ones.
pub type EntityId = u32;

pub const NO_ENTITY_ID: EntityId = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntityFlags: u32 {
        /// Exists only on the creating host; never serialized.
        const NOT_REPLICATED = 1 << 0;
        /// Ticks every frame.
        const UPDATED_FREQUENTLY = 1 << 1;
        /// Predicted variables are rolled forward by unconfirmed commands
        /// on the client.
        const PREDICTED = 1 << 2;
        /// Interpolated variables blend between server snapshots on the
        /// client.
        const INTERPOLATED = 1 << 3;
        /// Server records historical states for hit rewinding. Reserved;
        /// interface only.
        const LATENCY_COMPENSATED = 1 << 4;
        /// Replicated once, then detached on the creating host.
        const TRANSIENT = 1 << 5;
        /// Replicated to the owning user only.
        const OWNER_ONLY = 1 << 6;
        /// The single designated root entity of a simulation.
        const ROOT = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u8 {
        const CREATED = 1 << 0;
        const UPDATED = 1 << 1;
        const DELETED = 1 << 2;
    }
}

/// How an entity leaves the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Dispose owned children too.
    Recursive,
    /// Unparent children and leave them live (replicated).
    Detach,
    /// Remove only this entity; used by clients applying server deletes,
    /// where the children's own delete records follow.
    Shallow,
}

/// Side effects a behavior hands back to the simulator: follow-on commands
/// and an optional next scheduled update.
#[derive(Default)]
pub struct TickEffects {
    pub commands: Vec<Box<dyn Command>>,
    pub next_update: Option<(Priority, f64)>,
}

impl TickEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_command(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn request_update(&mut self, priority: Priority, target_time: f64) {
        self.next_update = Some((priority, target_time));
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.next_update.is_none()
    }
}

/// Application logic attached to an entity. Every hook except `update` is
/// optional.
pub trait EntityBehavior {
    fn update(&mut self, state: &mut EntityState, frame: &Frame, effects: &mut TickEffects);

    fn execute_command(
        &mut self,
        _state: &mut EntityState,
        _command: &dyn Command,
        _effects: &mut TickEffects,
    ) {
    }

    /// Fired at the end of a tick iff the entity was dirtied during it.
    fn post_tick_update(&mut self, _state: &mut EntityState, _frame: &Frame) {}

    /// Client only: fired after the entity received data from the server.
    fn post_network_update(&mut self, _state: &mut EntityState) {}

    fn parent_changed(&mut self, _old: Option<EntityId>, _new: Option<EntityId>) {}

    fn child_added(&mut self, _child: EntityId) {}

    fn child_removed(&mut self, _child: EntityId) {}
}

/// Behavior for passive, data-only entities.
pub struct NullBehavior;

impl EntityBehavior for NullBehavior {
    fn update(&mut self, _state: &mut EntityState, _frame: &Frame, _effects: &mut TickEffects) {}
}

pub struct Entity {
    id: EntityId,
    type_id: EntityTypeId,
    flags: EntityFlags,
    owner: Option<WireId>,
    parent: Option<EntityId>,
    children: Vec<EntityId>,
    dirty: DirtyFlags,
    /// Authoritative state on the server; last-confirmed server state on
    /// the client.
    state: EntityState,
    /// Client-side view for predicted/interpolated entities, rebuilt each
    /// render tick.
    client_state: Option<EntityState>,
    /// Server state snapshots for interpolation, time-ascending.
    history: Vec<EntityState>,
    behavior: Box<dyn EntityBehavior>,
}

impl Entity {
    pub fn new(
        id: EntityId,
        type_id: EntityTypeId,
        flags: EntityFlags,
        owner: Option<WireId>,
        state: EntityState,
        behavior: Box<dyn EntityBehavior>,
    ) -> Self {
        Self {
            id,
            type_id,
            flags,
            owner,
            parent: None,
            children: Vec::new(),
            dirty: DirtyFlags::empty(),
            state,
            client_state: None,
            history: Vec::new(),
            behavior,
        }
    }

    /// Splits the visible state off the networked one. Called by client
    /// simulators for predicted/interpolated entities.
    pub(crate) fn init_client_state(&mut self) {
        if self
            .flags
            .intersects(EntityFlags::PREDICTED | EntityFlags::INTERPOLATED)
        {
            self.client_state = Some(self.state.clone());
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn type_id(&self) -> EntityTypeId {
        self.type_id
    }

    pub fn flags(&self) -> EntityFlags {
        self.flags
    }

    pub(crate) fn clear_flags(&mut self, flags: EntityFlags) {
        self.flags.remove(flags);
    }

    pub fn owner(&self) -> Option<WireId> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<WireId>) {
        self.owner = owner;
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub(crate) fn set_parent_id(&mut self, parent: Option<EntityId>) {
        self.parent = parent;
    }

    pub fn children(&self) -> &[EntityId] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child_at(&self, index: usize) -> Option<EntityId> {
        self.children.get(index).copied()
    }

    pub fn has_child(&self, id: EntityId) -> bool {
        self.children.contains(&id)
    }

    pub(crate) fn link_child(&mut self, id: EntityId) {
        if !self.children.contains(&id) {
            self.children.push(id);
        }
    }

    pub(crate) fn unlink_child(&mut self, id: EntityId) {
        self.children.retain(|&c| c != id);
    }

    /// The state visible to gameplay code: the client-side view when the
    /// entity is predicted or interpolated, the networked state otherwise.
    pub fn state(&self) -> &EntityState {
        self.client_state.as_ref().unwrap_or(&self.state)
    }

    pub fn state_mut(&mut self) -> &mut EntityState {
        self.client_state.as_mut().unwrap_or(&mut self.state)
    }

    pub fn authoritative_state(&self) -> &EntityState {
        &self.state
    }

    pub fn authoritative_state_mut(&mut self) -> &mut EntityState {
        &mut self.state
    }

    pub fn dirty_flags(&self) -> DirtyFlags {
        self.dirty
    }

    pub(crate) fn mark(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub(crate) fn reset_dirty_state(&mut self) {
        self.dirty = DirtyFlags::empty();
        self.state.reset_dirty();
        if let Some(client_state) = self.client_state.as_mut() {
            client_state.reset_dirty();
        }
    }

    /// Clones the current networked state into the interpolation history.
    pub(crate) fn snapshot_state(&mut self, time: f64) {
        let mut snapshot = self.state.clone();
        snapshot.set_time(time);
        self.history.push(snapshot);
        if self.history.len() == 1 {
            // A lone snapshot gets the arrival time so the first
            // interpolation segment is well-defined.
            self.history[0].set_time(time);
        }
    }

    /// Number of buffered interpolation snapshots.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Rebuilds the client-side view for one render tick: immediate
    /// variables come straight from the networked state, interpolated
    /// variables blend between history snapshots around `time`, and
    /// predicted variables reset to the confirmed state ready for command
    /// replay.
    pub(crate) fn interpolate_view(&mut self, time: f64) {
        let Entity {
            flags,
            state,
            client_state,
            history,
            ..
        } = self;
        let Some(view) = client_state.as_mut() else {
            return;
        };

        view.copy_immediate(state);

        if flags.contains(EntityFlags::INTERPOLATED) && !history.is_empty() {
            let skip_predicted = flags.contains(EntityFlags::PREDICTED);
            let split = history.partition_point(|s| s.time() <= time);
            if split == history.len() {
                // Everything is in the past: snap to the newest snapshot
                // and drop the rest.
                let newest = history.len() - 1;
                let target = &history[newest];
                view.interpolate(target, target, 1.0, skip_predicted);
                history.drain(..newest);
            } else if split > 0 {
                let from = &history[split - 1];
                let to = &history[split];
                let span = to.time() - from.time();
                let t = if span > 0.0 {
                    ((time - from.time()) / span).clamp(0.0, 1.0) as f32
                } else {
                    1.0
                };
                view.interpolate(from, to, t, skip_predicted);
                history.drain(..split - 1);
            }
            // split == 0: no snapshot at or before `time` yet.
        }

        if flags.contains(EntityFlags::PREDICTED) {
            view.copy_predicted(state);
        }
    }

    pub(crate) fn update(&mut self, frame: &Frame, effects: &mut TickEffects) {
        let state = match self.client_state.as_mut() {
            Some(view) => view,
            None => &mut self.state,
        };
        self.behavior.update(state, frame, effects);
    }

    pub(crate) fn execute_command(&mut self, command: &dyn Command, effects: &mut TickEffects) {
        let state = match self.client_state.as_mut() {
            Some(view) => view,
            None => &mut self.state,
        };
        self.behavior.execute_command(state, command, effects);
    }

    pub(crate) fn post_tick_update(&mut self, frame: &Frame) {
        let state = match self.client_state.as_mut() {
            Some(view) => view,
            None => &mut self.state,
        };
        self.behavior.post_tick_update(state, frame);
    }

    pub(crate) fn post_network_update(&mut self) {
        self.behavior.post_network_update(&mut self.state);
    }

    pub(crate) fn parent_changed(&mut self, old: Option<EntityId>, new: Option<EntityId>) {
        self.behavior.parent_changed(old, new);
    }

    pub(crate) fn child_added(&mut self, child: EntityId) {
        self.behavior.child_added(child);
    }

    pub(crate) fn child_removed(&mut self, child: EntityId) {
        self.behavior.child_removed(child);
    }
}
