mod client;
mod server;
mod step;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::command::{
    Command, CommandFactory, CommandRegistry, CommandTypeId, REPARENT_COMMAND, ReparentCommand,
    SET_ROOT_COMMAND, SetRootCommand,
};
use crate::entity::{
    DirtyFlags, Entity, EntityFactory, EntityFlags, EntityId, EntityRegistry, EntityTypeId,
    NO_ENTITY_ID, RemoveMode, TickEffects,
};
use crate::error::SimError;
use crate::scheduler::{Priority, Scheduler};
use crate::session::WireId;
use crate::state::EntityState;
use crate::stats::SyncStats;

pub use client::ClientSimulator;
pub use server::ServerSimulator;
pub use step::Ticker;

/// One simulation step: the game time it runs at and the step length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub time: f64,
    pub time_delta: f64,
}

impl Frame {
    pub fn new(time: f64, time_delta: f64) -> Self {
        Self { time, time_delta }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Wall-clock scheduler budget per frame, if any.
    pub scheduler_budget_ms: Option<u64>,
    /// How far behind server time clients render interpolated entities.
    pub interpolation_delay: f64,
    /// Minimum interval between client command flushes (20 Hz).
    pub send_interval: f64,
    /// Interval between client command-list compactions.
    pub compact_interval: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            scheduler_budget_ms: None,
            interpolation_delay: 0.1,
            send_interval: 1.0 / 20.0,
            compact_interval: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// Observes entity lifetime in one simulator.
pub trait SimulatorWatcher {
    fn entity_created(&mut self, _id: EntityId, _type_id: EntityTypeId) {}
    fn entity_deleted(&mut self, _id: EntityId) {}
}

/// Receives application-defined global commands (built-ins never reach it).
pub trait GlobalCommandHandler {
    fn execute_command(&mut self, command: &dyn Command, effects: &mut TickEffects);
}

pub(crate) enum ScheduledTask {
    EntityUpdate(EntityId),
    Callback(Box<dyn FnMut(f64, f64)>),
}

/// State shared by both simulator sides: the entity map, registries,
/// scheduler, dirty tracking and command routing.
pub struct Simulator {
    side: Side,
    config: SimulatorConfig,
    entities: std::collections::HashMap<EntityId, Entity>,
    /// Entities removed this tick, kept alive until `post_update` so their
    /// delete records can still be written.
    retired: Vec<Entity>,
    root: EntityId,
    next_entity_id: EntityId,
    pub(crate) commands: CommandRegistry,
    types: EntityRegistry,
    watchers: Vec<Box<dyn SimulatorWatcher>>,
    pub(crate) scheduler: Scheduler<ScheduledTask>,
    dirty: Vec<EntityId>,
    pub(crate) clock: Clock,
    pub(crate) stats: SyncStats,
    /// Server-originated commands awaiting replication to every user.
    pub(crate) broadcast: Vec<Box<dyn Command>>,
    /// Follow-on commands produced by behaviors, routed by the owning side.
    pub(crate) effect_commands: Vec<Box<dyn Command>>,
    global_handler: Option<Box<dyn GlobalCommandHandler>>,
}

impl Simulator {
    pub fn new(side: Side, config: SimulatorConfig) -> Self {
        let scheduler = match config.scheduler_budget_ms {
            Some(ms) => Scheduler::with_budget(Duration::from_millis(ms)),
            None => Scheduler::new(),
        };
        Self {
            side,
            config,
            entities: std::collections::HashMap::new(),
            retired: Vec::new(),
            root: NO_ENTITY_ID,
            // Server IDs are even, client IDs odd; both step by two so the
            // origin bit never changes.
            next_entity_id: match side {
                Side::Server => 2,
                Side::Client => 1,
            },
            commands: CommandRegistry::new(),
            types: EntityRegistry::new(),
            watchers: Vec::new(),
            scheduler,
            dirty: Vec::new(),
            clock: Clock::new(),
            stats: SyncStats::default(),
            broadcast: Vec::new(),
            effect_commands: Vec::new(),
            global_handler: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn register_entity_type(&mut self, type_id: EntityTypeId, factory: Box<dyn EntityFactory>) {
        self.types.register(type_id, factory);
    }

    pub fn register_command_factory(&mut self, factory: Box<dyn CommandFactory>) {
        self.commands.register(factory);
    }

    pub fn add_watcher(&mut self, watcher: Box<dyn SimulatorWatcher>) {
        self.watchers.push(watcher);
    }

    pub fn set_global_handler(&mut self, handler: Box<dyn GlobalCommandHandler>) {
        self.global_handler = Some(handler);
    }

    pub fn root(&self) -> EntityId {
        self.root
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn allocate_entity_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 2;
        id
    }

    /// Creates an entity of a registered type and inserts it dirty-CREATED.
    pub fn create_entity(
        &mut self,
        type_id: EntityTypeId,
        owner: Option<WireId>,
    ) -> Result<EntityId, SimError> {
        let (flags, table, behavior) = {
            let factory = self
                .types
                .get(type_id)
                .ok_or(SimError::UnknownEntityType(type_id))?;
            (factory.flags(), factory.table().clone(), factory.create_behavior())
        };
        let id = self.allocate_entity_id();
        let mut entity = Entity::new(id, type_id, flags, owner, EntityState::new(table), behavior);
        if self.side == Side::Client {
            entity.init_client_state();
        }
        Ok(self.insert_entity(entity, true))
    }

    /// Builds an entity for a create record received from the server.
    pub(crate) fn build_entity(
        &mut self,
        id: EntityId,
        type_id: EntityTypeId,
        flags: EntityFlags,
        owner: Option<WireId>,
    ) -> Result<Entity, SimError> {
        let (table, behavior) = {
            let factory = self
                .types
                .get(type_id)
                .ok_or(SimError::UnknownEntityType(type_id))?;
            (factory.table().clone(), factory.create_behavior())
        };
        Ok(Entity::new(
            id,
            type_id,
            flags,
            owner,
            EntityState::new(table),
            behavior,
        ))
    }

    /// Inserts an entity, marks it CREATED, claims the root slot when
    /// flagged, and starts per-frame updates for UPDATED_FREQUENTLY types.
    pub(crate) fn insert_entity(&mut self, mut entity: Entity, notify_watchers: bool) -> EntityId {
        let id = entity.id();
        let type_id = entity.type_id();
        let flags = entity.flags();

        if flags.contains(EntityFlags::ROOT) {
            debug_assert_eq!(self.root, NO_ENTITY_ID, "a simulation has a single root");
            self.root = id;
        }

        entity.mark(DirtyFlags::CREATED);
        self.dirty.push(id);
        self.entities.insert(id, entity);

        if notify_watchers {
            for watcher in &mut self.watchers {
                watcher.entity_created(id, type_id);
            }
        }

        if flags.contains(EntityFlags::UPDATED_FREQUENTLY) {
            let now = self.clock.game_time();
            self.scheduler
                .schedule(Priority::Normal, now, now, ScheduledTask::EntityUpdate(id));
        }
        id
    }

    pub(crate) fn notify_created(&mut self, id: EntityId, type_id: EntityTypeId) {
        for watcher in &mut self.watchers {
            watcher.entity_created(id, type_id);
        }
    }

    pub(crate) fn notify_deleted(&mut self, id: EntityId) {
        for watcher in &mut self.watchers {
            watcher.entity_deleted(id);
        }
    }

    /// Marks an entity dirty, entering it into the dirty list the first
    /// time it is touched in a tick.
    pub fn invalidate_entity(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.dirty_flags().is_empty() {
                self.dirty.push(id);
            }
            entity.mark(DirtyFlags::UPDATED);
        }
    }

    pub fn remove_entity(&mut self, id: EntityId, mode: RemoveMode) {
        match mode {
            RemoveMode::Recursive => {
                let mut stack = vec![id];
                let mut doomed = Vec::new();
                while let Some(current) = stack.pop() {
                    if let Some(entity) = self.entities.get(&current) {
                        stack.extend_from_slice(entity.children());
                        doomed.push(current);
                    }
                }
                self.unlink_from_parent(id);
                for entity_id in doomed {
                    self.retire(entity_id);
                }
            }
            RemoveMode::Detach => {
                let children: Vec<EntityId> = self
                    .entities
                    .get(&id)
                    .map(|e| e.children().to_vec())
                    .unwrap_or_default();
                for child in children {
                    self.set_parent(child, None, false);
                }
                self.unlink_from_parent(id);
                self.retire(id);
            }
            RemoveMode::Shallow => {
                self.unlink_from_parent(id);
                self.retire(id);
            }
        }
    }

    fn unlink_from_parent(&mut self, id: EntityId) {
        let parent = self.entities.get(&id).and_then(|e| e.parent());
        if let Some(parent_id) = parent {
            if let Some(parent) = self.entities.get_mut(&parent_id) {
                parent.unlink_child(id);
                parent.child_removed(id);
            }
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.set_parent_id(None);
        }
    }

    fn retire(&mut self, id: EntityId) {
        if let Some(mut entity) = self.entities.remove(&id) {
            if entity.dirty_flags().is_empty() {
                self.dirty.push(id);
            }
            entity.mark(DirtyFlags::DELETED);
            if self.root == id {
                self.root = NO_ENTITY_ID;
            }
            self.retired.push(entity);
            self.notify_deleted(id);
        }
    }

    pub(crate) fn retired_entity(&self, id: EntityId) -> Option<&Entity> {
        self.retired.iter().find(|e| e.id() == id)
    }

    /// Removes an entity without marking it deleted; no record is written.
    /// Used for TRANSIENT detach sweeps.
    pub(crate) fn detach_entity(&mut self, id: EntityId) {
        self.unlink_from_parent(id);
        if self.entities.remove(&id).is_some() {
            if self.root == id {
                self.root = NO_ENTITY_ID;
            }
            self.notify_deleted(id);
        }
    }

    /// Re-links `child` under `parent`. On the server a Reparent command is
    /// queued for broadcast unless suppressed or the child is not
    /// replicated.
    pub fn set_parent(
        &mut self,
        child_id: EntityId,
        parent: Option<EntityId>,
        suppress_replication: bool,
    ) -> bool {
        let Some(child) = self.entities.get_mut(&child_id) else {
            return false;
        };
        let old = child.parent();
        if old == parent {
            return true;
        }
        let not_replicated = child.flags().contains(EntityFlags::NOT_REPLICATED);
        child.set_parent_id(parent);
        child.parent_changed(old, parent);

        if let Some(old_id) = old {
            if let Some(old_parent) = self.entities.get_mut(&old_id) {
                old_parent.unlink_child(child_id);
                old_parent.child_removed(child_id);
            }
        }
        if let Some(new_id) = parent {
            match self.entities.get_mut(&new_id) {
                Some(new_parent) => {
                    new_parent.link_child(child_id);
                    new_parent.child_added(child_id);
                }
                None => log::warn!("parent {new_id} of entity {child_id} is not in the map"),
            }
        }

        if self.side == Side::Server && !suppress_replication && !not_replicated {
            if let Some(mut command) = self.commands.allocate(REPARENT_COMMAND) {
                if let Some(reparent) = command.as_any_mut().downcast_mut::<ReparentCommand>() {
                    reparent.target = child_id;
                    reparent.parent_id = parent.unwrap_or(NO_ENTITY_ID);
                }
                self.broadcast.push(command);
            }
        }
        true
    }

    /// Allocates a command addressed at an entity (or at the simulation
    /// when `target` is `NO_ENTITY_ID`).
    pub fn create_command(
        &mut self,
        type_id: CommandTypeId,
        target: EntityId,
    ) -> Option<Box<dyn Command>> {
        let mut command = self.commands.allocate(type_id)?;
        command.set_target(target);
        Some(command)
    }

    /// Routes one command: built-ins to the simulator, globals to the
    /// installed handler, the rest to the addressed entity. Predicted
    /// commands come out with `has_predicted` raised.
    pub fn execute_command(&mut self, command: &mut Box<dyn Command>) {
        let type_id = Command::type_id(command.as_ref());
        if type_id == REPARENT_COMMAND {
            if let Some(reparent) = command.as_any().downcast_ref::<ReparentCommand>() {
                let parent = match reparent.parent_id {
                    NO_ENTITY_ID => None,
                    id => Some(id),
                };
                self.set_parent(reparent.target, parent, true);
            }
        } else if type_id == SET_ROOT_COMMAND {
            if let Some(set_root) = command.as_any().downcast_ref::<SetRootCommand>() {
                self.root = set_root.entity_id;
            }
        } else if command.target() == NO_ENTITY_ID {
            let mut effects = TickEffects::new();
            if let Some(mut handler) = self.global_handler.take() {
                handler.execute_command(command.as_ref(), &mut effects);
                self.global_handler = Some(handler);
            } else {
                log::debug!("discarding global command {type_id:#06x}: no handler installed");
            }
            self.effect_commands.extend(effects.commands);
        } else {
            let target = command.target();
            match self.entities.get_mut(&target) {
                Some(entity) => {
                    let mut effects = TickEffects::new();
                    entity.execute_command(command.as_ref(), &mut effects);
                    let dirtied = entity.state().is_dirty();
                    if dirtied {
                        self.invalidate_entity(target);
                    }
                    self.apply_effects(target, effects);
                }
                None => {
                    log::debug!(
                        "discarding command {type_id:#06x}: {}",
                        SimError::UnknownEntity(target)
                    );
                }
            }
        }

        if let Some(meta) = command.predicted_mut() {
            meta.has_predicted = true;
        }
    }

    fn apply_effects(&mut self, id: EntityId, effects: TickEffects) {
        if let Some((priority, target_time)) = effects.next_update {
            let now = self.clock.game_time();
            self.scheduler
                .schedule(priority, now, target_time, ScheduledTask::EntityUpdate(id));
        }
        self.effect_commands.extend(effects.commands);
    }

    /// Schedules a plain callback event.
    pub fn schedule_event(
        &mut self,
        priority: Priority,
        target_time: f64,
        callback: impl FnMut(f64, f64) + 'static,
    ) {
        let now = self.clock.game_time();
        self.scheduler.schedule(
            priority,
            now,
            target_time,
            ScheduledTask::Callback(Box::new(callback)),
        );
    }

    /// Schedules a one-shot entity update; a no-op at dispatch if the
    /// entity is gone by then.
    pub fn schedule_entity_update(&mut self, id: EntityId, priority: Priority, target_time: f64) {
        let now = self.clock.game_time();
        self.scheduler
            .schedule(priority, now, target_time, ScheduledTask::EntityUpdate(id));
    }

    pub(crate) fn run_scheduler(&mut self, frame: &Frame) {
        self.scheduler.begin_frame();
        while let Some((task, time_delta)) = self.scheduler.pop_due(frame.time) {
            match task {
                ScheduledTask::EntityUpdate(id) => self.update_entity(id, frame),
                ScheduledTask::Callback(mut callback) => callback(frame.time, time_delta),
            }
        }
    }

    fn update_entity(&mut self, id: EntityId, frame: &Frame) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        let mut effects = TickEffects::new();
        entity.update(frame, &mut effects);
        let dirtied = entity.state().is_dirty();
        let every_frame = entity.flags().contains(EntityFlags::UPDATED_FREQUENTLY);
        if dirtied {
            self.invalidate_entity(id);
        }
        self.apply_effects(id, effects);

        if every_frame {
            let next = frame.time + frame.time_delta.max(1e-6);
            self.scheduler.schedule(
                Priority::Normal,
                frame.time,
                next,
                ScheduledTask::EntityUpdate(id),
            );
        }
    }

    /// Fires the end-of-tick hook on every entity dirtied this tick and
    /// hands the dirty list to the caller.
    pub(crate) fn post_tick_update_entities(&mut self, frame: &Frame) -> Vec<EntityId> {
        let dirty = std::mem::take(&mut self.dirty);
        for &id in &dirty {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.post_tick_update(frame);
            }
        }
        dirty
    }

    /// Ends the tick: dirty state resets, retired entities are disposed.
    pub(crate) fn post_update(&mut self, mut dirty: Vec<EntityId>) {
        for id in dirty.drain(..) {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.reset_dirty_state();
            }
        }
        self.retired.clear();
        // Reuse the dirty list's allocation for the next tick.
        if self.dirty.is_empty() {
            self.dirty = dirty;
        }
    }

    /// Resets dirty tracking before server records are applied, so dirty
    /// state afterward reflects exactly what the packet changed.
    pub(crate) fn clear_dirty(&mut self) {
        let mut dirty = std::mem::take(&mut self.dirty);
        for id in dirty.drain(..) {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.reset_dirty_state();
            }
        }
        self.dirty = dirty;
    }
}
