use crate::command::Command;
use crate::entity::{DirtyFlags, Entity, EntityFlags, EntityId, NO_ENTITY_ID};
use crate::error::SimError;
use crate::session::{Transport, User, UserRegistry, WireId};
use crate::stats::SyncStats;
use crate::wire::{PACKET_EXEC_COMMANDS, PacketReader, SyncWriter};

use super::{Frame, Side, Simulator, SimulatorConfig};

/// Per-user replication endpoint: the sync writer accumulating this tick's
/// records plus commands received and not yet applied.
struct UserObserver {
    user: User,
    writer: SyncWriter,
    inbound: Vec<Box<dyn Command>>,
}

/// The authoritative side: applies user commands, runs the tick, and
/// broadcasts entity deltas to every attached user.
pub struct ServerSimulator {
    sim: Simulator,
    transport: Box<dyn Transport>,
    users: UserRegistry,
    observers: Vec<UserObserver>,
}

impl ServerSimulator {
    pub fn new(config: SimulatorConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            sim: Simulator::new(Side::Server, config),
            transport,
            users: UserRegistry::new(),
            observers: Vec::new(),
        }
    }

    pub fn sim(&self) -> &Simulator {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut Simulator {
        &mut self.sim
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    pub fn stats(&self) -> &SyncStats {
        self.sim.stats()
    }

    /// Attaches a user and seeds their writer with create records for every
    /// live replicated entity, so late joiners converge without any
    /// application handshake.
    pub fn add_user(&mut self, user: User) {
        let mut observer = UserObserver {
            user: user.clone(),
            writer: SyncWriter::new(),
            inbound: Vec::new(),
        };

        let mut stats = std::mem::take(&mut self.sim.stats);
        for entity in self.sim.entities() {
            // Entities created this tick reach everyone in the post-tick
            // pass; seeding them here would duplicate the record.
            if entity.dirty_flags().contains(DirtyFlags::CREATED) {
                continue;
            }
            if replicates_to(entity, observer.user.wire_id) {
                observer.writer.write_create(entity, &mut stats);
            }
        }
        self.sim.stats = stats;

        self.users.add(user);
        self.observers.push(observer);
    }

    pub fn remove_user(&mut self, wire_id: WireId) -> Option<User> {
        self.observers.retain(|o| o.user.wire_id != wire_id);
        self.users.remove(wire_id)
    }

    /// Executes a server-originated command locally and queues it for
    /// replication to every user.
    pub fn submit_command(&mut self, mut command: Box<dyn Command>) {
        self.sim.execute_command(&mut command);
        self.sim.broadcast.push(command);
    }

    /// One authoritative tick: drain inbound commands, run the scheduler,
    /// flush dirty entities into per-user packets, reset dirty state.
    pub fn update(&mut self, frame: &Frame) {
        self.pump_transport();
        self.execute_inbound();
        self.sim.run_scheduler(frame);
        self.drain_effect_commands();
        self.broadcast_commands();

        let dirty = self.sim.post_tick_update_entities(frame);
        self.write_entity_records(&dirty);
        self.send_packets(frame);
        self.detach_transients(&dirty);
        self.sim.post_update(dirty);
    }

    fn pump_transport(&mut self) {
        while let Some((from, payload)) = self.transport.recv() {
            if let Err(error) = self.handle_packet(from, &payload) {
                log::warn!("dropping packet from user {from}: {error}");
            }
        }
    }

    fn handle_packet(&mut self, from: WireId, payload: &[u8]) -> Result<(), SimError> {
        let Some(observer_index) = self.observers.iter().position(|o| o.user.wire_id == from)
        else {
            log::debug!("packet from unattached wire id {from}");
            return Ok(());
        };

        self.sim.stats.packets_received += 1;
        self.sim.stats.bytes_received += payload.len() as u64;

        let mut reader = PacketReader::new(payload);
        let packet_type = reader.read_u8()?;
        if packet_type != PACKET_EXEC_COMMANDS {
            return Err(SimError::UnknownPacketType(packet_type));
        }

        let highest_sequence = reader.read_varint()? as u32;
        let count = reader.read_varint()?;
        let mut received = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let type_id = reader.read_varint()? as u16;
            let mut command = self
                .sim
                .commands
                .allocate(type_id)
                .ok_or(SimError::UnknownCommandType(type_id))?;
            command.read(&mut reader, 0.0)?;
            received.push(command);
        }

        // Only a fully parsed packet takes effect.
        let observer = &mut self.observers[observer_index];
        observer.writer.observe_sequence(highest_sequence);
        self.sim.stats.commands_received += received.len() as u64;
        observer.inbound.append(&mut received);
        Ok(())
    }

    /// Applies commands in packet order per sender; across senders, receipt
    /// order.
    fn execute_inbound(&mut self) {
        for index in 0..self.observers.len() {
            let inbound = std::mem::take(&mut self.observers[index].inbound);
            for mut command in inbound {
                self.sim.execute_command(&mut command);
                self.sim.commands.release(command);
            }
        }
    }

    /// Behavior follow-on commands execute locally, then replicate like any
    /// other server command.
    fn drain_effect_commands(&mut self) {
        // A command may spawn further commands; drain to quiescence.
        while !self.sim.effect_commands.is_empty() {
            let batch = std::mem::take(&mut self.sim.effect_commands);
            for mut command in batch {
                self.sim.execute_command(&mut command);
                self.sim.broadcast.push(command);
            }
        }
    }

    fn broadcast_commands(&mut self) {
        let commands = std::mem::take(&mut self.sim.broadcast);
        let mut stats = std::mem::take(&mut self.sim.stats);
        for command in commands {
            let flags = self
                .sim
                .commands
                .flags(Command::type_id(command.as_ref()))
                .unwrap_or_default();
            for observer in &mut self.observers {
                if command_visible(&self.sim, command.as_ref(), observer.user.wire_id) {
                    observer
                        .writer
                        .write_command(command.as_ref(), flags, &mut stats);
                }
            }
            self.sim.commands.release(command);
        }
        self.sim.stats = stats;
    }

    fn write_entity_records(&mut self, dirty: &[EntityId]) {
        let mut stats = std::mem::take(&mut self.sim.stats);
        for &id in dirty {
            let entity = match self.sim.entity(id).or_else(|| self.sim.retired_entity(id)) {
                Some(entity) => entity,
                None => continue,
            };
            let dirty_flags = entity.dirty_flags();
            if entity.flags().contains(EntityFlags::NOT_REPLICATED) {
                continue;
            }
            // Created and deleted within one tick: nobody needs to know.
            if dirty_flags.contains(DirtyFlags::CREATED | DirtyFlags::DELETED) {
                continue;
            }
            for observer in &mut self.observers {
                if !replicates_to(entity, observer.user.wire_id) {
                    continue;
                }
                if dirty_flags.contains(DirtyFlags::CREATED) {
                    observer.writer.write_create(entity, &mut stats);
                } else if dirty_flags.contains(DirtyFlags::DELETED) {
                    observer.writer.write_delete(id, &mut stats);
                } else if entity.authoritative_state().is_dirty() {
                    observer.writer.write_update(entity, &mut stats);
                }
            }
        }
        self.sim.stats = stats;
    }

    fn send_packets(&mut self, frame: &Frame) {
        let mut stats = std::mem::take(&mut self.sim.stats);
        for observer in &mut self.observers {
            if observer.writer.has_content() {
                let packet = observer.writer.finish(frame.time, &mut stats);
                self.transport.send(observer.user.wire_id, packet);
            }
        }
        self.sim.stats = stats;
    }

    /// TRANSIENT entities leave the map once their create record has been
    /// flushed; no delete record is ever sent.
    fn detach_transients(&mut self, dirty: &[EntityId]) {
        for &id in dirty {
            let transient = self.sim.entity(id).is_some_and(|e| {
                e.flags().contains(EntityFlags::TRANSIENT)
                    && e.dirty_flags().contains(DirtyFlags::CREATED)
            });
            if transient {
                self.sim.detach_entity(id);
            }
        }
    }
}

fn replicates_to(entity: &Entity, wire_id: WireId) -> bool {
    if entity.flags().contains(EntityFlags::NOT_REPLICATED) {
        return false;
    }
    if entity.flags().contains(EntityFlags::OWNER_ONLY) {
        return entity.owner() == Some(wire_id);
    }
    true
}

/// Commands targeting an owner-only entity route to the owner alone.
fn command_visible(sim: &Simulator, command: &dyn Command, wire_id: WireId) -> bool {
    let target = command.target();
    if target == NO_ENTITY_ID {
        return true;
    }
    match sim.entity(target) {
        Some(entity) => replicates_to(entity, wire_id),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use crate::entity::{BasicEntityFactory, NullBehavior, RemoveMode};
    use crate::session::LoopbackHub;
    use crate::state::{TableBuilder, VariableFlags};

    use super::*;

    fn server_with_type(flags: EntityFlags) -> ServerSimulator {
        let hub = LoopbackHub::new();
        let mut server =
            ServerSimulator::new(SimulatorConfig::default(), Box::new(hub.server_end()));
        let mut builder = TableBuilder::new();
        builder.float(1, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();
        server.sim_mut().register_entity_type(
            1,
            Box::new(BasicEntityFactory::new(flags, table, || {
                Box::new(NullBehavior)
            })),
        );
        server
    }

    #[test]
    fn server_ids_are_even() {
        let mut server = server_with_type(EntityFlags::empty());
        let first = server.sim_mut().create_entity(1, None).unwrap();
        let second = server.sim_mut().create_entity(1, None).unwrap();
        assert_eq!(first & 1, 0);
        assert_eq!(second & 1, 0);
        assert_ne!(first, second);
    }

    #[test]
    fn recursive_removal_disposes_descendants() {
        let mut server = server_with_type(EntityFlags::empty());
        let sim = server.sim_mut();
        let a = sim.create_entity(1, None).unwrap();
        let b = sim.create_entity(1, None).unwrap();
        let c = sim.create_entity(1, None).unwrap();
        sim.set_parent(b, Some(a), true);
        sim.set_parent(c, Some(b), true);

        sim.remove_entity(a, RemoveMode::Recursive);
        assert_eq!(sim.entity_count(), 0);
    }

    #[test]
    fn detach_removal_keeps_children_alive() {
        let mut server = server_with_type(EntityFlags::empty());
        let sim = server.sim_mut();
        let a = sim.create_entity(1, None).unwrap();
        let b = sim.create_entity(1, None).unwrap();
        sim.set_parent(b, Some(a), true);

        sim.remove_entity(a, RemoveMode::Detach);
        assert_eq!(sim.entity_count(), 1);
        assert_eq!(sim.entity(b).unwrap().parent(), None);
    }

    #[test]
    fn transient_entities_detach_after_first_flush() {
        let mut server = server_with_type(EntityFlags::TRANSIENT);
        server.add_user(User::new(1, "session"));
        server.sim_mut().create_entity(1, None).unwrap();

        let frame = Frame::new(0.0, 1.0 / 60.0);
        server.update(&frame);
        assert_eq!(server.sim().entity_count(), 0);
        assert_eq!(server.stats().entity_creates_sent, 1);
        assert_eq!(server.stats().entity_deletes_sent, 0);
    }

    #[test]
    fn owner_only_entities_skip_other_users() {
        let mut server = server_with_type(EntityFlags::OWNER_ONLY);
        server.add_user(User::new(1, "owner"));
        server.add_user(User::new(2, "other"));
        server.sim_mut().create_entity(1, Some(1)).unwrap();

        let frame = Frame::new(0.0, 1.0 / 60.0);
        server.update(&frame);
        // One create record total: only the owner's writer saw it.
        assert_eq!(server.stats().entity_creates_sent, 1);
    }
}
