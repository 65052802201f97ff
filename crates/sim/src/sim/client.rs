use crate::command::{Command, CommandTypeId, PredictedCommandList};
use crate::entity::{EntityFlags, EntityId, EntityTypeId, RemoveMode};
use crate::error::SimError;
use crate::session::{NO_WIRE_ID, Transport, User, UserRegistry};
use crate::stats::SyncStats;
use crate::wire::{PACKET_EXEC_COMMANDS, PACKET_SYNC_SIMULATION, PacketReader, PacketWriter};

use super::{Frame, Side, Simulator, SimulatorConfig};

/// The predicted/interpolated side: applies server packets to confirmed
/// state, rebuilds the visible state every render tick, and streams local
/// commands to the server at a fixed rate.
pub struct ClientSimulator {
    sim: Simulator,
    transport: Box<dyn Transport>,
    users: UserRegistry,
    predicted: PredictedCommandList,
    /// Entities with a client-side view (predicted or interpolated),
    /// tracked so the per-frame pass is O(view entities).
    view_entities: Vec<EntityId>,
    last_send_time: f64,
    last_compact_time: f64,
    desynced: bool,
}

impl ClientSimulator {
    pub fn new(config: SimulatorConfig, transport: Box<dyn Transport>, local_user: User) -> Self {
        let mut users = UserRegistry::new();
        users.set_local(local_user.wire_id);
        users.add(local_user);
        // The first flush goes out immediately; only subsequent ones are
        // rate limited.
        let last_send_time = -config.send_interval;
        Self {
            sim: Simulator::new(Side::Client, config),
            transport,
            users,
            predicted: PredictedCommandList::new(),
            view_entities: Vec::new(),
            last_send_time,
            last_compact_time: 0.0,
            desynced: false,
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

    /// The server has stopped acknowledging; the session is dead.
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Predicted commands sent but not yet acknowledged by the server.
    pub fn unconfirmed_commands(&self) -> usize {
        self.predicted.unconfirmed_len()
    }

    pub fn create_command(
        &mut self,
        type_id: CommandTypeId,
        target: EntityId,
    ) -> Option<Box<dyn Command>> {
        self.sim.create_command(type_id, target)
    }

    /// Queues a command for the server. Predicted commands also enter the
    /// local replay set.
    pub fn add_command(&mut self, command: Box<dyn Command>) {
        self.predicted.add_command(command);
    }

    /// One render tick.
    pub fn update(&mut self, frame: &Frame) {
        self.pump_transport();
        self.interpolate_entities();
        self.execute_prediction();
        self.route_effect_commands();
        self.sim.run_scheduler(frame);
        self.route_effect_commands();

        let dirty = self.sim.post_tick_update_entities(frame);
        self.flush_outgoing();
        self.sim.post_update(dirty);
        self.maybe_compact();
    }

    fn pump_transport(&mut self) {
        while let Some((_, payload)) = self.transport.recv() {
            if let Err(error) = self.handle_packet(&payload) {
                log::warn!("dropping server packet: {error}");
            }
        }
    }

    /// Rebuilds every view entity for the render time: immediate copy,
    /// interpolation between snapshots, predicted reset.
    fn interpolate_entities(&mut self) {
        let render_time = self.sim.clock.server_time() - self.sim.config().interpolation_delay;
        let view = std::mem::take(&mut self.view_entities);
        for &id in &view {
            if let Some(entity) = self.sim.entity_mut(id) {
                entity.interpolate_view(render_time);
            }
        }
        self.view_entities = view;
    }

    /// Replays unacknowledged commands over the freshly reset predicted
    /// variables: unconfirmed (older) first, then predicted commands still
    /// awaiting send, in sequence order.
    fn execute_prediction(&mut self) {
        let (mut unconfirmed, mut outgoing) = self.predicted.take_replay_sets();
        for command in unconfirmed.iter_mut() {
            self.sim.execute_command(command);
        }
        let indices = self.predicted.outgoing_predicted_indices().to_vec();
        for index in indices {
            self.sim.execute_command(&mut outgoing[index]);
        }
        self.predicted.restore_replay_sets(unconfirmed, outgoing);
    }

    /// Commands spawned by behaviors become ordinary local commands.
    fn route_effect_commands(&mut self) {
        let commands = std::mem::take(&mut self.sim.effect_commands);
        for command in commands {
            self.predicted.add_command(command);
        }
    }

    /// At most every send interval, flushes queued commands into one
    /// ExecCommands packet.
    fn flush_outgoing(&mut self) {
        let now = self.sim.clock.client_time();
        if now - self.last_send_time < self.sim.config().send_interval {
            return;
        }
        if !self.predicted.has_outgoing() {
            return;
        }
        self.last_send_time = now;

        let mut writer = PacketWriter::new();
        writer.write_u8(PACKET_EXEC_COMMANDS);
        self.sim.stats.commands_sent += self.predicted.outgoing_len() as u64;
        self.predicted.write(&mut writer, &mut self.sim.commands);

        self.sim.stats.packets_sent += 1;
        self.sim.stats.bytes_sent += writer.len() as u64;
        self.transport.send(NO_WIRE_ID, writer.into_bytes());

        if self.predicted.is_desynced() && !self.desynced {
            log::error!(
                "{} unacknowledged predicted commands; giving up on the server",
                self.predicted.unconfirmed_len()
            );
            self.desynced = true;
        }
    }

    fn maybe_compact(&mut self) {
        let now = self.sim.clock.client_time();
        if now - self.last_compact_time >= self.sim.config().compact_interval {
            self.predicted.compact();
            self.last_compact_time = now;
        }
    }

    /// Applies one SyncSimulation packet: sequence confirmation, then
    /// creates, updates, deletes and commands, then the post-network pass.
    /// An error rejects the packet; the session layer decides what that
    /// means for the connection.
    pub fn handle_packet(&mut self, payload: &[u8]) -> Result<(), SimError> {
        self.sim.stats.packets_received += 1;
        self.sim.stats.bytes_received += payload.len() as u64;

        let mut reader = PacketReader::new(payload);
        let packet_type = reader.read_u8()?;
        if packet_type != PACKET_SYNC_SIMULATION {
            return Err(SimError::UnknownPacketType(packet_type));
        }

        let time_base = reader.read_varint()? as f64 / 1000.0;
        self.sim.clock.update_server_time(time_base, 0.0);

        let confirmed_sequence = reader.read_varint()? as u32;
        self.predicted
            .confirm_sequence(confirmed_sequence, &mut self.sim.commands);

        let create_count = reader.read_varint()?;
        let update_count = reader.read_varint()?;
        let delete_count = reader.read_varint()?;
        let command_count = reader.read_varint()?;

        // Dirty state from here on reflects exactly what this packet did.
        self.sim.clear_dirty();

        let mut touched: Vec<EntityId> = Vec::new();
        let mut created: Vec<(EntityId, EntityTypeId)> = Vec::new();
        let mut deleted: Vec<EntityId> = Vec::new();
        let mut pending_parents: Vec<(EntityId, EntityId)> = Vec::new();

        for _ in 0..create_count {
            let id = reader.read_entity_id()?;
            let type_id = reader.read_varint()? as EntityTypeId;
            let flags = EntityFlags::from_bits_truncate(reader.read_varint()? as u32);
            let owner = match reader.read_varint()? as u32 {
                NO_WIRE_ID => None,
                wire_id => Some(wire_id),
            };
            let parent = reader.read_varint()? as EntityId;

            let mut entity = self.sim.build_entity(id, type_id, flags, owner)?;
            // Never predict another user's entity, whatever the server's
            // flags claim.
            if flags.contains(EntityFlags::PREDICTED) && owner != Some(self.users.local_wire_id())
            {
                entity.clear_flags(EntityFlags::PREDICTED);
            }
            entity.authoritative_state_mut().read_all(&mut reader)?;
            entity.authoritative_state_mut().reset_dirty();
            if entity.flags().contains(EntityFlags::INTERPOLATED) {
                entity.snapshot_state(time_base);
            }
            entity.init_client_state();
            let in_view = entity
                .flags()
                .intersects(EntityFlags::PREDICTED | EntityFlags::INTERPOLATED);

            if self.sim.entity(id).is_some() {
                log::warn!("create record for entity {id} that already exists; replacing");
                self.view_entities.retain(|&v| v != id);
            }
            self.sim.insert_entity(entity, false);
            if in_view {
                self.view_entities.push(id);
            }
            if parent != 0 {
                pending_parents.push((id, parent));
            }
            created.push((id, type_id));
            touched.push(id);
            self.sim.stats.entity_creates_received += 1;
        }

        // Create records are not topologically sorted; resolve parents only
        // once every create in the packet has been applied.
        for (child, parent) in pending_parents {
            if self.sim.entity(parent).is_none() {
                return Err(SimError::UnknownParent(parent));
            }
            self.sim.set_parent(child, Some(parent), true);
        }

        for _ in 0..update_count {
            let id = reader.read_entity_id()?;
            let Some(entity) = self.sim.entity_mut(id) else {
                // Without the entity's table the rest of the packet cannot
                // be framed.
                return Err(SimError::UnknownUpdateEntity(id));
            };
            entity.authoritative_state_mut().read_delta(&mut reader)?;
            if entity.flags().contains(EntityFlags::INTERPOLATED) {
                entity.snapshot_state(time_base);
            }
            self.sim.invalidate_entity(id);
            if !touched.contains(&id) {
                touched.push(id);
            }
            self.sim.stats.entity_updates_received += 1;
        }

        for _ in 0..delete_count {
            let id = reader.read_entity_id()?;
            // The server deletes descendants itself; never recurse from a
            // delete record.
            self.sim.remove_entity(id, RemoveMode::Shallow);
            self.view_entities.retain(|&v| v != id);
            touched.retain(|&t| t != id);
            deleted.push(id);
            self.sim.stats.entity_deletes_received += 1;
        }

        for _ in 0..command_count {
            let type_id = reader.read_varint()? as u16;
            let mut command = self
                .sim
                .commands
                .allocate(type_id)
                .ok_or(SimError::UnknownCommandType(type_id))?;
            command.read(&mut reader, time_base)?;
            self.sim.execute_command(&mut command);
            self.sim.commands.release(command);
            self.sim.stats.commands_received += 1;
        }

        for &id in &touched {
            if let Some(entity) = self.sim.entity_mut(id) {
                entity.post_network_update();
            }
        }
        for (id, type_id) in created {
            if !deleted.contains(&id) {
                self.sim.notify_created(id, type_id);
            }
        }
        for id in deleted {
            self.sim.notify_deleted(id);
        }

        self.route_effect_commands();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::entity::{BasicEntityFactory, NullBehavior};
    use crate::session::LoopbackHub;
    use crate::state::{TableBuilder, VariableFlags};

    use super::*;

    fn client() -> ClientSimulator {
        let hub = LoopbackHub::new();
        let mut client = ClientSimulator::new(
            SimulatorConfig::default(),
            Box::new(hub.client_end(1)),
            User::new(1, "local"),
        );
        let mut builder = TableBuilder::new();
        builder.float(1, VariableFlags::empty(), 0);
        let table = builder.build().unwrap();
        client.sim_mut().register_entity_type(
            1,
            Box::new(BasicEntityFactory::new(EntityFlags::empty(), table, || {
                Box::new(NullBehavior)
            })),
        );
        client
    }

    #[test]
    fn client_ids_are_odd() {
        let mut client = client();
        let first = client.sim_mut().create_entity(1, None).unwrap();
        let second = client.sim_mut().create_entity(1, None).unwrap();
        assert_eq!(first & 1, 1);
        assert_eq!(second & 1, 1);
        assert_ne!(first, second);
    }

    #[test]
    fn garbage_packet_is_rejected() {
        let mut client = client();
        assert!(matches!(
            client.handle_packet(&[0x7f]),
            Err(SimError::UnknownPacketType(0x7f))
        ));
    }
}
