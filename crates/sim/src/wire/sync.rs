use crate::command::{Command, CommandFlags};
use crate::entity::{Entity, EntityId, NO_ENTITY_ID};
use crate::session::NO_WIRE_ID;
use crate::stats::SyncStats;

use super::codec::PacketWriter;

pub const PACKET_EXEC_COMMANDS: u8 = 1;
pub const PACKET_SYNC_SIMULATION: u8 = 2;

/// Accumulates one user's replication traffic for the current tick and
/// finalizes it into a single SyncSimulation packet: confirmed sequence,
/// then create, update and delete records, then commands.
#[derive(Default)]
pub struct SyncWriter {
    confirmed_sequence: u32,
    last_sent_confirmed: u32,
    time_base: Option<f64>,
    creates: PacketWriter,
    create_count: u32,
    updates: PacketWriter,
    update_count: u32,
    deletes: PacketWriter,
    delete_count: u32,
    commands: PacketWriter,
    command_count: u32,
}

impl SyncWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmed_sequence(&self) -> u32 {
        self.confirmed_sequence
    }

    /// Records the highest predicted-command sequence seen from this user.
    pub fn observe_sequence(&mut self, sequence: u32) {
        self.confirmed_sequence = self.confirmed_sequence.max(sequence);
    }

    /// Anything to send? A fresh acknowledgement alone counts: the client
    /// needs it to release confirmed commands even on quiet ticks.
    pub fn has_content(&self) -> bool {
        self.create_count > 0
            || self.update_count > 0
            || self.delete_count > 0
            || self.command_count > 0
            || self.confirmed_sequence != self.last_sent_confirmed
    }

    pub fn write_create(&mut self, entity: &Entity, stats: &mut SyncStats) {
        let start = self.creates.len();
        self.creates.write_entity_id(entity.id());
        self.creates.write_varint(entity.type_id() as u64);
        self.creates.write_varint(entity.flags().bits() as u64);
        self.creates
            .write_varint(entity.owner().unwrap_or(NO_WIRE_ID) as u64);
        self.creates
            .write_varint(entity.parent().unwrap_or(NO_ENTITY_ID) as u64);
        entity.authoritative_state().write_all(&mut self.creates);
        self.create_count += 1;
        stats.entity_creates_sent += 1;
        stats.entity_create_bytes_sent += (self.creates.len() - start) as u64;
    }

    pub fn write_update(&mut self, entity: &Entity, stats: &mut SyncStats) {
        let start = self.updates.len();
        self.updates.write_entity_id(entity.id());
        entity.authoritative_state().write_delta(&mut self.updates);
        self.update_count += 1;
        stats.entity_updates_sent += 1;
        stats.entity_update_bytes_sent += (self.updates.len() - start) as u64;
    }

    pub fn write_delete(&mut self, id: EntityId, stats: &mut SyncStats) {
        let start = self.deletes.len();
        self.deletes.write_entity_id(id);
        self.delete_count += 1;
        stats.entity_deletes_sent += 1;
        stats.entity_delete_bytes_sent += (self.deletes.len() - start) as u64;
    }

    /// Queues a command. The first TIME-flagged command fixes the packet's
    /// time base; everything after delta-encodes against it.
    pub fn write_command(&mut self, command: &dyn Command, flags: CommandFlags, stats: &mut SyncStats) {
        if self.time_base.is_none() && flags.contains(CommandFlags::TIME) {
            self.time_base = Some(command.time());
        }
        let start = self.commands.len();
        self.commands.write_varint(Command::type_id(command) as u64);
        command.write(&mut self.commands, self.time_base.unwrap_or(0.0));
        self.command_count += 1;
        stats.commands_sent += 1;
        stats.command_bytes_sent += (self.commands.len() - start) as u64;
    }

    /// Assembles the packet and resets the writer for the next tick.
    /// `fallback_time_base` (the server's game time) is used when no TIME
    /// command fixed one.
    pub fn finish(&mut self, fallback_time_base: f64, stats: &mut SyncStats) -> Vec<u8> {
        let mut packet = PacketWriter::new();
        packet.write_u8(PACKET_SYNC_SIMULATION);

        let time_base = self.time_base.unwrap_or(fallback_time_base);
        packet.write_varint((time_base * 1000.0).max(0.0) as u64);
        packet.write_varint(self.confirmed_sequence as u64);
        packet.write_varint(self.create_count as u64);
        packet.write_varint(self.update_count as u64);
        packet.write_varint(self.delete_count as u64);
        packet.write_varint(self.command_count as u64);
        packet.append(&self.creates);
        packet.append(&self.updates);
        packet.append(&self.deletes);
        packet.append(&self.commands);

        self.last_sent_confirmed = self.confirmed_sequence;
        self.time_base = None;
        self.creates.clear();
        self.updates.clear();
        self.deletes.clear();
        self.commands.clear();
        self.create_count = 0;
        self.update_count = 0;
        self.delete_count = 0;
        self.command_count = 0;

        stats.packets_sent += 1;
        stats.bytes_sent += packet.len() as u64;
        packet.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use crate::command::{ReparentCommand, SetRootCommand};
    use crate::wire::PacketReader;

    use super::*;

    #[test]
    fn empty_writer_has_no_content() {
        let writer = SyncWriter::new();
        assert!(!writer.has_content());
    }

    #[test]
    fn fresh_acknowledgement_is_content() {
        let mut writer = SyncWriter::new();
        writer.observe_sequence(4);
        assert!(writer.has_content());

        let mut stats = SyncStats::default();
        writer.finish(0.0, &mut stats);
        assert!(!writer.has_content());

        // A stale sequence does not regress the acknowledgement.
        writer.observe_sequence(2);
        assert_eq!(writer.confirmed_sequence(), 4);
        assert!(!writer.has_content());
    }

    #[test]
    fn finish_writes_header_and_counts() {
        let mut writer = SyncWriter::new();
        let mut stats = SyncStats::default();
        writer.observe_sequence(7);
        writer.write_delete(6, &mut stats);
        writer.write_command(
            &SetRootCommand { entity_id: 2 },
            CommandFlags::GLOBAL,
            &mut stats,
        );
        writer.write_command(
            &ReparentCommand {
                target: 6,
                parent_id: 2,
            },
            CommandFlags::empty(),
            &mut stats,
        );

        let packet = writer.finish(1.5, &mut stats);
        let mut reader = PacketReader::new(&packet);
        assert_eq!(reader.read_u8().unwrap(), PACKET_SYNC_SIMULATION);
        assert_eq!(reader.read_varint().unwrap(), 1500); // fallback time base
        assert_eq!(reader.read_varint().unwrap(), 7); // confirmed sequence
        assert_eq!(reader.read_varint().unwrap(), 0); // creates
        assert_eq!(reader.read_varint().unwrap(), 0); // updates
        assert_eq!(reader.read_varint().unwrap(), 1); // deletes
        assert_eq!(reader.read_varint().unwrap(), 2); // commands
        assert_eq!(reader.read_entity_id().unwrap(), 6);

        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.entity_deletes_sent, 1);
        assert_eq!(stats.commands_sent, 2);
        assert!(stats.bytes_sent as usize == packet.len());
    }
}
