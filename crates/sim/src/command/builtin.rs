use std::any::Any;

use crate::entity::{EntityId, NO_ENTITY_ID};
use crate::wire::{PacketReader, PacketWriter, WireError};

use super::{
    BUILTIN_MODULE_ID, Command, CommandFlags, CommandRegistry, CommandTypeId, PooledFactory,
    make_type_id,
};

pub const REPARENT_COMMAND: CommandTypeId = make_type_id(BUILTIN_MODULE_ID, 0);
pub const SET_ROOT_COMMAND: CommandTypeId = make_type_id(BUILTIN_MODULE_ID, 1);

pub fn register_builtins(registry: &mut CommandRegistry) {
    registry.register(Box::new(PooledFactory::<ReparentCommand>::new(
        REPARENT_COMMAND,
        CommandFlags::empty(),
    )));
    registry.register(Box::new(PooledFactory::<SetRootCommand>::new(
        SET_ROOT_COMMAND,
        CommandFlags::GLOBAL,
    )));
}

/// Re-links an entity under a new parent (or detaches it when the parent is
/// `NO_ENTITY_ID`). Sent by the server whenever `set_parent` changes the
/// tree, executed by clients to mirror it.
#[derive(Debug, Default)]
pub struct ReparentCommand {
    pub target: EntityId,
    pub parent_id: EntityId,
}

impl Command for ReparentCommand {
    fn type_id(&self) -> CommandTypeId {
        REPARENT_COMMAND
    }

    fn target(&self) -> EntityId {
        self.target
    }

    fn set_target(&mut self, target: EntityId) {
        self.target = target;
    }

    fn write(&self, writer: &mut PacketWriter, _time_base: f64) {
        writer.write_entity_id(self.target);
        writer.write_entity_id(self.parent_id);
    }

    fn read(&mut self, reader: &mut PacketReader<'_>, _time_base: f64) -> Result<(), WireError> {
        self.target = reader.read_entity_id()?;
        self.parent_id = reader.read_entity_id()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Designates the simulation's root entity. Global: handled by the
/// simulator itself, never routed to an entity.
#[derive(Debug, Default)]
pub struct SetRootCommand {
    pub entity_id: EntityId,
}

impl Command for SetRootCommand {
    fn type_id(&self) -> CommandTypeId {
        SET_ROOT_COMMAND
    }

    fn target(&self) -> EntityId {
        NO_ENTITY_ID
    }

    fn write(&self, writer: &mut PacketWriter, _time_base: f64) {
        writer.write_entity_id(self.entity_id);
    }

    fn read(&mut self, reader: &mut PacketReader<'_>, _time_base: f64) -> Result<(), WireError> {
        self.entity_id = reader.read_entity_id()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reparent_roundtrip() {
        let command = ReparentCommand {
            target: 6,
            parent_id: 4,
        };
        let mut writer = PacketWriter::new();
        command.write(&mut writer, 0.0);

        let mut incoming = ReparentCommand::default();
        let mut reader = PacketReader::new(writer.bytes());
        incoming.read(&mut reader, 0.0).unwrap();
        assert_eq!(incoming.target, 6);
        assert_eq!(incoming.parent_id, 4);
    }

    #[test]
    fn set_root_is_global() {
        let command = SetRootCommand { entity_id: 2 };
        assert_eq!(command.target(), NO_ENTITY_ID);
    }
}
