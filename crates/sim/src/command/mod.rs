mod builtin;
mod list;

use std::any::Any;
use std::collections::HashMap;

use bitflags::bitflags;

use crate::entity::{EntityId, NO_ENTITY_ID};
use crate::wire::{PacketReader, PacketWriter, WireError};

pub use builtin::{
    REPARENT_COMMAND, ReparentCommand, SET_ROOT_COMMAND, SetRootCommand, register_builtins,
};
pub use list::{MAX_UNCONFIRMED_COMMANDS, PredictedCommandList};

pub type CommandTypeId = u16;

/// Module 0 is reserved for the framework's built-in commands; applications
/// allocate their own module IDs.
pub const BUILTIN_MODULE_ID: u8 = 0;

pub const fn make_type_id(module_id: u8, local_id: u8) -> CommandTypeId {
    ((module_id as u16) << 8) | local_id as u16
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u8 {
        /// Never targeted at an entity; skips targeting validation.
        const GLOBAL = 1 << 0;
        /// Carries an absolute time, delta-encoded against the packet's
        /// time base.
        const TIME = 1 << 1;
    }
}

/// Per-client replay bookkeeping carried by predicted command types.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictedMeta {
    pub sequence: u32,
    /// False on the first execution, true on every re-execution during
    /// prediction replay.
    pub has_predicted: bool,
}

pub trait Command: Any {
    fn type_id(&self) -> CommandTypeId;

    /// Target entity, or `NO_ENTITY_ID` for global commands.
    fn target(&self) -> EntityId {
        NO_ENTITY_ID
    }

    fn set_target(&mut self, _target: EntityId) {}

    /// Absolute time in seconds for TIME-flagged commands.
    fn time(&self) -> f64 {
        0.0
    }

    fn write(&self, writer: &mut PacketWriter, time_base: f64);

    fn read(&mut self, reader: &mut PacketReader<'_>, time_base: f64) -> Result<(), WireError>;

    fn predicted(&self) -> Option<&PredictedMeta> {
        None
    }

    fn predicted_mut(&mut self) -> Option<&mut PredictedMeta> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub fn write_command_time(writer: &mut PacketWriter, time: f64, time_base: f64) {
    let delta_ms = ((time - time_base) * 1000.0).max(0.0) as u64;
    writer.write_varint(delta_ms);
}

pub fn read_command_time(
    reader: &mut PacketReader<'_>,
    time_base: f64,
) -> Result<f64, WireError> {
    let delta_ms = reader.read_varint()?;
    Ok(time_base + delta_ms as f64 / 1000.0)
}

/// Allocator for one command type. Released commands are recycled.
pub trait CommandFactory {
    fn type_id(&self) -> CommandTypeId;
    fn flags(&self) -> CommandFlags;
    fn allocate(&mut self) -> Box<dyn Command>;
    fn release(&mut self, command: Box<dyn Command>);
}

const FACTORY_POOL_CAP: usize = 64;

/// Free-list factory for any `Default` command type. Callers must fully
/// initialize allocated commands; recycled instances keep stale payloads.
pub struct PooledFactory<C> {
    type_id: CommandTypeId,
    flags: CommandFlags,
    pool: Vec<Box<dyn Command>>,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<C: Command + Default> PooledFactory<C> {
    pub fn new(type_id: CommandTypeId, flags: CommandFlags) -> Self {
        Self {
            type_id,
            flags,
            pool: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<C: Command + Default> CommandFactory for PooledFactory<C> {
    fn type_id(&self) -> CommandTypeId {
        self.type_id
    }

    fn flags(&self) -> CommandFlags {
        self.flags
    }

    fn allocate(&mut self) -> Box<dyn Command> {
        self.pool.pop().unwrap_or_else(|| Box::new(C::default()))
    }

    fn release(&mut self, command: Box<dyn Command>) {
        if self.pool.len() < FACTORY_POOL_CAP {
            self.pool.push(command);
        }
    }
}

/// Immutable-after-bootstrap registry of command factories.
#[derive(Default)]
pub struct CommandRegistry {
    factories: HashMap<CommandTypeId, Box<dyn CommandFactory>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, factory: Box<dyn CommandFactory>) {
        let type_id = CommandFactory::type_id(factory.as_ref());
        if self.factories.insert(type_id, factory).is_some() {
            log::warn!("command type {type_id:#06x} registered twice");
        }
    }

    pub fn flags(&self, type_id: CommandTypeId) -> Option<CommandFlags> {
        self.factories.get(&type_id).map(|f| f.flags())
    }

    pub fn allocate(&mut self, type_id: CommandTypeId) -> Option<Box<dyn Command>> {
        self.factories.get_mut(&type_id).map(|f| f.allocate())
    }

    pub fn release(&mut self, command: Box<dyn Command>) {
        if let Some(factory) = self.factories.get_mut(&Command::type_id(command.as_ref())) {
            factory.release(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_id_packs_module_and_local() {
        assert_eq!(make_type_id(0, 0), 0);
        assert_eq!(make_type_id(0, 1), 1);
        assert_eq!(make_type_id(3, 7), 0x0307);
    }

    #[test]
    fn registry_has_builtins() {
        let registry = CommandRegistry::new();
        assert!(registry.flags(REPARENT_COMMAND).is_some());
        assert_eq!(
            registry.flags(SET_ROOT_COMMAND),
            Some(CommandFlags::GLOBAL)
        );
    }

    #[test]
    fn factory_recycles_commands() {
        let mut registry = CommandRegistry::new();
        let command = registry.allocate(REPARENT_COMMAND).unwrap();
        registry.release(command);
        let again = registry.allocate(REPARENT_COMMAND).unwrap();
        assert_eq!(Command::type_id(again.as_ref()), REPARENT_COMMAND);
    }

    #[test]
    fn command_time_delta_encoding() {
        let mut writer = PacketWriter::new();
        write_command_time(&mut writer, 12.345, 12.0);
        let mut reader = PacketReader::new(writer.bytes());
        let time = read_command_time(&mut reader, 12.0).unwrap();
        assert!((time - 12.345).abs() < 0.001);
    }
}
