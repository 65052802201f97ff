pub mod clock;
pub mod command;
pub mod entity;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod state;
pub mod stats;
pub mod wire;

pub use clock::Clock;
pub use command::{
    BUILTIN_MODULE_ID, Command, CommandFactory, CommandFlags, CommandRegistry, CommandTypeId,
    MAX_UNCONFIRMED_COMMANDS, PooledFactory, PredictedCommandList, PredictedMeta,
    REPARENT_COMMAND, ReparentCommand, SET_ROOT_COMMAND, SetRootCommand, make_type_id,
    read_command_time, write_command_time,
};
pub use entity::{
    BasicEntityFactory, DirtyFlags, Entity, EntityBehavior, EntityFactory, EntityFlags, EntityId,
    EntityRegistry, EntityTypeId, NO_ENTITY_ID, NullBehavior, RemoveMode, TickEffects,
};
pub use error::SimError;
pub use scheduler::{Priority, Scheduler};
pub use session::{
    LoopbackHub, LoopbackTransport, NO_WIRE_ID, Transport, User, UserRegistry, WireId,
};
pub use sim::{
    ClientSimulator, Frame, GlobalCommandHandler, ServerSimulator, Side, Simulator,
    SimulatorConfig, SimulatorWatcher, Ticker,
};
pub use state::{
    EntityState, TableBuilder, TableError, Value, Var, VariableFlags, VariableKind, VariableTable,
};
pub use stats::SyncStats;
pub use wire::{
    PACKET_EXEC_COMMANDS, PACKET_SYNC_SIMULATION, PacketReader, PacketWriter, SyncWriter,
    WireError,
};
