use crate::command::CommandTypeId;
use crate::entity::EntityId;
use crate::wire::WireError;

/// Failures surfaced by the packet handlers. The transport layer decides
/// whether an error disconnects the peer; inside a tick, per-entity errors
/// never abort the tick.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("malformed packet: {0}")]
    InvalidPacket(#[from] WireError),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("unknown command type {0:#06x}")]
    UnknownCommandType(CommandTypeId),

    #[error("unknown entity type {0}")]
    UnknownEntityType(u16),

    /// A command addressed an entity that is not in the map. Logged at
    /// debug level and discarded at dispatch; never fatal.
    #[error("command addresses unknown entity {0}")]
    UnknownEntity(EntityId),

    /// An update record references an entity this side does not have.
    /// Fatal to the packet: without the entity's variable table the
    /// remaining records cannot be framed.
    #[error("update record references unknown entity {0}")]
    UnknownUpdateEntity(EntityId),

    #[error("create record references unknown parent entity {0}")]
    UnknownParent(EntityId),

    #[error("too many unacknowledged predicted commands; server stopped confirming")]
    Desync,
}
