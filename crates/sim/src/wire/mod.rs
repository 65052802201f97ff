mod codec;
mod sync;

pub use codec::{MAX_VARINT_BYTES, PacketReader, PacketWriter, WireError};
pub use sync::{PACKET_EXEC_COMMANDS, PACKET_SYNC_SIMULATION, SyncWriter};
