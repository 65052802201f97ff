use crate::wire::PacketWriter;

use super::{Command, CommandRegistry};

/// Past this many unacknowledged predicted commands the server has stopped
/// confirming and the client must treat the session as dead.
pub const MAX_UNCONFIRMED_COMMANDS: usize = 1500;

/// Client-side command queues: everything awaiting the next send plus the
/// predicted commands the server has not yet acknowledged.
pub struct PredictedCommandList {
    next_sequence: u32,
    pub(crate) unconfirmed: Vec<Box<dyn Command>>,
    pub(crate) outgoing: Vec<Box<dyn Command>>,
    outgoing_predicted: Vec<usize>,
}

impl Default for PredictedCommandList {
    fn default() -> Self {
        Self::new()
    }
}

impl PredictedCommandList {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            unconfirmed: Vec::new(),
            outgoing: Vec::new(),
            outgoing_predicted: Vec::new(),
        }
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_desynced(&self) -> bool {
        self.unconfirmed.len() > MAX_UNCONFIRMED_COMMANDS
    }

    /// Queues a command for the next send. Predicted commands get the next
    /// sequence number and enter the replay set.
    pub fn add_command(&mut self, mut command: Box<dyn Command>) {
        if let Some(meta) = command.predicted_mut() {
            meta.sequence = self.next_sequence;
            meta.has_predicted = false;
            self.next_sequence += 1;
            self.outgoing_predicted.push(self.outgoing.len());
        }
        self.outgoing.push(command);
    }

    /// Releases every unconfirmed command the server has acknowledged.
    pub fn confirm_sequence(&mut self, sequence: u32, registry: &mut CommandRegistry) {
        let keep_from = self
            .unconfirmed
            .partition_point(|c| c.predicted().map_or(true, |m| m.sequence <= sequence));
        for command in self.unconfirmed.drain(..keep_from) {
            registry.release(command);
        }
    }

    /// Serializes the outgoing queue as the body of an ExecCommands packet:
    /// the highest sequence being sent, then each command. Predicted
    /// commands move to the unconfirmed list; the rest return to their
    /// factories.
    pub fn write(&mut self, writer: &mut PacketWriter, registry: &mut CommandRegistry) {
        writer.write_varint((self.next_sequence - 1) as u64);
        writer.write_varint(self.outgoing.len() as u64);
        for command in self.outgoing.drain(..) {
            writer.write_varint(Command::type_id(command.as_ref()) as u64);
            command.write(writer, 0.0);
            if command.predicted().is_some() {
                self.unconfirmed.push(command);
            } else {
                registry.release(command);
            }
        }
        self.outgoing_predicted.clear();
    }

    /// Commands to replay this frame: the unconfirmed set first (older),
    /// then predicted commands still waiting to be sent, both in sequence
    /// order. The caller runs them and hands both sets back.
    pub(crate) fn take_replay_sets(&mut self) -> (Vec<Box<dyn Command>>, Vec<Box<dyn Command>>) {
        let unconfirmed = std::mem::take(&mut self.unconfirmed);
        let outgoing = std::mem::take(&mut self.outgoing);
        (unconfirmed, outgoing)
    }

    pub(crate) fn restore_replay_sets(
        &mut self,
        unconfirmed: Vec<Box<dyn Command>>,
        outgoing: Vec<Box<dyn Command>>,
    ) {
        debug_assert!(self.unconfirmed.is_empty() && self.outgoing.is_empty());
        self.unconfirmed = unconfirmed;
        self.outgoing = outgoing;
    }

    pub(crate) fn outgoing_predicted_indices(&self) -> &[usize] {
        &self.outgoing_predicted
    }

    /// Releases queue capacity claimed by long-gone bursts.
    pub fn compact(&mut self) {
        self.unconfirmed.shrink_to_fit();
        self.outgoing.shrink_to_fit();
        self.outgoing_predicted.shrink_to_fit();
    }
}
