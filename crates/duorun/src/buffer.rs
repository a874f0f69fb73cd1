//! # Packet Buffer
//!
//! Accumulates outbound commands until the enclosing request completes.
//! Pure in-memory; compiling hands the whole batch over and leaves the buffer
//! empty.

use duorpc::Command;
use duorpc::ExecResult;
use duorpc::Packet;

#[derive(Debug, Default)]
pub struct PacketBuffer {
    commands: Vec<Command>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one command and returns its index within the pending batch.
    pub fn buffer_command(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn buffer_many(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn pending(&self) -> &[Command] {
        &self.commands
    }

    /// Snapshots and clears the buffer, pairing it with `results`.
    pub fn compile(&mut self, results: Option<Vec<Option<ExecResult>>>) -> Packet {
        Packet::new(std::mem::take(&mut self.commands), results)
    }

    pub fn reset(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cmd(i: i64) -> Command {
        Command::new("Log", "append", vec![json!(i)])
    }

    #[test]
    fn test_indices_follow_insertion_order() {
        let mut buffer = PacketBuffer::new();
        assert_eq!(buffer.buffer_command(cmd(0)), 0);
        assert_eq!(buffer.buffer_command(cmd(1)), 1);
        buffer.buffer_many([cmd(2), cmd(3)]);
        assert_eq!(buffer.buffer_command(cmd(4)), 4);
    }

    #[test]
    fn test_compile_snapshots_and_clears() {
        let mut buffer = PacketBuffer::new();
        buffer.buffer_many((0..3).map(cmd));

        let packet = buffer.compile(Some(vec![Some(ExecResult::ok(json!(true)))]));
        assert_eq!(packet.commands, vec![cmd(0), cmd(1), cmd(2)]);
        assert_eq!(packet.results().len(), 1);
        assert!(buffer.is_empty());

        let next = buffer.compile(None);
        assert!(next.commands.is_empty());
        assert!(next.command_execution_results.is_none());
    }

    #[test]
    fn test_compiled_packet_reparses_to_the_same_commands() {
        let mut buffer = PacketBuffer::new();
        buffer.buffer_many((0..4).map(cmd));
        let expected = buffer.pending().to_vec();

        let bytes = duorpc::encode_packet(&buffer.compile(None)).unwrap();
        let reparsed = duorpc::decode_packet(&bytes).unwrap();

        assert_eq!(reparsed.commands, expected);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut buffer = PacketBuffer::new();
        buffer.buffer_command(cmd(9));
        buffer.reset();
        assert!(buffer.compile(None).commands.is_empty());
    }
}
