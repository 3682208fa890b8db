use crate::bits::{BitBuffer, read_packed, write_packed};
use crate::config::COMMAND_SEND_COUNT;
use crate::entity::EntityId;
use crate::error::DecodeError;
use crate::sim::{Tick, TickStamped};

/// A user-defined input record. One command type serves the whole protocol;
/// entities that ignore inputs simply never see one.
pub trait CommandData: Default + Clone + std::fmt::Debug + 'static {
    fn encode(&self, buf: &mut BitBuffer);
    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError>;
}

/// A command stamped with the client tick it was produced on. `is_new` is
/// local bookkeeping: true only the first time the producing side applies
/// it, so one-shot inputs fire once despite replay.
#[derive(Debug, Clone, Default)]
pub struct Command<C: CommandData> {
    pub client_tick: Tick,
    pub is_new: bool,
    pub data: C,
}

impl<C: CommandData> TickStamped for Command<C> {
    fn tick(&self) -> Tick {
        self.client_tick
    }
}

impl<C: CommandData> Command<C> {
    fn encode(&self, buf: &mut BitBuffer) {
        self.client_tick.encode(buf);
        self.data.encode(buf);
    }

    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        Ok(Command {
            client_tick: Tick::decode(buf)?,
            is_new: true,
            data: C::decode(buf)?,
        })
    }
}

/// The recent commands for one controlled entity, batched into a packet.
/// Redundant resends of the same commands are what make the input stream
/// survive packet loss.
#[derive(Debug, Clone)]
pub struct CommandUpdate<C: CommandData> {
    pub entity_id: EntityId,
    pub commands: Vec<Command<C>>,
}

impl<C: CommandData> CommandUpdate<C> {
    pub fn encode(&self, buf: &mut BitBuffer) {
        debug_assert!(self.commands.len() <= COMMAND_SEND_COUNT);
        self.entity_id.encode(buf);
        write_packed(
            buf,
            usize::MAX,
            usize::MAX,
            &self.commands,
            |buf, command| command.encode(buf),
            |command| format!("command at {}", command.client_tick),
        );
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        let entity_id = EntityId::decode(buf)?;
        let commands = read_packed(buf, Command::decode)?;
        Ok(CommandUpdate { entity_id, commands })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Thrust(i32);

    impl CommandData for Thrust {
        fn encode(&self, buf: &mut BitBuffer) {
            buf.write_varint_signed(self.0);
        }

        fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
            Ok(Thrust(buf.read_varint_signed()?))
        }
    }

    #[test]
    fn update_round_trip() {
        let update = CommandUpdate {
            entity_id: EntityId::from_raw(4),
            commands: (0..5)
                .map(|i| Command {
                    client_tick: Tick::from_raw(10 + i),
                    is_new: false,
                    data: Thrust(i as i32 - 2),
                })
                .collect(),
        };

        let mut buf = BitBuffer::new();
        update.encode(&mut buf);
        let decoded: CommandUpdate<Thrust> = CommandUpdate::decode(&mut buf).unwrap();

        assert_eq!(decoded.entity_id, update.entity_id);
        assert_eq!(decoded.commands.len(), 5);
        assert_eq!(decoded.commands[4].client_tick, Tick::from_raw(14));
        assert_eq!(decoded.commands[4].data, Thrust(2));
        // Decoded commands count as new until the receiver applies them.
        assert!(decoded.commands.iter().all(|c| c.is_new));
    }
}
