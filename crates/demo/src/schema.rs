use std::f32::consts::{PI, TAU};
use std::rc::Rc;

use bitflags::bitflags;
use glam::Vec2;
use tickwire::{
    BitBuffer, Command, CommandData, DecodeError, EntityLogic, EventData, FloatCompressor,
    IntCompressor, Registry, StateData,
};

pub const ARENA_HALF_EXTENT: f32 = 500.0;
const MOVE_SPEED: f32 = 3.0;
const BOOST_MULTIPLIER: f32 = 2.0;

const STAMINA: IntCompressor = IntCompressor::new(0, 100);

fn coord() -> FloatCompressor {
    FloatCompressor::new(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT, 0.01)
}

fn angle() -> FloatCompressor {
    FloatCompressor::new(-PI, PI, 0.01)
}

/// Replicated state of one actor. Position and heading change every tick;
/// stamina is private to the controlling client; the palette and callsign
/// are fixed at spawn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorState {
    pub x: f32,
    pub y: f32,
    pub heading: f32,
    pub stamina: i64,
    pub palette: u32,
    pub callsign: String,
}

const FLAG_X: u32 = 1 << 0;
const FLAG_Y: u32 = 1 << 1;
const FLAG_HEADING: u32 = 1 << 2;

impl ActorState {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

impl StateData for ActorState {
    const FLAG_COUNT: u32 = 3;

    fn compare_mutable(&self, basis: &Self) -> u32 {
        let mut flags = 0;
        if self.x != basis.x {
            flags |= FLAG_X;
        }
        if self.y != basis.y {
            flags |= FLAG_Y;
        }
        if self.heading != basis.heading {
            flags |= FLAG_HEADING;
        }
        flags
    }

    fn apply_mutable(&mut self, source: &Self, flags: u32) {
        if flags & FLAG_X != 0 {
            self.x = source.x;
        }
        if flags & FLAG_Y != 0 {
            self.y = source.y;
        }
        if flags & FLAG_HEADING != 0 {
            self.heading = source.heading;
        }
    }

    fn apply_controller(&mut self, source: &Self) {
        self.stamina = source.stamina;
    }

    fn apply_immutable(&mut self, source: &Self) {
        self.palette = source.palette;
        self.callsign = source.callsign.clone();
    }

    fn encode_mutable(&self, flags: u32, buf: &mut BitBuffer) {
        if flags & FLAG_X != 0 {
            coord().write(buf, self.x);
        }
        if flags & FLAG_Y != 0 {
            coord().write(buf, self.y);
        }
        if flags & FLAG_HEADING != 0 {
            angle().write(buf, self.heading);
        }
    }

    fn decode_mutable(&mut self, flags: u32, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        if flags & FLAG_X != 0 {
            self.x = coord().read(buf)?;
        }
        if flags & FLAG_Y != 0 {
            self.y = coord().read(buf)?;
        }
        if flags & FLAG_HEADING != 0 {
            self.heading = angle().read(buf)?;
        }
        Ok(())
    }

    fn encode_controller(&self, buf: &mut BitBuffer) {
        STAMINA.write(buf, self.stamina);
    }

    fn decode_controller(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.stamina = STAMINA.read(buf)?;
        Ok(())
    }

    fn encode_immutable(&self, buf: &mut BitBuffer) {
        buf.write_varint(self.palette);
        buf.write_string(&self.callsign);
    }

    fn decode_immutable(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.palette = buf.read_varint()?;
        self.callsign = buf.read_string()?;
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Buttons: u8 {
        const FORWARD = 1 << 0;
        const BACK = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const BOOST = 1 << 4;
    }
}

/// One tick of input: held buttons plus the aim direction.
#[derive(Debug, Clone, Default)]
pub struct MoveCommand {
    pub buttons: Buttons,
    pub aim: f32,
}

impl CommandData for MoveCommand {
    fn encode(&self, buf: &mut BitBuffer) {
        buf.write(5, u32::from(self.buttons.bits()));
        angle().write(buf, self.aim);
    }

    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        Ok(MoveCommand {
            buttons: Buttons::from_bits_truncate(buf.read(5)? as u8),
            aim: angle().read(buf)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatEvent {
    pub sender: String,
    pub message: String,
}

impl EventData for ChatEvent {
    fn encode(&self, buf: &mut BitBuffer) {
        buf.write_string(&self.sender);
        buf.write_string(&self.message);
    }

    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        Ok(ChatEvent {
            sender: buf.read_string()?,
            message: buf.read_string()?,
        })
    }
}

/// Actor behavior on both ends. Server-side it consumes commands and walks
/// undriven actors in a slow circle; client-side it wanders on its own,
/// steering with held buttons.
#[derive(Debug, Default)]
pub struct ActorLogic {
    ticks: u32,
    idle_ticks: u32,
}

impl ActorLogic {
    fn advance(state: &mut ActorState, direction: Vec2, speed: f32) {
        let next = state.position() + direction * speed;
        state.x = next.x.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
        state.y = next.y.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
    }
}

impl EntityLogic<MoveCommand> for ActorLogic {
    type State = ActorState;

    fn apply_control(&mut self, state: &mut ActorState, command: &Command<MoveCommand>) {
        self.idle_ticks = 0;
        let input = &command.data;
        state.heading = input.aim;
        let mut direction = Vec2::ZERO;
        if input.buttons.contains(Buttons::FORWARD) {
            direction += Vec2::from_angle(input.aim);
        }
        if input.buttons.contains(Buttons::BACK) {
            direction -= Vec2::from_angle(input.aim);
        }
        if input.buttons.contains(Buttons::LEFT) {
            direction += Vec2::from_angle(input.aim).perp();
        }
        if input.buttons.contains(Buttons::RIGHT) {
            direction -= Vec2::from_angle(input.aim).perp();
        }
        let speed = if input.buttons.contains(Buttons::BOOST) {
            MOVE_SPEED * BOOST_MULTIPLIER
        } else {
            MOVE_SPEED
        };
        if direction != Vec2::ZERO {
            Self::advance(state, direction.normalize(), speed);
        }
    }

    fn update_auth(&mut self, state: &mut ActorState) {
        self.ticks = self.ticks.wrapping_add(1);
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        // Actors nobody has driven lately orbit the arena center, so
        // spectators always see motion.
        if self.idle_ticks > 120 {
            let orbit = (self.ticks as f32) * 0.01;
            state.heading = (orbit % TAU) - PI;
            Self::advance(state, Vec2::from_angle(state.heading), MOVE_SPEED * 0.5);
        }
    }

    fn update_control(&mut self, _state: &ActorState, command: &mut MoveCommand) {
        self.ticks = self.ticks.wrapping_add(1);
        // Self-driving input: hold forward and sweep the aim slowly.
        command.buttons = Buttons::FORWARD;
        if self.ticks % 240 < 40 {
            command.buttons |= Buttons::BOOST;
        }
        command.aim = (((self.ticks as f32) * 0.005) % TAU) - PI;
    }
}

/// The protocol both binaries are built from. Registration order is the
/// wire contract; keep it identical on every host.
pub fn build_registry() -> Rc<Registry<MoveCommand>> {
    let mut registry = Registry::new();
    registry.add_entity_type::<ActorLogic>();
    registry.add_event_type::<ChatEvent>();
    Rc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let command = MoveCommand {
            buttons: Buttons::FORWARD | Buttons::BOOST,
            aim: 1.25,
        };
        let mut buf = BitBuffer::new();
        command.encode(&mut buf);
        let decoded = MoveCommand::decode(&mut buf).unwrap();
        assert_eq!(decoded.buttons, command.buttons);
        assert!((decoded.aim - 1.25).abs() < 0.01);
    }

    #[test]
    fn state_flags_track_changes() {
        let a = ActorState::default();
        let mut b = a.clone();
        b.x = 10.0;
        b.heading = 0.5;
        assert_eq!(a.compare_mutable(&a.clone()), 0);
        assert_eq!(b.compare_mutable(&a), FLAG_X | FLAG_HEADING);
    }

    #[test]
    fn movement_stays_in_the_arena() {
        let mut state = ActorState {
            x: ARENA_HALF_EXTENT,
            ..ActorState::default()
        };
        ActorLogic::advance(&mut state, Vec2::X, 100.0);
        assert_eq!(state.x, ARENA_HALF_EXTENT);
    }
}
