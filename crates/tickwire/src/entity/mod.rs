mod client;
mod server;

pub(crate) use client::{ClientEntity, ClientEntitySlot, ControlChange};
pub(crate) use server::{ServerEntity, ServerEntitySlot};

use crate::bits::BitBuffer;
use crate::command::CommandData;
use crate::error::DecodeError;
use crate::state::StateData;

/// Stable identifier for an entity, unique within a room for the lifetime
/// of the engine. Assigned sequentially by the server; 0 is invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(u16);

impl EntityId {
    pub const INVALID: EntityId = EntityId(0);
    pub const FIRST: EntityId = EntityId(1);

    pub fn from_raw(raw: u16) -> Self {
        EntityId(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    pub fn next(self) -> EntityId {
        EntityId(self.0 + 1)
    }

    pub fn encode(self, buf: &mut BitBuffer) {
        buf.write_varint(u32::from(self.0));
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<EntityId, DecodeError> {
        let raw = buf.read_varint()?;
        if raw > u32::from(u16::MAX) {
            return Err(DecodeError::ValueOutOfRange);
        }
        Ok(EntityId(raw as u16))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bucket an entity simulates in; buckets run in declaration order each
/// tick, so late movers can read what early movers produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateOrder {
    Early,
    #[default]
    Normal,
    Late,
    VeryLate,
}

impl UpdateOrder {
    pub const ALL: [UpdateOrder; 4] = [
        UpdateOrder::Early,
        UpdateOrder::Normal,
        UpdateOrder::Late,
        UpdateOrder::VeryLate,
    ];
}

/// Game-side behavior of one entity schema. The engine owns the replicated
/// state and the timing; implementations fill in what the ticks mean.
///
/// Server hooks: `update_auth` (simulate one tick), `apply_control` /
/// `command_missing` (consume inputs), `on_start`, `on_sunset`. Client
/// hooks: `update_control` (produce an input), `apply_control` again during
/// replay, `update_proxy` / `update_frozen`, and the freeze edge
/// notifications. Only one side's hooks run on any given host.
#[allow(unused_variables)]
pub trait EntityLogic<C: CommandData>: 'static {
    type State: StateData;

    fn update_order(&self) -> UpdateOrder {
        UpdateOrder::Normal
    }

    /// First simulation tick after creation.
    fn on_start(&mut self, state: &Self::State) {}

    /// The entity was marked for removal; runs once, at mark time.
    fn on_sunset(&mut self, state: &Self::State) {}

    fn on_frozen(&mut self, state: &Self::State) {}

    fn on_unfrozen(&mut self, state: &Self::State) {}

    /// Server: advance the authoritative state by one tick.
    fn update_auth(&mut self, state: &mut Self::State) {}

    /// Apply one input to the state. Runs on the server for arriving
    /// commands and on the client during prediction replay; must be a pure
    /// function of `(state, command)` for the two to agree.
    fn apply_control(&mut self, state: &mut Self::State, command: &crate::command::Command<C>) {}

    /// Server: the controller's input for this tick never arrived.
    fn command_missing(&mut self, state: &mut Self::State) {}

    /// Client: populate a fresh command from current input.
    fn update_control(&mut self, state: &Self::State, command: &mut C) {}

    /// Client: per-tick hook for entities owned by someone else.
    fn update_proxy(&mut self, state: &mut Self::State) {}

    /// Client: per-tick hook while frozen.
    fn update_frozen(&mut self) {}
}
