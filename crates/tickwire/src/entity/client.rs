use std::collections::VecDeque;

use log::{debug, warn};

use super::{EntityId, EntityLogic};
use crate::command::{Command, CommandData, CommandUpdate};
use crate::config::{COMMAND_BUFFER_COUNT, COMMAND_SEND_COUNT, DEJITTER_BUFFER_LENGTH, SERVER_SEND_RATE};
use crate::pool::Pool;
use crate::sim::{DejitterBuffer, Tick};
use crate::state::{DynState, FactoryType, StateDelta, apply_delta};

/// What the latest authoritative delta said about local control, so the
/// room can attach or detach this client as the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlChange {
    None,
    Grant,
    Revoke,
}

/// Object-safe handle the client room holds per entity.
pub(crate) trait ClientEntitySlot<C: CommandData> {
    fn id(&self) -> EntityId;
    fn is_frozen(&self) -> bool;
    fn is_controlled(&self) -> bool;
    fn set_controlled(&mut self, controlled: bool);
    fn removed_tick(&self) -> Tick;
    /// Buffer an authoritative delta; returns false for stale duplicates.
    fn ingest_delta(&mut self, delta: StateDelta) -> bool;
    /// Fold buffered deltas up to the room tick into the authoritative
    /// snapshot; reports what the freshest delta said about control.
    fn update_auth_state(&mut self, room_tick: Tick) -> ControlChange;
    /// One client tick: exactly one of the frozen, proxy, or
    /// controlled-and-predicted paths runs.
    fn client_update(&mut self, local_tick: Tick);
    /// The commands to resend this packet, if this entity has any.
    fn command_update(&self) -> Option<CommandUpdate<C>>;
    fn current_state(&self) -> &dyn DynState;
    fn auth_tick(&self) -> Tick;
    /// The buffered snapshot just past the room tick, for interpolation.
    fn next_state(&self) -> Option<(&dyn DynState, Tick)>;
    fn outgoing_command_count(&self) -> usize;
}

pub(crate) struct ClientEntity<C: CommandData, L: EntityLogic<C>> {
    id: EntityId,
    factory: FactoryType,
    logic: L,
    incoming: DejitterBuffer<StateDelta>,
    outgoing: VecDeque<Command<C>>,
    command_pool: Pool<Command<C>>,
    /// Last authoritative snapshot and the one after it.
    auth_state: L::State,
    next_state: Option<L::State>,
    /// What the game reads: the predicted state for controlled entities,
    /// a copy of the authoritative state otherwise.
    current: L::State,
    auth_tick: Tick,
    next_tick: Tick,
    command_ack: Tick,
    removed_tick: Tick,
    seen_immutable: bool,
    is_frozen: bool,
    should_be_frozen: bool,
    controlled: bool,
    started: bool,
}

impl<C: CommandData, L: EntityLogic<C>> ClientEntity<C, L> {
    pub fn new(id: EntityId, factory: FactoryType, logic: L) -> Self {
        Self {
            id,
            factory,
            logic,
            incoming: DejitterBuffer::new(DEJITTER_BUFFER_LENGTH, SERVER_SEND_RATE),
            outgoing: VecDeque::with_capacity(COMMAND_BUFFER_COUNT),
            command_pool: Pool::default(),
            auth_state: L::State::default(),
            next_state: None,
            current: L::State::default(),
            auth_tick: Tick::INVALID,
            next_tick: Tick::INVALID,
            command_ack: Tick::INVALID,
            removed_tick: Tick::INVALID,
            seen_immutable: false,
            is_frozen: false,
            should_be_frozen: false,
            controlled: false,
            started: false,
        }
    }

    fn set_freeze(&mut self, frozen: bool) {
        if frozen == self.is_frozen {
            return;
        }
        self.is_frozen = frozen;
        if frozen {
            self.logic.on_frozen(&self.auth_state);
        } else {
            self.logic.on_unfrozen(&self.auth_state);
        }
    }

    /// Discard commands the server has already consumed.
    fn clean_commands(&mut self, ack: Tick) {
        if !ack.is_valid() {
            return;
        }
        while let Some(front) = self.outgoing.front() {
            if front.client_tick <= ack {
                let consumed = self.outgoing.pop_front().expect("front just checked");
                self.command_pool.free(consumed);
            } else {
                break;
            }
        }
    }

    fn update_controlled(&mut self, local_tick: Tick) {
        if self.outgoing.len() >= COMMAND_BUFFER_COUNT {
            return;
        }
        let mut command = self.command_pool.allocate();
        command.client_tick = local_tick;
        command.is_new = true;
        self.logic.update_control(&self.current, &mut command.data);
        self.outgoing.push_back(command);
    }

    /// Rebuild the predicted state: start from the authoritative snapshot,
    /// roll forward through buffered deltas that still carry controller
    /// data, then replay every unacknowledged command.
    fn update_predicted(&mut self) {
        self.current.clone_from(&self.auth_state);
        for delta in self.incoming.range_after(self.auth_tick) {
            match &delta.payload {
                Some(payload) if payload.has_controller => {
                    let mut seen = self.seen_immutable;
                    apply_delta(&mut self.current, &mut seen, payload);
                }
                // Control was lost somewhere ahead; predicting past that
                // point would fight the server.
                _ => break,
            }
        }
        self.clean_commands(self.command_ack);
        for command in self.outgoing.iter_mut() {
            self.logic.apply_control(&mut self.current, command);
            command.is_new = false;
        }
    }
}

impl<C: CommandData, L: EntityLogic<C>> ClientEntitySlot<C> for ClientEntity<C, L> {
    fn id(&self) -> EntityId {
        self.id
    }

    fn is_frozen(&self) -> bool {
        self.is_frozen
    }

    fn is_controlled(&self) -> bool {
        self.controlled
    }

    fn set_controlled(&mut self, controlled: bool) {
        if self.controlled && !controlled {
            // Commands for an entity we no longer drive are dead weight.
            while let Some(command) = self.outgoing.pop_front() {
                self.command_pool.free(command);
            }
        }
        self.controlled = controlled;
    }

    fn removed_tick(&self) -> Tick {
        self.removed_tick
    }

    fn ingest_delta(&mut self, delta: StateDelta) -> bool {
        if let Some(payload) = &delta.payload {
            if payload.factory != self.factory {
                warn!("entity {} received a delta of the wrong schema", self.id);
                return false;
            }
        }
        match self.incoming.store(delta) {
            Ok(_) => true,
            Err(stale) => {
                debug!("entity {} dropped stale delta at {}", self.id, stale.tick);
                false
            }
        }
    }

    fn update_auth_state(&mut self, room_tick: Tick) -> ControlChange {
        let mut change = ControlChange::None;
        let mut latest_ack = Tick::INVALID;
        let mut latest_removed = Tick::INVALID;
        let mut new_auth_tick = self.auth_tick;
        let mut should_be_frozen = self.should_be_frozen;

        {
            let (deltas, next) = self.incoming.range_and_next(self.auth_tick, room_tick);
            for delta in &deltas {
                match &delta.payload {
                    Some(payload) => {
                        self.auth_state.apply_mutable_dyn(payload.state.as_ref(), payload.flags);
                        if payload.has_controller {
                            self.auth_state.apply_controller_dyn(payload.state.as_ref());
                        }
                        if payload.has_immutable {
                            self.auth_state.apply_immutable_dyn(payload.state.as_ref());
                            self.seen_immutable = true;
                        }
                        should_be_frozen = false;
                        change = if payload.has_controller {
                            ControlChange::Grant
                        } else {
                            ControlChange::Revoke
                        };
                    }
                    None => {
                        should_be_frozen = true;
                        change = ControlChange::Revoke;
                    }
                }
                if delta.command_ack > latest_ack {
                    latest_ack = delta.command_ack;
                }
                if delta.removed_tick.is_valid() {
                    latest_removed = delta.removed_tick;
                }
                new_auth_tick = delta.tick;
            }

            // Stage the following snapshot for interpolation.
            self.next_tick = Tick::INVALID;
            match next {
                Some(next_delta) if !should_be_frozen => {
                    if let Some(payload) = &next_delta.payload {
                        let mut staged = self.auth_state.clone();
                        let mut seen = self.seen_immutable;
                        apply_delta(&mut staged, &mut seen, payload);
                        self.next_state = Some(staged);
                        self.next_tick = next_delta.tick;
                    } else {
                        self.next_state = None;
                    }
                }
                _ => self.next_state = None,
            }
        }

        self.auth_tick = new_auth_tick;
        self.should_be_frozen = should_be_frozen;
        if latest_ack > self.command_ack {
            self.command_ack = latest_ack;
        }
        if latest_removed.is_valid() {
            self.removed_tick = latest_removed;
        }
        change
    }

    fn client_update(&mut self, local_tick: Tick) {
        if !self.started {
            if !self.auth_tick.is_valid() {
                return;
            }
            self.logic.on_start(&self.auth_state);
            self.started = true;
        }
        let should_be_frozen = self.should_be_frozen;
        self.set_freeze(should_be_frozen);
        if self.is_frozen {
            self.logic.update_frozen();
        } else if !self.controlled {
            self.current.clone_from(&self.auth_state);
            self.logic.update_proxy(&mut self.current);
        } else {
            self.next_tick = Tick::INVALID;
            self.next_state = None;
            self.update_controlled(local_tick);
            self.update_predicted();
        }
    }

    fn command_update(&self) -> Option<CommandUpdate<C>> {
        if self.outgoing.is_empty() {
            return None;
        }
        let skip = self.outgoing.len().saturating_sub(COMMAND_SEND_COUNT);
        Some(CommandUpdate {
            entity_id: self.id,
            commands: self.outgoing.iter().skip(skip).cloned().collect(),
        })
    }

    fn current_state(&self) -> &dyn DynState {
        &self.current
    }

    fn auth_tick(&self) -> Tick {
        self.auth_tick
    }

    fn next_state(&self) -> Option<(&dyn DynState, Tick)> {
        match (&self.next_state, self.next_tick) {
            (Some(state), tick) if tick.is_valid() => {
                let staged: &dyn DynState = state;
                Some((staged, tick))
            }
            _ => None,
        }
    }

    fn outgoing_command_count(&self) -> usize {
        self.outgoing.len()
    }
}
