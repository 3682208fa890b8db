use log::debug;

use super::{EntityId, EntityLogic, UpdateOrder};
use crate::command::{Command, CommandData};
use crate::config::DEJITTER_BUFFER_LENGTH;
use crate::net::ClientId;
use crate::pool::Pool;
use crate::sim::{DejitterBuffer, QueueBuffer, Tick};
use crate::state::{DynState, FactoryType, StateData, StateDelta, StateRecord, create_delta};

/// Object-safe handle the server room holds per entity, hiding the schema
/// behind the registry's factory type.
pub(crate) trait ServerEntitySlot<C: CommandData> {
    fn update_order(&self) -> UpdateOrder;
    fn controller(&self) -> Option<ClientId>;
    fn set_controller(&mut self, controller: Option<ClientId>);
    fn removed_tick(&self) -> Tick;
    /// Schedules removal and fires the sunset hook once.
    fn mark_for_removal(&mut self, removal_tick: Tick);
    /// One simulation tick: consume the freshest command at or before the
    /// controller's estimated tick, then advance the authoritative state.
    fn server_update(&mut self, tick: Tick, command_horizon: Tick);
    /// Snapshot the current state into the record history if it changed.
    fn store_record(&mut self, tick: Tick);
    /// Buffer an arriving command; returns false for stale duplicates.
    fn ingest_command(&mut self, command: Command<C>) -> bool;
    /// Build this entity's delta for one client against its acked basis.
    fn produce_delta(&self, tick: Tick, basis: Tick, destination: ClientId) -> Option<StateDelta>;
    fn current_state(&self) -> &dyn DynState;
    fn current_state_mut(&mut self) -> &mut dyn DynState;
}

pub(crate) struct ServerEntity<C: CommandData, L: EntityLogic<C>> {
    id: EntityId,
    factory: FactoryType,
    logic: L,
    state: L::State,
    controller: Option<ClientId>,
    /// Kept through removal so the final delta still carries controller
    /// data to whoever drove the entity last.
    prior_controller: Option<ClientId>,
    incoming_commands: DejitterBuffer<Command<C>>,
    records: QueueBuffer<StateRecord<L::State>>,
    record_pool: Pool<StateRecord<L::State>>,
    command_ack: Tick,
    removed_tick: Tick,
    started: bool,
}

impl<C: CommandData, L: EntityLogic<C>> ServerEntity<C, L> {
    pub fn new(id: EntityId, factory: FactoryType, logic: L) -> Self {
        Self {
            id,
            factory,
            logic,
            state: L::State::default(),
            controller: None,
            prior_controller: None,
            incoming_commands: DejitterBuffer::new(DEJITTER_BUFFER_LENGTH, 1),
            records: QueueBuffer::new(DEJITTER_BUFFER_LENGTH),
            record_pool: Pool::default(),
            command_ack: Tick::INVALID,
            removed_tick: Tick::INVALID,
            started: false,
        }
    }
}

impl<C: CommandData, L: EntityLogic<C>> ServerEntitySlot<C> for ServerEntity<C, L> {
    fn update_order(&self) -> UpdateOrder {
        self.logic.update_order()
    }

    fn controller(&self) -> Option<ClientId> {
        self.controller
    }

    fn set_controller(&mut self, controller: Option<ClientId>) {
        if let Some(previous) = self.controller {
            self.prior_controller = Some(previous);
        }
        self.controller = controller;
    }

    fn removed_tick(&self) -> Tick {
        self.removed_tick
    }

    fn mark_for_removal(&mut self, removal_tick: Tick) {
        if self.removed_tick.is_valid() {
            return;
        }
        self.removed_tick = removal_tick;
        self.logic.on_sunset(&self.state);
    }

    fn server_update(&mut self, _tick: Tick, command_horizon: Tick) {
        if !self.started {
            self.logic.on_start(&self.state);
            self.started = true;
        }
        if self.controller.is_some() {
            if let Some(command) = self.incoming_commands.latest_at_mut(command_horizon) {
                self.logic.apply_control(&mut self.state, command);
                command.is_new = false;
                if command.client_tick > self.command_ack {
                    self.command_ack = command.client_tick;
                }
            } else {
                self.logic.command_missing(&mut self.state);
            }
        }
        self.logic.update_auth(&mut self.state);
    }

    fn store_record(&mut self, tick: Tick) {
        if let Some(latest) = self.records.latest() {
            if self.state.compare_mutable(&latest.state) == 0 {
                return;
            }
        }
        let mut record = self.record_pool.allocate();
        record.tick = tick;
        record.state.clone_from(&self.state);
        if let Some(evicted) = self.records.push(record) {
            self.record_pool.free(evicted);
        }
    }

    fn ingest_command(&mut self, command: Command<C>) -> bool {
        match self.incoming_commands.store(command) {
            Ok(_) => true,
            Err(stale) => {
                debug!("entity {} dropped stale command at {}", self.id, stale.client_tick);
                false
            }
        }
    }

    fn produce_delta(&self, tick: Tick, basis: Tick, destination: ClientId) -> Option<StateDelta> {
        let include_controller =
            self.controller == Some(destination) || self.prior_controller == Some(destination);
        let basis_record = if basis.is_valid() {
            self.records.latest_at_or_before(basis)
        } else {
            None
        };
        // A missing record for a valid basis means the history window aged
        // out from under this client; recover with a full snapshot.
        let include_immutable = basis_record.is_none();
        let command_ack = if self.controller == Some(destination) {
            self.command_ack
        } else {
            Tick::INVALID
        };
        create_delta(
            tick,
            self.id,
            self.factory,
            basis_record.map(|record| &record.state),
            &self.state,
            include_controller,
            include_immutable,
            command_ack,
            self.removed_tick,
            basis_record.is_none(),
        )
    }

    fn current_state(&self) -> &dyn DynState {
        &self.state
    }

    fn current_state_mut(&mut self) -> &mut dyn DynState {
        &mut self.state
    }
}
