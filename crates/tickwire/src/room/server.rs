use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, warn};

use super::{PendingEvent, TickCallback};
use crate::bits::BitBuffer;
use crate::command::CommandData;
use crate::config::{DATA_BUFFER_SIZE, RoomConfig, SERVER_SEND_RATE};
use crate::entity::{EntityId, EntityLogic, ServerEntitySlot, UpdateOrder};
use crate::event::{EventData, EventId, ReceivedEvent};
use crate::net::{ClientId, NetworkStats, Peer, Transport, decode_client_packet, encode_server_packet};
use crate::registry::Registry;
use crate::scope::Scope;
use crate::sim::Tick;
use crate::state::{DynState, StateData, StateDelta};

/// Decides whether an entity is inside a client's area of interest; out of
/// scope entities are shipped as frozen markers instead of state.
pub type ScopeFilter = Box<dyn FnMut(EntityId, &dyn DynState) -> bool>;

struct RemoteClient {
    id: ClientId,
    peer: Peer,
    scope: Scope,
    identifier: String,
    scope_filter: Option<ScopeFilter>,
}

/// The authoritative room: owns every entity, assigns ids, and runs the
/// simulation the clients converge to.
pub struct ServerRoom<C: CommandData> {
    registry: Rc<Registry<C>>,
    tick: Tick,
    entities: HashMap<EntityId, Box<dyn ServerEntitySlot<C>>>,
    /// Entities past their removal tick, retained until every client has
    /// acknowledged the removal (or never saw them at all).
    removed: HashMap<EntityId, Box<dyn ServerEntitySlot<C>>>,
    next_entity_id: EntityId,
    pending_broadcasts: Vec<PendingEvent>,
    events_in: Vec<(ClientId, ReceivedEvent)>,
    pre_update: Option<TickCallback>,
    post_update: Option<TickCallback>,
    entity_removed: Option<Box<dyn FnMut(EntityId)>>,
}

impl<C: CommandData> ServerRoom<C> {
    fn new(registry: Rc<Registry<C>>) -> Self {
        Self {
            registry,
            tick: Tick::START,
            entities: HashMap::new(),
            removed: HashMap::new(),
            next_entity_id: EntityId::FIRST,
            pending_broadcasts: Vec::new(),
            events_in: Vec::new(),
            pre_update: None,
            post_update: None,
            entity_removed: None,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Spawns an entity of a registered schema and returns its id.
    pub fn add_entity<L>(&mut self) -> EntityId
    where
        L: EntityLogic<C> + Default,
    {
        let factory = self
            .registry
            .factory_of::<L>()
            .expect("entity type was not registered");
        let id = self.next_entity_id;
        self.next_entity_id = self.next_entity_id.next();
        let entity = self
            .registry
            .create_server_entity(factory, id)
            .expect("registry produced the factory type");
        self.entities.insert(id, entity);
        id
    }

    /// Schedules removal for the next tick and fires the sunset hook. The
    /// entity keeps simulating until the removal tick arrives, so marking
    /// mid-tick never disturbs the current tick.
    pub fn mark_for_removal(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.mark_for_removal(self.tick + 1);
        }
    }

    pub fn grant_control(&mut self, id: EntityId, client: ClientId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.set_controller(Some(client));
        }
    }

    pub fn revoke_control(&mut self, id: EntityId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.set_controller(None);
        }
    }

    pub fn controller_of(&self, id: EntityId) -> Option<ClientId> {
        self.entities.get(&id).and_then(|entity| entity.controller())
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    /// Typed read access to an entity's authoritative state.
    pub fn state<S: StateData>(&self, id: EntityId) -> Option<&S> {
        self.entities
            .get(&id)
            .and_then(|entity| entity.current_state().as_any().downcast_ref::<S>())
    }

    /// Typed write access, for host-driven changes between ticks.
    pub fn state_mut<S: StateData>(&mut self, id: EntityId) -> Option<&mut S> {
        self.entities
            .get_mut(&id)
            .and_then(|entity| entity.current_state_mut().as_any_mut().downcast_mut::<S>())
    }

    /// Queues a reliable event for every connected client.
    pub fn broadcast_event<E: EventData>(&mut self, event: E, attempts: u16) {
        let kind = self
            .registry
            .event_type_of::<E>()
            .expect("event type was not registered");
        self.pending_broadcasts.push(PendingEvent {
            kind,
            payload: Box::new(event),
            attempts,
        });
    }

    /// Events received from clients since the last call.
    pub fn take_events(&mut self) -> Vec<(ClientId, ReceivedEvent)> {
        std::mem::take(&mut self.events_in)
    }

    pub fn on_pre_update(&mut self, callback: impl FnMut(Tick) + 'static) {
        self.pre_update = Some(Box::new(callback));
    }

    pub fn on_post_update(&mut self, callback: impl FnMut(Tick) + 'static) {
        self.post_update = Some(Box::new(callback));
    }

    pub fn on_entity_removed(&mut self, callback: impl FnMut(EntityId) + 'static) {
        self.entity_removed = Some(Box::new(callback));
    }

    /// Entity ids in simulation order: bucket first, then id for
    /// determinism inside a bucket.
    fn update_order(&self) -> Vec<EntityId> {
        let mut order: Vec<(UpdateOrder, EntityId)> = self
            .entities
            .iter()
            .map(|(&id, entity)| (entity.update_order(), id))
            .collect();
        order.sort();
        order.into_iter().map(|(_, id)| id).collect()
    }
}

/// The server-side engine front: owns the clients and drives the room.
pub struct Server<C: CommandData> {
    registry: Rc<Registry<C>>,
    config: RoomConfig,
    clients: HashMap<ClientId, RemoteClient>,
    next_client_id: u64,
    room: Option<ServerRoom<C>>,
    client_joined: Option<Box<dyn FnMut(ClientId)>>,
    client_left: Option<Box<dyn FnMut(ClientId)>>,
}

impl<C: CommandData> Server<C> {
    pub fn new(registry: Rc<Registry<C>>, config: RoomConfig) -> Self {
        Self {
            registry,
            config,
            clients: HashMap::new(),
            next_client_id: 1,
            room: None,
            client_joined: None,
            client_left: None,
        }
    }

    pub fn start_room(&mut self) -> &mut ServerRoom<C> {
        assert!(self.room.is_none(), "room already started");
        self.room = Some(ServerRoom::new(Rc::clone(&self.registry)));
        self.room.as_mut().expect("just created")
    }

    pub fn room(&self) -> Option<&ServerRoom<C>> {
        self.room.as_ref()
    }

    pub fn room_mut(&mut self) -> Option<&mut ServerRoom<C>> {
        self.room.as_mut()
    }

    /// Registers a connected transport as a client.
    pub fn add_client(&mut self, transport: Box<dyn Transport>, identifier: &str) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        self.clients.insert(
            id,
            RemoteClient {
                id,
                peer: Peer::new(transport),
                scope: Scope::new(),
                identifier: identifier.to_string(),
                scope_filter: None,
            },
        );
        if let Some(callback) = &mut self.client_joined {
            callback(id);
        }
        id
    }

    /// Drops a client, revoking control of everything it drove.
    pub fn remove_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        if let Some(room) = &mut self.room {
            for entity in room.entities.values_mut() {
                if entity.controller() == Some(id) {
                    entity.set_controller(None);
                }
            }
        }
        if let Some(callback) = &mut self.client_left {
            callback(id);
        }
    }

    pub fn client_identifier(&self, id: ClientId) -> Option<&str> {
        self.clients.get(&id).map(|client| client.identifier.as_str())
    }

    pub fn client_stats(&self, id: ClientId) -> Option<&NetworkStats> {
        self.clients.get(&id).map(|client| client.peer.stats())
    }

    /// Estimated current tick of a client's local clock.
    pub fn client_remote_tick(&self, id: ClientId) -> Tick {
        self.clients
            .get(&id)
            .map_or(Tick::INVALID, |client| client.peer.estimated_remote_tick())
    }

    pub fn set_scope_filter(&mut self, id: ClientId, filter: ScopeFilter) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.scope_filter = Some(filter);
        }
    }

    pub fn on_client_joined(&mut self, callback: impl FnMut(ClientId) + 'static) {
        self.client_joined = Some(Box::new(callback));
    }

    pub fn on_client_left(&mut self, callback: impl FnMut(ClientId) + 'static) {
        self.client_left = Some(Box::new(callback));
    }

    /// One server tick: drain client packets, simulate, and on send ticks
    /// snapshot state and broadcast per-client packets.
    pub fn update(&mut self) {
        let Some(room) = self.room.as_mut() else {
            return;
        };

        // Receive.
        for (&client_id, client) in self.clients.iter_mut() {
            let mut payloads = Vec::new();
            client.peer.poll_transport(&mut payloads);
            for payload in payloads {
                let packet = match decode_client_packet::<C>(&payload, self.registry.as_ref()) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!("{}: undecodable packet: {}", client.identifier, err);
                        continue;
                    }
                };
                if !client.peer.begin_receive(&packet.header, &self.config) {
                    continue;
                }
                for event in packet.events {
                    if client.peer.accept_event(event.id) {
                        room.events_in.push((client_id, event));
                    }
                }
                client.scope.integrate_acked(&packet.view);
                for update in packet.updates {
                    match room.entities.get_mut(&update.entity_id) {
                        Some(entity) if entity.controller() == Some(client_id) => {
                            for command in update.commands {
                                entity.ingest_command(command);
                            }
                        }
                        _ => debug!(
                            "{}: commands for entity {} it does not control",
                            client.identifier, update.entity_id
                        ),
                    }
                }
            }
        }

        // Simulate.
        room.tick = room.tick.next();
        if let Some(callback) = &mut room.pre_update {
            callback(room.tick);
        }
        let horizons: HashMap<ClientId, Tick> = self
            .clients
            .iter()
            .map(|(&id, client)| (id, client.peer.estimated_remote_tick()))
            .collect();
        for id in room.update_order() {
            let entity = room.entities.get_mut(&id).expect("id from live map");
            let horizon = entity
                .controller()
                .and_then(|controller| horizons.get(&controller).copied())
                .unwrap_or(Tick::INVALID);
            entity.server_update(room.tick, horizon);
        }

        // Apply deferred removals.
        let due: Vec<EntityId> = room
            .entities
            .iter()
            .filter(|(_, entity)| {
                let removed = entity.removed_tick();
                removed.is_valid() && room.tick >= removed
            })
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            let mut entity = room.entities.remove(&id).expect("id from live map");
            entity.set_controller(None);
            room.removed.insert(id, entity);
            if let Some(callback) = &mut room.entity_removed {
                callback(id);
            }
        }

        // Send.
        if room.tick.is_send_tick(SERVER_SEND_RATE) {
            for entity in room.entities.values_mut() {
                entity.store_record(room.tick);
            }
            let broadcasts: Vec<PendingEvent> = room.pending_broadcasts.drain(..).collect();
            for client in self.clients.values_mut() {
                for event in &broadcasts {
                    client.peer.queue_event(
                        event.kind,
                        event.payload.clone_dyn(),
                        event.attempts,
                        Tick::INVALID,
                    );
                }
            }
            for client in self.clients.values_mut() {
                send_to_client(room, client);
            }
            clean_removed(room, &mut self.clients);
        }

        if let Some(callback) = &mut room.post_update {
            callback(room.tick);
        }
    }
}

/// Builds this client's delta list in starvation-safe order: removals
/// first, then freeze markers, then live entities by priority (never-sent
/// first, then stalest).
fn collect_deltas<C: CommandData>(room: &ServerRoom<C>, client: &mut RemoteClient) -> Vec<StateDelta> {
    let mut deltas = Vec::new();
    for (&id, entity) in room.removed.iter() {
        if client.scope.acked_removal(id, entity.removed_tick()) {
            continue;
        }
        let basis = client.scope.last_acked(id);
        if let Some(delta) = entity.produce_delta(room.tick, basis, client.id) {
            deltas.push(delta);
        }
    }

    let mut live: Vec<(Tick, EntityId)> = Vec::new();
    for (&id, entity) in room.entities.iter() {
        let in_scope = match &mut client.scope_filter {
            Some(filter) => filter(id, entity.current_state()),
            None => true,
        };
        if in_scope {
            live.push((client.scope.last_sent(id), id));
        } else if !client.scope.acked_frozen(id) {
            deltas.push(StateDelta::frozen(room.tick, id));
        }
    }
    // Invalid ticks order first, which is exactly the priority we want:
    // never-sent entities beat everything, then the longest-unsent.
    live.sort();
    for (_, id) in live {
        let entity = room.entities.get(&id).expect("id from live map");
        let basis = client.scope.last_acked(id);
        if let Some(delta) = entity.produce_delta(room.tick, basis, client.id) {
            deltas.push(delta);
        }
    }
    deltas
}

fn send_to_client<C: CommandData>(room: &ServerRoom<C>, client: &mut RemoteClient) {
    let deltas = collect_deltas(room, client);
    let header = client.peer.header_for_send(room.tick);
    let mut buf = BitBuffer::with_capacity_bytes(DATA_BUFFER_SIZE);
    let (event_ids, deltas_written) = {
        let events = client.peer.events_for_send(room.tick);
        let (events_written, deltas_written) = encode_server_packet(&mut buf, &header, &events, &deltas);
        let event_ids: Vec<EventId> = events_written.iter().map(|&i| events[i].id).collect();
        (event_ids, deltas_written)
    };
    client.peer.after_send(&event_ids, room.tick);
    for &index in &deltas_written {
        client.scope.mark_sent(deltas[index].entity_id, room.tick);
    }
    let payload = buf.store();
    client.peer.send(&payload);
}

fn clean_removed<C: CommandData>(room: &mut ServerRoom<C>, clients: &mut HashMap<ClientId, RemoteClient>) {
    room.removed.retain(|&id, entity| {
        let settled = clients
            .values()
            .all(|client| client.scope.acked_removal(id, entity.removed_tick()));
        if settled {
            for client in clients.values_mut() {
                client.scope.forget(id);
            }
        }
        !settled
    });
}
