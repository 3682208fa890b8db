use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::{debug, warn};

use super::{PendingEvent, TickCallback};
use crate::bits::BitBuffer;
use crate::command::{CommandData, CommandUpdate};
use crate::config::{CLIENT_SEND_RATE, DATA_BUFFER_SIZE, RoomConfig};
use crate::entity::{ClientEntitySlot, ControlChange, EntityId};
use crate::event::{EventData, EventId, ReceivedEvent};
use crate::net::{NetworkStats, Peer, Transport, decode_server_packet, encode_client_packet};
use crate::registry::Registry;
use crate::scope::View;
use crate::sim::Tick;
use crate::state::{StateData, StateDelta};

/// The client's mirror of the server room: replicated entities, the ack
/// view, and the estimated server tick.
pub struct ClientRoom<C: CommandData> {
    registry: Rc<Registry<C>>,
    /// Estimated server tick; entities interpolate and predict around it.
    tick: Tick,
    entities: HashMap<EntityId, Box<dyn ClientEntitySlot<C>>>,
    /// Ids we already removed; their deltas are acknowledged but never
    /// applied again, so a resent removal cannot resurrect the entity.
    departed: HashSet<EntityId>,
    view: View,
    pending_events: Vec<PendingEvent>,
    events_in: Vec<ReceivedEvent>,
    pre_update: Option<TickCallback>,
    post_update: Option<TickCallback>,
    entity_removed: Option<Box<dyn FnMut(EntityId)>>,
}

impl<C: CommandData> ClientRoom<C> {
    fn new(registry: Rc<Registry<C>>) -> Self {
        Self {
            registry,
            tick: Tick::INVALID,
            entities: HashMap::new(),
            departed: HashSet::new(),
            view: View::new(),
            pending_events: Vec::new(),
            events_in: Vec::new(),
            pre_update: None,
            post_update: None,
            entity_removed: None,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Typed read access to what the game should render: the predicted
    /// state for controlled entities, the authoritative one otherwise.
    pub fn state<S: StateData>(&self, id: EntityId) -> Option<&S> {
        self.entities
            .get(&id)
            .and_then(|entity| entity.current_state().as_any().downcast_ref::<S>())
    }

    /// The staged pair for render interpolation: the authoritative snapshot
    /// with its tick, and the following one when buffered. The caller owns
    /// the clock that turns ticks into a blend fraction.
    pub fn interpolation<S: StateData>(&self, id: EntityId) -> Option<(Tick, &S, Option<(Tick, &S)>)> {
        let entity = self.entities.get(&id)?;
        let current = entity.current_state().as_any().downcast_ref::<S>()?;
        let next = entity
            .next_state()
            .and_then(|(state, tick)| state.as_any().downcast_ref::<S>().map(|s| (tick, s)));
        Some((entity.auth_tick(), current, next))
    }

    pub fn is_frozen(&self, id: EntityId) -> bool {
        self.entities.get(&id).is_some_and(|entity| entity.is_frozen())
    }

    pub fn is_controlled(&self, id: EntityId) -> bool {
        self.entities.get(&id).is_some_and(|entity| entity.is_controlled())
    }

    /// Commands generated locally and not yet acknowledged by the server.
    pub fn pending_commands(&self, id: EntityId) -> usize {
        self.entities
            .get(&id)
            .map_or(0, |entity| entity.outgoing_command_count())
    }

    /// Queues a reliable event for the server.
    pub fn raise_event<E: EventData>(&mut self, event: E, attempts: u16) {
        let kind = self
            .registry
            .event_type_of::<E>()
            .expect("event type was not registered");
        self.pending_events.push(PendingEvent {
            kind,
            payload: Box::new(event),
            attempts,
        });
    }

    /// Events received from the server since the last call.
    pub fn take_events(&mut self) -> Vec<ReceivedEvent> {
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

    fn route_delta(&mut self, delta: StateDelta, local_tick: Tick) {
        self.view
            .record(delta.entity_id, delta.tick, local_tick, delta.is_frozen());
        if self.departed.contains(&delta.entity_id) {
            return;
        }
        if let Some(entity) = self.entities.get_mut(&delta.entity_id) {
            entity.ingest_delta(delta);
            return;
        }
        // An unknown entity can only be constructed from a delta carrying
        // its immutable data; anything else is a leftover from a removal
        // we already processed, or a freeze marker we can ack but not use.
        let Some(payload) = delta.payload.as_ref().filter(|p| p.has_immutable) else {
            debug!("no entity {} for incomplete delta, ignoring", delta.entity_id);
            return;
        };
        let Some(mut entity) = self.registry.create_client_entity(payload.factory, delta.entity_id) else {
            warn!("delta for unregistered factory type {}", payload.factory.0);
            return;
        };
        entity.ingest_delta(delta);
        self.entities.insert(entity.id(), entity);
    }
}

/// The client-side engine front: one peer, one room, a local tick.
pub struct Client<C: CommandData> {
    registry: Rc<Registry<C>>,
    config: RoomConfig,
    peer: Option<Peer>,
    room: Option<ClientRoom<C>>,
    local_tick: Tick,
}

impl<C: CommandData> Client<C> {
    pub fn new(registry: Rc<Registry<C>>, config: RoomConfig) -> Self {
        Self {
            registry,
            config,
            peer: None,
            room: None,
            local_tick: Tick::START,
        }
    }

    /// Attaches the transport that talks to the server.
    pub fn set_peer(&mut self, transport: Box<dyn Transport>) {
        self.peer = Some(Peer::new(transport));
    }

    pub fn start_room(&mut self) -> &mut ClientRoom<C> {
        assert!(self.room.is_none(), "room already started");
        self.room = Some(ClientRoom::new(Rc::clone(&self.registry)));
        self.room.as_mut().expect("just created")
    }

    pub fn room(&self) -> Option<&ClientRoom<C>> {
        self.room.as_ref()
    }

    pub fn room_mut(&mut self) -> Option<&mut ClientRoom<C>> {
        self.room.as_mut()
    }

    pub fn local_tick(&self) -> Tick {
        self.local_tick
    }

    pub fn stats(&self) -> Option<&NetworkStats> {
        self.peer.as_ref().map(|peer| peer.stats())
    }

    /// One client tick: drain server packets, advance the estimated server
    /// clock, run every entity, and on send ticks ship the view and the
    /// pending commands.
    pub fn update(&mut self) {
        let (Some(peer), Some(room)) = (self.peer.as_mut(), self.room.as_mut()) else {
            return;
        };

        // Receive.
        let mut payloads = Vec::new();
        peer.poll_transport(&mut payloads);
        for payload in payloads {
            let packet =
                match decode_server_packet(&payload, self.registry.as_ref(), self.registry.as_ref()) {
                    Ok(packet) => packet,
                    Err(err) => {
                        warn!("undecodable server packet: {}", err);
                        continue;
                    }
                };
            if !peer.begin_receive(&packet.header, &self.config) {
                continue;
            }
            for event in packet.events {
                if peer.accept_event(event.id) {
                    room.events_in.push(event);
                }
            }
            for delta in packet.deltas {
                room.route_delta(delta, self.local_tick);
            }
        }

        // Advance clocks: the local tick is ours, the room tick chases the
        // server's.
        self.local_tick = self.local_tick.next();
        let estimate = peer.estimated_remote_tick();
        if estimate > room.tick {
            room.tick = estimate;
        }
        if let Some(callback) = &mut room.pre_update {
            callback(room.tick);
        }

        // Fold authoritative data, then run the per-entity state machines.
        let ids: Vec<EntityId> = room.entities.keys().copied().collect();
        for id in &ids {
            let entity = room.entities.get_mut(id).expect("id from live map");
            match entity.update_auth_state(room.tick) {
                ControlChange::Grant => entity.set_controlled(true),
                ControlChange::Revoke => entity.set_controlled(false),
                ControlChange::None => {}
            }
        }
        for id in &ids {
            let entity = room.entities.get_mut(id).expect("id from live map");
            entity.client_update(self.local_tick);
        }

        // Entities past their removal tick leave the room; their view
        // entries stay behind until they age out, which is what carries
        // the final acknowledgment back.
        let removed: Vec<EntityId> = room
            .entities
            .iter()
            .filter(|(_, entity)| {
                let tick = entity.removed_tick();
                tick.is_valid() && room.tick >= tick
            })
            .map(|(&id, _)| id)
            .collect();
        for id in removed {
            room.entities.remove(&id);
            room.departed.insert(id);
            if let Some(callback) = &mut room.entity_removed {
                callback(id);
            }
        }

        // Send.
        if self.local_tick.is_send_tick(CLIENT_SEND_RATE) {
            for event in room.pending_events.drain(..) {
                peer.queue_event(event.kind, event.payload, event.attempts, Tick::INVALID);
            }
            room.view.prune(room.tick);
            let view = room.view.sorted_entries();
            let updates: Vec<CommandUpdate<C>> = room
                .entities
                .values()
                .filter(|entity| entity.is_controlled())
                .filter_map(|entity| entity.command_update())
                .collect();
            let header = peer.header_for_send(self.local_tick);
            let mut buf = BitBuffer::with_capacity_bytes(DATA_BUFFER_SIZE);
            let event_ids: Vec<EventId> = {
                let events = peer.events_for_send(self.local_tick);
                let (events_written, _, _) =
                    encode_client_packet(&mut buf, &header, &events, &view, &updates);
                events_written.iter().map(|&i| events[i].id).collect()
            };
            peer.after_send(&event_ids, self.local_tick);
            let payload = buf.store();
            peer.send(&payload);
        }

        if let Some(callback) = &mut room.post_update {
            callback(room.tick);
        }
    }
}
