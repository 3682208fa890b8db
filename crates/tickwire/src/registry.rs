use std::any::TypeId;
use std::collections::HashMap;

use crate::bits::BitBuffer;
use crate::command::CommandData;
use crate::entity::{ClientEntity, ClientEntitySlot, EntityId, EntityLogic, ServerEntity, ServerEntitySlot};
use crate::error::DecodeError;
use crate::event::{DynEvent, EventData, EventDecoder, EventTypeId};
use crate::state::{DynState, FactoryType, StateData, StateFactory};

type MakeServer<C> = Box<dyn Fn(EntityId, FactoryType) -> Box<dyn ServerEntitySlot<C>>>;
type MakeClient<C> = Box<dyn Fn(EntityId, FactoryType) -> Box<dyn ClientEntitySlot<C>>>;
type MakeState = Box<dyn Fn() -> Box<dyn DynState>>;
type DecodeEvent = Box<dyn Fn(&mut BitBuffer) -> Result<Box<dyn DynEvent>, DecodeError>>;

struct EntityEntry<C: CommandData> {
    make_server: MakeServer<C>,
    make_client: MakeClient<C>,
    make_state: MakeState,
    flag_count: u32,
}

struct EventEntry {
    decode: DecodeEvent,
}

/// The protocol definition both ends are built from: every entity schema
/// (keyed by registration order) and every event schema. The command type
/// is fixed by the type parameter; registration order must match across
/// server and client or the wire ids will disagree.
pub struct Registry<C: CommandData> {
    entities: Vec<EntityEntry<C>>,
    entity_index: HashMap<TypeId, usize>,
    events: Vec<EventEntry>,
    event_index: HashMap<TypeId, usize>,
}

impl<C: CommandData> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CommandData> Registry<C> {
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            entity_index: HashMap::new(),
            events: Vec::new(),
            event_index: HashMap::new(),
        }
    }

    /// Registers an entity schema. The returned factory type is its wire
    /// discriminator.
    pub fn add_entity_type<L>(&mut self) -> FactoryType
    where
        L: EntityLogic<C> + Default,
    {
        let factory = FactoryType(self.entities.len() as u32);
        let previous = self.entity_index.insert(TypeId::of::<L>(), self.entities.len());
        assert!(previous.is_none(), "entity type registered twice");
        self.entities.push(EntityEntry {
            make_server: Box::new(|id, factory| {
                Box::new(ServerEntity::<C, L>::new(id, factory, L::default())) as Box<dyn ServerEntitySlot<C>>
            }),
            make_client: Box::new(|id, factory| {
                Box::new(ClientEntity::<C, L>::new(id, factory, L::default())) as Box<dyn ClientEntitySlot<C>>
            }),
            make_state: Box::new(|| Box::new(<L::State as Default>::default()) as Box<dyn DynState>),
            flag_count: <L::State as StateData>::FLAG_COUNT,
        });
        factory
    }

    /// Registers an event schema; the returned id is its wire discriminator.
    pub fn add_event_type<E: EventData>(&mut self) -> EventTypeId {
        let kind = EventTypeId(self.events.len() as u32);
        let previous = self.event_index.insert(TypeId::of::<E>(), self.events.len());
        assert!(previous.is_none(), "event type registered twice");
        self.events.push(EventEntry {
            decode: Box::new(|buf| Ok(Box::new(E::decode(buf)?) as Box<dyn DynEvent>)),
        });
        kind
    }

    pub fn factory_of<L>(&self) -> Option<FactoryType>
    where
        L: EntityLogic<C> + Default,
    {
        self.entity_index
            .get(&TypeId::of::<L>())
            .map(|&index| FactoryType(index as u32))
    }

    pub fn event_type_of<E: EventData>(&self) -> Option<EventTypeId> {
        self.event_index
            .get(&TypeId::of::<E>())
            .map(|&index| EventTypeId(index as u32))
    }

    pub(crate) fn create_server_entity(
        &self,
        factory: FactoryType,
        id: EntityId,
    ) -> Option<Box<dyn ServerEntitySlot<C>>> {
        let entry = self.entities.get(factory.0 as usize)?;
        Some((entry.make_server)(id, factory))
    }

    pub(crate) fn create_client_entity(
        &self,
        factory: FactoryType,
        id: EntityId,
    ) -> Option<Box<dyn ClientEntitySlot<C>>> {
        let entry = self.entities.get(factory.0 as usize)?;
        Some((entry.make_client)(id, factory))
    }

    pub fn entity_type_count(&self) -> usize {
        self.entities.len()
    }
}

impl<C: CommandData> StateFactory for Registry<C> {
    fn create_state(&self, factory: FactoryType) -> Option<Box<dyn DynState>> {
        self.entities.get(factory.0 as usize).map(|entry| (entry.make_state)())
    }

    fn state_flag_count(&self, factory: FactoryType) -> Option<u32> {
        self.entities.get(factory.0 as usize).map(|entry| entry.flag_count)
    }
}

impl<C: CommandData> EventDecoder for Registry<C> {
    fn decode_event(
        &self,
        kind: EventTypeId,
        buf: &mut BitBuffer,
    ) -> Result<Box<dyn DynEvent>, DecodeError> {
        let entry = self
            .events
            .get(kind.0 as usize)
            .ok_or(DecodeError::UnknownEventType(kind.0))?;
        (entry.decode)(buf)
    }
}
