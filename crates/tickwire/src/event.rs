use std::any::Any;
use std::fmt;

use crate::bits::BitBuffer;
use crate::error::DecodeError;
use crate::sim::Tick;

/// A user-defined out-of-band message, retried until acknowledged or out of
/// attempts.
pub trait EventData: Clone + fmt::Debug + 'static {
    fn encode(&self, buf: &mut BitBuffer);
    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Object-safe face of [`EventData`]; blanket-implemented.
pub trait DynEvent: Any + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn clone_dyn(&self) -> Box<dyn DynEvent>;
    fn encode_dyn(&self, buf: &mut BitBuffer);
}

impl<E: EventData> DynEvent for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_dyn(&self) -> Box<dyn DynEvent> {
        Box::new(self.clone())
    }

    fn encode_dyn(&self, buf: &mut BitBuffer) {
        self.encode(buf);
    }
}

/// Discriminator for a registered event schema, assigned by registration
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTypeId(pub u32);

impl EventTypeId {
    pub fn encode(self, buf: &mut BitBuffer) {
        buf.write_varint(self.0);
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<EventTypeId, DecodeError> {
        Ok(EventTypeId(buf.read_varint()?))
    }
}

/// Per-peer unique id for a reliable event. Monotonic from [`EventId::START`];
/// 0 is the invalid sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u32);

impl EventId {
    pub const INVALID: EventId = EventId(0);
    pub const START: EventId = EventId(1);

    pub fn from_raw(raw: u32) -> Self {
        EventId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    pub fn next(self) -> EventId {
        EventId(self.0 + 1)
    }

    pub fn prev(self) -> EventId {
        EventId(self.0.saturating_sub(1))
    }

    pub fn encode(self, buf: &mut BitBuffer) {
        buf.write_varint(self.0);
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<EventId, DecodeError> {
        Ok(EventId(buf.read_varint()?))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Decodes event payloads for a type id; implemented by the registry.
pub trait EventDecoder {
    fn decode_event(&self, kind: EventTypeId, buf: &mut BitBuffer) -> Result<Box<dyn DynEvent>, DecodeError>;
}

/// An event queued for (re)delivery to one peer.
#[derive(Debug)]
pub struct OutgoingEvent {
    pub id: EventId,
    pub kind: EventTypeId,
    pub payload: Box<dyn DynEvent>,
    pub attempts_left: u16,
    /// Stop resending once the local tick passes this; invalid means never.
    pub expires: Tick,
}

impl OutgoingEvent {
    pub fn encode(&self, buf: &mut BitBuffer) {
        self.id.encode(buf);
        self.kind.encode(buf);
        self.payload.encode_dyn(buf);
    }
}

/// An event received from a peer, after duplicate filtering.
#[derive(Debug)]
pub struct ReceivedEvent {
    pub id: EventId,
    pub kind: EventTypeId,
    pub payload: Box<dyn DynEvent>,
}

impl ReceivedEvent {
    pub fn decode(buf: &mut BitBuffer, events: &dyn EventDecoder) -> Result<Self, DecodeError> {
        let id = EventId::decode(buf)?;
        let kind = EventTypeId::decode(buf)?;
        let payload = events.decode_event(kind, buf)?;
        Ok(ReceivedEvent { id, kind, payload })
    }

    /// Typed view of the payload.
    pub fn get<E: EventData>(&self) -> Option<&E> {
        self.payload.as_any().downcast_ref::<E>()
    }
}
