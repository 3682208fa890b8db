mod client;
mod server;

pub use client::{Client, ClientRoom};
pub use server::{ScopeFilter, Server, ServerRoom};

use crate::event::{DynEvent, EventTypeId};
use crate::sim::Tick;

/// An event raised on a room, waiting to be fanned out to peers on the
/// next update.
pub(crate) struct PendingEvent {
    pub kind: EventTypeId,
    pub payload: Box<dyn DynEvent>,
    pub attempts: u16,
}

/// Room lifecycle callbacks share one shape: they observe a tick.
pub(crate) type TickCallback = Box<dyn FnMut(Tick)>;
