//! Client/server state synchronization for tick-based games.
//!
//! An authoritative server simulates the world at a fixed tick rate and
//! ships delta-compressed snapshots of the entities each client can see;
//! clients predict the outcome of their own inputs and reconcile when the
//! authoritative data arrives. Everything rides on a lossy datagram
//! transport supplied by the host; the engine restores order with sequence
//! ids and tick-indexed dejitter buffers, and is strictly single-threaded.

pub mod bits;
pub mod command;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod net;
pub mod pool;
pub mod registry;
pub mod room;
pub mod scope;
pub mod sim;
pub mod state;

pub use bits::{BitBuffer, FloatCompressor, IntCompressor, MAX_STRING_LENGTH};
pub use command::{Command, CommandData, CommandUpdate};
pub use config::{
    CLIENT_SEND_RATE, COMMAND_BUFFER_COUNT, COMMAND_SEND_COUNT, DEJITTER_BUFFER_LENGTH,
    MAX_PACKET_SIZE, RoomConfig, SERVER_SEND_RATE,
};
pub use entity::{EntityId, EntityLogic, UpdateOrder};
pub use error::DecodeError;
pub use event::{DynEvent, EventData, EventId, EventTypeId, ReceivedEvent};
pub use net::{
    ClientId, DEFAULT_EVENT_ATTEMPTS, LoopbackTransport, LossHandle, NetworkStats, SequenceId,
    Transport, UdpTransport,
};
pub use pool::Pool;
pub use registry::Registry;
pub use room::{Client, ClientRoom, ScopeFilter, Server, ServerRoom};
pub use scope::{Scope, View, ViewEntry};
pub use sim::{DejitterBuffer, QueueBuffer, Tick, TickStamped};
pub use state::{DynState, FactoryType, FieldFlags, StateData, StateDelta};
