//! Shared schema for the headless demo: one kind of wandering actor, a
//! button-style movement command, and a chat event, synchronized over UDP.

pub mod schema;
pub mod socket;

pub use schema::{ActorLogic, ActorState, Buttons, ChatEvent, MoveCommand, build_registry};
pub use socket::{ClientChannel, ServerSocket};

pub const DEFAULT_PORT: u16 = 27100;
pub const DEFAULT_TICK_RATE: u32 = 60;
