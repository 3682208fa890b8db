mod dejitter;
mod tick;

pub use dejitter::{DejitterBuffer, QueueBuffer};
pub use tick::{Tick, TickStamped};
