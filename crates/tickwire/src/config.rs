//! Protocol constants both ends must agree on, plus the host-tunable knobs.
//!
//! The send rates are protocol-level because they double as dejitter slot
//! divisors: a receiver sizes its rings assuming one stored value per
//! producer send tick.

/// Server ticks per state packet.
pub const SERVER_SEND_RATE: u32 = 2;
/// Client ticks per command packet.
pub const CLIENT_SEND_RATE: u32 = 2;

/// Most recent commands resent per controlled entity per packet.
pub const COMMAND_SEND_COUNT: usize = 40;
/// Unacknowledged commands a client keeps for replay.
pub const COMMAND_BUFFER_COUNT: usize = 40;

/// Slots in the command and delta dejitter rings and in the server-side
/// record history.
pub const DEJITTER_BUFFER_LENGTH: usize = 50;

/// Acknowledgment entries older than this many ticks are dropped from the
/// client's view.
pub const VIEW_TICKS: u32 = 100;

/// Initial packet scratch size in bytes.
pub const DATA_BUFFER_SIZE: usize = 2048;

/// Hard payload ceiling handed to the transport.
pub const MAX_PACKET_SIZE: usize = 1200;
/// Byte budget for the reliable-event block at the front of each packet,
/// reserved early so state floods cannot starve small messages.
pub const EVENT_BLOCK_BYTES: usize = 370;
/// Byte budget for the command section of a client packet.
pub const COMMAND_BLOCK_BYTES: usize = 670;

/// Per-item ceilings inside packed lists.
pub const MAX_ENTITY_BYTES: usize = 100;
pub const MAX_EVENT_BYTES: usize = 100;
pub const MAX_COMMAND_UPDATE_BYTES: usize = 335;
pub const MAX_VIEW_ENTRY_BYTES: usize = 16;

/// Host-chosen settings that do not touch the wire format.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Seconds per simulation tick; converts transport RTT into ticks for
    /// remote clock estimation. The engine itself never reads a wall clock.
    pub tick_duration: f32,
    /// Extra ticks of lead added to the remote clock estimate so freshly
    /// arrived data sits in front of the playhead instead of behind it.
    pub remote_tick_lead: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            tick_duration: 1.0 / 60.0,
            remote_tick_lead: 1,
        }
    }
}
