mod history;
mod packet;
mod peer;
mod sequence;
mod stats;
mod transport;

pub use history::{HISTORY_CHUNKS, SequenceHistory};
pub use peer::{ClientId, DEFAULT_EVENT_ATTEMPTS};
pub use sequence::{SEQUENCE_BITS, SequenceId};
pub use stats::NetworkStats;
pub use transport::{LoopbackTransport, LossHandle, Transport, UdpTransport};

pub(crate) use packet::{decode_client_packet, decode_server_packet, encode_client_packet, encode_server_packet};
pub(crate) use peer::Peer;
