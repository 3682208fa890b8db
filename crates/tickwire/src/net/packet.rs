use super::sequence::SequenceId;
use crate::bits::{BitBuffer, read_packed, write_packed};
use crate::command::{CommandData, CommandUpdate};
use crate::config::{
    COMMAND_BLOCK_BYTES, EVENT_BLOCK_BYTES, MAX_COMMAND_UPDATE_BYTES, MAX_ENTITY_BYTES,
    MAX_EVENT_BYTES, MAX_PACKET_SIZE, MAX_VIEW_ENTRY_BYTES,
};
use crate::entity::EntityId;
use crate::error::DecodeError;
use crate::event::{EventDecoder, EventId, OutgoingEvent, ReceivedEvent};
use crate::scope::ViewEntry;
use crate::sim::Tick;
use crate::state::{StateDelta, StateFactory, decode_delta, encode_delta};

/// Leave room for the store sentinel when budgeting against the MTU.
const PACKET_BUDGET: usize = MAX_PACKET_SIZE - 1;

/// Fields every packet opens with, in both directions.
#[derive(Debug, Clone)]
pub(crate) struct PacketHeader {
    pub sequence: SequenceId,
    pub sender_tick: Tick,
    /// Most recent remote tick this sender has seen.
    pub ack_tick: Tick,
    /// Highest contiguously delivered reliable-event id.
    pub ack_event_id: EventId,
    /// Ids delivered ahead of the contiguous frontier.
    pub event_acks: Vec<EventId>,
}

impl PacketHeader {
    fn encode(&self, buf: &mut BitBuffer) {
        self.sequence.encode(buf);
        self.sender_tick.encode(buf);
        self.ack_tick.encode(buf);
        self.ack_event_id.encode(buf);
        debug_assert!(self.event_acks.len() <= u8::MAX as usize);
        buf.write(8, self.event_acks.len() as u32);
        for ack in &self.event_acks {
            ack.encode(buf);
        }
    }

    fn decode(buf: &mut BitBuffer) -> Result<Self, DecodeError> {
        let sequence = SequenceId::decode(buf)?;
        let sender_tick = Tick::decode(buf)?;
        let ack_tick = Tick::decode(buf)?;
        let ack_event_id = EventId::decode(buf)?;
        let ack_count = buf.read(8)? as usize;
        let mut event_acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            event_acks.push(EventId::decode(buf)?);
        }
        Ok(PacketHeader {
            sequence,
            sender_tick,
            ack_tick,
            ack_event_id,
            event_acks,
        })
    }
}

fn write_event_block(buf: &mut BitBuffer, events: &[&OutgoingEvent]) -> Vec<usize> {
    // Events get their own early reservation so state cannot starve them.
    let cap = (buf.byte_size() + EVENT_BLOCK_BYTES).min(PACKET_BUDGET);
    write_packed(
        buf,
        cap,
        MAX_EVENT_BYTES,
        events,
        |buf, event| event.encode(buf),
        |event| format!("event {}", event.id),
    )
}

fn read_event_block(
    buf: &mut BitBuffer,
    events: &dyn EventDecoder,
) -> Result<Vec<ReceivedEvent>, DecodeError> {
    read_packed(buf, |buf| ReceivedEvent::decode(buf, events))
}

/// Server-to-client: header, events, then as many state deltas as fit.
/// Returns which events and which deltas were written.
pub(crate) fn encode_server_packet(
    buf: &mut BitBuffer,
    header: &PacketHeader,
    events: &[&OutgoingEvent],
    deltas: &[StateDelta],
) -> (Vec<usize>, Vec<usize>) {
    header.encode(buf);
    let events_written = write_event_block(buf, events);
    let deltas_written = write_packed(
        buf,
        PACKET_BUDGET,
        MAX_ENTITY_BYTES,
        deltas,
        |buf, delta| encode_delta(delta, buf),
        |delta| format!("delta for entity {}", delta.entity_id),
    );
    (events_written, deltas_written)
}

#[derive(Debug)]
pub(crate) struct ServerPacketIn {
    pub header: PacketHeader,
    pub events: Vec<ReceivedEvent>,
    pub deltas: Vec<StateDelta>,
}

pub(crate) fn decode_server_packet(
    data: &[u8],
    states: &dyn StateFactory,
    events: &dyn EventDecoder,
) -> Result<ServerPacketIn, DecodeError> {
    let mut buf = BitBuffer::with_capacity_bytes(data.len());
    buf.load(data)?;
    let header = PacketHeader::decode(&mut buf)?;
    let received_events = read_event_block(&mut buf, events)?;
    let mut deltas = read_packed(&mut buf, |buf| decode_delta(buf, states))?;
    if !buf.is_finished() {
        return Err(DecodeError::Malformed("trailing bits after payload"));
    }
    // Deltas inherit the tick they were sent on.
    for delta in &mut deltas {
        delta.tick = header.sender_tick;
    }
    Ok(ServerPacketIn {
        header,
        events: received_events,
        deltas,
    })
}

/// Client-to-server: header, events, the ack view, then command updates.
/// Returns which events, view entries, and updates were written.
pub(crate) fn encode_client_packet<C: CommandData>(
    buf: &mut BitBuffer,
    header: &PacketHeader,
    events: &[&OutgoingEvent],
    view: &[(EntityId, ViewEntry)],
    updates: &[CommandUpdate<C>],
) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    header.encode(buf);
    let events_written = write_event_block(buf, events);
    // The command section has a guaranteed budget; the view takes what is
    // left in front of it.
    let view_cap = PACKET_BUDGET.saturating_sub(COMMAND_BLOCK_BYTES);
    let view_written = write_packed(
        buf,
        view_cap,
        MAX_VIEW_ENTRY_BYTES,
        view,
        |buf, (entity_id, entry)| entry.encode(*entity_id, buf),
        |(entity_id, _)| format!("view entry for entity {entity_id}"),
    );
    let command_cap = (buf.byte_size() + COMMAND_BLOCK_BYTES).min(PACKET_BUDGET);
    let updates_written = write_packed(
        buf,
        command_cap,
        MAX_COMMAND_UPDATE_BYTES,
        updates,
        |buf, update| update.encode(buf),
        |update| format!("commands for entity {}", update.entity_id),
    );
    (events_written, view_written, updates_written)
}

#[derive(Debug)]
pub(crate) struct ClientPacketIn<C: CommandData> {
    pub header: PacketHeader,
    pub events: Vec<ReceivedEvent>,
    pub view: Vec<(EntityId, ViewEntry)>,
    pub updates: Vec<CommandUpdate<C>>,
}

pub(crate) fn decode_client_packet<C: CommandData>(
    data: &[u8],
    events: &dyn EventDecoder,
) -> Result<ClientPacketIn<C>, DecodeError> {
    let mut buf = BitBuffer::with_capacity_bytes(data.len());
    buf.load(data)?;
    let header = PacketHeader::decode(&mut buf)?;
    let received_events = read_event_block(&mut buf, events)?;
    let view = read_packed(&mut buf, ViewEntry::decode)?;
    let updates = read_packed(&mut buf, CommandUpdate::decode)?;
    if !buf.is_finished() {
        return Err(DecodeError::Malformed("trailing bits after payload"));
    }
    Ok(ClientPacketIn {
        header,
        events: received_events,
        view,
        updates,
    })
}
