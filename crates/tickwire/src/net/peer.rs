use std::collections::BTreeSet;

use log::{debug, warn};

use super::history::SequenceHistory;
use super::packet::PacketHeader;
use super::sequence::SequenceId;
use super::stats::NetworkStats;
use super::transport::Transport;
use crate::config::RoomConfig;
use crate::event::{DynEvent, EventId, EventTypeId, OutgoingEvent};
use crate::sim::Tick;

/// Identifies a connected client on the server. The client side never sees
/// these; it only knows whether it controls an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// How many out-of-order event acknowledgments ride in one header.
const MAX_HEADER_EVENT_ACKS: usize = 32;
/// Default retry budget for a reliable event.
pub const DEFAULT_EVENT_ATTEMPTS: u16 = 10;

/// Everything the engine tracks per remote end: packet sequencing and
/// dedup, the reliable-event pipeline in both directions, the remote tick
/// estimate, and traffic counters.
pub(crate) struct Peer {
    transport: Box<dyn Transport>,
    next_sequence: SequenceId,
    received: SequenceHistory,
    // Outgoing reliable events.
    outgoing_events: Vec<OutgoingEvent>,
    next_event_id: EventId,
    // Incoming event dedup: ids at or below the frontier are delivered;
    // `ahead` holds ids that arrived past a gap.
    event_frontier: EventId,
    ahead: BTreeSet<u32>,
    // The freshest tick the remote stamped on a packet, and a smoothed,
    // never-regressing estimate of where its clock is now.
    latest_remote_tick: Tick,
    estimated_remote_tick: Tick,
    stats: NetworkStats,
}

impl Peer {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            next_sequence: SequenceId::START,
            received: SequenceHistory::new(),
            outgoing_events: Vec::new(),
            next_event_id: EventId::START,
            event_frontier: EventId::INVALID,
            ahead: BTreeSet::new(),
            latest_remote_tick: Tick::INVALID,
            estimated_remote_tick: Tick::INVALID,
            stats: NetworkStats::default(),
        }
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Where the remote clock should be about now: the freshest tick it
    /// sent, led by half the round trip. Never steps backwards.
    pub fn estimated_remote_tick(&self) -> Tick {
        self.estimated_remote_tick
    }

    /// Drains every payload the transport has queued.
    pub fn poll_transport(&mut self, out: &mut Vec<Vec<u8>>) {
        while let Some(payload) = self.transport.receive() {
            self.stats.packets_received += 1;
            self.stats.bytes_received += payload.len() as u64;
            out.push(payload);
        }
    }

    /// Validates an arriving packet header. Returns false when the packet
    /// is a duplicate or fell out of the sequence window and must be
    /// dropped whole.
    pub fn begin_receive(&mut self, header: &PacketHeader, config: &RoomConfig) -> bool {
        if !self.received.is_new(header.sequence) {
            self.stats.packets_dropped += 1;
            debug!("dropping stale or duplicate packet");
            return false;
        }
        self.received.store(header.sequence);
        if header.sender_tick > self.latest_remote_tick {
            self.latest_remote_tick = header.sender_tick;
            self.update_remote_estimate(config);
        }
        self.process_event_acks(header);
        true
    }

    fn update_remote_estimate(&mut self, config: &RoomConfig) {
        self.stats.rtt = self.transport.ping();
        let lead_ticks = match self.stats.rtt {
            Some(rtt) if config.tick_duration > 0.0 => {
                (rtt * 0.5 / config.tick_duration).ceil() as u32
            }
            _ => 0,
        };
        let estimate = self.latest_remote_tick + (lead_ticks + config.remote_tick_lead);
        if estimate > self.estimated_remote_tick {
            self.estimated_remote_tick = estimate;
        }
    }

    fn process_event_acks(&mut self, header: &PacketHeader) {
        if header.ack_event_id.is_valid() || !header.event_acks.is_empty() {
            self.outgoing_events.retain(|event| {
                event.id > header.ack_event_id && !header.event_acks.contains(&event.id)
            });
        }
    }

    /// Queues a reliable event for delivery to this peer.
    pub fn queue_event(
        &mut self,
        kind: EventTypeId,
        payload: Box<dyn DynEvent>,
        attempts: u16,
        expires: Tick,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.next();
        self.outgoing_events.push(OutgoingEvent {
            id,
            kind,
            payload,
            attempts_left: attempts.max(1),
            expires,
        });
        id
    }

    /// Events eligible for this packet, lowest id first.
    pub fn events_for_send(&self, local_tick: Tick) -> Vec<&OutgoingEvent> {
        self.outgoing_events
            .iter()
            .filter(|event| !event.expires.is_valid() || local_tick <= event.expires)
            .collect()
    }

    /// Burns one attempt on each event that made it into the packet and
    /// drops the ones that are out of budget or expired.
    pub fn after_send(&mut self, written_ids: &[EventId], local_tick: Tick) {
        for event in &mut self.outgoing_events {
            if written_ids.contains(&event.id) {
                event.attempts_left = event.attempts_left.saturating_sub(1);
            }
        }
        self.outgoing_events.retain(|event| {
            if event.attempts_left == 0 {
                warn!("reliable event {} ran out of attempts, dropped", event.id);
                return false;
            }
            if event.expires.is_valid() && local_tick > event.expires {
                warn!("reliable event {} expired before delivery, dropped", event.id);
                return false;
            }
            true
        });
    }

    /// Filters arriving events down to first deliveries and advances the
    /// contiguous frontier.
    pub fn accept_event(&mut self, id: EventId) -> bool {
        if !id.is_valid() || id <= self.event_frontier {
            return false;
        }
        if id == self.event_frontier.next() {
            self.event_frontier = id;
            // The gap may have just closed.
            while self.ahead.remove(&self.event_frontier.next().raw()) {
                self.event_frontier = self.event_frontier.next();
            }
            true
        } else {
            self.ahead.insert(id.raw())
        }
    }

    /// Header for the next outgoing packet.
    pub fn header_for_send(&mut self, sender_tick: Tick) -> PacketHeader {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.next();
        let event_acks = self
            .ahead
            .iter()
            .take(MAX_HEADER_EVENT_ACKS)
            .map(|&raw| EventId::from_raw(raw))
            .collect();
        PacketHeader {
            sequence,
            sender_tick,
            ack_tick: self.latest_remote_tick,
            ack_event_id: self.event_frontier,
            event_acks,
        }
    }

    pub fn send(&mut self, payload: &[u8]) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        self.transport.send_payload(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::LoopbackTransport;

    fn test_peer() -> Peer {
        let (transport, _other) = LoopbackTransport::pair();
        Peer::new(Box::new(transport))
    }

    fn header(sequence: u16, tick: u32) -> PacketHeader {
        PacketHeader {
            sequence: SequenceId::from_id(sequence),
            sender_tick: Tick::from_raw(tick),
            ack_tick: Tick::INVALID,
            ack_event_id: EventId::INVALID,
            event_acks: Vec::new(),
        }
    }

    #[test]
    fn duplicate_packets_are_rejected() {
        let mut peer = test_peer();
        let config = RoomConfig::default();
        assert!(peer.begin_receive(&header(1, 10), &config));
        assert!(!peer.begin_receive(&header(1, 10), &config));
        assert!(peer.begin_receive(&header(2, 12), &config));
    }

    #[test]
    fn event_frontier_advances_through_gaps() {
        let mut peer = test_peer();
        assert!(peer.accept_event(EventId::from_raw(1)));
        assert!(peer.accept_event(EventId::from_raw(3)));
        assert!(!peer.accept_event(EventId::from_raw(3)));
        // Delivering 2 closes the gap and the frontier jumps to 3.
        assert!(peer.accept_event(EventId::from_raw(2)));
        assert!(!peer.accept_event(EventId::from_raw(1)));
        let header = peer.header_for_send(Tick::START);
        assert_eq!(header.ack_event_id, EventId::from_raw(3));
        assert!(header.event_acks.is_empty());
    }

    #[test]
    fn acked_events_stop_resending() {
        let mut peer = test_peer();
        #[derive(Debug, Clone, Default)]
        struct Nop;
        impl crate::event::EventData for Nop {
            fn encode(&self, _buf: &mut crate::bits::BitBuffer) {}
            fn decode(_buf: &mut crate::bits::BitBuffer) -> Result<Self, crate::error::DecodeError> {
                Ok(Nop)
            }
        }
        peer.queue_event(EventTypeId(0), Box::new(Nop), 5, Tick::INVALID);
        peer.queue_event(EventTypeId(0), Box::new(Nop), 5, Tick::INVALID);
        assert_eq!(peer.events_for_send(Tick::START).len(), 2);

        let mut ack = header(1, 5);
        ack.ack_event_id = EventId::from_raw(1);
        peer.begin_receive(&ack, &RoomConfig::default());
        assert_eq!(peer.events_for_send(Tick::START).len(), 1);
    }

    #[test]
    fn attempts_run_out_with_a_drop() {
        let mut peer = test_peer();
        #[derive(Debug, Clone, Default)]
        struct Nop;
        impl crate::event::EventData for Nop {
            fn encode(&self, _buf: &mut crate::bits::BitBuffer) {}
            fn decode(_buf: &mut crate::bits::BitBuffer) -> Result<Self, crate::error::DecodeError> {
                Ok(Nop)
            }
        }
        let id = peer.queue_event(EventTypeId(0), Box::new(Nop), 2, Tick::INVALID);
        peer.after_send(&[id], Tick::START);
        assert_eq!(peer.events_for_send(Tick::START).len(), 1);
        peer.after_send(&[id], Tick::START);
        assert!(peer.events_for_send(Tick::START).is_empty());
    }

    #[test]
    fn remote_estimate_never_regresses() {
        let mut peer = test_peer();
        let config = RoomConfig::default();
        peer.begin_receive(&header(1, 20), &config);
        let first = peer.estimated_remote_tick();
        peer.begin_receive(&header(2, 18), &config);
        assert_eq!(peer.estimated_remote_tick(), first);
        peer.begin_receive(&header(3, 30), &config);
        assert!(peer.estimated_remote_tick() > first);
    }
}
