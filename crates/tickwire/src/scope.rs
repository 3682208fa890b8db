use std::collections::HashMap;

use crate::bits::BitBuffer;
use crate::config::VIEW_TICKS;
use crate::entity::EntityId;
use crate::error::DecodeError;
use crate::sim::Tick;

/// One client-side acknowledgment: the newest server tick seen for an
/// entity, the local tick it arrived on, and whether the entity was frozen
/// at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewEntry {
    pub last_received_tick: Tick,
    pub local_tick: Tick,
    pub is_frozen: bool,
}

impl ViewEntry {
    pub fn encode(&self, entity_id: EntityId, buf: &mut BitBuffer) {
        entity_id.encode(buf);
        self.last_received_tick.encode(buf);
        self.local_tick.encode(buf);
        buf.write_bool(self.is_frozen);
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<(EntityId, ViewEntry), DecodeError> {
        let entity_id = EntityId::decode(buf)?;
        let entry = ViewEntry {
            last_received_tick: Tick::decode(buf)?,
            local_tick: Tick::decode(buf)?,
            is_frozen: buf.read_bool()?,
        };
        Ok((entity_id, entry))
    }
}

/// The client's running summary of what it has received, sent back to the
/// server as its acknowledgment state.
#[derive(Debug, Default)]
pub struct View {
    entries: HashMap<EntityId, ViewEntry>,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received delta; older ticks never overwrite newer ones.
    pub fn record(&mut self, entity_id: EntityId, tick: Tick, local_tick: Tick, is_frozen: bool) {
        let entry = ViewEntry {
            last_received_tick: tick,
            local_tick,
            is_frozen,
        };
        match self.entries.get_mut(&entity_id) {
            Some(existing) => {
                if tick > existing.last_received_tick {
                    *existing = entry;
                }
            }
            None => {
                self.entries.insert(entity_id, entry);
            }
        }
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&ViewEntry> {
        self.entries.get(&entity_id)
    }

    /// Entries newest-first, so when the packet fills up the freshest
    /// acknowledgments still make it out.
    pub fn sorted_entries(&self) -> Vec<(EntityId, ViewEntry)> {
        let mut entries: Vec<(EntityId, ViewEntry)> =
            self.entries.iter().map(|(&id, &entry)| (id, entry)).collect();
        entries.sort_by(|a, b| b.1.last_received_tick.cmp(&a.1.last_received_tick));
        entries
    }

    /// Drops acknowledgments that have aged out of relevance.
    pub fn prune(&mut self, current_tick: Tick) {
        if !current_tick.is_valid() {
            return;
        }
        self.entries
            .retain(|_, entry| current_tick - entry.last_received_tick <= i64::from(VIEW_TICKS));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Server-side bookkeeping for one client: what was last sent and last
/// acknowledged per entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeEntry {
    pub last_sent: Tick,
    pub last_acked: Tick,
    /// The client confirmed it is holding this entity frozen.
    pub acked_frozen: bool,
}

#[derive(Debug, Default)]
pub struct Scope {
    entries: HashMap<EntityId, ScopeEntry>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&ScopeEntry> {
        self.entries.get(&entity_id)
    }

    pub fn last_acked(&self, entity_id: EntityId) -> Tick {
        self.entries.get(&entity_id).map_or(Tick::INVALID, |e| e.last_acked)
    }

    pub fn last_sent(&self, entity_id: EntityId) -> Tick {
        self.entries.get(&entity_id).map_or(Tick::INVALID, |e| e.last_sent)
    }

    pub fn acked_frozen(&self, entity_id: EntityId) -> bool {
        self.entries.get(&entity_id).is_some_and(|e| e.acked_frozen)
    }

    pub fn mark_sent(&mut self, entity_id: EntityId, tick: Tick) {
        let entry = self.entries.entry(entity_id).or_default();
        if tick > entry.last_sent {
            entry.last_sent = tick;
        }
    }

    /// Folds a received view into the ack state; acks only move forward.
    pub fn integrate_acked(&mut self, view: &[(EntityId, ViewEntry)]) {
        for (entity_id, acked) in view {
            let entry = self.entries.entry(*entity_id).or_default();
            if acked.last_received_tick > entry.last_acked {
                entry.last_acked = acked.last_received_tick;
                entry.acked_frozen = acked.is_frozen;
            }
        }
    }

    /// True once this client no longer needs the removal delta: it either
    /// never saw the entity or has acknowledged past the removal tick.
    pub fn acked_removal(&self, entity_id: EntityId, removed_tick: Tick) -> bool {
        match self.entries.get(&entity_id) {
            None => true,
            Some(entry) => !entry.last_sent.is_valid() || entry.last_acked >= removed_tick,
        }
    }

    pub fn forget(&mut self, entity_id: EntityId) {
        self.entries.remove(&entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_keeps_newest() {
        let mut view = View::new();
        let id = EntityId::from_raw(1);
        view.record(id, Tick::from_raw(10), Tick::from_raw(5), false);
        view.record(id, Tick::from_raw(8), Tick::from_raw(6), true);
        assert_eq!(view.get(id).unwrap().last_received_tick, Tick::from_raw(10));
        assert!(!view.get(id).unwrap().is_frozen);
    }

    #[test]
    fn view_sorts_newest_first() {
        let mut view = View::new();
        view.record(EntityId::from_raw(1), Tick::from_raw(4), Tick::START, false);
        view.record(EntityId::from_raw(2), Tick::from_raw(9), Tick::START, false);
        view.record(EntityId::from_raw(3), Tick::from_raw(6), Tick::START, false);
        let order: Vec<u16> = view.sorted_entries().iter().map(|(id, _)| id.raw()).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn view_prunes_stale_entries() {
        let mut view = View::new();
        view.record(EntityId::from_raw(1), Tick::from_raw(5), Tick::START, false);
        view.record(EntityId::from_raw(2), Tick::from_raw(200), Tick::START, false);
        view.prune(Tick::from_raw(200));
        assert!(view.get(EntityId::from_raw(1)).is_none());
        assert!(view.get(EntityId::from_raw(2)).is_some());
    }

    #[test]
    fn scope_acks_are_monotonic() {
        let mut scope = Scope::new();
        let id = EntityId::from_raw(7);
        let entry = |tick: u32, frozen: bool| ViewEntry {
            last_received_tick: Tick::from_raw(tick),
            local_tick: Tick::START,
            is_frozen: frozen,
        };
        scope.integrate_acked(&[(id, entry(10, false))]);
        scope.integrate_acked(&[(id, entry(6, true))]);
        assert_eq!(scope.last_acked(id), Tick::from_raw(10));
        assert!(!scope.acked_frozen(id));
    }

    #[test]
    fn removal_ack_logic() {
        let mut scope = Scope::new();
        let id = EntityId::from_raw(3);
        let removed = Tick::from_raw(20);
        // Never in scope at all: nothing owed.
        assert!(scope.acked_removal(id, removed));
        scope.mark_sent(id, Tick::from_raw(19));
        assert!(!scope.acked_removal(id, removed));
        scope.integrate_acked(&[(
            id,
            ViewEntry {
                last_received_tick: Tick::from_raw(21),
                local_tick: Tick::START,
                is_frozen: false,
            },
        )]);
        assert!(scope.acked_removal(id, removed));
    }
}
