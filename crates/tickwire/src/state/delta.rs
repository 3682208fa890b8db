use super::{DynState, FactoryType, FieldFlags, StateData, StateFactory, all_fields};
use crate::bits::BitBuffer;
use crate::entity::EntityId;
use crate::error::DecodeError;
use crate::sim::{Tick, TickStamped};

/// The state portion of a delta: which sections ride along and the source
/// values for them. The embedded state is a full snapshot; `flags` selects
/// what actually went (or goes) on the wire.
#[derive(Debug)]
pub struct DeltaPayload {
    pub factory: FactoryType,
    pub state: Box<dyn DynState>,
    pub flags: FieldFlags,
    pub has_controller: bool,
    pub has_immutable: bool,
}

/// One entity's update in one packet.
///
/// A frozen delta carries no payload at all; a removing delta still carries
/// the final state so the controller sees its terminal controller data. The
/// tick is not written per delta: it is stamped from the packet header on
/// decode.
#[derive(Debug)]
pub struct StateDelta {
    pub tick: Tick,
    pub entity_id: EntityId,
    pub payload: Option<DeltaPayload>,
    pub removed_tick: Tick,
    pub command_ack: Tick,
}

impl StateDelta {
    pub fn frozen(tick: Tick, entity_id: EntityId) -> Self {
        Self {
            tick,
            entity_id,
            payload: None,
            removed_tick: Tick::INVALID,
            command_ack: Tick::INVALID,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.payload.is_none()
    }
}

impl TickStamped for StateDelta {
    fn tick(&self) -> Tick {
        self.tick
    }
}

/// Diffs `current` against `basis` and builds the delta for one packet slot.
/// Returns `None` when nothing needs saying: no changed field, no section to
/// include, no removal to report.
#[allow(clippy::too_many_arguments)]
pub fn create_delta<S: StateData>(
    tick: Tick,
    entity_id: EntityId,
    factory: FactoryType,
    basis: Option<&S>,
    current: &S,
    include_controller: bool,
    include_immutable: bool,
    command_ack: Tick,
    removed_tick: Tick,
    force_all_mutable: bool,
) -> Option<StateDelta> {
    let flags = match basis {
        Some(basis) if !force_all_mutable => current.compare_mutable(basis),
        _ => all_fields(S::FLAG_COUNT),
    };
    if flags == 0 && !include_controller && !include_immutable && !removed_tick.is_valid() {
        return None;
    }
    Some(StateDelta {
        tick,
        entity_id,
        payload: Some(DeltaPayload {
            factory,
            state: Box::new(current.clone()),
            flags,
            has_controller: include_controller,
            has_immutable: include_immutable,
        }),
        removed_tick,
        command_ack,
    })
}

/// Copies the sections a payload carries onto `target`. `has_immutable` on
/// the target side is monotonic: once seen, it stays set.
pub fn apply_delta<S: StateData>(target: &mut S, seen_immutable: &mut bool, payload: &DeltaPayload) {
    let Some(source) = payload.state.as_any().downcast_ref::<S>() else {
        debug_assert!(false, "delta applied across schemas");
        return;
    };
    target.apply_mutable(source, payload.flags);
    if payload.has_controller {
        target.apply_controller(source);
    }
    if payload.has_immutable {
        target.apply_immutable(source);
        *seen_immutable = true;
    }
}

pub fn encode_delta(delta: &StateDelta, buf: &mut BitBuffer) {
    delta.entity_id.encode(buf);
    buf.write_bool(delta.is_frozen());
    let Some(payload) = &delta.payload else {
        return;
    };
    delta.removed_tick.encode(buf);
    delta.command_ack.encode(buf);
    payload.factory.encode(buf);
    let flag_count = payload.state.flag_count();
    let flags = payload.flags & all_fields(flag_count);
    buf.write(flag_count, flags);
    payload.state.encode_mutable_dyn(flags, buf);
    buf.write_bool(payload.has_controller);
    if payload.has_controller {
        payload.state.encode_controller_dyn(buf);
    }
    buf.write_bool(payload.has_immutable);
    if payload.has_immutable {
        payload.state.encode_immutable_dyn(buf);
    }
}

/// Decodes one delta. The tick stays invalid here; the packet layer stamps
/// it from the header.
pub fn decode_delta(buf: &mut BitBuffer, states: &dyn StateFactory) -> Result<StateDelta, DecodeError> {
    let entity_id = EntityId::decode(buf)?;
    if buf.read_bool()? {
        return Ok(StateDelta::frozen(Tick::INVALID, entity_id));
    }
    let removed_tick = Tick::decode(buf)?;
    let command_ack = Tick::decode(buf)?;
    let factory = FactoryType::decode(buf)?;
    let mut state = states
        .create_state(factory)
        .ok_or(DecodeError::UnknownFactoryType(factory.0))?;
    let flag_count = state.flag_count();
    let flags = buf.read(flag_count)?;
    state.decode_mutable_dyn(flags, buf)?;
    let has_controller = buf.read_bool()?;
    if has_controller {
        state.decode_controller_dyn(buf)?;
    }
    let has_immutable = buf.read_bool()?;
    if has_immutable {
        state.decode_immutable_dyn(buf)?;
    }
    Ok(StateDelta {
        tick: Tick::INVALID,
        entity_id,
        payload: Some(DeltaPayload {
            factory,
            state,
            flags,
            has_controller,
            has_immutable,
        }),
        removed_tick,
        command_ack,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{FloatCompressor, IntCompressor};

    const HEALTH: IntCompressor = IntCompressor::new(0, 1000);

    fn coord() -> FloatCompressor {
        FloatCompressor::new(-512.0, 512.0, 0.5)
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Soldier {
        x: f32,
        y: f32,
        health: i64,
        ammo: i64,
        squad: u32,
    }

    const FLAG_X: FieldFlags = 1 << 0;
    const FLAG_Y: FieldFlags = 1 << 1;
    const FLAG_HEALTH: FieldFlags = 1 << 2;

    impl StateData for Soldier {
        const FLAG_COUNT: u32 = 3;

        fn compare_mutable(&self, basis: &Self) -> FieldFlags {
            let mut flags = 0;
            if self.x != basis.x {
                flags |= FLAG_X;
            }
            if self.y != basis.y {
                flags |= FLAG_Y;
            }
            if self.health != basis.health {
                flags |= FLAG_HEALTH;
            }
            flags
        }

        fn apply_mutable(&mut self, source: &Self, flags: FieldFlags) {
            if flags & FLAG_X != 0 {
                self.x = source.x;
            }
            if flags & FLAG_Y != 0 {
                self.y = source.y;
            }
            if flags & FLAG_HEALTH != 0 {
                self.health = source.health;
            }
        }

        fn apply_controller(&mut self, source: &Self) {
            self.ammo = source.ammo;
        }

        fn apply_immutable(&mut self, source: &Self) {
            self.squad = source.squad;
        }

        fn encode_mutable(&self, flags: FieldFlags, buf: &mut BitBuffer) {
            if flags & FLAG_X != 0 {
                coord().write(buf, self.x);
            }
            if flags & FLAG_Y != 0 {
                coord().write(buf, self.y);
            }
            if flags & FLAG_HEALTH != 0 {
                HEALTH.write(buf, self.health);
            }
        }

        fn decode_mutable(&mut self, flags: FieldFlags, buf: &mut BitBuffer) -> Result<(), DecodeError> {
            if flags & FLAG_X != 0 {
                self.x = coord().read(buf)?;
            }
            if flags & FLAG_Y != 0 {
                self.y = coord().read(buf)?;
            }
            if flags & FLAG_HEALTH != 0 {
                self.health = HEALTH.read(buf)?;
            }
            Ok(())
        }

        fn encode_controller(&self, buf: &mut BitBuffer) {
            HEALTH.write(buf, self.ammo);
        }

        fn decode_controller(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
            self.ammo = HEALTH.read(buf)?;
            Ok(())
        }

        fn encode_immutable(&self, buf: &mut BitBuffer) {
            buf.write_varint(self.squad);
        }

        fn decode_immutable(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
            self.squad = buf.read_varint()?;
            Ok(())
        }
    }

    struct SoldierFactory;

    impl StateFactory for SoldierFactory {
        fn create_state(&self, factory: FactoryType) -> Option<Box<dyn DynState>> {
            (factory.0 == 0).then(|| Box::new(Soldier::default()) as Box<dyn DynState>)
        }

        fn state_flag_count(&self, factory: FactoryType) -> Option<u32> {
            (factory.0 == 0).then_some(Soldier::FLAG_COUNT)
        }
    }

    fn soldier(x: f32, y: f32, health: i64) -> Soldier {
        Soldier { x, y, health, ammo: 30, squad: 7 }
    }

    #[test]
    fn identical_states_produce_no_delta() {
        let basis = soldier(1.0, 2.0, 100);
        let delta = create_delta(
            Tick::START,
            EntityId::from_raw(1),
            FactoryType(0),
            Some(&basis),
            &basis.clone(),
            false,
            false,
            Tick::INVALID,
            Tick::INVALID,
            false,
        );
        assert!(delta.is_none());
    }

    #[test]
    fn self_delta_is_a_no_op() {
        let basis = soldier(1.0, 2.0, 100);
        // Controller data forces a delta even with zero flags.
        let delta = create_delta(
            Tick::START,
            EntityId::from_raw(1),
            FactoryType(0),
            Some(&basis),
            &basis.clone(),
            true,
            false,
            Tick::INVALID,
            Tick::INVALID,
            false,
        )
        .unwrap();
        let mut clone = basis.clone();
        let mut seen = false;
        apply_delta(&mut clone, &mut seen, delta.payload.as_ref().unwrap());
        assert_eq!(clone, basis);
    }

    #[test]
    fn full_delta_reproduces_target() {
        let basis = soldier(0.0, 0.0, 100);
        let target = soldier(42.0, 106.0, 55);
        let delta = create_delta(
            Tick::START,
            EntityId::from_raw(1),
            FactoryType(0),
            Some(&basis),
            &target,
            true,
            true,
            Tick::INVALID,
            Tick::INVALID,
            false,
        )
        .unwrap();

        let mut rebuilt = basis.clone();
        let mut seen = false;
        apply_delta(&mut rebuilt, &mut seen, delta.payload.as_ref().unwrap());
        assert_eq!(rebuilt, target);
        assert!(seen);
    }

    #[test]
    fn wire_round_trip_keeps_flagged_fields() {
        let basis = soldier(0.0, 0.0, 100);
        let mut target = basis.clone();
        target.y = -30.5;
        let delta = create_delta(
            Tick::from_raw(20),
            EntityId::from_raw(3),
            FactoryType(0),
            Some(&basis),
            &target,
            false,
            false,
            Tick::from_raw(18),
            Tick::INVALID,
            false,
        )
        .unwrap();

        let mut buf = BitBuffer::new();
        encode_delta(&delta, &mut buf);
        let decoded = decode_delta(&mut buf, &SoldierFactory).unwrap();
        assert!(buf.is_finished());

        assert_eq!(decoded.entity_id, EntityId::from_raw(3));
        assert_eq!(decoded.command_ack, Tick::from_raw(18));
        let payload = decoded.payload.unwrap();
        assert_eq!(payload.flags, FLAG_Y);
        let state = payload.state.as_any().downcast_ref::<Soldier>().unwrap();
        assert_eq!(state.y, -30.5);
    }

    #[test]
    fn frozen_delta_has_no_payload() {
        let delta = StateDelta::frozen(Tick::START, EntityId::from_raw(9));
        let mut buf = BitBuffer::new();
        encode_delta(&delta, &mut buf);
        let decoded = decode_delta(&mut buf, &SoldierFactory).unwrap();
        assert!(decoded.is_frozen());
        assert_eq!(decoded.entity_id, EntityId::from_raw(9));
    }

    #[test]
    fn unknown_factory_fails_the_decode() {
        let basis = soldier(0.0, 0.0, 1);
        let delta = create_delta(
            Tick::START,
            EntityId::from_raw(1),
            FactoryType(6),
            None,
            &basis,
            false,
            true,
            Tick::INVALID,
            Tick::INVALID,
            false,
        )
        .unwrap();
        let mut buf = BitBuffer::new();
        encode_delta(&delta, &mut buf);
        assert!(matches!(
            decode_delta(&mut buf, &SoldierFactory),
            Err(DecodeError::UnknownFactoryType(6))
        ));
    }
}
