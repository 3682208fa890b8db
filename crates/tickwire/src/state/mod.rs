mod delta;

pub use delta::{DeltaPayload, StateDelta, apply_delta, create_delta, decode_delta, encode_delta};

use std::any::Any;

use crate::bits::BitBuffer;
use crate::error::DecodeError;
use crate::sim::{Tick, TickStamped};

/// Bitmask of mutable fields that differ from a basis. Bit `n` covers the
/// schema's `n`-th mutable field.
pub type FieldFlags = u32;

/// Mask covering every mutable field of a schema with `flag_count` fields.
pub fn all_fields(flag_count: u32) -> FieldFlags {
    debug_assert!(flag_count <= 32);
    if flag_count == 32 {
        u32::MAX
    } else {
        (1 << flag_count) - 1
    }
}

/// Discriminator for a registered entity schema, assigned by registration
/// order and carried on the wire in front of every state block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryType(pub u32);

impl FactoryType {
    pub fn encode(self, buf: &mut BitBuffer) {
        buf.write_varint(self.0);
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<FactoryType, DecodeError> {
        Ok(FactoryType(buf.read_varint()?))
    }
}

/// A user-defined replicated record, partitioned into three sections:
/// mutable fields (delta-encoded against a basis, one flag bit each),
/// controller-only fields (sent in full, only to the controlling client),
/// and immutable fields (sent once at creation).
///
/// Implementations write fields in a fixed schema order; the engine drives
/// which sections and which flagged fields go on the wire.
pub trait StateData: Default + Clone + std::fmt::Debug + 'static {
    /// Number of mutable fields, at most 32.
    const FLAG_COUNT: u32;

    /// Flags for every mutable field that differs from `basis`.
    fn compare_mutable(&self, basis: &Self) -> FieldFlags;
    /// Copies the flagged mutable fields from `source`.
    fn apply_mutable(&mut self, source: &Self, flags: FieldFlags);
    fn apply_controller(&mut self, source: &Self);
    fn apply_immutable(&mut self, source: &Self);

    fn encode_mutable(&self, flags: FieldFlags, buf: &mut BitBuffer);
    fn decode_mutable(&mut self, flags: FieldFlags, buf: &mut BitBuffer) -> Result<(), DecodeError>;
    fn encode_controller(&self, buf: &mut BitBuffer);
    fn decode_controller(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError>;
    fn encode_immutable(&self, buf: &mut BitBuffer);
    fn decode_immutable(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError>;
}

/// Object-safe face of [`StateData`], so rooms and packets can hold states
/// of mixed schemas. Blanket-implemented for every `StateData`; cross-schema
/// calls are programming errors and degrade to no-ops in release builds.
pub trait DynState: Any + std::fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_dyn(&self) -> Box<dyn DynState>;
    fn flag_count(&self) -> u32;
    fn compare_mutable_dyn(&self, basis: &dyn DynState) -> FieldFlags;
    fn apply_mutable_dyn(&mut self, source: &dyn DynState, flags: FieldFlags);
    fn apply_controller_dyn(&mut self, source: &dyn DynState);
    fn apply_immutable_dyn(&mut self, source: &dyn DynState);
    fn encode_mutable_dyn(&self, flags: FieldFlags, buf: &mut BitBuffer);
    fn decode_mutable_dyn(&mut self, flags: FieldFlags, buf: &mut BitBuffer) -> Result<(), DecodeError>;
    fn encode_controller_dyn(&self, buf: &mut BitBuffer);
    fn decode_controller_dyn(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError>;
    fn encode_immutable_dyn(&self, buf: &mut BitBuffer);
    fn decode_immutable_dyn(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError>;
}

impl<S: StateData> DynState for S {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_dyn(&self) -> Box<dyn DynState> {
        Box::new(self.clone())
    }

    fn flag_count(&self) -> u32 {
        S::FLAG_COUNT
    }

    fn compare_mutable_dyn(&self, basis: &dyn DynState) -> FieldFlags {
        match basis.as_any().downcast_ref::<S>() {
            Some(basis) => self.compare_mutable(basis),
            None => {
                debug_assert!(false, "compared states of different schemas");
                all_fields(S::FLAG_COUNT)
            }
        }
    }

    fn apply_mutable_dyn(&mut self, source: &dyn DynState, flags: FieldFlags) {
        if let Some(source) = source.as_any().downcast_ref::<S>() {
            self.apply_mutable(source, flags);
        } else {
            debug_assert!(false, "applied state of a different schema");
        }
    }

    fn apply_controller_dyn(&mut self, source: &dyn DynState) {
        if let Some(source) = source.as_any().downcast_ref::<S>() {
            self.apply_controller(source);
        } else {
            debug_assert!(false, "applied state of a different schema");
        }
    }

    fn apply_immutable_dyn(&mut self, source: &dyn DynState) {
        if let Some(source) = source.as_any().downcast_ref::<S>() {
            self.apply_immutable(source);
        } else {
            debug_assert!(false, "applied state of a different schema");
        }
    }

    fn encode_mutable_dyn(&self, flags: FieldFlags, buf: &mut BitBuffer) {
        self.encode_mutable(flags, buf);
    }

    fn decode_mutable_dyn(&mut self, flags: FieldFlags, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.decode_mutable(flags, buf)
    }

    fn encode_controller_dyn(&self, buf: &mut BitBuffer) {
        self.encode_controller(buf);
    }

    fn decode_controller_dyn(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.decode_controller(buf)
    }

    fn encode_immutable_dyn(&self, buf: &mut BitBuffer) {
        self.encode_immutable(buf);
    }

    fn decode_immutable_dyn(&mut self, buf: &mut BitBuffer) -> Result<(), DecodeError> {
        self.decode_immutable(buf)
    }
}

/// Creates default-initialized states for a factory type; implemented by the
/// registry and consumed by the wire decoder.
pub trait StateFactory {
    fn create_state(&self, factory: FactoryType) -> Option<Box<dyn DynState>>;
    fn state_flag_count(&self, factory: FactoryType) -> Option<u32>;
}

/// A snapshot of an entity's state at a tick, kept server-side as the delta
/// basis for clients acking that far back.
#[derive(Debug, Clone)]
pub struct StateRecord<S: StateData> {
    pub tick: Tick,
    pub state: S,
}

impl<S: StateData> Default for StateRecord<S> {
    fn default() -> Self {
        Self {
            tick: Tick::INVALID,
            state: S::default(),
        }
    }
}

impl<S: StateData> TickStamped for StateRecord<S> {
    fn tick(&self) -> Tick {
        self.tick
    }
}
