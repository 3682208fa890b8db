use std::fmt;
use std::ops::{Add, Sub};

use crate::bits::BitBuffer;
use crate::error::DecodeError;

/// A simulation step. Raw value 0 is the invalid sentinel; real sessions
/// start at [`Tick::START`] and count up, so plain integer ordering is
/// enough for gameplay-length sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(u32);

impl Tick {
    pub const INVALID: Tick = Tick(0);
    pub const START: Tick = Tick(1);

    pub fn from_raw(raw: u32) -> Self {
        Tick(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    pub fn next(self) -> Tick {
        Tick(self.0.wrapping_add(1))
    }

    /// True on the ticks where a sender at `rate` emits a packet.
    pub fn is_send_tick(self, rate: u32) -> bool {
        self.is_valid() && self.0 % rate == 0
    }

    pub fn encode(self, buf: &mut BitBuffer) {
        buf.write_varint(self.0);
    }

    pub fn decode(buf: &mut BitBuffer) -> Result<Tick, DecodeError> {
        Ok(Tick(buf.read_varint()?))
    }
}

impl Add<u32> for Tick {
    type Output = Tick;

    fn add(self, rhs: u32) -> Tick {
        debug_assert!(self.is_valid());
        Tick(self.0.wrapping_add(rhs))
    }
}

impl Sub<Tick> for Tick {
    type Output = i64;

    fn sub(self, rhs: Tick) -> i64 {
        i64::from(self.0) - i64::from(rhs.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "T{}", self.0)
        } else {
            f.write_str("T-")
        }
    }
}

/// Anything stamped with the tick it belongs to, so ring buffers can slot
/// and order it.
pub trait TickStamped {
    fn tick(&self) -> Tick;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let a = Tick::START;
        let b = a + 9;
        assert!(a < b);
        assert_eq!(b - a, 9);
        assert_eq!(a - b, -9);
        assert_eq!(a.next(), a + 1);
    }

    #[test]
    fn invalid_is_never_a_send_tick() {
        assert!(!Tick::INVALID.is_send_tick(1));
        assert!(Tick::from_raw(4).is_send_tick(2));
        assert!(!Tick::from_raw(5).is_send_tick(2));
    }

    #[test]
    fn wire_round_trip() {
        let mut buf = BitBuffer::new();
        Tick::from_raw(700).encode(&mut buf);
        Tick::INVALID.encode(&mut buf);
        assert_eq!(Tick::decode(&mut buf).unwrap(), Tick::from_raw(700));
        assert_eq!(Tick::decode(&mut buf).unwrap(), Tick::INVALID);
    }
}
