use super::buffer::BitBuffer;
use crate::error::DecodeError;

/// Widths above this fall back to varint encoding, which wins once values
/// cluster near the low end of a wide range.
pub const VARINT_FALLBACK_BITS: u32 = 10;

/// Fixed-width encoder for integers in a closed range.
#[derive(Debug, Clone, Copy)]
pub struct IntCompressor {
    min: i64,
    max: i64,
    bits: u32,
}

impl IntCompressor {
    pub const fn new(min: i64, max: i64) -> Self {
        assert!(min <= max);
        assert!(max - min <= u32::MAX as i64, "range too wide for a 32-bit offset");
        Self {
            min,
            max,
            bits: bits_for_range((max - min) as u64),
        }
    }

    pub const fn bits(&self) -> u32 {
        self.bits
    }

    pub fn write(&self, buf: &mut BitBuffer, value: i64) {
        debug_assert!(
            value >= self.min && value <= self.max,
            "{value} outside [{}, {}]",
            self.min,
            self.max
        );
        let offset = (value.clamp(self.min, self.max) - self.min) as u32;
        if self.bits > VARINT_FALLBACK_BITS {
            buf.write_varint(offset);
        } else {
            buf.write(self.bits, offset);
        }
    }

    pub fn read(&self, buf: &mut BitBuffer) -> Result<i64, DecodeError> {
        let offset = if self.bits > VARINT_FALLBACK_BITS {
            buf.read_varint()?
        } else {
            buf.read(self.bits)?
        };
        let value = self.min + i64::from(offset);
        if value > self.max {
            return Err(DecodeError::ValueOutOfRange);
        }
        Ok(value)
    }
}

/// Quantizing encoder for floats in `[min, max]` at a fixed resolution.
#[derive(Debug, Clone, Copy)]
pub struct FloatCompressor {
    min: f32,
    precision: f32,
    max_steps: u32,
    bits: u32,
}

impl FloatCompressor {
    pub fn new(min: f32, max: f32, precision: f32) -> Self {
        assert!(min < max);
        assert!(precision > 0.0);
        let max_steps = ((max - min) / precision).round() as u32;
        Self {
            min,
            precision,
            max_steps,
            bits: bits_for_range(u64::from(max_steps)),
        }
    }

    pub fn write(&self, buf: &mut BitBuffer, value: f32) {
        let steps = ((value - self.min) / self.precision).round();
        let steps = (steps.max(0.0) as u32).min(self.max_steps);
        if self.bits > VARINT_FALLBACK_BITS {
            buf.write_varint(steps);
        } else {
            buf.write(self.bits, steps);
        }
    }

    pub fn read(&self, buf: &mut BitBuffer) -> Result<f32, DecodeError> {
        let steps = if self.bits > VARINT_FALLBACK_BITS {
            buf.read_varint()?
        } else {
            buf.read(self.bits)?
        };
        if steps > self.max_steps {
            return Err(DecodeError::ValueOutOfRange);
        }
        Ok(self.min + steps as f32 * self.precision)
    }
}

/// Bits needed for values `0..=range`.
const fn bits_for_range(range: u64) -> u32 {
    if range == 0 {
        1
    } else {
        64 - range.leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_width_matches_range() {
        assert_eq!(IntCompressor::new(0, 1).bits(), 1);
        assert_eq!(IntCompressor::new(0, 7).bits(), 3);
        assert_eq!(IntCompressor::new(-4, 3).bits(), 3);
        assert_eq!(IntCompressor::new(0, 8).bits(), 4);
    }

    #[test]
    fn int_round_trip() {
        let comp = IntCompressor::new(-100, 155);
        let mut buf = BitBuffer::new();
        for value in [-100i64, -1, 0, 42, 155] {
            comp.write(&mut buf, value);
            assert_eq!(comp.read(&mut buf).unwrap(), value);
        }
    }

    #[test]
    fn wide_int_uses_varint() {
        let comp = IntCompressor::new(0, 1_000_000);
        assert!(comp.bits() > VARINT_FALLBACK_BITS);
        let mut buf = BitBuffer::new();
        comp.write(&mut buf, 3);
        // Small offsets should cost a single byte on the wire.
        assert_eq!(buf.byte_size(), 1);
        assert_eq!(comp.read(&mut buf).unwrap(), 3);
    }

    #[test]
    fn int_rejects_out_of_range_offset() {
        let narrow = IntCompressor::new(0, 5);
        let mut buf = BitBuffer::new();
        buf.write(narrow.bits(), 7);
        assert_eq!(narrow.read(&mut buf), Err(DecodeError::ValueOutOfRange));
    }

    #[test]
    fn float_quantizes_to_resolution() {
        let comp = FloatCompressor::new(-512.0, 512.0, 0.01);
        let mut buf = BitBuffer::new();
        comp.write(&mut buf, 42.123);
        let got = comp.read(&mut buf).unwrap();
        assert!((got - 42.12).abs() < 0.005, "got {got}");
    }

    #[test]
    fn float_clamps_writes() {
        let comp = FloatCompressor::new(0.0, 10.0, 0.5);
        let mut buf = BitBuffer::new();
        comp.write(&mut buf, 99.0);
        comp.write(&mut buf, -99.0);
        assert_eq!(comp.read(&mut buf).unwrap(), 10.0);
        assert_eq!(comp.read(&mut buf).unwrap(), 0.0);
    }
}
