use log::warn;

use super::buffer::BitBuffer;
use crate::error::DecodeError;

const COUNT_BITS: u32 = 8;
const MAX_COUNT: usize = u8::MAX as usize;

/// Writes a length-prefixed list while honouring two byte budgets: a cap on
/// the whole buffer and a cap per item.
///
/// The 8-bit count is reserved up front and patched once the outcome is
/// known. An item that alone exceeds `max_item_bytes` is rolled back and
/// skipped with a warning; an item that pushes the buffer past
/// `max_total_bytes` is rolled back and ends the list. Returns the indices
/// of the items that were actually written, in order.
pub fn write_packed<T>(
    buf: &mut BitBuffer,
    max_total_bytes: usize,
    max_item_bytes: usize,
    items: &[T],
    mut encode: impl FnMut(&mut BitBuffer, &T),
    label: impl Fn(&T) -> String,
) -> Vec<usize> {
    let count_mark = buf.reserve(COUNT_BITS);
    let mut written = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if written.len() == MAX_COUNT {
            break;
        }
        let mark = buf.mark();
        let bits_before = buf.bit_size();
        encode(buf, item);
        let item_bytes = (buf.bit_size() - bits_before).div_ceil(8);
        if item_bytes > max_item_bytes {
            buf.rollback(mark);
            warn!(
                "skipping {}: {} bytes exceeds the {} byte item cap",
                label(item),
                item_bytes,
                max_item_bytes
            );
            continue;
        }
        if buf.byte_size() > max_total_bytes {
            buf.rollback(mark);
            break;
        }
        written.push(index);
    }
    buf.insert(count_mark, COUNT_BITS, written.len() as u32);
    written
}

/// Reads a list written by [`write_packed`].
pub fn read_packed<T>(
    buf: &mut BitBuffer,
    mut decode: impl FnMut(&mut BitBuffer) -> Result<T, DecodeError>,
) -> Result<Vec<T>, DecodeError> {
    let count = buf.read(COUNT_BITS)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(decode(buf)?);
    }
    Ok(out)
}
