mod buffer;
mod compress;
mod pack;

pub use buffer::{BitBuffer, MAX_STRING_LENGTH, WriteMark};
pub use compress::{FloatCompressor, IntCompressor, VARINT_FALLBACK_BITS};
pub use pack::{read_packed, write_packed};
