//! Cursor types used by the codec. Multi-byte integers are big-endian, as on
//! the Modbus wire.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;
