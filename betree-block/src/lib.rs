//! Block codec and ordered message table shared by the betree storage engine.
//!
//! This crate has no knowledge of files, caches, or trees: it only knows how
//! to encode/decode the fixed little-endian wire format described by the
//! on-disk layout, and how to keep an ordered, overwrite-on-duplicate table
//! of pending messages for a single pivot.

mod block;
mod comparator;
mod message;

pub use block::{Block, BlockReader, BlockWriter};
pub use comparator::{ByteComparator, Comparator};
pub use message::{CodecError, Message, MessageTable};

/// Node identifier. Monotonically increasing, never reused. `NID_NIL` means
/// "no child".
pub type Nid = u64;

/// Reserved nid meaning "no child" / "no node".
pub const NID_NIL: Nid = 0;
