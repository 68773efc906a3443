#![forbid(unsafe_code)]
//! dmreg-reloc: relocatable blocks for everything that crosses a boundary.
//!
//! A block is one contiguous buffer whose internal pointers are absolute
//! addresses in the sender's space (`base + offset`). The receiver calls the
//! matching `rebase` with its own base before reading. Schema subtrees,
//! compact tuples, tuple chains and queries each have their own block
//! layout; [`frame`] wraps any of them for the [`channel`].

pub mod channel;
pub mod cursor;
pub mod frame;
pub mod query_block;
pub mod schema_block;
pub mod tuple_block;

pub use channel::{Channel, MemoryChannel};
pub use frame::{Frame, MessageKind};
pub use query_block::QueryRecord;
pub use tuple_block::{pack, pack_chain, split_chain, unpack_chain, CompactTuple};
