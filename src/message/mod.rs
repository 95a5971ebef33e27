//! Framed message objects and the pools that recycle them.
//!
//! A [`Message`] is one wire frame: a packed 4-byte header (`kind` +
//! `length`, little-endian) followed by up to [`MAX_PAYLOAD_SIZE`] payload
//! bytes in a single contiguous allocation, so a queued message is exactly one
//! gather slice for a batched send. Messages are recycled through
//! [`MessagePool`] (locked free list, used by the public allocate/free
//! operations and the send path) or [`LocalPool`] (per-thread free lists,
//! used by the receive path).

pub use frame::{FrameHeader, FrameKind, Message, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use local_pool::{LocalPool, Pooled, Reusable};
pub use pool::MessagePool;

mod frame;
mod local_pool;
mod pool;
