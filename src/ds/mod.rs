//! Fixed-capacity data structures shared by the tx/rx queues and FIFO plumbing.
//!
//! Neither structure allocates after construction and neither is thread-safe on its own; callers
//! are expected to guard them with the locks documented on their owning types.

pub mod ring;
pub mod slab;

pub use ring::RingQueue;
pub use slab::IndexedSlab;
