//! Per-client data-plane buffers.
//!
//! Three primitives with three distinct loss policies:
//! - [`SampleRing`]: lock-free SPSC audio FIFO, drops *oldest* on overflow.
//! - [`FrameBuffer`]: double-buffered latest-only video holder, older frames
//!   are discarded by definition.
//! - [`PacketQueue`]: bounded priority egress queue, rejects on overflow so
//!   producers can apply their own drop policy.

pub mod frame;
pub mod queue;
pub mod ring;

pub use frame::{FrameBuffer, FrameError, FrameSlot, FrameWrite};
pub use queue::{PacketQueue, QueueError, QueuedPacket};
pub use ring::SampleRing;
