//! snapshare Transport - Datagram media
//!
//! - UDP: one socket per node, broadcast to configured discovery targets
//! - Memory: an in-process broadcast domain for deterministic tests
//!
//! Both are used through [`Medium`], which splits into a sender, a packet
//! receiver and a guard owning any background receive task.

pub mod medium;
pub mod memory;
pub mod udp;

pub use medium::*;
pub use memory::*;
pub use udp::*;
