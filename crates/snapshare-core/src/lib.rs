//! snapshare Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout snapshare:
//! - Identifiers (PeerToken, PeerIdentity)
//! - Connection states, disconnect reasons and session events
//! - Payloads and delivery reliability
//! - The image model shared by the gallery and the wire
//! - The error taxonomy

pub mod error;
pub mod event;
pub mod id;
pub mod image;
pub mod payload;

pub use error::*;
pub use event::*;
pub use id::*;
pub use image::*;
pub use payload::*;

/// Service tag identifying the selfie-sharing protocol namespace on the local network.
///
/// Every participating device must use the same tag or they will not discover each other.
pub const SERVICE_TAG: &str = "selfie-share";
