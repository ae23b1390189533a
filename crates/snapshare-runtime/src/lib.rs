//! snapshare Runtime - Node runtime
//!
//! A [`Node`] owns one session: it advertises and browses under a service
//! tag, negotiates encrypted links, tracks per-peer connection state and
//! fans payloads out over a [`BroadcastChannel`]. A single driver task per
//! node is the only writer of link state; the [`Session`] peer map and the
//! [`ImageStore`] are behind `parking_lot` locks so readers may live on any
//! thread.

pub mod advertiser;
pub mod broadcast;
pub mod browser;
pub mod config;
pub mod events;
pub mod gallery;
pub mod image_store;
mod link;
pub mod logging;
pub mod node;
pub mod reliable;
pub mod session;

pub use advertiser::AdvertiseHandle;
pub use broadcast::{BroadcastChannel, Inbound, Targets};
pub use browser::{BrowseEvent, BrowseStream, DiscoveredPeer};
pub use config::{LogFormat, LoggingConfig, NodeConfig, ShareConfig};
pub use events::{EventStream, Subscribers};
pub use gallery::Gallery;
pub use image_store::{ImageOrigin, ImageRecord, ImageStore};
pub use node::Node;
pub use session::{PeerConnection, Session, SessionManager};
