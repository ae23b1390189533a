//! snapshare Test - In-memory harness and end-to-end scenarios
//!
//! Nodes built by [`harness::Cluster`] run the production driver over a
//! simulated broadcast domain whose links can be isolated or unplugged.

pub mod harness;

#[cfg(test)]
mod scenarios;

pub use harness::{connect, fast_config, png, png_image, Cluster, RawPeer, TestNode, TEST_TAG, WAIT};
