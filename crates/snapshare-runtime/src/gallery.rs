//! Gallery glue between a node and an image store
//!
//! A background pump feeds every inbound payload through the image decoder
//! into the store; `share` covers the local capture path.

use snapshare_core::{Image, Payload, ShareResult};
use tokio::task::JoinHandle;

use crate::{BroadcastChannel, ImageStore, Node, Targets};

pub struct Gallery {
    store: ImageStore,
    channel: BroadcastChannel,
    pump: JoinHandle<()>,
}

impl Gallery {
    /// Start delivering `node`'s inbound images into `store`
    pub fn attach(node: &Node, store: ImageStore) -> Self {
        let channel = node.broadcast();
        let mut inbound = channel.on_receive();
        let sink = store.clone();

        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match Image::decode(message.payload.into_bytes()) {
                    Ok(image) => {
                        let arrival = sink.insert_received(message.from.clone(), image);
                        tracing::debug!(peer = %message.from, arrival, "Image received");
                    }
                    Err(e) => {
                        tracing::warn!(
                            peer = %message.from,
                            error = %e,
                            "Skipping undecodable payload"
                        );
                    }
                }
            }
        });

        Gallery {
            store,
            channel,
            pump,
        }
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Show `image` locally, then send it reliably to every connected peer.
    ///
    /// The image stays in the store even when some peers fail to receive it.
    pub async fn share(&self, image: Image) -> ShareResult<()> {
        let bytes = image.encode();
        self.store.insert_local(image);
        self.channel
            .send(Payload::reliable(bytes), Targets::Connected)
            .await
    }
}

impl Drop for Gallery {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
