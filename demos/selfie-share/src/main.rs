//! selfie-share: share images with nearby devices.
//!
//! Host advertises and accepts invitations; join browses and invites every
//! host it finds. Both then read commands from stdin:
//!
//!   send <path>   Add an image to the gallery and send it to every peer
//!   peers         List peers and their connection state
//!   images        List the gallery, newest first
//!   quit          Leave the session

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use snapshare_core::{Image, SessionEvent, ShareError, ShareResult};
use snapshare_runtime::{
    logging, BrowseEvent, BrowseStream, Gallery, ImageOrigin, ImageStore, Node, ShareConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "selfie-share")]
#[command(about = "Share images with nearby devices on the local network")]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Display name shown to other devices
    #[arg(long)]
    name: Option<String>,

    /// Service tag to advertise or browse (defaults to the configured tag)
    #[arg(long)]
    tag: Option<String>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Advertise and accept invitations
    Host,
    /// Browse and invite every host found
    Join,
}

#[tokio::main]
async fn main() -> ShareResult<()> {
    let cli = Cli::parse();

    let mut config = ShareConfig::load(cli.config.as_deref())?;
    if let Some(name) = cli.name {
        config.node.device_name = Some(name);
    }
    let tag = cli.tag.unwrap_or_else(|| config.node.service_tag.clone());
    logging::init(&config.logging);

    let node = Node::bind_udp(config.node.clone(), &config.udp).await?;
    println!("{} listening on {}", node.identity(), node.local_addr());

    let gallery = Gallery::attach(&node, ImageStore::new());
    let mut events = node.session().subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PeerConnecting(peer) => println!("* connecting to {}", peer),
                SessionEvent::PeerJoined(peer) => println!("* {} joined", peer),
                SessionEvent::PeerLeft { peer, reason, .. } => {
                    println!("* {} left ({:?})", peer, reason)
                }
            }
        }
    });

    let mut browse: Option<BrowseStream> = None;
    match cli.mode {
        Mode::Host => {
            node.start_advertising(&tag).await?;
            println!("hosting under {:?}", tag);
        }
        Mode::Join => {
            browse = Some(node.start_browsing(&tag).await?);
            println!("looking for hosts under {:?}", tag);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(line.trim(), &node, &gallery).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("stdin: {}", e);
                    break;
                }
            },
            event = next_browse_event(&mut browse) => match event {
                Some(BrowseEvent::Found(peer)) => {
                    println!("found {} at {}", peer.identity, peer.addr);
                    if !node.session().is_connected(peer.identity.token()) {
                        node.invite(&peer).await?;
                    }
                }
                Some(BrowseEvent::Lost(peer)) => println!("lost {}", peer.identity),
                None => browse = None,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(browse);
    drop(gallery);
    node.shutdown().await;
    Ok(())
}

async fn next_browse_event(browse: &mut Option<BrowseStream>) -> Option<BrowseEvent> {
    match browse {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Returns false when the user asked to quit
async fn run_command(line: &str, node: &Node, gallery: &Gallery) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "send" => match share_file(arg, gallery).await {
            Ok(()) => println!("sent {}", arg),
            Err(ShareError::DeliveryFailed { targets }) => {
                let names: Vec<String> = targets.iter().map(|p| p.to_string()).collect();
                println!("not delivered to: {}", names.join(", "));
            }
            Err(e) => println!("send failed: {}", e),
        },
        "peers" => {
            let peers = node.session().peers();
            if peers.is_empty() {
                println!("no peers");
            }
            for peer in peers {
                println!(
                    "{} [{}] {} for {:?}",
                    peer.identity,
                    peer.identity.token(),
                    peer.state,
                    peer.since.elapsed()
                );
            }
        }
        "images" => {
            for record in gallery.store().all() {
                let origin = match &record.origin {
                    ImageOrigin::Local => "local".to_string(),
                    ImageOrigin::Received(peer) => format!("from {}", peer),
                };
                println!(
                    "#{} {} {}x{} {} bytes {}",
                    record.arrival,
                    record.image.format(),
                    record.image.width(),
                    record.image.height(),
                    record.image.byte_len(),
                    origin
                );
            }
        }
        "quit" | "exit" => return false,
        other => println!("unknown command {:?} (send <path>, peers, images, quit)", other),
    }
    true
}

async fn share_file(path: &str, gallery: &Gallery) -> ShareResult<()> {
    if path.is_empty() {
        return Err(ShareError::Config("usage: send <path>".into()));
    }
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| ShareError::Config(format!("{}: {}", path, e)))?;
    let image = Image::decode(data)?;
    gallery.share(image).await
}
