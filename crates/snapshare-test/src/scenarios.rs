//! End-to-end session scenarios over the in-memory network

use std::time::Duration;

use bytes::Bytes;
use snapshare_core::{DisconnectReason, Payload, Reliability, SessionEvent, ShareError, ShareResult};
use snapshare_crypto::{HandshakeKeys, LinkCipher, Role, Transcript};
use snapshare_runtime::{
    BroadcastChannel, BrowseEvent, Gallery, ImageOrigin, ImageStore, NodeConfig, Targets,
};
use snapshare_wire::{CipherSuite, Invite, LinkMessage, Packet, Sealed};

use crate::harness::{
    connect, fast_config, png, png_image, Cluster, RawPeer, TestNode, TEST_TAG, WAIT,
};

fn invite_from(raw: &RawPeer, suite: CipherSuite, public_key: [u8; 32]) -> Packet {
    Packet::Invite(Invite {
        service_tag: TEST_TAG.to_string(),
        display_name: raw.identity.display_name().to_string(),
        suite,
        public_key,
    })
}

async fn expect_refusal(node: &mut TestNode, raw: &mut RawPeer) {
    let reply = raw.recv_handshake().await.unwrap();
    match reply.packet {
        Packet::Reject(reject) => assert_eq!(reject.reason, DisconnectReason::EncryptionRequired),
        other => panic!("expected reject, got {:?}", other),
    }

    assert_eq!(
        node.next_event().await,
        Some(SessionEvent::PeerConnecting(raw.identity.clone()))
    );
    assert_eq!(
        node.next_event().await,
        Some(SessionEvent::PeerLeft {
            peer: raw.identity.clone(),
            reason: DisconnectReason::EncryptionRequired,
            was_connected: false,
        })
    );
    assert!(node.node.session().peers().is_empty());
}

#[tokio::test]
async fn test_two_peers_exchange_payload() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();

    connect(&mut a, &mut b).await.unwrap();
    assert!(a.node.session().is_connected(b.identity().token()));
    assert!(b.node.session().is_connected(a.identity().token()));

    a.node
        .broadcast()
        .send(Payload::reliable(png(2, 2)), Targets::Connected)
        .await
        .unwrap();

    let inbound = b.next_inbound().await.unwrap();
    assert_eq!(&inbound.from, a.identity());
    assert_eq!(inbound.payload.sender(), Some(a.identity()));
    assert_eq!(inbound.payload.reliability(), Reliability::Reliable);
    assert_eq!(inbound.payload.bytes().as_ref(), png(2, 2).as_slice());
}

#[tokio::test]
async fn test_isolated_peer_is_lost_and_empty_send_succeeds() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    cluster.network.isolate(b.addr);
    let b_identity = b.identity().clone();
    assert_eq!(a.wait_left(&b_identity).await, Some(DisconnectReason::LinkLost));
    assert!(a.node.session().connected_peers().is_empty());

    // No targets left: nothing is sent and nothing fails
    a.node
        .broadcast()
        .send(Payload::reliable(png(1, 1)), Targets::Connected)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_send_never_touches_transport() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    let channel = a.node.broadcast();

    let before = cluster.network.sent_from(a.addr);
    channel
        .send(Payload::reliable(png(1, 1)), Targets::Connected)
        .await
        .unwrap();
    channel
        .send(Payload::best_effort(png(1, 1)), Targets::Only(Vec::new()))
        .await
        .unwrap();
    assert_eq!(cluster.network.sent_from(a.addr), before);
}

#[tokio::test]
async fn test_partial_failure_names_unreachable_peer() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    let mut c = cluster.spawn("carol").unwrap();
    connect(&mut a, &mut b).await.unwrap();
    connect(&mut a, &mut c).await.unwrap();
    assert_eq!(a.node.session().connected_peers().len(), 2);

    cluster.network.isolate(c.addr);
    let err = a
        .node
        .broadcast()
        .send(Payload::reliable(png(3, 3)), Targets::Connected)
        .await
        .unwrap_err();

    match &err {
        ShareError::DeliveryFailed { targets } => assert_eq!(targets, &vec![c.identity().clone()]),
        other => panic!("expected delivery failure, got {:?}", other),
    }
    // The reachable peer still got it
    let inbound = b.next_inbound().await.unwrap();
    assert_eq!(&inbound.from, a.identity());
}

#[tokio::test]
async fn test_send_to_unconnected_peer_fails() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    let stranger = cluster.raw_peer("stranger");

    let err = a
        .node
        .broadcast()
        .send(
            Payload::reliable(Bytes::from_static(b"hi")),
            Targets::Only(vec![stranger.identity.clone()]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.failed_targets(), &[stranger.identity.clone()]);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let config = NodeConfig {
        max_payload_size: 1024,
        ..fast_config()
    };
    let cluster = Cluster::with_config(config);
    let a = cluster.spawn("alice").unwrap();

    let err = a
        .node
        .broadcast()
        .send(Payload::reliable(vec![0u8; 1025]), Targets::Connected)
        .await
        .unwrap_err();
    assert_eq!(err, ShareError::PayloadTooLarge { size: 1025, max: 1024 });
}

#[tokio::test]
async fn test_advertising_twice_keeps_one_advertisement() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    let b = cluster.spawn("bob").unwrap();

    let first = a.node.start_advertising(TEST_TAG).await.unwrap();
    let mut stream = b.node.start_browsing(TEST_TAG).await.unwrap();
    let found = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert!(matches!(&found, BrowseEvent::Found(peer) if &peer.identity == a.identity()));

    let second = a.node.start_advertising(TEST_TAG).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(a.node.advertised_tag().as_deref(), Some(TEST_TAG));

    // Longer than the peer TTL: the browser sees neither a second Found nor a Lost
    let quiet = tokio::time::timeout(Duration::from_millis(500), stream.next()).await;
    assert!(quiet.is_err(), "unexpected browse event {:?}", quiet);

    // A superseded handle no longer controls the advertisement
    a.node.stop_advertising(&first).await.unwrap();
    assert!(a.node.is_advertising());

    a.node.stop_advertising(&second).await.unwrap();
    assert!(!a.node.is_advertising());
    let lost = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert!(matches!(&lost, BrowseEvent::Lost(peer) if &peer.identity == a.identity()));
}

#[tokio::test]
async fn test_stop_advertising_keeps_connected_peers() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();

    let handle = a.node.start_advertising(TEST_TAG).await.unwrap();
    connect(&mut a, &mut b).await.unwrap();
    a.node.stop_advertising(&handle).await.unwrap();
    assert!(!a.node.is_advertising());

    // Outlive the link timeout so only keepalives hold the link up
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(a.node.session().is_connected(b.identity().token()));
    assert!(b.node.session().is_connected(a.identity().token()));

    a.node
        .broadcast()
        .send(Payload::reliable(png(4, 4)), Targets::Connected)
        .await
        .unwrap();
    let inbound = b.next_inbound().await.unwrap();
    assert_eq!(&inbound.from, a.identity());
}

#[tokio::test]
async fn test_reliable_sends_arrive_in_order() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    let channel = a.node.broadcast();
    let payload = |tag: u8| Payload::reliable(vec![tag; 3000]);
    let (r0, r1, r2, r3, r4) = tokio::join!(
        channel.send(payload(0), Targets::Connected),
        channel.send(payload(1), Targets::Connected),
        channel.send(payload(2), Targets::Connected),
        channel.send(payload(3), Targets::Connected),
        channel.send(payload(4), Targets::Connected),
    );
    for result in [r0, r1, r2, r3, r4] {
        result.unwrap();
    }

    for expected in 0u8..5 {
        let inbound = b.next_inbound().await.unwrap();
        assert_eq!(inbound.payload.len(), 3000);
        assert!(inbound.payload.bytes().iter().all(|&byte| byte == expected));
    }
}

async fn send_run(channel: BroadcastChannel, count: u8) -> ShareResult<()> {
    for index in 0..count {
        channel
            .send(Payload::reliable(vec![index; 512]), Targets::Connected)
            .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_order_is_per_sender_with_concurrent_senders() {
    const RUN: u8 = 30;

    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    let mut c = cluster.spawn("carol").unwrap();
    connect(&mut b, &mut a).await.unwrap();
    connect(&mut b, &mut c).await.unwrap();

    let (ra, rc) = tokio::join!(
        send_run(a.node.broadcast(), RUN),
        send_run(c.node.broadcast(), RUN)
    );
    ra.unwrap();
    rc.unwrap();

    let mut next_from_a = 0u8;
    let mut next_from_c = 0u8;
    for _ in 0..2 * RUN as usize {
        let inbound = b.next_inbound().await.unwrap();
        let expected = if &inbound.from == a.identity() {
            &mut next_from_a
        } else {
            assert_eq!(&inbound.from, c.identity());
            &mut next_from_c
        };
        assert!(inbound.payload.bytes().iter().all(|&byte| byte == *expected));
        *expected += 1;
    }
    assert_eq!((next_from_a, next_from_c), (RUN, RUN));
}

#[tokio::test]
async fn test_large_payload_is_reassembled() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    a.node
        .broadcast()
        .send(Payload::reliable(data.clone()), Targets::Connected)
        .await
        .unwrap();

    let inbound = b.next_inbound().await.unwrap();
    assert_eq!(inbound.payload.bytes().as_ref(), data.as_slice());
}

#[tokio::test]
async fn test_best_effort_payload_is_delivered() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    a.node
        .broadcast()
        .send(Payload::best_effort(Bytes::from_static(b"ping")), Targets::Connected)
        .await
        .unwrap();

    let inbound = b.next_inbound().await.unwrap();
    assert_eq!(inbound.payload.reliability(), Reliability::BestEffort);
    assert_eq!(inbound.payload.bytes().as_ref(), b"ping");
}

#[tokio::test]
async fn test_plaintext_invite_is_refused() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    a.node.start_advertising(TEST_TAG).await.unwrap();

    let mut raw = cluster.raw_peer("mallory");
    let keys = HandshakeKeys::generate();
    raw.send(invite_from(&raw, CipherSuite::Plaintext, keys.public_bytes()), a.addr)
        .unwrap();

    expect_refusal(&mut a, &mut raw).await;
}

#[tokio::test]
async fn test_low_order_key_is_refused() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    a.node.start_advertising(TEST_TAG).await.unwrap();

    let mut raw = cluster.raw_peer("mallory");
    raw.send(invite_from(&raw, CipherSuite::X25519ChaCha20Poly1305, [0u8; 32]), a.addr)
        .unwrap();

    expect_refusal(&mut a, &mut raw).await;
}

#[tokio::test]
async fn test_invite_for_other_tag_is_ignored() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    a.node.start_advertising("other-tag").await.unwrap();

    let mut raw = cluster.raw_peer("dave");
    let keys = HandshakeKeys::generate();
    raw.send(invite_from(&raw, CipherSuite::default(), keys.public_bytes()), a.addr)
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_millis(200), raw.recv_handshake()).await;
    assert!(reply.is_err() || reply.unwrap().is_none());
    assert!(a.node.session().peers().is_empty());
}

#[tokio::test]
async fn test_hand_driven_handshake_establishes_link() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    a.node.start_advertising(TEST_TAG).await.unwrap();

    let mut raw = cluster.raw_peer("dave");
    let keys = HandshakeKeys::generate();
    let inviter_key = keys.public_bytes();
    raw.send(invite_from(&raw, CipherSuite::default(), inviter_key), a.addr)
        .unwrap();

    let accept = match raw.recv_handshake().await.unwrap().packet {
        Packet::Accept(accept) => accept,
        other => panic!("expected accept, got {:?}", other),
    };
    assert!(accept.suite.is_encrypted());
    assert_eq!(accept.display_name, "alice");

    let transcript = Transcript {
        service_tag: TEST_TAG,
        inviter: raw.identity.token(),
        acceptor: a.identity().token(),
        inviter_key,
        acceptor_key: accept.public_key,
    };
    let link_keys = keys
        .complete(accept.public_key, &transcript, Role::Inviter)
        .unwrap();
    let mut cipher = LinkCipher::new(&link_keys);

    let (counter, ciphertext) = cipher
        .seal(raw.identity.token(), &LinkMessage::Confirm.encode())
        .unwrap();
    raw.send(
        Packet::Sealed(Sealed {
            counter,
            ciphertext: Bytes::from(ciphertext),
        }),
        a.addr,
    )
    .unwrap();

    assert!(a.wait_joined(&raw.identity).await);

    // The node answers with its own sealed Confirm; skip retransmitted accepts
    let sealed = loop {
        match raw.recv_handshake().await.unwrap().packet {
            Packet::Sealed(sealed) => break sealed,
            Packet::Accept(_) => continue,
            other => panic!("expected sealed, got {:?}", other),
        }
    };
    let plaintext = cipher
        .open(a.identity().token(), sealed.counter, &sealed.ciphertext)
        .unwrap();
    assert_eq!(LinkMessage::decode(Bytes::from(plaintext)).unwrap(), LinkMessage::Confirm);
}

#[tokio::test]
async fn test_simultaneous_invites_yield_one_link() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    a.node.start_advertising(TEST_TAG).await.unwrap();
    b.node.start_advertising(TEST_TAG).await.unwrap();

    let found_b = a.discover(TEST_TAG, b.identity().token()).await.unwrap();
    let found_a = b.discover(TEST_TAG, a.identity().token()).await.unwrap();
    let (ra, rb) = tokio::join!(a.node.invite(&found_b), b.node.invite(&found_a));
    ra.unwrap();
    rb.unwrap();

    let a_identity = a.identity().clone();
    let b_identity = b.identity().clone();
    assert!(a.wait_joined(&b_identity).await);
    assert!(b.wait_joined(&a_identity).await);
    assert_eq!(a.node.session().peers().len(), 1);
    assert_eq!(b.node.session().peers().len(), 1);
}

#[tokio::test]
async fn test_browse_reports_found_and_lost() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    let b = cluster.spawn("bob").unwrap();

    let handle = a.node.start_advertising(TEST_TAG).await.unwrap();
    let mut stream = b.node.start_browsing(TEST_TAG).await.unwrap();
    assert_eq!(stream.service_tag(), TEST_TAG);

    let found = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert!(matches!(&found, BrowseEvent::Found(peer) if &peer.identity == a.identity()));
    assert_eq!(found.peer().addr, a.addr);

    a.node.stop_advertising(&handle).await.unwrap();
    let lost = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert!(matches!(&lost, BrowseEvent::Lost(peer) if &peer.identity == a.identity()));
}

#[tokio::test]
async fn test_unplugged_transport_cannot_advertise_or_browse() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    cluster.network.unplug(a.addr);

    let err = a.node.start_advertising(TEST_TAG).await.unwrap_err();
    assert!(matches!(err, ShareError::TransportUnavailable(_)));
    assert!(!a.node.is_advertising());

    let err = a.node.start_browsing(TEST_TAG).await.unwrap_err();
    assert!(matches!(err, ShareError::TransportUnavailable(_)));

    cluster.network.plug(a.addr);
    a.node.start_advertising(TEST_TAG).await.unwrap();
}

#[tokio::test]
async fn test_invalid_service_tag_is_a_config_error() {
    let cluster = Cluster::new();
    let a = cluster.spawn("alice").unwrap();
    assert!(matches!(a.node.start_advertising("").await, Err(ShareError::Config(_))));
    assert!(matches!(a.node.start_browsing("").await, Err(ShareError::Config(_))));
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    let a_identity = a.identity().clone();
    let b_identity = b.identity().clone();
    let TestNode {
        node,
        mut events,
        mut inbound,
        ..
    } = a;
    let channel = node.broadcast();
    node.shutdown().await;

    let mut left = None;
    while let Some(event) = events.recv().await {
        if let SessionEvent::PeerLeft { peer, reason, was_connected } = event {
            assert_eq!(peer, b_identity);
            assert!(was_connected);
            left = Some(reason);
        }
    }
    assert_eq!(left, Some(DisconnectReason::LocalTeardown));
    assert_eq!(inbound.recv().await, None);
    assert!(channel.session().peers().is_empty());

    let err = channel
        .send(Payload::reliable(Bytes::from_static(b"late")), Targets::Only(vec![b_identity]))
        .await
        .unwrap_err();
    assert_eq!(err, ShareError::SessionClosed);

    assert_eq!(b.wait_left(&a_identity).await, Some(DisconnectReason::RemoteClosed));
}

#[tokio::test]
async fn test_gallery_shares_and_receives_images() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    let a_gallery = Gallery::attach(&a.node, ImageStore::new());
    let b_gallery = Gallery::attach(&b.node, ImageStore::new());
    let mut revision = b_gallery.store().subscribe();

    // Not an image: logged and skipped on the receiving side
    a.node
        .broadcast()
        .send(Payload::reliable(Bytes::from_static(b"not an image")), Targets::Connected)
        .await
        .unwrap();

    let image = png_image(640, 480);
    a_gallery.share(image.clone()).await.unwrap();

    let local = a_gallery.store().get(0).unwrap();
    assert_eq!(local.origin, ImageOrigin::Local);
    assert_eq!(local.image, image);

    tokio::time::timeout(WAIT, revision.wait_for(|count| *count >= 1))
        .await
        .unwrap()
        .unwrap();
    let records = b_gallery.store().all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].origin, ImageOrigin::Received(a.identity().clone()));
    assert_eq!(records[0].image.width(), 640);
    assert_eq!(records[0].image.height(), 480);
}

#[tokio::test]
async fn test_gallery_keeps_image_on_partial_failure() {
    let cluster = Cluster::new();
    let mut a = cluster.spawn("alice").unwrap();
    let mut b = cluster.spawn("bob").unwrap();
    connect(&mut a, &mut b).await.unwrap();

    let gallery = Gallery::attach(&a.node, ImageStore::new());
    cluster.network.isolate(b.addr);

    let err = gallery.share(png_image(8, 8)).await.unwrap_err();
    assert_eq!(err.failed_targets(), &[b.identity().clone()]);
    assert_eq!(gallery.store().len(), 1);
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(8))]

    #[test]
    fn prop_reliable_sends_arrive_intact(
        sizes in proptest::collection::vec(1usize..20_000, 1..6)
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let cluster = Cluster::new();
            let mut a = cluster.spawn("alice").unwrap();
            let mut b = cluster.spawn("bob").unwrap();
            connect(&mut a, &mut b).await.unwrap();

            let channel = a.node.broadcast();
            for (index, size) in sizes.iter().enumerate() {
                let data = vec![index as u8; *size];
                channel
                    .send(Payload::reliable(data), Targets::Connected)
                    .await
                    .unwrap();
            }
            for (index, size) in sizes.iter().enumerate() {
                let inbound = b.next_inbound().await.unwrap();
                assert_eq!(inbound.payload.len(), *size);
                assert!(inbound.payload.bytes().iter().all(|&byte| byte == index as u8));
            }
        });
    }
}
