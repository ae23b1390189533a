//! Peer browsing
//!
//! Each browsed tag is a scope with its own visible-peer table and
//! subscribers. A scope lives while at least one [`BrowseStream`] for it
//! is alive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use snapshare_core::{PeerIdentity, PeerToken};

use crate::events::{EventStream, Subscribers};

/// A peer seen advertising a service tag
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub identity: PeerIdentity,
    pub addr: SocketAddr,
    pub service_tag: String,
}

/// Browse stream item
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrowseEvent {
    Found(DiscoveredPeer),
    Lost(DiscoveredPeer),
}

impl BrowseEvent {
    pub fn peer(&self) -> &DiscoveredPeer {
        match self {
            BrowseEvent::Found(p) | BrowseEvent::Lost(p) => p,
        }
    }
}

/// Peers appearing and disappearing under one tag; drop it to stop browsing
#[derive(Debug)]
pub struct BrowseStream {
    service_tag: String,
    events: EventStream<BrowseEvent>,
}

impl BrowseStream {
    pub(crate) fn new(service_tag: String, events: EventStream<BrowseEvent>) -> Self {
        BrowseStream { service_tag, events }
    }

    pub fn service_tag(&self) -> &str {
        &self.service_tag
    }

    /// Next event; `None` once the node shut down
    pub async fn next(&mut self) -> Option<BrowseEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<BrowseEvent> {
        self.events.try_recv()
    }
}

struct Visible {
    peer: DiscoveredPeer,
    last_seen: Instant,
}

struct Scope {
    subscribers: Subscribers<BrowseEvent>,
    peers: HashMap<PeerToken, Visible>,
    next_probe: Instant,
}

pub(crate) struct Browser {
    scopes: HashMap<String, Scope>,
    probe_interval: Duration,
}

impl Browser {
    pub fn new(probe_interval: Duration) -> Self {
        Browser {
            scopes: HashMap::new(),
            probe_interval,
        }
    }

    /// New stream for `service_tag`, replaying currently visible peers.
    /// Returns true if the scope is new and needs an immediate probe.
    pub fn subscribe(
        &mut self,
        service_tag: &str,
        now: Instant,
    ) -> (EventStream<BrowseEvent>, bool) {
        let interval = self.probe_interval;
        let mut created = false;
        let scope = self.scopes.entry(service_tag.to_owned()).or_insert_with(|| {
            created = true;
            Scope {
                subscribers: Subscribers::new(),
                peers: HashMap::new(),
                next_probe: now + interval,
            }
        });

        let replay: Vec<BrowseEvent> = scope
            .peers
            .values()
            .map(|v| BrowseEvent::Found(v.peer.clone()))
            .collect();
        (scope.subscribers.subscribe_with(replay), created)
    }

    pub fn remove_scope(&mut self, service_tag: &str) {
        if let Some(scope) = self.scopes.remove(service_tag) {
            scope.subscribers.close();
        }
    }

    pub fn is_browsing(&self, service_tag: &str) -> bool {
        self.scopes.contains_key(service_tag)
    }

    /// Record a beacon; publishes `Found` the first time a peer is seen
    pub fn observe(
        &mut self,
        service_tag: &str,
        identity: PeerIdentity,
        addr: SocketAddr,
        now: Instant,
    ) {
        let Some(scope) = self.scopes.get_mut(service_tag) else {
            return;
        };

        match scope.peers.get_mut(&identity.token()) {
            Some(visible) => {
                visible.last_seen = now;
                visible.peer.addr = addr;
            }
            None => {
                let peer = DiscoveredPeer {
                    identity,
                    addr,
                    service_tag: service_tag.to_owned(),
                };
                tracing::debug!(peer = %peer.identity, %addr, tag = service_tag, "Peer found");
                scope.subscribers.publish(BrowseEvent::Found(peer.clone()));
                scope.peers.insert(peer.identity.token(), Visible { peer, last_seen: now });
            }
        }
    }

    /// Peer announced it stopped advertising
    pub fn withdraw(&mut self, service_tag: &str, token: PeerToken) {
        let Some(scope) = self.scopes.get_mut(service_tag) else {
            return;
        };
        if let Some(visible) = scope.peers.remove(&token) {
            tracing::debug!(peer = %visible.peer.identity, tag = service_tag, "Peer withdrew");
            scope.subscribers.publish(BrowseEvent::Lost(visible.peer));
        }
    }

    /// Lose peers silent for longer than `ttl`
    pub fn expire(&mut self, now: Instant, ttl: Duration) {
        for (tag, scope) in self.scopes.iter_mut() {
            let stale: Vec<PeerToken> = scope
                .peers
                .iter()
                .filter(|(_, v)| now.duration_since(v.last_seen) >= ttl)
                .map(|(t, _)| *t)
                .collect();
            for token in stale {
                if let Some(visible) = scope.peers.remove(&token) {
                    tracing::debug!(peer = %visible.peer.identity, tag = %tag, "Peer expired");
                    scope.subscribers.publish(BrowseEvent::Lost(visible.peer));
                }
            }
        }
    }

    /// Tags whose periodic probe is due
    pub fn probes_due(&mut self, now: Instant) -> Vec<String> {
        let interval = self.probe_interval;
        self.scopes
            .iter_mut()
            .filter(|(_, scope)| now >= scope.next_probe)
            .map(|(tag, scope)| {
                scope.next_probe = now + interval;
                tag.clone()
            })
            .collect()
    }

    /// Forget scopes nobody listens to any more
    pub fn prune(&mut self) {
        self.scopes.retain(|tag, scope| {
            let alive = scope.subscribers.retain_open() > 0;
            if !alive {
                tracing::debug!(tag = %tag, "Browsing stopped");
            }
            alive
        });
    }

    /// End every browse stream
    pub fn close(&mut self) {
        for (_, scope) in self.scopes.drain() {
            scope.subscribers.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(300);

    fn peer(n: u64) -> PeerIdentity {
        PeerIdentity::new(PeerToken::new(n), &format!("peer-{}", n))
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 47800))
    }

    #[tokio::test]
    async fn test_found_once_then_lost_on_expiry() {
        let mut browser = Browser::new(Duration::from_millis(100));
        let now = Instant::now();
        let (mut events, created) = browser.subscribe("selfie-share", now);
        assert!(created);

        browser.observe("selfie-share", peer(1), addr(1), now);
        browser.observe("selfie-share", peer(1), addr(1), now + TTL / 2);
        browser.expire(now + TTL, TTL);
        assert!(matches!(events.try_recv(), Some(BrowseEvent::Found(p)) if p.identity == peer(1)));
        assert!(events.try_recv().is_none());

        browser.expire(now + TTL / 2 + TTL, TTL);
        assert!(matches!(events.recv().await, Some(BrowseEvent::Lost(p)) if p.identity == peer(1)));
    }

    #[test]
    fn test_other_tags_ignored() {
        let mut browser = Browser::new(Duration::from_millis(100));
        let now = Instant::now();
        let (mut events, _) = browser.subscribe("selfie-share", now);

        browser.observe("hws-project25", peer(1), addr(1), now);
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn test_new_stream_replays_visible_peers() {
        let mut browser = Browser::new(Duration::from_millis(100));
        let now = Instant::now();
        let (_first, _) = browser.subscribe("selfie-share", now);
        browser.observe("selfie-share", peer(1), addr(1), now);
        browser.observe("selfie-share", peer(2), addr(2), now);

        let (mut second, created) = browser.subscribe("selfie-share", now);
        assert!(!created);
        let mut replayed = Vec::new();
        while let Some(BrowseEvent::Found(p)) = second.try_recv() {
            replayed.push(p.identity.token().0);
        }
        replayed.sort_unstable();
        assert_eq!(replayed, vec![1, 2]);
    }

    #[test]
    fn test_withdraw_publishes_lost() {
        let mut browser = Browser::new(Duration::from_millis(100));
        let now = Instant::now();
        let (mut events, _) = browser.subscribe("selfie-share", now);
        browser.observe("selfie-share", peer(1), addr(1), now);
        browser.withdraw("selfie-share", peer(1).token());

        assert!(matches!(events.try_recv(), Some(BrowseEvent::Found(_))));
        assert!(matches!(events.try_recv(), Some(BrowseEvent::Lost(_))));
    }

    #[test]
    fn test_dropped_stream_stops_browsing() {
        let mut browser = Browser::new(Duration::from_millis(100));
        let now = Instant::now();
        let (events, _) = browser.subscribe("selfie-share", now);
        browser.prune();
        assert!(browser.is_browsing("selfie-share"));

        drop(events);
        browser.prune();
        assert!(!browser.is_browsing("selfie-share"));
    }

    #[test]
    fn test_probe_schedule() {
        let interval = Duration::from_millis(100);
        let mut browser = Browser::new(interval);
        let now = Instant::now();
        let (_events, _) = browser.subscribe("selfie-share", now);

        assert!(browser.probes_due(now).is_empty());
        assert_eq!(browser.probes_due(now + interval), vec!["selfie-share".to_owned()]);
        assert!(browser.probes_due(now + interval).is_empty());
    }
}
