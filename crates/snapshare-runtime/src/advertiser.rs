//! Presence advertising
//!
//! A node advertises at most one service tag. Starting again replaces the
//! current advertisement, so browsers never see two announcers for one node.

use std::time::{Duration, Instant};

/// Returned by `Node::start_advertising`; pass it back to stop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdvertiseHandle {
    id: u64,
    service_tag: String,
}

impl AdvertiseHandle {
    pub fn service_tag(&self) -> &str {
        &self.service_tag
    }
}

struct Advertisement {
    id: u64,
    service_tag: String,
    next_beacon: Instant,
}

pub(crate) struct Advertiser {
    active: Option<Advertisement>,
    next_id: u64,
    interval: Duration,
}

impl Advertiser {
    pub fn new(interval: Duration) -> Self {
        Advertiser {
            active: None,
            next_id: 1,
            interval,
        }
    }

    /// Begin (or restart) advertising; the first beacon is due immediately
    pub fn start(&mut self, service_tag: &str, now: Instant) -> AdvertiseHandle {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(old) = self.active.replace(Advertisement {
            id,
            service_tag: service_tag.to_owned(),
            next_beacon: now,
        }) {
            tracing::debug!(old = %old.service_tag, new = service_tag, "Advertisement replaced");
        }
        AdvertiseHandle {
            id,
            service_tag: service_tag.to_owned(),
        }
    }

    /// Stop if `handle` is the current advertisement; returns the stopped tag
    pub fn stop(&mut self, handle: &AdvertiseHandle) -> Option<String> {
        match &self.active {
            Some(ad) if ad.id == handle.id => self.active.take().map(|ad| ad.service_tag),
            _ => None,
        }
    }

    /// Drop the advertisement whatever its handle
    pub fn clear(&mut self) -> Option<String> {
        self.active.take().map(|ad| ad.service_tag)
    }

    /// Whether invitations and probes for `service_tag` are answered
    pub fn accepts(&self, service_tag: &str) -> bool {
        self.active.as_ref().is_some_and(|ad| ad.service_tag == service_tag)
    }

    pub fn active_tag(&self) -> Option<&str> {
        self.active.as_ref().map(|ad| ad.service_tag.as_str())
    }

    /// Tag to beacon now, if a beacon is due
    pub fn due(&mut self, now: Instant) -> Option<String> {
        let ad = self.active.as_mut()?;
        if now < ad.next_beacon {
            return None;
        }
        ad.next_beacon = now + self.interval;
        Some(ad.service_tag.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    #[test]
    fn test_beacon_schedule() {
        let mut adv = Advertiser::new(INTERVAL);
        let now = Instant::now();
        assert!(adv.due(now).is_none());

        adv.start("selfie-share", now);
        assert_eq!(adv.due(now).as_deref(), Some("selfie-share"));
        assert!(adv.due(now + INTERVAL / 2).is_none());
        assert!(adv.due(now + INTERVAL).is_some());
    }

    #[test]
    fn test_restart_keeps_one_advertisement() {
        let mut adv = Advertiser::new(INTERVAL);
        let now = Instant::now();
        let first = adv.start("selfie-share", now);
        let second = adv.start("selfie-share", now);
        assert_ne!(first, second);

        // One beacon per interval, not one per start
        assert!(adv.due(now).is_some());
        assert!(adv.due(now).is_none());

        // The replaced handle no longer controls anything
        assert!(adv.stop(&first).is_none());
        assert!(adv.accepts("selfie-share"));
        assert_eq!(adv.stop(&second).as_deref(), Some("selfie-share"));
        assert!(!adv.accepts("selfie-share"));
    }

    #[test]
    fn test_accepts_only_own_tag() {
        let mut adv = Advertiser::new(INTERVAL);
        adv.start("selfie-share", Instant::now());
        assert!(adv.accepts("selfie-share"));
        assert!(!adv.accepts("hws-project25"));
        assert_eq!(adv.active_tag(), Some("selfie-share"));
        assert_eq!(adv.clear().as_deref(), Some("selfie-share"));
        assert!(adv.active_tag().is_none());
    }
}
