//! Router-side session registry.
//!
//! Maps router-assigned session ids to connected peers. Ids are random and
//! re-rolled on collision. A second handshake from a registered peer migrates
//! it to a fresh id. Notifications are published once no map shard is held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use demonsaw_crypto::random::random_id;

use crate::error::Result;
use crate::event::{Event, EventAction, EventBus, EventKind};
use crate::session::{Session, short_id};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connected peer as seen by the router.
#[derive(Debug)]
pub struct Peer {
    session: Mutex<Session>,
    version: Mutex<String>,
    group: Mutex<String>,
    touched: Mutex<Instant>,
}

impl Peer {
    /// A peer holding a bootstrap session.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            version: Mutex::new(String::new()),
            group: Mutex::new(String::new()),
            touched: Mutex::new(Instant::now()),
        }
    }

    /// Lock the session.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    /// Session id (empty before the first handshake).
    #[must_use]
    pub fn id(&self) -> String {
        self.session().id().to_string()
    }

    /// Display name recorded by `join`.
    #[must_use]
    pub fn name(&self) -> String {
        self.session().name().to_string()
    }

    /// Version reported in the handshake.
    #[must_use]
    pub fn version(&self) -> String {
        lock(&self.version).clone()
    }

    /// Record the peer version.
    pub fn set_version(&self, version: impl Into<String>) {
        *lock(&self.version) = version.into();
    }

    /// Group id registered by `group` (empty when none).
    #[must_use]
    pub fn group(&self) -> String {
        lock(&self.group).clone()
    }

    /// Record the peer's group id.
    pub fn set_group(&self, group: impl Into<String>) {
        *lock(&self.group) = group.into();
    }

    /// Mark activity.
    pub fn touch(&self) {
        *lock(&self.touched) = Instant::now();
    }

    /// Time since last activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        lock(&self.touched).elapsed()
    }
}

/// Active sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: DashMap<String, Arc<Peer>>,
    events: EventBus,
}

impl SessionRegistry {
    /// Empty registry publishing on `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            peers: DashMap::new(),
            events,
        }
    }

    /// Notification bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Give `peer` a fresh unique id and register it, migrating it away from
    /// its current id when that one is registered. Returns the new id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Crypto`] if the random source fails.
    pub fn assign(&self, peer: &Arc<Peer>) -> Result<String> {
        let old = peer.id();
        let id = loop {
            let candidate = random_id()?;
            if let Entry::Vacant(entry) = self.peers.entry(candidate.clone()) {
                entry.insert(Arc::clone(peer));
                break candidate;
            }
        };
        let migrated = old != id
            && self
                .peers
                .remove_if(&old, |_, existing| Arc::ptr_eq(existing, peer))
                .is_some();
        peer.session().set_id(id.clone());

        if migrated {
            tracing::debug!("Session {} migrated to {}", short_id(&old), short_id(&id));
            self.events
                .publish(&Event::new(EventKind::Session, EventAction::Removed, old));
        }
        self.events
            .publish(&Event::new(EventKind::Session, EventAction::Added, id.clone()));
        Ok(id)
    }

    /// Look a session up.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.get(id).map(|peer| Arc::clone(peer.value()))
    }

    /// Remove a session, publishing `Removed` if it was present.
    pub fn remove(&self, id: &str) -> Option<Arc<Peer>> {
        let removed = self.peers.remove(id).map(|(_, peer)| peer);
        if removed.is_some() {
            self.events
                .publish(&Event::new(EventKind::Session, EventAction::Removed, id));
        }
        removed
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether session `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Snapshot of all peers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|peer| Arc::clone(peer.value())).collect()
    }

    /// Remove sessions idle for longer than `limit`, returning their ids.
    /// A peer touched after the scan survives.
    pub fn prune(&self, limit: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|peer| peer.value().idle() > limit)
            .map(|peer| peer.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if self.peers.remove_if(&id, |_, peer| peer.idle() > limit).is_some() {
                self.events
                    .publish(&Event::new(EventKind::Session, EventAction::Removed, id.clone()));
                removed.push(id);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (EventBus, Arc<Mutex<Vec<Event>>>) {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (bus, seen)
    }

    #[test]
    fn test_assign_new_peer() {
        let (bus, seen) = recording();
        let registry = SessionRegistry::new(bus);
        let peer = Arc::new(Peer::new(Session::new()));

        let id = registry.assign(&peer).unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(peer.id(), id);
        assert!(registry.get(&id).is_some());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Event::new(EventKind::Session, EventAction::Added, id)]
        );
    }

    #[test]
    fn test_assign_migrates() {
        let (bus, seen) = recording();
        let registry = SessionRegistry::new(bus);
        let peer = Arc::new(Peer::new(Session::new()));

        let first = registry.assign(&peer).unwrap();
        let second = registry.assign(&peer).unwrap();
        assert_ne!(first, second);
        assert!(registry.get(&first).is_none());
        assert!(registry.get(&second).is_some());
        assert_eq!(registry.len(), 1);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], Event::new(EventKind::Session, EventAction::Removed, first));
        assert_eq!(events[2], Event::new(EventKind::Session, EventAction::Added, second));
    }

    #[test]
    fn test_unregistered_old_id_fires_added_only() {
        let (bus, seen) = recording();
        let registry = SessionRegistry::new(bus);
        let mut session = Session::new();
        session.set_id("stale");
        let peer = Arc::new(Peer::new(session));

        registry.assign(&peer).unwrap();
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::Added);
    }

    #[test]
    fn test_remove() {
        let registry = SessionRegistry::default();
        let peer = Arc::new(Peer::new(Session::new()));
        let id = registry.assign(&peer).unwrap();
        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prune_idle() {
        let registry = SessionRegistry::default();
        let peer = Arc::new(Peer::new(Session::new()));
        let id = registry.assign(&peer).unwrap();
        assert!(registry.prune(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.prune(Duration::from_millis(1)), vec![id]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_assign_unique_ids() {
        let registry = Arc::new(SessionRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| registry.assign(&Arc::new(Peer::new(Session::new()))).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<String> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 256);
        assert_eq!(registry.len(), 256);
        assert_eq!(registry.snapshot().len(), 256);
    }

    #[test]
    fn test_group_recorded_on_peer() {
        let peer = Peer::new(Session::new());
        assert!(peer.group().is_empty());
        peer.set_group("c0ffee");
        assert_eq!(peer.group(), "c0ffee");
    }
}
