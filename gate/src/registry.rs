//! Session tables and fleet presence
//!
//! The two local tables (`session_id -> Session`, `uid -> Session`) live
//! behind one lock so they can never disagree. Fleet presence is a
//! copy-on-write snapshot: readers clone the `Arc`, writers clone the map
//! and swap it in. Kick waiters are one-shot senders keyed by uid and are
//! fulfilled when that uid goes offline anywhere in the fleet.

use crate::session::Session;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;

#[derive(Default)]
struct Tables {
    by_sid: HashMap<u32, Arc<Session>>,
    by_uid: HashMap<u32, Arc<Session>>,
}

/// `uid -> gate_id` for every online player in the fleet
pub type FleetPresence = HashMap<u32, u32>;

#[derive(Default)]
pub struct Registry {
    tables: RwLock<Tables>,
    fleet: RwLock<Arc<FleetPresence>>,
    kick_waiters: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_session(&self, session: Arc<Session>) {
        self.write().by_sid.insert(session.id(), session);
    }

    /// Binds `uid` to `session`; fails when another session holds the uid
    pub fn bind_uid(&self, uid: u32, session: &Arc<Session>) -> bool {
        let mut tables = self.write();
        match tables.by_uid.get(&uid) {
            Some(existing) if !Arc::ptr_eq(existing, session) => false,
            _ => {
                tables.by_uid.insert(uid, Arc::clone(session));
                true
            }
        }
    }

    /// Removes both entries, but only those that still point at `session`
    pub fn remove_session(&self, session: &Arc<Session>) {
        let mut tables = self.write();
        if tables
            .by_sid
            .get(&session.id())
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            tables.by_sid.remove(&session.id());
        }
        let uid = session.uid();
        if uid != 0 && tables.by_uid.get(&uid).is_some_and(|s| Arc::ptr_eq(s, session)) {
            tables.by_uid.remove(&uid);
        }
    }

    pub fn get_by_sid(&self, session_id: u32) -> Option<Arc<Session>> {
        self.read().by_sid.get(&session_id).cloned()
    }

    pub fn get_by_uid(&self, uid: u32) -> Option<Arc<Session>> {
        self.read().by_uid.get(&uid).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.read().by_sid.len()
    }

    /// Sessions that completed the handshake
    pub fn bound_count(&self) -> usize {
        self.read().by_uid.len()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.read().by_sid.values().cloned().collect()
    }

    pub fn fleet(&self) -> Arc<FleetPresence> {
        Arc::clone(&self.fleet.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Gate currently owning `uid`, if it is online anywhere
    pub fn fleet_owner(&self, uid: u32) -> Option<u32> {
        self.fleet().get(&uid).copied()
    }

    /// Installs a fresh discovery snapshot
    ///
    /// Entries naming this gate are only kept for uids bound here, and every
    /// local binding is present whatever the snapshot says: this gate is
    /// authoritative for its own sessions.
    pub fn replace_fleet(&self, mut snapshot: FleetPresence, own_gate: u32) {
        let local: Vec<u32> = self.read().by_uid.keys().copied().collect();
        snapshot.retain(|uid, gate| *gate != own_gate || local.contains(uid));
        for uid in local {
            snapshot.insert(uid, own_gate);
        }
        *self.fleet.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    /// Applies one presence event
    ///
    /// Going offline only clears the entry when it still names `gate_id`, so a
    /// late offline from an old gate cannot erase a newer login elsewhere.
    pub fn apply_presence(&self, uid: u32, gate_id: u32, online: bool) {
        let mut fleet = self.fleet.write().unwrap_or_else(|e| e.into_inner());
        let current = fleet.get(&uid).copied();
        if online {
            if current == Some(gate_id) {
                return;
            }
            Arc::make_mut(&mut *fleet).insert(uid, gate_id);
        } else if current == Some(gate_id) {
            Arc::make_mut(&mut *fleet).remove(&uid);
        }
    }

    /// Registers interest in `uid` going offline, replacing any older waiter
    pub fn register_kick_waiter(&self, uid: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.kick_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uid, tx);
        rx
    }

    pub fn fulfil_kick_waiter(&self, uid: u32) {
        let waiter = self
            .kick_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&uid);
        if let Some(tx) = waiter {
            debug!("Kick waiter for uid {} fulfilled", uid);
            let _ = tx.send(());
        }
    }

    pub fn cancel_kick_waiter(&self, uid: u32) {
        self.kick_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_session;

    #[tokio::test]
    async fn test_bind_and_lookup() {
        let registry = Registry::new();
        let session = test_session(1);
        registry.insert_session(Arc::clone(&session));
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.bound_count(), 0);

        session.set_uid(10001);
        assert!(registry.bind_uid(10001, &session));
        assert!(Arc::ptr_eq(&registry.get_by_uid(10001).unwrap(), &session));
        assert!(Arc::ptr_eq(&registry.get_by_sid(1).unwrap(), &session));
        assert_eq!(registry.bound_count(), 1);
    }

    #[tokio::test]
    async fn test_uid_held_by_another_session() {
        let registry = Registry::new();
        let first = test_session(1);
        let second = test_session(2);
        assert!(registry.bind_uid(10001, &first));
        assert!(!registry.bind_uid(10001, &second));
        assert!(registry.bind_uid(10001, &first));
    }

    #[tokio::test]
    async fn test_remove_leaves_newer_binding() {
        let registry = Registry::new();
        let old = test_session(1);
        let new = test_session(2);
        old.set_uid(10001);
        new.set_uid(10001);

        registry.insert_session(Arc::clone(&old));
        registry.insert_session(Arc::clone(&new));
        registry.bind_uid(10001, &new);

        registry.remove_session(&old);
        assert!(registry.get_by_sid(1).is_none());
        assert!(Arc::ptr_eq(&registry.get_by_uid(10001).unwrap(), &new));

        registry.remove_session(&new);
        assert!(registry.get_by_uid(10001).is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_replace_fleet_keeps_local_truth() {
        let registry = Registry::new();
        let session = test_session(1);
        session.set_uid(10001);
        registry.bind_uid(10001, &session);

        let snapshot = HashMap::from([(10002, 7), (10003, 9), (10004, 7)]);
        registry.replace_fleet(snapshot, 7);

        let fleet = registry.fleet();
        assert_eq!(fleet.get(&10001), Some(&7));
        assert_eq!(fleet.get(&10002), None);
        assert_eq!(fleet.get(&10003), Some(&9));
        assert_eq!(fleet.get(&10004), None);
    }

    #[test]
    fn test_offline_only_clears_matching_gate() {
        let registry = Registry::new();
        registry.apply_presence(10001, 3, true);
        registry.apply_presence(10001, 4, false);
        assert_eq!(registry.fleet_owner(10001), Some(3));

        registry.apply_presence(10001, 3, false);
        assert_eq!(registry.fleet_owner(10001), None);
    }

    #[test]
    fn test_snapshot_readers_are_isolated() {
        let registry = Registry::new();
        registry.apply_presence(1, 1, true);
        let before = registry.fleet();
        registry.apply_presence(2, 1, true);
        assert_eq!(before.len(), 1);
        assert_eq!(registry.fleet().len(), 2);
    }

    #[tokio::test]
    async fn test_kick_waiter() {
        let registry = Registry::new();
        let waiter = registry.register_kick_waiter(10001);
        registry.fulfil_kick_waiter(10001);
        assert!(waiter.await.is_ok());

        let cancelled = registry.register_kick_waiter(10002);
        registry.cancel_kick_waiter(10002);
        assert!(cancelled.await.is_err());
    }
}
