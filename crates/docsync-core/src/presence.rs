//! Session presence: who is viewing which document.
//!
//! The server owns the truth in a `PresenceRegistry`. Each client keeps a
//! `PresenceList`, a read-only cache rebuilt from `user-connected` and
//! `user-disconnected` events. Names are not unique, so both sides track a
//! multiset rather than a set.

use crate::ids::{DocId, UserName};
use std::collections::HashMap;

/// Client-side list of other participants in the open document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceList {
    users: Vec<UserName>,
}

impl PresenceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a `user-connected`. Duplicates are kept.
    pub fn user_connected(&mut self, name: UserName) {
        self.users.push(name);
    }

    /// Record a `user-disconnected`. Removes the first matching entry only.
    /// Returns false if nobody by that name was listed.
    pub fn user_disconnected(&mut self, name: &UserName) -> bool {
        match self.users.iter().position(|u| u == name) {
            Some(index) => {
                self.users.remove(index);
                true
            }
            None => false,
        }
    }

    /// Forget everyone, e.g. after the connection dropped.
    pub fn clear(&mut self) {
        self.users.clear();
    }

    pub fn users(&self) -> &[UserName] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, name: &UserName) -> bool {
        self.users.contains(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Participant {
    conn: String,
    name: UserName,
}

/// Server-side registry: `docID -> [(connection, userName)]`.
///
/// Entries are created by `join-document` and removed by `leave-document`
/// or when the connection goes away. Never persisted.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    rooms: HashMap<DocId, Vec<Participant>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name` on `conn` to `doc`.
    ///
    /// Returns the participants that were already present, in join order.
    /// The joiner should be told about each of them.
    pub fn join(&mut self, doc: &DocId, conn: &str, name: UserName) -> Vec<UserName> {
        let room = self.rooms.entry(doc.clone()).or_default();
        let existing = room.iter().map(|p| p.name.clone()).collect();
        room.push(Participant {
            conn: conn.to_string(),
            name,
        });
        existing
    }

    /// Remove one entry for `name` on `conn` from `doc`. Returns false if no
    /// such entry existed.
    pub fn leave(&mut self, doc: &DocId, conn: &str, name: &UserName) -> bool {
        let Some(room) = self.rooms.get_mut(doc) else {
            return false;
        };
        let Some(index) = room.iter().position(|p| p.conn == conn && &p.name == name) else {
            return false;
        };
        room.remove(index);
        if room.is_empty() {
            self.rooms.remove(doc);
        }
        true
    }

    /// Remove everything `conn` had joined. Returns the removed
    /// `(doc, name)` pairs so the caller can announce the departures.
    pub fn disconnect(&mut self, conn: &str) -> Vec<(DocId, UserName)> {
        let mut removed = Vec::new();
        self.rooms.retain(|doc, room| {
            room.retain(|p| {
                if p.conn == conn {
                    removed.push((doc.clone(), p.name.clone()));
                    false
                } else {
                    true
                }
            });
            !room.is_empty()
        });
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        removed
    }

    /// Names present in `doc`, in join order.
    pub fn participants(&self, doc: &DocId) -> Vec<UserName> {
        self.rooms
            .get(doc)
            .map(|room| room.iter().map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Distinct connections present in `doc`.
    pub fn connections(&self, doc: &DocId) -> Vec<String> {
        let mut conns: Vec<String> = Vec::new();
        if let Some(room) = self.rooms.get(doc) {
            for p in room {
                if !conns.contains(&p.conn) {
                    conns.push(p.conn.clone());
                }
            }
        }
        conns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> UserName {
        s.parse().unwrap()
    }

    fn doc(s: &str) -> DocId {
        s.parse().unwrap()
    }

    #[test]
    fn test_list_keeps_duplicates() {
        let mut list = PresenceList::new();
        list.user_connected(name("bob"));
        list.user_connected(name("bob"));
        list.user_connected(name("carol"));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_list_disconnect_removes_exactly_one() {
        let mut list = PresenceList::new();
        list.user_connected(name("bob"));
        list.user_connected(name("carol"));
        list.user_connected(name("bob"));

        assert!(list.user_disconnected(&name("bob")));
        assert_eq!(list.users(), &[name("carol"), name("bob")]);

        assert!(!list.user_disconnected(&name("dave")));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_presence_symmetry() {
        for n in 0..5 {
            let mut list = PresenceList::new();
            list.user_connected(name("existing"));
            for _ in 0..n {
                list.user_connected(name("x"));
            }
            assert_eq!(list.len(), n + 1);

            let removed = list.user_disconnected(&name("x"));
            assert_eq!(removed, n > 0);
            assert_eq!(list.len(), if n > 0 { n } else { 1 });
        }
    }

    #[test]
    fn test_registry_join_returns_existing() {
        let mut registry = PresenceRegistry::new();
        let doc1 = doc("doc1");

        assert!(registry.join(&doc1, "conn-1", name("alice")).is_empty());
        assert_eq!(registry.join(&doc1, "conn-2", name("bob")), vec![name("alice")]);
        assert_eq!(registry.participants(&doc1), vec![name("alice"), name("bob")]);
        assert_eq!(registry.connections(&doc1), vec!["conn-1", "conn-2"]);
    }

    #[test]
    fn test_registry_leave() {
        let mut registry = PresenceRegistry::new();
        let doc1 = doc("doc1");
        registry.join(&doc1, "conn-1", name("alice"));

        assert!(!registry.leave(&doc1, "conn-2", &name("alice")));
        assert!(registry.leave(&doc1, "conn-1", &name("alice")));
        assert!(registry.participants(&doc1).is_empty());
        assert!(!registry.leave(&doc1, "conn-1", &name("alice")));
    }

    #[test]
    fn test_registry_disconnect_clears_every_room() {
        let mut registry = PresenceRegistry::new();
        registry.join(&doc("a"), "conn-1", name("alice"));
        registry.join(&doc("b"), "conn-1", name("alice"));
        registry.join(&doc("b"), "conn-2", name("bob"));

        let removed = registry.disconnect("conn-1");
        assert_eq!(
            removed,
            vec![(doc("a"), name("alice")), (doc("b"), name("alice"))]
        );
        assert!(registry.participants(&doc("a")).is_empty());
        assert_eq!(registry.participants(&doc("b")), vec![name("bob")]);
    }
}
