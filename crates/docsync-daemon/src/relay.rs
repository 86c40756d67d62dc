//! The relay: the single sequencer for every open document.
//!
//! The relay is the only place edits are ordered. Each `send-changes` is
//! composed into the room's document in the order it is received and then
//! relayed, in that same order, to every other connection viewing the
//! document. A connection starts receiving `receive-changes` at the moment
//! its `get-document` is answered, so the loaded snapshot plus the relayed
//! deltas always add up to the room's document.
//!
//! The relay never touches sockets. Every handler returns the `Delivery`s
//! the caller should send, which keeps it testable without a network.

use docsync_core::{
    ClientEvent, Delta, DocId, DocumentStore, Membership, PresenceRegistry, ServerEvent,
    StoreError, StoredDocument, TitleUpdate, UserName,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An event to send to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub conn_id: String,
    pub event: ServerEvent,
}

impl Delivery {
    fn new(conn_id: &str, event: ServerEvent) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            event,
        }
    }
}

struct Room {
    doc: StoredDocument,
    /// Connections that loaded this document, in load order.
    viewers: Vec<String>,
    dirty: bool,
    /// False when the stored copy could not be read. Such a room is served
    /// empty but never saved, and is reloaded once nobody views it.
    persist: bool,
}

pub struct Relay {
    store: Arc<dyn DocumentStore>,
    rooms: HashMap<DocId, Room>,
    /// Document each connection is viewing.
    viewing: HashMap<String, DocId>,
    presence: PresenceRegistry,
}

impl Relay {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            rooms: HashMap::new(),
            viewing: HashMap::new(),
            presence: PresenceRegistry::new(),
        }
    }

    /// Dispatch one client event.
    pub async fn handle(&mut self, conn_id: &str, event: ClientEvent) -> Vec<Delivery> {
        match event {
            ClientEvent::GetDocument(doc_id) => self.get_document(conn_id, doc_id).await,
            ClientEvent::SendChanges(delta) => self.send_changes(conn_id, delta),
            ClientEvent::UpdateTitle(update) => self.update_title(conn_id, update).await,
            ClientEvent::JoinDocument(membership) => self.join(conn_id, membership),
            ClientEvent::LeaveDocument(membership) => self.leave(conn_id, membership),
        }
    }

    async fn get_document(&mut self, conn_id: &str, doc_id: DocId) -> Vec<Delivery> {
        self.stop_viewing(conn_id);
        self.open_room(&doc_id).await;

        let Some(room) = self.rooms.get_mut(&doc_id) else {
            return Vec::new();
        };
        room.viewers.push(conn_id.to_string());
        self.viewing.insert(conn_id.to_string(), doc_id.clone());
        debug!(doc = %doc_id, conn = conn_id, viewers = room.viewers.len(), "Document requested");

        vec![
            Delivery::new(conn_id, ServerEvent::LoadDocument(room.doc.content.clone())),
            Delivery::new(conn_id, ServerEvent::TitleUpdated(room.doc.title.clone())),
        ]
    }

    fn send_changes(&mut self, conn_id: &str, delta: Delta) -> Vec<Delivery> {
        let Some(doc_id) = self.viewing.get(conn_id) else {
            warn!("send-changes from {} before get-document, dropping", conn_id);
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(doc_id) else {
            return Vec::new();
        };

        match room.doc.content.apply(&delta) {
            Ok(next) => {
                room.doc.content = next;
                room.dirty = true;
            }
            Err(e) => {
                warn!(doc = %doc_id, "Rejecting change from {}: {}", conn_id, e);
                return Vec::new();
            }
        }

        room.viewers
            .iter()
            .filter(|c| c.as_str() != conn_id)
            .map(|c| Delivery::new(c, ServerEvent::ReceiveChanges(delta.clone())))
            .collect()
    }

    async fn update_title(&mut self, conn_id: &str, update: TitleUpdate) -> Vec<Delivery> {
        self.open_room(&update.doc_id).await;
        let Some(room) = self.rooms.get_mut(&update.doc_id) else {
            return Vec::new();
        };

        info!(doc = %update.doc_id, "Title set to {:?}", update.title);
        room.doc.title = update.title.clone();
        room.dirty = true;

        room.viewers
            .iter()
            .filter(|c| c.as_str() != conn_id)
            .map(|c| Delivery::new(c, ServerEvent::TitleUpdated(update.title.clone())))
            .collect()
    }

    fn join(&mut self, conn_id: &str, membership: Membership) -> Vec<Delivery> {
        let Membership { user_name, doc_id } = membership;
        let existing = self.presence.join(&doc_id, conn_id, user_name.clone());
        info!(doc = %doc_id, user = %user_name, conn = conn_id, "Joined");

        let mut deliveries: Vec<Delivery> = existing
            .into_iter()
            .map(|name| Delivery::new(conn_id, ServerEvent::UserConnected(name)))
            .collect();
        deliveries.extend(self.announce(&doc_id, conn_id, ServerEvent::UserConnected(user_name)));
        deliveries
    }

    fn leave(&mut self, conn_id: &str, membership: Membership) -> Vec<Delivery> {
        let Membership { user_name, doc_id } = membership;
        if self.viewing.get(conn_id) == Some(&doc_id) {
            self.stop_viewing(conn_id);
        }
        if !self.presence.leave(&doc_id, conn_id, &user_name) {
            debug!(doc = %doc_id, user = %user_name, "leave-document without a join");
            return Vec::new();
        }
        info!(doc = %doc_id, user = %user_name, conn = conn_id, "Left");
        self.announce(&doc_id, conn_id, ServerEvent::UserDisconnected(user_name))
    }

    /// A connection went away without leaving.
    pub fn disconnected(&mut self, conn_id: &str) -> Vec<Delivery> {
        self.stop_viewing(conn_id);
        let mut deliveries = Vec::new();
        for (doc_id, name) in self.presence.disconnect(conn_id) {
            info!(doc = %doc_id, user = %name, conn = conn_id, "Dropped");
            deliveries.extend(self.announce(&doc_id, conn_id, ServerEvent::UserDisconnected(name)));
        }
        deliveries
    }

    /// Save every changed document, tell its viewers, and close rooms
    /// nobody is viewing.
    pub async fn flush(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        for (doc_id, room) in self.rooms.iter_mut() {
            if !room.dirty {
                continue;
            }
            if !room.persist {
                warn!(doc = %doc_id, "Not saving a document that failed to load");
                room.dirty = false;
                continue;
            }
            match self.store.save(doc_id, &room.doc).await {
                Ok(()) => {
                    room.dirty = false;
                    debug!(doc = %doc_id, "Saved");
                    deliveries.extend(
                        room.viewers
                            .iter()
                            .map(|c| Delivery::new(c, ServerEvent::SaveChanges)),
                    );
                }
                Err(e) => error!(doc = %doc_id, "Failed to save document: {}", e),
            }
        }

        self.rooms
            .retain(|_, room| room.dirty || !room.viewers.is_empty());
        deliveries
    }

    /// Current content of an open document.
    pub fn document(&self, doc_id: &DocId) -> Option<&StoredDocument> {
        self.rooms.get(doc_id).map(|room| &room.doc)
    }

    pub fn participants(&self, doc_id: &DocId) -> Vec<UserName> {
        self.presence.participants(doc_id)
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Every document the store holds, open or not.
    pub async fn stored_documents(&self) -> Result<Vec<DocId>, StoreError> {
        self.store.list().await
    }

    async fn open_room(&mut self, doc_id: &DocId) {
        if self.rooms.contains_key(doc_id) {
            return;
        }
        let (doc, persist) = match self.store.load(doc_id).await {
            Ok(Some(doc)) => (doc, true),
            Ok(None) => {
                info!(doc = %doc_id, "New document");
                (StoredDocument::default(), true)
            }
            Err(e) => {
                error!(doc = %doc_id, "Failed to load document, serving it empty: {}", e);
                (StoredDocument::default(), false)
            }
        };
        self.rooms.insert(
            doc_id.clone(),
            Room {
                doc,
                viewers: Vec::new(),
                dirty: false,
                persist,
            },
        );
    }

    fn stop_viewing(&mut self, conn_id: &str) {
        if let Some(doc_id) = self.viewing.remove(conn_id) {
            if let Some(room) = self.rooms.get_mut(&doc_id) {
                room.viewers.retain(|c| c != conn_id);
            }
        }
    }

    /// `event` to every connection present in `doc_id` except `conn_id`.
    fn announce(&self, doc_id: &DocId, conn_id: &str, event: ServerEvent) -> Vec<Delivery> {
        self.presence
            .connections(doc_id)
            .into_iter()
            .filter(|c| c != conn_id)
            .map(|c| Delivery {
                conn_id: c,
                event: event.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docsync_core::InMemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn doc1() -> DocId {
        "doc1".parse().unwrap()
    }

    fn name(s: &str) -> UserName {
        s.parse().unwrap()
    }

    fn join(user: &str) -> ClientEvent {
        ClientEvent::JoinDocument(Membership {
            user_name: name(user),
            doc_id: doc1(),
        })
    }

    fn to(conn: &str, event: ServerEvent) -> Delivery {
        Delivery::new(conn, event)
    }

    async fn relay_with(text: &str) -> (Relay, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .save(
                &doc1(),
                &StoredDocument {
                    title: "Notes".into(),
                    content: Delta::new().insert(text),
                },
            )
            .await
            .unwrap();
        (Relay::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_get_document_sends_content_then_title() {
        let (mut relay, _) = relay_with("Hello").await;

        let out = relay
            .handle("conn-1", ClientEvent::GetDocument(doc1()))
            .await;

        assert_eq!(
            out,
            vec![
                to("conn-1", ServerEvent::LoadDocument(Delta::new().insert("Hello"))),
                to("conn-1", ServerEvent::TitleUpdated("Notes".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_document_loads_empty() {
        let mut relay = Relay::new(Arc::new(InMemoryStore::new()));
        let out = relay
            .handle("conn-1", ClientEvent::GetDocument("fresh".parse().unwrap()))
            .await;
        assert_eq!(out[0].event, ServerEvent::LoadDocument(Delta::new()));
        assert_eq!(
            out[1].event,
            ServerEvent::TitleUpdated("Untitled Document".into())
        );
    }

    #[tokio::test]
    async fn test_changes_are_composed_and_relayed_to_others() {
        let (mut relay, _) = relay_with("Hello").await;
        relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        relay.handle("conn-2", ClientEvent::GetDocument(doc1())).await;

        let delta = Delta::new().retain(5).insert("!");
        let out = relay
            .handle("conn-1", ClientEvent::SendChanges(delta.clone()))
            .await;

        assert_eq!(out, vec![to("conn-2", ServerEvent::ReceiveChanges(delta))]);
        assert_eq!(relay.document(&doc1()).unwrap().content.plain_text(), "Hello!");
    }

    #[tokio::test]
    async fn test_late_loader_gets_composed_snapshot() {
        let (mut relay, _) = relay_with("Hello").await;
        relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().retain(5).insert("!")))
            .await;

        let out = relay.handle("conn-2", ClientEvent::GetDocument(doc1())).await;
        assert_eq!(
            out[0].event,
            ServerEvent::LoadDocument(Delta::new().insert("Hello!"))
        );
    }

    #[tokio::test]
    async fn test_invalid_change_is_not_relayed() {
        let (mut relay, _) = relay_with("Hi").await;
        relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        relay.handle("conn-2", ClientEvent::GetDocument(doc1())).await;

        let out = relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().retain(9).delete(1)))
            .await;

        assert!(out.is_empty());
        assert_eq!(relay.document(&doc1()).unwrap().content.plain_text(), "Hi");
    }

    #[tokio::test]
    async fn test_changes_before_get_document_are_dropped() {
        let (mut relay, _) = relay_with("Hi").await;
        let out = relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().insert("x")))
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_title_update_relayed_to_others() {
        let (mut relay, _) = relay_with("").await;
        relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        relay.handle("conn-2", ClientEvent::GetDocument(doc1())).await;

        let out = relay
            .handle(
                "conn-1",
                ClientEvent::UpdateTitle(TitleUpdate {
                    doc_id: doc1(),
                    title: "Report".into(),
                }),
            )
            .await;

        assert_eq!(out, vec![to("conn-2", ServerEvent::TitleUpdated("Report".into()))]);
        assert_eq!(relay.document(&doc1()).unwrap().title, "Report");
    }

    #[tokio::test]
    async fn test_presence_join_and_leave() {
        let (mut relay, _) = relay_with("").await;

        assert!(relay.handle("conn-1", join("alice")).await.is_empty());

        let out = relay.handle("conn-2", join("bob")).await;
        assert_eq!(
            out,
            vec![
                to("conn-2", ServerEvent::UserConnected(name("alice"))),
                to("conn-1", ServerEvent::UserConnected(name("bob"))),
            ]
        );

        let out = relay
            .handle(
                "conn-2",
                ClientEvent::LeaveDocument(Membership {
                    user_name: name("bob"),
                    doc_id: doc1(),
                }),
            )
            .await;
        assert_eq!(out, vec![to("conn-1", ServerEvent::UserDisconnected(name("bob")))]);
        assert_eq!(relay.participants(&doc1()), vec![name("alice")]);
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure() {
        let (mut relay, _) = relay_with("").await;
        relay.handle("conn-1", join("alice")).await;
        relay.handle("conn-2", join("bob")).await;
        relay.handle("conn-2", ClientEvent::GetDocument(doc1())).await;

        let out = relay.disconnected("conn-2");

        assert_eq!(out, vec![to("conn-1", ServerEvent::UserDisconnected(name("bob")))]);
        assert_eq!(relay.participants(&doc1()), vec![name("alice")]);
    }

    #[tokio::test]
    async fn test_flush_saves_and_signals_viewers() {
        let (mut relay, store) = relay_with("Hello").await;
        relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().retain(5).insert("!")))
            .await;

        let out = relay.flush().await;
        assert_eq!(out, vec![to("conn-1", ServerEvent::SaveChanges)]);
        let saved = store.load(&doc1()).await.unwrap().unwrap();
        assert_eq!(saved.content.plain_text(), "Hello!");

        assert!(relay.flush().await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_closes_unviewed_rooms() {
        let (mut relay, store) = relay_with("Hello").await;
        relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().insert(">")))
            .await;
        relay.disconnected("conn-1");

        assert!(relay.flush().await.is_empty());
        assert_eq!(relay.open_rooms(), 0);
        let saved = store.load(&doc1()).await.unwrap().unwrap();
        assert_eq!(saved.content.plain_text(), ">Hello");
    }

    #[tokio::test]
    async fn test_stored_documents_include_closed_rooms() {
        let (mut relay, _) = relay_with("Hello").await;
        let other: DocId = "other".parse().unwrap();
        relay.handle("conn-1", ClientEvent::GetDocument(other.clone())).await;
        relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().insert("new")))
            .await;
        relay.flush().await;

        let mut ids = relay.stored_documents().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec![doc1(), other]);
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn load(&self, _id: &DocId) -> Result<Option<StoredDocument>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn save(&self, _id: &DocId, _doc: &StoredDocument) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }

        async fn list(&self) -> Result<Vec<DocId>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_serves_empty_document() {
        let mut relay = Relay::new(Arc::new(BrokenStore));
        let out = relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        assert_eq!(out[0].event, ServerEvent::LoadDocument(Delta::new()));

        relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().insert("x")))
            .await;
        assert!(relay.flush().await.is_empty());
        assert_eq!(relay.open_rooms(), 1);
    }

    /// Fails the first `load`, then behaves like the wrapped store.
    struct FlakyStore {
        inner: InMemoryStore,
        fail_next_load: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn load(&self, id: &DocId) -> Result<Option<StoredDocument>, StoreError> {
            if self.fail_next_load.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk hiccup".into()));
            }
            self.inner.load(id).await
        }

        async fn save(&self, id: &DocId, doc: &StoredDocument) -> Result<(), StoreError> {
            self.inner.save(id, doc).await
        }

        async fn list(&self) -> Result<Vec<DocId>, StoreError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_failed_load_never_overwrites_stored_document() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryStore::new(),
            fail_next_load: AtomicBool::new(false),
        });
        let original = StoredDocument {
            title: "Thesis".into(),
            content: Delta::new().insert("Ten pages of work"),
        };
        store.save(&doc1(), &original).await.unwrap();
        store.fail_next_load.store(true, Ordering::SeqCst);
        let mut relay = Relay::new(store.clone());

        let out = relay.handle("conn-1", ClientEvent::GetDocument(doc1())).await;
        assert_eq!(out[0].event, ServerEvent::LoadDocument(Delta::new()));
        relay
            .handle("conn-1", ClientEvent::SendChanges(Delta::new().insert("x")))
            .await;
        relay
            .handle(
                "conn-1",
                ClientEvent::UpdateTitle(TitleUpdate {
                    doc_id: doc1(),
                    title: "Scratch".into(),
                }),
            )
            .await;

        assert!(relay.flush().await.is_empty());
        assert_eq!(store.load(&doc1()).await.unwrap(), Some(original.clone()));

        // Once nobody views it, the room is dropped and the next open reloads.
        relay.disconnected("conn-1");
        relay.flush().await;
        assert_eq!(relay.open_rooms(), 0);

        let out = relay.handle("conn-2", ClientEvent::GetDocument(doc1())).await;
        assert_eq!(out[0].event, ServerEvent::LoadDocument(original.content));
        assert_eq!(out[1].event, ServerEvent::TitleUpdated("Thesis".into()));
    }
}
