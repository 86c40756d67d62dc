//! Typed events exchanged over the document channel.
//!
//! Client events flow client -> server, server events server -> client.
//! Both serialize as `{"event": "<kebab-name>", "payload": ...}`.

use crate::delta::Delta;
use crate::ids::{DocId, UserName};
use crate::protocol::encoding::{self, ProtocolError};
use serde::{Deserialize, Serialize};

/// Payload of `join-document` and `leave-document`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    #[serde(rename = "userName")]
    pub user_name: UserName,
    #[serde(rename = "docID")]
    pub doc_id: DocId,
}

/// Payload of `update-title`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleUpdate {
    #[serde(rename = "docID")]
    pub doc_id: DocId,
    pub title: String,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Request the initial content of a document.
    GetDocument(DocId),
    /// Broadcast a local edit.
    SendChanges(Delta),
    /// Persist and broadcast a title.
    UpdateTitle(TitleUpdate),
    /// Register presence.
    JoinDocument(Membership),
    /// Deregister presence.
    LeaveDocument(Membership),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::GetDocument(_) => "get-document",
            ClientEvent::SendChanges(_) => "send-changes",
            ClientEvent::UpdateTitle(_) => "update-title",
            ClientEvent::JoinDocument(_) => "join-document",
            ClientEvent::LeaveDocument(_) => "leave-document",
        }
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        encoding::encode(self)
    }

    pub fn from_frame(data: &[u8]) -> Result<Self, ProtocolError> {
        encoding::decode(data)
    }
}

/// Events the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// One-shot response to `get-document`.
    LoadDocument(Delta),
    /// A remote edit to apply.
    ReceiveChanges(Delta),
    /// The title changed.
    TitleUpdated(String),
    /// A participant joined the document.
    UserConnected(UserName),
    /// A participant left the document.
    UserDisconnected(UserName),
    /// The server persisted the document. No client action required.
    SaveChanges,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::LoadDocument(_) => "load-document",
            ServerEvent::ReceiveChanges(_) => "receive-changes",
            ServerEvent::TitleUpdated(_) => "title-updated",
            ServerEvent::UserConnected(_) => "user-connected",
            ServerEvent::UserDisconnected(_) => "user-disconnected",
            ServerEvent::SaveChanges => "save-changes",
        }
    }

    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        encoding::encode(self)
    }

    pub fn from_frame(data: &[u8]) -> Result<Self, ProtocolError> {
        encoding::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc1() -> DocId {
        "doc1".parse().unwrap()
    }

    fn alice() -> UserName {
        "alice".parse().unwrap()
    }

    fn wire(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn test_get_document_wire_format() {
        let frame = ClientEvent::GetDocument(doc1()).to_frame().unwrap();
        assert_eq!(wire(&frame), json!({"event": "get-document", "payload": "doc1"}));
    }

    #[test]
    fn test_send_changes_wire_format() {
        let delta = Delta::new().retain(5).insert("!");
        let frame = ClientEvent::SendChanges(delta).to_frame().unwrap();
        assert_eq!(
            wire(&frame),
            json!({
                "event": "send-changes",
                "payload": {"ops": [{"retain": 5}, {"insert": "!"}]}
            })
        );
    }

    #[test]
    fn test_update_title_wire_format() {
        let event = ClientEvent::UpdateTitle(TitleUpdate {
            doc_id: doc1(),
            title: "Report".into(),
        });
        assert_eq!(
            wire(&event.to_frame().unwrap()),
            json!({"event": "update-title", "payload": {"docID": "doc1", "title": "Report"}})
        );
    }

    #[test]
    fn test_join_document_wire_format() {
        let event = ClientEvent::JoinDocument(Membership {
            user_name: alice(),
            doc_id: doc1(),
        });
        assert_eq!(
            wire(&event.to_frame().unwrap()),
            json!({"event": "join-document", "payload": {"userName": "alice", "docID": "doc1"}})
        );
        assert_eq!(event.name(), "join-document");
    }

    #[test]
    fn test_parse_server_events() {
        let load = ServerEvent::from_frame(
            br#"{"event":"load-document","payload":{"ops":[{"insert":"Hello"}]}}"#,
        )
        .unwrap();
        assert_eq!(load, ServerEvent::LoadDocument(Delta::new().insert("Hello")));

        let title = ServerEvent::from_frame(br#"{"event":"title-updated","payload":"Report"}"#)
            .unwrap();
        assert_eq!(title, ServerEvent::TitleUpdated("Report".into()));

        let joined = ServerEvent::from_frame(br#"{"event":"user-connected","payload":"bob"}"#)
            .unwrap();
        assert_eq!(joined, ServerEvent::UserConnected("bob".parse().unwrap()));
    }

    #[test]
    fn test_save_changes_has_no_payload() {
        let frame = ServerEvent::SaveChanges.to_frame().unwrap();
        assert_eq!(wire(&frame), json!({"event": "save-changes"}));

        let parsed = ServerEvent::from_frame(br#"{"event":"save-changes"}"#).unwrap();
        assert_eq!(parsed, ServerEvent::SaveChanges);
    }

    #[test]
    fn test_reject_blank_user_name() {
        assert!(ServerEvent::from_frame(br#"{"event":"user-connected","payload":""}"#).is_err());
    }
}
