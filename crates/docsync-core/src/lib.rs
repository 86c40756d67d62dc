//! docsync-core: transport-agnostic library for collaborative rich-text editing.
//!
//! This crate provides the core functionality for:
//! - Rich-text deltas (retain/insert/delete) and their composition
//! - The wire protocol spoken between clients and the relay server
//! - The per-document `Loading -> Ready` state machine and the sync engine
//! - Session presence, share links, and the Channel/Editor/DocumentStore traits

pub mod channel;
pub mod delta;
pub mod document;
pub mod editor;
pub mod events;
pub mod ids;
pub mod presence;
pub mod protocol;
pub mod share;
pub mod store;
pub mod sync_engine;

pub use channel::{Channel, ChannelError, ChannelNotice, DisconnectReason, MemoryChannel};
pub use delta::{Attributes, Delta, DeltaError, Insert, Op};
pub use document::{DocumentSync, SyncState, DEFAULT_TITLE};
pub use editor::{ChangeSource, Editor, EditorError, MemoryEditor, TextChange, PLACEHOLDER};
pub use events::{EngineEvent, EventBus, NoticeLevel, Subscription};
pub use ids::{DocId, IdError, UserName};
pub use presence::{PresenceList, PresenceRegistry};
pub use protocol::{ClientEvent, Membership, ProtocolError, ServerEvent, TitleUpdate};
pub use share::{Clipboard, DocumentRoute, MemoryClipboard, ShareError};
pub use store::{DocumentStore, InMemoryStore, StoreError, StoredDocument};
pub use sync_engine::{EngineConfig, SyncEngine, SyncError, SyncSession};
