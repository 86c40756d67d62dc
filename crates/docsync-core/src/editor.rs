//! The rich-text editing widget, seen from the sync engine.
//!
//! The widget itself (rendering, cursor, toolbars) lives outside this crate.
//! The engine only needs to read and replace content, apply deltas, toggle
//! editing, and hear about every content mutation together with its source.

use crate::delta::{Delta, DeltaError};
use crate::events::EventBus;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::trace;

/// Text shown while the document is still loading.
pub const PLACEHOLDER: &str = "Loading the document...";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditorError {
    #[error("Editor is disabled")]
    Disabled,

    #[error("Invalid change: {0}")]
    Delta(#[from] DeltaError),
}

/// Who caused a content mutation.
///
/// Only `User` changes are ever sent over the network. Changes made through
/// the API (remote deltas, loaded content) use `Api` or `Silent` so they are
/// never retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    User,
    Api,
    Silent,
}

/// A content mutation reported by the editor.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChange {
    pub delta: Delta,
    pub old_contents: Delta,
    pub source: ChangeSource,
}

/// Editing widget interface.
///
/// Every mutation, whatever its source, is announced on `changes()` after it
/// has been applied.
pub trait Editor: Send + Sync {
    /// Current document content.
    fn contents(&self) -> Delta;

    /// Replace the whole content with `content`, which must be a document.
    fn set_contents(&self, content: Delta, source: ChangeSource) -> Result<(), EditorError>;

    /// Apply a change on top of the current content.
    fn update_contents(&self, delta: &Delta, source: ChangeSource) -> Result<(), EditorError>;

    /// Replace the whole content with plain text.
    fn set_text(&self, text: &str, source: ChangeSource) -> Result<(), EditorError> {
        self.set_contents(Delta::new().insert(text), source)
    }

    fn enable(&self);

    fn disable(&self);

    fn is_enabled(&self) -> bool;

    /// Bus announcing every content mutation.
    fn changes(&self) -> &Arc<EventBus<TextChange>>;
}

struct EditorState {
    contents: Delta,
    enabled: bool,
}

/// Headless editor holding its content in memory.
///
/// Used by tests and by the `docsync open` terminal client. Starts disabled
/// and empty. `apply_user_edit` stands in for typing.
pub struct MemoryEditor {
    state: Mutex<EditorState>,
    changes: Arc<EventBus<TextChange>>,
}

impl Default for MemoryEditor {
    fn default() -> Self {
        Self {
            state: Mutex::new(EditorState {
                contents: Delta::new(),
                enabled: false,
            }),
            changes: Arc::new(EventBus::new()),
        }
    }
}

impl MemoryEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain text of the current content.
    pub fn text(&self) -> String {
        self.contents().plain_text()
    }

    /// Apply an edit as if the user typed it. Fails while the editor is
    /// disabled.
    pub fn apply_user_edit(&self, delta: &Delta) -> Result<(), EditorError> {
        self.mutate(ChangeSource::User, |state| {
            if !state.enabled {
                return Err(EditorError::Disabled);
            }
            Ok((state.contents.apply(delta)?, delta.clone()))
        })
    }

    /// Append text at the end of the document as a user edit.
    pub fn type_text(&self, text: &str) -> Result<(), EditorError> {
        self.mutate(ChangeSource::User, |state| {
            if !state.enabled {
                return Err(EditorError::Disabled);
            }
            let delta = Delta::new().retain(state.contents.length()).insert(text);
            Ok((state.contents.apply(&delta)?, delta))
        })
    }

    /// Compute the next content and the change that produced it, and swap it
    /// in, all under one lock hold. Subscribers hear about it after the lock
    /// is released.
    fn mutate(
        &self,
        source: ChangeSource,
        build: impl FnOnce(&EditorState) -> Result<(Delta, Delta), EditorError>,
    ) -> Result<(), EditorError> {
        let (delta, old_contents) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let (next, delta) = build(&state)?;
            (delta, std::mem::replace(&mut state.contents, next))
        };
        trace!(?source, ops = delta.ops().len(), "Editor content changed");
        self.changes.emit(TextChange {
            delta,
            old_contents,
            source,
        });
        Ok(())
    }
}

impl Editor for MemoryEditor {
    fn contents(&self) -> Delta {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contents
            .clone()
    }

    fn set_contents(&self, content: Delta, source: ChangeSource) -> Result<(), EditorError> {
        if !content.is_document() {
            return Err(DeltaError::NotADocument.into());
        }
        self.mutate(source, |state| {
            let mut change = Delta::new();
            for op in content.ops() {
                change.push(op.clone());
            }
            let change = change.delete(state.contents.length());
            Ok((content, change))
        })
    }

    fn update_contents(&self, delta: &Delta, source: ChangeSource) -> Result<(), EditorError> {
        self.mutate(source, |state| Ok((state.contents.apply(delta)?, delta.clone())))
    }

    fn enable(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enabled = true;
    }

    fn disable(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).enabled
    }

    fn changes(&self) -> &Arc<EventBus<TextChange>> {
        &self.changes
    }
}
