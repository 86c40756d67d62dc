//! Per-document sync state machine: `Loading -> Ready`.
//!
//! `DocumentSync` only decides. It never touches the editor or the channel;
//! each input returns an outcome and the sync engine carries it out. That
//! keeps the single-load guard and the loading buffer testable without a
//! transport.
//!
//! One *load round* starts every time a connection comes up and
//! `get-document` is requested. Within a round the first `load-document`
//! moves the document to `Ready`; any further one is a duplicate. Deltas that
//! arrive while the round is still loading are buffered and handed back, in
//! arrival order, together with the loaded content.

use crate::delta::Delta;
use crate::ids::DocId;
use serde::Serialize;
use tracing::debug;

/// Title shown until the server says otherwise.
pub const DEFAULT_TITLE: &str = "Untitled Document";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Waiting for `load-document`. Editing is disabled.
    Loading,
    /// Content loaded. Local and remote edits flow.
    Ready,
}

/// Result of a `load-document`.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// First load of the round: show `content`, then apply `replay` in order.
    Apply { content: Delta, replay: Vec<Delta> },
    /// Already loaded this round.
    Duplicate,
    /// No `get-document` is outstanding (e.g. still disconnected).
    Unrequested,
}

/// Result of a `receive-changes`.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Apply(Delta),
    /// Held until the content loads.
    Buffered,
    /// No load in progress and not ready, so there is nothing to apply to.
    Ignored,
}

#[derive(Debug)]
pub struct DocumentSync {
    doc_id: DocId,
    state: SyncState,
    title: String,
    round: u64,
    requested: bool,
    buffered: Vec<Delta>,
}

impl DocumentSync {
    pub fn new(doc_id: DocId) -> Self {
        Self {
            doc_id,
            state: SyncState::Loading,
            title: DEFAULT_TITLE.to_string(),
            round: 0,
            requested: false,
            buffered: Vec::new(),
        }
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SyncState::Ready
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Number of load rounds started so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Start a new load round: back to `Loading` with `get-document`
    /// outstanding. Returns the round number.
    pub fn begin_load(&mut self) -> u64 {
        self.round += 1;
        self.state = SyncState::Loading;
        self.requested = true;
        self.buffered.clear();
        debug!(doc = %self.doc_id, round = self.round, "Load round started");
        self.round
    }

    /// The connection went away. Back to `Loading` with nothing requested.
    /// Returns the previous state.
    pub fn reset(&mut self) -> SyncState {
        let previous = self.state;
        self.state = SyncState::Loading;
        self.requested = false;
        self.buffered.clear();
        previous
    }

    pub fn on_load(&mut self, content: Delta) -> LoadOutcome {
        if self.state == SyncState::Ready {
            return LoadOutcome::Duplicate;
        }
        if !self.requested {
            return LoadOutcome::Unrequested;
        }
        self.state = SyncState::Ready;
        self.requested = false;
        LoadOutcome::Apply {
            content,
            replay: std::mem::take(&mut self.buffered),
        }
    }

    pub fn on_remote_change(&mut self, delta: Delta) -> RemoteOutcome {
        match self.state {
            SyncState::Ready => RemoteOutcome::Apply(delta),
            SyncState::Loading if self.requested => {
                self.buffered.push(delta);
                RemoteOutcome::Buffered
            }
            SyncState::Loading => RemoteOutcome::Ignored,
        }
    }

    /// Local title edit. Only accepted once the document is ready.
    pub fn edit_title(&mut self, title: String) -> bool {
        if self.state != SyncState::Ready {
            return false;
        }
        self.title = title;
        true
    }

    /// Title from the server. Last writer wins, in any state.
    pub fn set_remote_title(&mut self, title: String) {
        self.title = title;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loading() -> DocumentSync {
        let mut doc = DocumentSync::new("doc1".parse().unwrap());
        doc.begin_load();
        doc
    }

    #[test]
    fn test_starts_loading_with_default_title() {
        let doc = DocumentSync::new("doc1".parse().unwrap());
        assert_eq!(doc.state(), SyncState::Loading);
        assert_eq!(doc.title(), DEFAULT_TITLE);
        assert_eq!(doc.round(), 0);
    }

    #[test]
    fn test_single_load() {
        let mut doc = loading();

        let first = doc.on_load(Delta::new().insert("Hello"));
        assert_eq!(
            first,
            LoadOutcome::Apply {
                content: Delta::new().insert("Hello"),
                replay: vec![]
            }
        );
        assert!(doc.is_ready());

        assert_eq!(doc.on_load(Delta::new().insert("Other")), LoadOutcome::Duplicate);
        assert!(doc.is_ready());
    }

    #[test]
    fn test_unrequested_load_is_ignored() {
        let mut doc = DocumentSync::new("doc1".parse().unwrap());
        assert_eq!(doc.on_load(Delta::new().insert("x")), LoadOutcome::Unrequested);
        assert_eq!(doc.state(), SyncState::Loading);
    }

    #[test]
    fn test_changes_buffered_while_loading() {
        let mut doc = loading();
        let d1 = Delta::new().insert("a");
        let d2 = Delta::new().retain(1).insert("b");

        assert_eq!(doc.on_remote_change(d1.clone()), RemoteOutcome::Buffered);
        assert_eq!(doc.on_remote_change(d2.clone()), RemoteOutcome::Buffered);
        assert_eq!(doc.buffered_len(), 2);

        match doc.on_load(Delta::new()) {
            LoadOutcome::Apply { replay, .. } => assert_eq!(replay, vec![d1, d2]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(doc.buffered_len(), 0);

        let d3 = Delta::new().delete(1);
        assert_eq!(doc.on_remote_change(d3.clone()), RemoteOutcome::Apply(d3));
    }

    #[test]
    fn test_reset_drops_buffer_and_requires_new_round() {
        let mut doc = loading();
        doc.on_load(Delta::new().insert("Hello"));
        assert_eq!(doc.reset(), SyncState::Ready);

        assert_eq!(doc.on_remote_change(Delta::new().insert("x")), RemoteOutcome::Ignored);
        assert_eq!(doc.on_load(Delta::new()), LoadOutcome::Unrequested);

        assert_eq!(doc.begin_load(), 2);
        assert!(matches!(doc.on_load(Delta::new()), LoadOutcome::Apply { .. }));
    }

    #[test]
    fn test_title_edits() {
        let mut doc = loading();
        assert!(!doc.edit_title("Early".into()));
        assert_eq!(doc.title(), DEFAULT_TITLE);

        doc.set_remote_title("Remote".into());
        assert_eq!(doc.title(), "Remote");

        doc.on_load(Delta::new());
        assert!(doc.edit_title("Report".into()));
        assert_eq!(doc.title(), "Report");
    }
}
