//! Document routes and share links.
//!
//! A document view lives at `<base>/documents/<docID>?userName=<name>`.
//! The share link is the same address without the `userName` parameter, so
//! whoever opens it picks their own name.

use crate::ids::{DocId, IdError, UserName};
use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Not a document route: {0}")]
    NotADocumentRoute(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    #[error("{0}")]
    Clipboard(String),
}

/// Address of a document view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRoute {
    base: Url,
    doc_id: DocId,
    user_name: Option<UserName>,
}

impl DocumentRoute {
    /// Route for `doc_id` under `base` (e.g. `https://docs.example.com/`).
    pub fn new(base: Url, doc_id: DocId) -> Result<Self, ShareError> {
        if base.cannot_be_a_base() {
            return Err(ShareError::NotADocumentRoute(base.to_string()));
        }
        Ok(Self {
            base,
            doc_id,
            user_name: None,
        })
    }

    pub fn with_user(mut self, user_name: UserName) -> Self {
        self.user_name = Some(user_name);
        self
    }

    /// Parse a full document address.
    ///
    /// ```
    /// use docsync_core::DocumentRoute;
    ///
    /// let route = DocumentRoute::parse("https://docs.example.com/documents/doc1?userName=alice").unwrap();
    /// assert_eq!(route.doc_id().as_str(), "doc1");
    /// assert_eq!(route.share_url().as_str(), "https://docs.example.com/documents/doc1");
    /// ```
    pub fn parse(input: &str) -> Result<Self, ShareError> {
        let url = Url::parse(input)?;
        let segments: Vec<&str> = url
            .path_segments()
            .ok_or_else(|| ShareError::NotADocumentRoute(input.to_string()))?
            .filter(|s| !s.is_empty())
            .collect();

        let n = segments.len();
        if n < 2 || segments[n - 2] != "documents" {
            return Err(ShareError::NotADocumentRoute(input.to_string()));
        }
        let doc_id: DocId = segments[n - 1].parse()?;

        let user_name = url
            .query_pairs()
            .find(|(key, _)| key == "userName")
            .map(|(_, value)| UserName::try_from(value.into_owned()))
            .transpose()?;

        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        base.set_path(&format!("/{}", segments[..n - 2].join("/")));

        Ok(Self {
            base,
            doc_id,
            user_name,
        })
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn user_name(&self) -> Option<&UserName> {
        self.user_name.as_ref()
    }

    /// Address to hand to other people.
    pub fn share_url(&self) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("documents")
                .push(self.doc_id.as_str());
        }
        url
    }

    /// Full address of this view, including the user name if any.
    pub fn url(&self) -> Url {
        let mut url = self.share_url();
        if let Some(user) = &self.user_name {
            url.query_pairs_mut().append_pair("userName", user.as_str());
        }
        url
    }
}

/// Somewhere to put a share link.
#[async_trait]
pub trait Clipboard: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<(), ShareError>;
}

/// Clipboard held in memory, optionally failing every write.
#[derive(Default)]
pub struct MemoryClipboard {
    contents: Mutex<Option<String>>,
    failure: Option<String>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clipboard that rejects every write with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            contents: Mutex::new(None),
            failure: Some(reason.into()),
        }
    }

    pub fn contents(&self) -> Option<String> {
        self.contents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Clipboard for MemoryClipboard {
    async fn write_text(&self, text: &str) -> Result<(), ShareError> {
        if let Some(reason) = &self.failure {
            return Err(ShareError::Clipboard(reason.clone()));
        }
        *self.contents.lock().unwrap_or_else(|e| e.into_inner()) = Some(text.to_string());
        Ok(())
    }
}
