//! File-backed document store using tokio::fs.
//!
//! One pretty-printed JSON file per document: `<root>/<id>.json`. Bytes of
//! the id outside `[A-Za-z0-9_-]` are written as `%XX` so any id maps to a
//! single safe file name and back.

use async_trait::async_trait;
use docsync_core::{DocId, DocumentStore, StoreError, StoredDocument};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, id: &DocId) -> PathBuf {
        self.root.join(format!("{}.json", encode_file_name(id.as_str())))
    }
}

fn encode_file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn load(&self, id: &DocId) -> Result<Option<StoredDocument>, StoreError> {
        let path = self.path_for(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, id: &DocId, doc: &StoredDocument) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;

        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(doc)?;

        // Readers only ever see a complete file.
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Saved document {} to {:?}", id, path);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DocId>, StoreError> {
        let mut ids = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match decode_file_name(stem).map(DocId::try_from) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!("Skipping unrecognised file {:?} in document store", name),
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::Delta;
    use tempfile::TempDir;

    fn doc(title: &str, text: &str) -> StoredDocument {
        StoredDocument {
            title: title.into(),
            content: Delta::new().insert(text),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        let id: DocId = "doc1".parse().unwrap();

        assert_eq!(store.load(&id).await.unwrap(), None);

        store.save(&id, &doc("Report", "Hello")).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(doc("Report", "Hello")));
        assert!(dir.path().join("doc1.json").exists());
    }

    #[tokio::test]
    async fn test_unsafe_ids_stay_inside_root() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("docs"));
        let id: DocId = "../escape/me".parse().unwrap();

        store.save(&id, &doc("t", "x")).await.unwrap();

        assert!(dir.path().join("docs").join("%2E%2E%2Fescape%2Fme.json").exists());
        assert_eq!(store.list().await.unwrap(), vec![id.clone()]);
        assert_eq!(store.load(&id).await.unwrap(), Some(doc("t", "x")));
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let store = FileStore::new(dir.path().to_path_buf());

        let result = store.load(&"bad".parse().unwrap()).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_file_name_encoding() {
        assert_eq!(encode_file_name("abc-1_2"), "abc-1_2");
        assert_eq!(encode_file_name("a b"), "a%20b");
        assert_eq!(decode_file_name("a%20b").as_deref(), Some("a b"));
        assert_eq!(decode_file_name("bad%2"), None);
    }
}
