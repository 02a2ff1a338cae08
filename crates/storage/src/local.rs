#![forbid(unsafe_code)]

//! Filesystem-backed collaborators for single-host deployments.

use parking_lot::Mutex;
use pl_core::ids::EntityId;
use pl_sync::clients::{AuthToken, BlobStore, ByteStream, ObjectMetadata, SearchEngine};
use pl_sync::error::{BlobError, SearchError};
use serde_json::Value as JsonValue;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One directory per container, one file per object.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BlobError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf, BlobError> {
        check_name(container)?;
        check_name(key)?;
        Ok(self.root.join(container).join(key))
    }

    fn write(&self, container: &str, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(container, key)?;
        std::fs::create_dir_all(self.root.join(container))?;
        let tmp = partial_path(&path);
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    fn update_object_and_key(
        &self,
        container: &str,
        bytes: &[u8],
        token: &AuthToken,
    ) -> Result<String, BlobError> {
        check_token(token)?;
        let key = uuid::Uuid::new_v4().to_string();
        self.write(container, &key, bytes)?;
        Ok(key)
    }

    fn copy_object(
        &self,
        src_container: &str,
        src_key: &str,
        dst_container: &str,
        dst_key: &str,
        token: &AuthToken,
    ) -> Result<(), BlobError> {
        check_token(token)?;
        let src = self.object_path(src_container, src_key)?;
        let bytes = std::fs::read(&src).map_err(|err| not_found(err, src_container, src_key))?;
        self.write(dst_container, dst_key, &bytes)
    }

    fn update_object(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
        token: &AuthToken,
    ) -> Result<(), BlobError> {
        check_token(token)?;
        self.write(container, key, bytes)
    }

    fn delete_object(
        &self,
        container: &str,
        key: &str,
        token: &AuthToken,
    ) -> Result<(), BlobError> {
        check_token(token)?;
        let path = self.object_path(container, key)?;
        std::fs::remove_file(path).map_err(|err| not_found(err, container, key))
    }

    fn get_object_metadata(
        &self,
        container: &str,
        key: &str,
        token: &AuthToken,
    ) -> Result<ObjectMetadata, BlobError> {
        check_token(token)?;
        let path = self.object_path(container, key)?;
        let meta = std::fs::metadata(path).map_err(|err| not_found(err, container, key))?;
        let mut out = ObjectMetadata::new();
        out.insert("size".to_string(), meta.len().to_string());
        Ok(out)
    }

    fn get_object_streaming(
        &self,
        container: &str,
        key: &str,
        token: &AuthToken,
    ) -> Result<ByteStream, BlobError> {
        check_token(token)?;
        let path = self.object_path(container, key)?;
        let file = std::fs::File::open(path).map_err(|err| not_found(err, container, key))?;
        Ok(Box::new(file))
    }
}

/// Sibling of `path` for the in-flight write; keeps the whole file name so
/// `a.b` and `a.c` never share one.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

fn check_token(token: &AuthToken) -> Result<(), BlobError> {
    if token.as_str().trim().is_empty() {
        return Err(BlobError::Transport("missing auth token".to_string()));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), BlobError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(BlobError::Transport(format!("invalid object name {name:?}")));
    }
    Ok(())
}

fn not_found(err: std::io::Error, container: &str, key: &str) -> BlobError {
    if err.kind() == ErrorKind::NotFound {
        BlobError::NotFound {
            container: container.to_string(),
            key: key.to_string(),
        }
    } else {
        BlobError::Io(err)
    }
}

/// JSON documents on disk, one file per document id. Queries scan the
/// directory, which is fine for the document counts of one host.
pub struct FsSearchIndex {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FsSearchIndex {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SearchError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(transport)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn get(&self, doc_id: &str) -> Result<Option<JsonValue>, SearchError> {
        match std::fs::read(self.doc_path(doc_id)) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(transport),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(transport(err)),
        }
    }

    /// Document ids in file-name order.
    pub fn doc_ids(&self) -> Result<Vec<String>, SearchError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(transport)? {
            let entry = entry.map_err(transport)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.replace('@', ":"));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn doc_path(&self, doc_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", doc_id.replace(':', "@")))
    }

    fn write_doc(&self, doc_id: &str, document: &JsonValue) -> Result<(), SearchError> {
        let path = self.doc_path(doc_id);
        let tmp = partial_path(&path);
        let bytes = serde_json::to_vec(document).map_err(transport)?;
        std::fs::write(&tmp, bytes).map_err(transport)?;
        std::fs::rename(&tmp, &path).map_err(transport)
    }
}

impl SearchEngine for FsSearchIndex {
    fn add_to_index(&self, doc_id: &str, document: &JsonValue) -> Result<(), SearchError> {
        let _guard = self.write_lock.lock();
        self.write_doc(doc_id, document)
    }

    fn remove_from_index_by_query(&self, field: &str, value: EntityId) -> Result<(), SearchError> {
        let _guard = self.write_lock.lock();
        let mut removed = 0usize;
        for doc_id in self.doc_ids()? {
            let matches = self
                .get(&doc_id)?
                .is_some_and(|doc| doc.get(field).and_then(JsonValue::as_i64) == Some(value));
            if matches {
                std::fs::remove_file(self.doc_path(&doc_id)).map_err(transport)?;
                removed += 1;
            }
        }
        if removed == 0 {
            return Err(SearchError::NotFound {
                field: field.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }

    fn bulk_add_to_index(&self, documents: &[(String, JsonValue)]) -> Result<(), SearchError> {
        let _guard = self.write_lock.lock();
        for (doc_id, document) in documents {
            self.write_doc(doc_id, document)?;
        }
        Ok(())
    }
}

fn transport(err: impl std::fmt::Display) -> SearchError {
    SearchError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read as _;

    fn token() -> AuthToken {
        AuthToken::new("svc")
    }

    #[test]
    fn blob_store_round_trips_and_reports_missing_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::open(dir.path()).expect("open");

        let key = store
            .update_object_and_key("temp", b"abc", &token())
            .expect("put");
        store
            .copy_object("temp", &key, "10", "003", &token())
            .expect("copy");

        let mut out = Vec::new();
        store
            .get_object_streaming("10", "003", &token())
            .expect("stream")
            .read_to_end(&mut out)
            .expect("read");
        assert_eq!(out, b"abc");

        let err = store
            .delete_object("10", "004", &token())
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn keys_differing_only_in_extension_do_not_share_a_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::open(dir.path()).expect("open");
        store
            .update_object("c", "a.partial", b"kept", &token())
            .expect("seed");
        store.update_object("c", "a.b", b"one", &token()).expect("put");
        store.update_object("c", "a.c", b"two", &token()).expect("put");

        let read = |key: &str| std::fs::read(dir.path().join("c").join(key)).expect("read");
        assert_eq!(read("a.partial"), b"kept");
        assert_eq!(read("a.b"), b"one");
        assert_eq!(read("a.c"), b"two");

        let mut names = std::fs::read_dir(dir.path().join("c"))
            .expect("list")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["a.b", "a.c", "a.partial"]);
    }

    #[test]
    fn blob_store_rejects_path_escapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::open(dir.path()).expect("open");
        assert!(store.update_object("..", "x", b"", &token()).is_err());
        assert!(store.update_object("a", "../x", b"", &token()).is_err());
    }

    #[test]
    fn search_index_removes_every_document_of_an_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = FsSearchIndex::open(dir.path()).expect("open");
        index.add_to_index("5", &json!({"id": 5})).expect("add");
        index
            .add_to_index("5:attachments", &json!({"id": 5, "files": []}))
            .expect("add");
        index.add_to_index("6", &json!({"id": 6})).expect("add");
        assert_eq!(index.doc_ids().expect("ids"), vec!["5", "5:attachments", "6"]);

        index.remove_from_index_by_query("id", 5).expect("remove");
        assert_eq!(index.doc_ids().expect("ids"), vec!["6"]);

        let err = index
            .remove_from_index_by_query("id", 5)
            .expect_err("already gone");
        assert!(matches!(err, SearchError::NotFound { .. }));
    }
}
