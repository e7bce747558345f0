//! Path-addressed file storage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::errors::PersistenceError;

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write `content` at `path` (relative, `/`-separated), replacing any
    /// previous content. Returns the location to record for the file.
    async fn put(&self, path: &str, content: &[u8]) -> Result<String, PersistenceError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, PersistenceError>;
    async fn delete(&self, path: &str) -> Result<(), PersistenceError>;
    /// Relative paths of all files under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;
}

/// Files under a root directory on the local filesystem.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative storage path to a location under the root, rejecting
    /// absolute paths and `..`.
    fn resolve(&self, path: &str) -> Result<PathBuf, PersistenceError> {
        let rel = Path::new(path);
        if path.trim().is_empty() {
            return Err(PersistenceError::InvalidPath(path.to_string()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(PersistenceError::InvalidPath(path.to_string())),
            }
        }
        Ok(self.root.join(rel))
    }
}

fn storage_err(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Storage {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, path: &str, content: &[u8]) -> Result<String, PersistenceError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err(parent, e))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| storage_err(&full, e))?;
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, PersistenceError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| storage_err(&full, e))
    }

    async fn delete(&self, path: &str) -> Result<(), PersistenceError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(&full, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix)?
        };
        if !base.exists() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let walk = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in walkdir::WalkDir::new(&base) {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    PersistenceError::Storage {
                        path,
                        source: std::io::Error::other(e.to_string()),
                    }
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    let parts: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect();
                    out.push(parts.join("/"));
                }
            }
            out.sort();
            Ok::<_, PersistenceError>(out)
        })
        .await
        .map_err(|e| PersistenceError::Storage {
            path: self.root.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;
        walk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let loc = store.put("generations/abc/main.tf", b"resource {}").await.unwrap();
        assert_eq!(loc, "generations/abc/main.tf");
        store.put("generations/abc/variables.tf", b"").await.unwrap();
        store.put("generations/other/main.tf", b"x").await.unwrap();

        assert_eq!(store.get("generations/abc/main.tf").await.unwrap(), b"resource {}");
        assert_eq!(
            store.list("generations/abc").await.unwrap(),
            vec!["generations/abc/main.tf", "generations/abc/variables.tf"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
        assert!(store.list("missing").await.unwrap().is_empty());

        store.delete("generations/abc/main.tf").await.unwrap();
        store.delete("generations/abc/main.tf").await.unwrap();
        assert!(store.get("generations/abc/main.tf").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        for bad in ["../etc/passwd", "/abs/path", "a/../../b", ""] {
            let err = store.put(bad, b"x").await.unwrap_err();
            assert!(matches!(err, PersistenceError::InvalidPath(_)), "{}", bad);
        }
    }
}
