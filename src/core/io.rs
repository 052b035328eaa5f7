use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Key-addressed byte store rooted at a directory. Keys are plain file names.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
    /// Writes through a temporary file and a rename, so concurrent writers of
    /// the same key never expose a partial file.
    async fn write(&self, key: &str, content: &[u8]) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    fn path_of(&self, key: &str) -> PathBuf;
}

pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_of(key);
        let tmp = self
            .root
            .join(format!("{}.{:016x}.tmp", key, rand::random::<u64>()));
        let result = match tokio::fs::write(&tmp, content).await {
            Ok(()) => tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("Failed to finalize {}", path.display())),
            Err(e) => Err(e).with_context(|| format!("Failed to write {}", tmp.display())),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_of(key)).await?)
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_exists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path().join("nested"));

        assert!(!storage.exists("a.mp3").await?);
        storage.write("a.mp3", b"abc").await?;
        assert!(storage.exists("a.mp3").await?);
        assert_eq!(storage.read("a.mp3").await?, b"abc");

        // Overwrite is idempotent for the same key.
        storage.write("a.mp3", b"abc").await?;
        assert_eq!(storage.read("a.mp3").await?, b"abc");

        let leftovers: Vec<_> = std::fs::read_dir(storage.root())?
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_temp_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new(dir.path());
        // A non-empty directory under the key makes the final rename fail.
        std::fs::create_dir(dir.path().join("b.mp3"))?;
        std::fs::write(dir.path().join("b.mp3").join("keep"), b"x")?;

        assert!(storage.write("b.mp3", b"abc").await.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NativeStorage::new(dir.path());
        assert!(storage.read("missing.mp3").await.is_err());
    }
}
