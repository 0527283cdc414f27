use crate::cache::disk::persist_atomic;
use crate::cache::is_sized_key;
use crate::config::ImageFormat;
use crate::ImageServerError;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A located original: the logical name and the file backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Original {
    pub name: String,
    pub path: PathBuf,
}

/// Read side of `images/<name>/<name>.<ext>`, plus creation for uploads.
#[derive(Debug, Clone)]
pub struct OriginalStore {
    root: PathBuf,
    extensions: Vec<String>,
}

impl OriginalStore {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self { root: root.into(), extensions }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a `<name>.<ext>` file would be found by [`find_original`](Self::find_original)
    /// ahead of `original`.
    pub fn would_shadow(&self, original: &Original, ext: &str) -> bool {
        let current = original.path.extension().and_then(|e| e.to_str());
        let rank = |x: &str| self.extensions.iter().position(|e| e == x);
        match (rank(ext), current.and_then(rank)) {
            (Some(candidate), Some(existing)) => candidate < existing,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Folder owning the original and every derivative of `name`.
    pub fn image_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Rejects names that could escape the root folder or hide from the janitor.
    ///
    /// Names shaped like a sized key (`200x150`, `x5`) are refused too: the
    /// full-size key of such an image would be a sized key, and sized
    /// requests would resolve to the original itself.
    pub fn validate_name(name: &str) -> Result<(), ImageServerError> {
        let bad = name.is_empty()
            || name.len() > 200
            || name.starts_with('.')
            || name.contains(['/', '\\', '\0']);
        if bad {
            return Err(ImageServerError::InvalidArgument(format!("invalid image name {:?}", name)));
        }
        if is_sized_key(name) {
            return Err(ImageServerError::InvalidArgument(format!(
                "image name {:?} is reserved for resized derivatives",
                name
            )));
        }
        Ok(())
    }

    /// Returns the first existing `<name>.<ext>` in extension order.
    pub async fn find_original(&self, name: &str) -> Result<Option<PathBuf>, ImageServerError> {
        Self::validate_name(name)?;
        let dir = self.image_dir(name);
        for ext in &self.extensions {
            let candidate = dir.join(format!("{}.{}", name, ext));
            match fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => return Ok(Some(candidate)),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Like [`find_original`](Self::find_original) but absence is `NotFound`.
    pub async fn locate(&self, name: &str) -> Result<Original, ImageServerError> {
        match self.find_original(name).await? {
            Some(path) => Ok(Original { name: name.to_string(), path }),
            None => Err(ImageServerError::NotFound(format!("no original for image {:?}", name))),
        }
    }

    /// Creates the image folder and stores `bytes` as its original.
    ///
    /// Fails with `Conflict` if the folder already exists; nothing is overwritten.
    pub async fn create_original(
        &self,
        name: &str,
        bytes: Vec<u8>,
        format: ImageFormat,
    ) -> Result<Original, ImageServerError> {
        Self::validate_name(name)?;
        fs::create_dir_all(&self.root).await?;

        let dir = self.image_dir(name);
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ImageServerError::Conflict(format!("image {:?} already exists", name)));
            }
            Err(e) => return Err(e.into()),
        }

        let file_name = format!("{}.{}", name, format.extension());
        let target = dir.clone();
        let written = tokio::task::spawn_blocking(move || persist_atomic(&target, &file_name, &bytes))
            .await
            .map_err(|e| ImageServerError::InternalError(e.to_string()))?;

        match written {
            Ok(path) => {
                tracing::info!(image = name, path = %path.display(), "Stored new original");
                Ok(Original { name: name.to_string(), path })
            }
            Err(e) => {
                // Leave no empty folder behind, it would block a retry with the same name.
                let _ = fs::remove_dir_all(&dir).await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> OriginalStore {
        OriginalStore::new(dir.path(), vec!["jpg".into(), "png".into(), "jpeg".into()])
    }

    #[tokio::test]
    async fn finds_first_matching_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cat")).unwrap();
        std::fs::write(dir.path().join("cat/cat.jpeg"), b"a").unwrap();
        std::fs::write(dir.path().join("cat/cat.png"), b"b").unwrap();

        let found = store(&dir).find_original("cat").await.unwrap().unwrap();
        assert_eq!(found, dir.path().join("cat/cat.png"));
    }

    #[tokio::test]
    async fn missing_original_is_not_found() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cat")).unwrap();
        std::fs::write(dir.path().join("cat/200x200.webp"), b"a").unwrap();

        let err = store(&dir).locate("cat").await.unwrap_err();
        assert!(matches!(err, ImageServerError::NotFound(_)));
        let err = store(&dir).locate("doesnotexist").await.unwrap_err();
        assert!(matches!(err, ImageServerError::NotFound(_)));
    }

    #[test]
    fn earlier_extensions_shadow_later_ones() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let png = Original { name: "cat".into(), path: dir.path().join("cat/cat.png") };
        assert!(store.would_shadow(&png, "jpg"));
        assert!(!store.would_shadow(&png, "png"));
        assert!(!store.would_shadow(&png, "jpeg"));
        assert!(!store.would_shadow(&png, "webp"));
    }

    #[test]
    fn names_cannot_escape_the_root() {
        for name in ["", "..", ".hidden", "a/b", "a\\b", "nul\0"] {
            assert!(OriginalStore::validate_name(name).is_err(), "{name:?}");
        }
        assert!(OriginalStore::validate_name("cat").is_ok());
        assert!(OriginalStore::validate_name("my cat").is_ok());
    }

    #[tokio::test]
    async fn key_shaped_names_are_refused() {
        for name in ["x5", "200x", "200x150"] {
            assert!(OriginalStore::validate_name(name).is_err(), "{name:?}");
        }
        assert!(OriginalStore::validate_name("x").is_ok());
        assert!(OriginalStore::validate_name("box5").is_ok());

        let dir = TempDir::new().unwrap();
        let err = store(&dir).create_original("200x150", vec![1], ImageFormat::png).await.unwrap_err();
        assert!(matches!(err, ImageServerError::InvalidArgument(_)));
        assert!(!dir.path().join("200x150").exists());
    }

    #[tokio::test]
    async fn create_refuses_existing_folder() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let created = store.create_original("dog", vec![1, 2, 3], ImageFormat::png).await.unwrap();
        assert_eq!(created.path, dir.path().join("dog/dog.png"));

        let err = store.create_original("dog", vec![9], ImageFormat::png).await.unwrap_err();
        assert!(matches!(err, ImageServerError::Conflict(_)));
        assert_eq!(std::fs::read(dir.path().join("dog/dog.png")).unwrap(), vec![1, 2, 3]);
    }
}
