use crate::cache::{Cache, CacheKey};
use crate::config::ImageFormat;
use crate::ImageServerError;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

const PARTIAL_PREFIX: &str = ".partial-";
const PARTIAL_SUFFIX: &str = ".tmp";

/// Whether `file_name` is a temp file left by [`persist_atomic`], e.g. after a crash mid-write.
pub fn is_partial_file(file_name: &str) -> bool {
    file_name.starts_with(PARTIAL_PREFIX) && file_name.ends_with(PARTIAL_SUFFIX)
}

/// Writes `bytes` to `dir/file_name` through a temp file in the same folder.
///
/// The rename is atomic, so a concurrent reader sees either no file or the
/// complete one. Concurrent writers of the same name are last-rename-wins.
/// On failure the temp file is removed when dropped.
pub(crate) fn persist_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(file_name);
    let mut tmp = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

/// Filesystem cache laid out as `<root>/<image>/<key>.<ext>`, next to the originals.
///
/// There is no index: presence of the file is the cache entry.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl Cache for DiskCache {
    fn path_for(&self, image: &str, key: &CacheKey, format: ImageFormat) -> PathBuf {
        self.root.join(image).join(key.file_name(format))
    }

    async fn get(&self, image: &str, key: &CacheKey, format: ImageFormat) -> Result<Option<Bytes>, ImageServerError> {
        let p = self.path_for(image, key, format);
        // A file removed by the janitor between lookups is just a miss.
        match fs::read(&p).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        image: &str,
        key: &CacheKey,
        format: ImageFormat,
        data: Bytes,
    ) -> Result<PathBuf, ImageServerError> {
        let dir = self.root.join(image);
        let file_name = key.file_name(format);
        tokio::task::spawn_blocking(move || persist_atomic(&dir, &file_name, &data))
            .await
            .map_err(|e| ImageServerError::InternalError(e.to_string()))?
            .map_err(ImageServerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{build_key, Dimension};
    use tempfile::TempDir;

    fn key(w: i64, h: i64) -> CacheKey {
        build_key(Dimension::new(w, 1000).ok(), Dimension::new(h, 1000).ok(), "cat")
    }

    #[tokio::test]
    async fn put_then_get() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cat")).unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        let k = key(20, 10);

        assert!(cache.get("cat", &k, ImageFormat::webp).await.unwrap().is_none());
        let path = cache.put("cat", &k, ImageFormat::webp, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(path, dir.path().join("cat/20x10.webp"));
        assert_eq!(cache.get("cat", &k, ImageFormat::webp).await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        // Other formats of the same key are separate entries.
        assert!(cache.get("cat", &k, ImageFormat::png).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("cat")).unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        cache.put("cat", &key(5, 5), ImageFormat::png, Bytes::from_static(b"x")).await.unwrap();
        cache.put("cat", &key(5, 5), ImageFormat::png, Bytes::from_static(b"y")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("cat"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["5x5.png".to_string()]);
        assert_eq!(std::fs::read(dir.path().join("cat/5x5.png")).unwrap(), b"y");
    }

    #[tokio::test]
    async fn put_into_missing_folder_fails() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path().to_path_buf());
        assert!(cache.put("ghost", &key(1, 1), ImageFormat::png, Bytes::from_static(b"x")).await.is_err());
    }
}
