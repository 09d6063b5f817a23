//! Local Storage Backend
//!
//! Serves a directory tree rooted at a fixed sandbox. Every entry point goes
//! through [`LocalBackend::resolve`], which refuses anything that would land
//! outside the root, symlinks included.

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{
    guess_mime, join_path, normalize_path, parent_path, validate_entry_name, BackendKind,
    FileEntry, ProviderError, ReadResponse, StorageBackend, StorageInfo,
};
use crate::byte_stream::{ByteStream, UpstreamBody};
use crate::http_range::{parse_range_header, unsatisfied_content_range};

/// Local filesystem backend confined to `root`
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open (and create if needed) the sandbox at `root`
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ProviderError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| ProviderError::from_io(e, "/"))?;
        let root = root
            .canonicalize()
            .map_err(|e| ProviderError::from_io(e, "/"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a backend path onto the filesystem.
    ///
    /// `.` segments are dropped. Any `..` segment is a traversal attempt and
    /// fails with `AccessDenied`, even one that would stay inside the root.
    /// The deepest existing ancestor is canonicalized so a symlink cannot
    /// point outside the sandbox.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ProviderError> {
        if path.contains('\0') {
            return Err(ProviderError::InvalidPath("Path contains null bytes".to_string()));
        }

        let mut parts: Vec<&str> = Vec::new();
        for segment in path.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    warn!("Rejected traversal attempt: {:?}", path);
                    return Err(ProviderError::AccessDenied(path.to_string()));
                }
                s => parts.push(s),
            }
        }

        let mut resolved = self.root.clone();
        resolved.extend(&parts);
        if !resolved.starts_with(&self.root) {
            return Err(ProviderError::AccessDenied(path.to_string()));
        }

        if let Some(existing) = resolved.ancestors().find(|p| p.symlink_metadata().is_ok()) {
            let canonical = existing
                .canonicalize()
                .map_err(|e| ProviderError::from_io(e, path))?;
            if !canonical.starts_with(&self.root) {
                warn!("Rejected path escaping sandbox via link: {:?}", path);
                return Err(ProviderError::AccessDenied(path.to_string()));
            }
        }

        Ok(resolved)
    }

    /// Inverse of `resolve` for paths known to be inside the root
    fn virtual_path(&self, abs: &Path) -> String {
        let rel = abs.strip_prefix(&self.root).unwrap_or(abs);
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        normalize_path(&parts.join("/"))
    }

    fn entry_from_metadata(&self, abs: &Path, meta: &std::fs::Metadata) -> FileEntry {
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path = self.virtual_path(abs);
        let mtime = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

        let mut entry = if meta.is_dir() {
            let mut entry = FileEntry::directory(name, path);
            entry.child_count = Some(count_visible_children(abs));
            entry
        } else {
            FileEntry::file(name, path, meta.len())
        };
        entry.mtime = mtime;
        entry
    }

    /// Same-filesystem rename used for Local to Local moves
    pub async fn rename_within(&self, from: &str, to: &str) -> Result<(), ProviderError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if src == self.root {
            return Err(ProviderError::AccessDenied(from.to_string()));
        }
        if dst.starts_with(&src) && dst != src {
            return Err(ProviderError::InvalidPath(format!(
                "Cannot move {} into itself",
                from
            )));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::from_io(e, to))?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| ProviderError::from_io(e, from))?;
        debug!("Renamed {} -> {}", from, to);
        Ok(())
    }

    /// Filesystem-level file copy used for Local to Local copies
    pub async fn copy_within(&self, from: &str, to: &str) -> Result<u64, ProviderError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        // Copying a file onto itself would truncate it
        if src == dst {
            return Err(ProviderError::InvalidPath(format!(
                "Source and destination are the same: {}",
                from
            )));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::from_io(e, to))?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .map_err(|e| ProviderError::from_io(e, from))
    }

    /// Open `path` for reading with optional `Range` header semantics:
    /// 206 + window, 200 + whole file, or `RangeNotSatisfiable`.
    pub async fn open_range(&self, path: &str, range: Option<&str>) -> Result<ReadResponse, ProviderError> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| ProviderError::from_io(e, path))?;
        if meta.is_dir() {
            return Err(ProviderError::InvalidPath(format!("{} is a directory", path)));
        }
        let size = meta.len();
        let mut file = tokio::fs::File::open(&abs)
            .await
            .map_err(|e| ProviderError::from_io(e, path))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Ok(value) = HeaderValue::from_str(&guess_mime(path)) {
            headers.insert(CONTENT_TYPE, value);
        }
        if let Ok(modified) = meta.modified() {
            let date = chrono::DateTime::<chrono::Utc>::from(modified)
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string();
            if let Ok(value) = HeaderValue::from_str(&date) {
                headers.insert(LAST_MODIFIED, value);
            }
        }

        match range.and_then(parse_range_header) {
            Some(requested) => {
                let window = requested.resolve(size)?;
                file.seek(io::SeekFrom::Start(window.start))
                    .await
                    .map_err(|e| ProviderError::from_io(e, path))?;
                headers.insert(CONTENT_LENGTH, HeaderValue::from(window.length()));
                if let Ok(value) = HeaderValue::from_str(&window.content_range()) {
                    headers.insert(CONTENT_RANGE, value);
                }
                Ok(ReadResponse {
                    status: StatusCode::PARTIAL_CONTENT,
                    headers,
                    body: UpstreamBody::from_reader(file.take(window.length())),
                })
            }
            None => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
                Ok(ReadResponse {
                    status: StatusCode::OK,
                    headers,
                    body: UpstreamBody::from_reader(file),
                })
            }
        }
    }
}

fn count_visible_children(dir: &Path) -> u64 {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .count() as u64,
        Err(_) => 0,
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn filesystem_stats(path: &Path) -> io::Result<StorageInfo> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stats is a valid out-pointer
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let block = stats.f_frsize as u64;
    let total = stats.f_blocks as u64 * block;
    let free = stats.f_bavail as u64 * block;
    let used = total.saturating_sub(stats.f_bfree as u64 * block);
    Ok(StorageInfo { used, total, free })
}

#[cfg(not(unix))]
fn filesystem_stats(_path: &Path) -> io::Result<StorageInfo> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "statvfs unavailable"))
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn as_local(&self) -> Option<&LocalBackend> {
        Some(self)
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, ProviderError> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ProviderError::from_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| ProviderError::from_io(e, path))?
        {
            let name = item.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            // Broken symlinks and racing deletes are skipped, not fatal
            let meta = match tokio::fs::metadata(item.path()).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping {:?}: {}", item.path(), e);
                    continue;
                }
            };
            entries.push(self.entry_from_metadata(&item.path(), &meta));
        }

        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, ProviderError> {
        let abs = self.resolve(path)?;
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| ProviderError::from_io(e, path))?;
        Ok(self.entry_from_metadata(&abs, &meta))
    }

    async fn mkdir(&self, path: &str) -> Result<(), ProviderError> {
        let abs = self.resolve(path)?;
        tokio::fs::create_dir_all(&abs)
            .await
            .map_err(|e| ProviderError::from_io(e, path))
    }

    async fn delete(&self, paths: &[String]) -> Result<(), ProviderError> {
        for path in paths {
            let abs = self.resolve(path)?;
            if abs == self.root {
                return Err(ProviderError::AccessDenied(path.clone()));
            }
            let meta = tokio::fs::symlink_metadata(&abs)
                .await
                .map_err(|e| ProviderError::from_io(e, path))?;
            let result = if meta.is_dir() {
                tokio::fs::remove_dir_all(&abs).await
            } else {
                tokio::fs::remove_file(&abs).await
            };
            result.map_err(|e| ProviderError::from_io(e, path))?;
            info!("Deleted local {}", path);
        }
        Ok(())
    }

    async fn rename(&self, path: &str, new_name: &str) -> Result<String, ProviderError> {
        validate_entry_name(new_name)?;
        let target = join_path(&parent_path(path), new_name);
        self.rename_within(path, &target).await?;
        Ok(target)
    }

    async fn move_items(&self, paths: &[String], dest_dir: &str) -> Result<(), ProviderError> {
        let dest = self.resolve(dest_dir)?;
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| ProviderError::from_io(e, dest_dir))?;
        for path in paths {
            let name = super::base_name(path);
            validate_entry_name(&name)?;
            self.rename_within(path, &join_path(dest_dir, &name)).await?;
        }
        Ok(())
    }

    async fn read(&self, path: &str, range: Option<&str>) -> Result<ReadResponse, ProviderError> {
        self.open_range(path, range).await
    }

    async fn write(&self, path: &str, mut body: ByteStream, _size_hint: Option<u64>) -> Result<(), ProviderError> {
        let abs = self.resolve(path)?;
        if abs == self.root {
            return Err(ProviderError::InvalidPath(path.to_string()));
        }
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::from_io(e, path))?;
        }
        let mut file = tokio::fs::File::create(&abs)
            .await
            .map_err(|e| ProviderError::from_io(e, path))?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProviderError::from_io(e, path))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ProviderError::from_io(e, path))?;
        }
        file.flush().await.map_err(|e| ProviderError::from_io(e, path))?;
        Ok(())
    }

    async fn storage_info(&self) -> Result<Option<StorageInfo>, ProviderError> {
        let root = self.root.clone();
        let stats = tokio::task::spawn_blocking(move || filesystem_stats(&root))
            .await
            .map_err(|e| ProviderError::IoError(io::Error::other(e)))?;
        match stats {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                debug!("Local quota unavailable: {}", e);
                Ok(None)
            }
        }
    }

    async fn search(&self, path: &str, pattern: &str, limit: usize) -> Result<Vec<FileEntry>, ProviderError> {
        let start = self.resolve(path)?;
        let needle = pattern.to_lowercase();
        let backend = self.clone();

        tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();
            let walker = walkdir::WalkDir::new(&start)
                .min_depth(1)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
            for entry in walker.flatten() {
                if !entry.file_name().to_string_lossy().to_lowercase().contains(&needle) {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    results.push(backend.entry_from_metadata(entry.path(), &meta));
                    if results.len() >= limit {
                        break;
                    }
                }
            }
            results
        })
        .await
        .map_err(|e| ProviderError::IoError(io::Error::other(e)))
    }

    async fn check_connection(&self) -> Result<(), ProviderError> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| ProviderError::from_io(e, "/"))?;
        if meta.is_dir() {
            Ok(())
        } else {
            Err(ProviderError::InvalidConfig("Sandbox root is not a directory".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::collect;
    use bytes::Bytes;

    fn sandbox() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("root")).unwrap();
        (dir, backend)
    }

    fn body(data: &[u8]) -> ByteStream {
        UpstreamBody::from_bytes(Bytes::copy_from_slice(data)).into_stream()
    }

    #[test]
    fn test_resolve_stays_inside_root() {
        let (_dir, backend) = sandbox();
        assert_eq!(backend.resolve("/").unwrap(), backend.root());
        assert_eq!(backend.resolve("a/./b").unwrap(), backend.root().join("a").join("b"));

        for evil in ["../etc/passwd", "/../../x", "a/../../x", "..\\..\\x", "..", "/a/../b", "a/b/.."] {
            assert!(
                matches!(backend.resolve(evil), Err(ProviderError::AccessDenied(_))),
                "{} should be rejected",
                evil
            );
        }
        assert!(matches!(backend.resolve("a\0b"), Err(ProviderError::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (dir, backend) = sandbox();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, backend.root().join("link")).unwrap();
        assert!(matches!(
            backend.resolve("/link/secret.txt"),
            Err(ProviderError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_rejected_on_every_entry_point() {
        let (_dir, backend) = sandbox();
        let evil = "../escape.txt".to_string();
        assert!(matches!(backend.list("../").await, Err(ProviderError::AccessDenied(_))));
        assert!(matches!(backend.stat(&evil).await, Err(ProviderError::AccessDenied(_))));
        assert!(matches!(backend.read(&evil, None).await, Err(ProviderError::AccessDenied(_))));
        assert!(matches!(
            backend.write(&evil, body(b"x"), None).await,
            Err(ProviderError::AccessDenied(_))
        ));
        assert!(matches!(backend.mkdir("../d").await, Err(ProviderError::AccessDenied(_))));
        assert!(matches!(
            backend.delete(&[evil.clone()]).await,
            Err(ProviderError::AccessDenied(_))
        ));
        assert!(matches!(
            backend.move_items(&["/a".to_string()], "../out").await,
            Err(ProviderError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (_dir, backend) = sandbox();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        backend.write("/nested/dir/data.bin", body(&data), Some(5000)).await.unwrap();

        let resp = backend.read("/nested/dir/data.bin", None).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers[CONTENT_LENGTH], "5000");
        assert_eq!(collect(resp.body.into_stream()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_range_read() {
        let (_dir, backend) = sandbox();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        backend.write("/v.mp4", body(&data), None).await.unwrap();

        let resp = backend.read("/v.mp4", Some("bytes=100-199")).await.unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers[CONTENT_LENGTH], "100");
        assert_eq!(resp.headers[CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(resp.headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(collect(resp.body.into_stream()).await.unwrap(), &data[100..200]);

        let err = backend.read("/v.mp4", Some("bytes=1000-")).await.unwrap_err();
        assert!(matches!(err, ProviderError::RangeNotSatisfiable { size: 1000 }));
        assert_eq!(unsatisfied_content_range(1000), "bytes */1000");
    }

    #[tokio::test]
    async fn test_list_hides_dot_entries_and_counts_children() {
        let (_dir, backend) = sandbox();
        backend.mkdir("/docs").await.unwrap();
        backend.write("/docs/a.txt", body(b"a"), None).await.unwrap();
        backend.write("/docs/.hidden", body(b"h"), None).await.unwrap();
        backend.write("/.profile", body(b"p"), None).await.unwrap();
        backend.write("/z.txt", body(b"zz"), None).await.unwrap();

        let entries = backend.list("/").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "z.txt"]);
        assert_eq!(entries[0].child_count, Some(1));
        assert_eq!(entries[0].path, "/docs");
        assert_eq!(entries[1].size, 2);
        assert!(entries[1].mtime.is_some());
    }

    #[tokio::test]
    async fn test_mkdir_is_idempotent() {
        let (_dir, backend) = sandbox();
        backend.mkdir("/photos").await.unwrap();
        backend.mkdir("/photos").await.unwrap();
        let entries = backend.list("/").await.unwrap();
        assert_eq!(entries.iter().filter(|e| e.name == "photos").count(), 1);
    }

    #[tokio::test]
    async fn test_rename_and_move() {
        let (_dir, backend) = sandbox();
        backend.write("/a.txt", body(b"hello"), None).await.unwrap();
        let renamed = backend.rename("/a.txt", "b.txt").await.unwrap();
        assert_eq!(renamed, "/b.txt");
        assert!(backend.rename("/b.txt", "../c.txt").await.is_err());

        backend.mkdir("/dest").await.unwrap();
        backend.move_items(&["/b.txt".to_string()], "/dest").await.unwrap();
        assert!(matches!(backend.stat("/b.txt").await, Err(ProviderError::NotFound(_))));
        assert_eq!(backend.stat("/dest/b.txt").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_move_into_itself_rejected() {
        let (_dir, backend) = sandbox();
        backend.mkdir("/a/b").await.unwrap();
        assert!(matches!(
            backend.move_items(&["/a".to_string()], "/a/b").await,
            Err(ProviderError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_onto_itself_keeps_content() {
        let (_dir, backend) = sandbox();
        std::fs::write(backend.root().join("keep.txt"), b"precious data").unwrap();
        assert!(matches!(
            backend.copy_within("/keep.txt", "/./keep.txt").await,
            Err(ProviderError::InvalidPath(_))
        ));
        assert_eq!(std::fs::read(backend.root().join("keep.txt")).unwrap(), b"precious data");

        assert_eq!(backend.copy_within("/keep.txt", "/copy/keep.txt").await.unwrap(), 13);
        assert_eq!(std::fs::read(backend.root().join("copy/keep.txt")).unwrap(), b"precious data");
    }

    #[tokio::test]
    async fn test_delete_tree_and_root_protection() {
        let (_dir, backend) = sandbox();
        backend.write("/t/x/y.txt", body(b"y"), None).await.unwrap();
        backend.delete(&["/t".to_string()]).await.unwrap();
        assert!(backend.list("/").await.unwrap().is_empty());
        assert!(matches!(
            backend.delete(&["/".to_string()]).await,
            Err(ProviderError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_bounded() {
        let (_dir, backend) = sandbox();
        for i in 0..5 {
            backend.write(&format!("/s/Report-{}.txt", i), body(b"r"), None).await.unwrap();
        }
        backend.write("/s/.report-hidden", body(b"r"), None).await.unwrap();
        let hits = backend.search("/", "report", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|e| e.path.starts_with("/s/Report-")));
        let all = backend.search("/", "REPORT", 100).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_storage_info_and_connection() {
        let (_dir, backend) = sandbox();
        backend.check_connection().await.unwrap();
        #[cfg(unix)]
        {
            let info = backend.storage_info().await.unwrap().unwrap();
            assert!(info.total > 0);
            assert!(info.free <= info.total);
        }
    }
}
