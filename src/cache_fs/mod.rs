//! On-disk cache layout and file operations.
//!
//! Owns the bytes under the cache root and a sibling temp area. Writes go
//! through a temp-then-rename protocol so a reader opening a path through
//! this component sees either a complete file or nothing.

pub mod eviction;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::store::MediaKind;

const COPY_BUF_SIZE: usize = 64 * 1024;
const METADATA_SIDECAR: &str = ".meta.json";

pub struct CacheFilesystem {
    root: PathBuf,
    temp: PathBuf,
}

/// Removes the temp file on drop unless the write completed.
struct TempGuard {
    path: PathBuf,
    defused: bool,
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if !self.defused {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl CacheFilesystem {
    pub fn new(root: impl Into<PathBuf>, temp: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let temp = temp.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory {:?}", root))?;
        std::fs::create_dir_all(&temp)
            .with_context(|| format!("Failed to create temp directory {:?}", temp))?;
        Ok(Self { root, temp })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location for a media file, relative to the cache root.
    pub fn relative_media_path(
        &self,
        kind: MediaKind,
        media_id: &str,
        season: Option<u32>,
        episode: Option<u32>,
        filename: &str,
    ) -> PathBuf {
        let filename = sanitize_filename(filename);
        match kind {
            MediaKind::Movie => PathBuf::from("movies").join(media_id).join(filename),
            MediaKind::Episode => PathBuf::from("series")
                .join(media_id)
                .join(format!(
                    "S{:02}E{:02}",
                    season.unwrap_or(0),
                    episode.unwrap_or(0)
                ))
                .join(filename),
            other => PathBuf::from(other.as_str()).join(media_id).join(filename),
        }
    }

    /// Absolute path for a relative cache path.
    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Compute the target path and create its parent directories. Existing
    /// media files are never touched here; collisions surface at rename time.
    pub fn reserve_path(
        &self,
        kind: MediaKind,
        media_id: &str,
        series_id: Option<&str>,
        season: Option<u32>,
        episode: Option<u32>,
        filename: &str,
    ) -> Result<PathBuf> {
        // Episodes are grouped by series, other kinds by their own id.
        let group_id = match kind {
            MediaKind::Episode => series_id.unwrap_or(media_id),
            _ => media_id,
        };
        let relative = self.relative_media_path(kind, group_id, season, episode, filename);
        let absolute = self.absolute(&relative);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        Ok(relative)
    }

    /// Stream `reader` into `relative` atomically.
    ///
    /// Bytes land in a temp file first, are fsynced, then renamed into place
    /// on the same filesystem. Returns bytes written and the SHA-256 of the
    /// content. On any failure (including cancellation of the returned
    /// future) the temp file is removed and the target is untouched. A
    /// pre-existing target is a rename collision and fails the write.
    pub async fn atomic_write<R>(&self, relative: &Path, mut reader: R) -> Result<(u64, String)>
    where
        R: AsyncRead + Unpin,
    {
        let target = self.absolute(relative);
        let temp_path = self
            .temp
            .join(format!("{}.tmp", uuid::Uuid::new_v4()));

        let mut guard = TempGuard {
            path: temp_path.clone(),
            defused: false,
        };

        let mut file = File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .context("Failed reading download stream")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .await
                .context("Failed writing to temp file")?;
            written += n as u64;
        }

        file.sync_all().await.context("Failed to sync temp file")?;
        drop(file);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            bail!("Rename collision: {:?} already exists", target);
        }
        tokio::fs::rename(&temp_path, &target)
            .await
            .with_context(|| format!("Failed to rename temp file into {:?}", target))?;
        guard.defused = true;

        let checksum = format!("{:x}", hasher.finalize());
        debug!(
            "Atomic write complete: {:?} ({} bytes, sha256 {})",
            target, written, checksum
        );
        Ok((written, checksum))
    }

    /// Open a cached file for range serving.
    pub async fn open_for_range(&self, relative: &Path) -> Result<(File, u64, SystemTime)> {
        let path = self.absolute(relative);
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open {:?}", path))?;
        let meta = file.metadata().await?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok((file, meta.len(), mtime))
    }

    pub fn file_size(&self, relative: &Path) -> Option<u64> {
        std::fs::metadata(self.absolute(relative))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    /// Unlink a media file. If its leaf directory is then empty apart from a
    /// metadata sidecar, the sidecar and directory are removed too.
    pub fn delete(&self, relative: &Path) -> Result<()> {
        let path = self.absolute(relative);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }

        if let Some(dir) = path.parent() {
            if dir.starts_with(&self.root) && dir != self.root && leaf_is_disposable(dir) {
                let sidecar = dir.join(METADATA_SIDECAR);
                let _ = std::fs::remove_file(sidecar);
                if std::fs::remove_dir(dir).is_ok() {
                    debug!("Removed empty cache directory {:?}", dir);
                }
            }
        }
        Ok(())
    }

    /// Remove temp files older than `older_than`. Returns how many went.
    pub fn sweep_temp(&self, older_than: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        let entries = match std::fs::read_dir(&self.temp) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("Failed to read temp directory"),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified <= cutoff {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove stale temp file {:?}: {}", path, e);
                } else {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!("Swept {} stale temp files", removed);
        }
        Ok(removed)
    }

    /// Sum of regular media files under the cache root. The temp area,
    /// top-level files (the metadata database lives there) and metadata
    /// sidecars are excluded.
    pub fn enumerate_size(&self) -> Result<u64> {
        let mut total = 0u64;
        let entries = std::fs::read_dir(&self.root).context("Failed to read cache root")?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path == self.temp {
                continue;
            }
            if path.is_dir() {
                total += dir_size(&path)?;
            }
        }
        Ok(total)
    }
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&path)?;
        } else if meta.is_file() && entry.file_name() != METADATA_SIDECAR {
            total += meta.len();
        }
    }
    Ok(total)
}

fn leaf_is_disposable(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .all(|entry| entry.file_name() == METADATA_SIDECAR),
        Err(_) => false,
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn fs() -> (TempDir, CacheFilesystem) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let temp = root.join("temp");
        let fs = CacheFilesystem::new(&root, &temp).unwrap();
        (dir, fs)
    }

    #[test]
    fn layout_matches_kind() {
        let (_dir, fs) = fs();
        assert_eq!(
            fs.relative_media_path(MediaKind::Movie, "m1", None, None, "film.mp4"),
            PathBuf::from("movies/m1/film.mp4")
        );
        assert_eq!(
            fs.relative_media_path(MediaKind::Episode, "show", Some(1), Some(2), "ep.mkv"),
            PathBuf::from("series/show/S01E02/ep.mkv")
        );
        assert_eq!(
            fs.relative_media_path(MediaKind::Series, "s1", None, None, "x.bin"),
            PathBuf::from("series/s1/x.bin")
        );
    }

    #[test]
    fn reserve_path_creates_parents_and_groups_episodes_by_series() {
        let (_dir, fs) = fs();
        let relative = fs
            .reserve_path(
                MediaKind::Episode,
                "ep-42",
                Some("show-1"),
                Some(3),
                Some(7),
                "episode.mkv",
            )
            .unwrap();
        assert_eq!(relative, PathBuf::from("series/show-1/S03E07/episode.mkv"));
        assert!(fs.absolute(&relative).parent().unwrap().is_dir());
    }

    #[test]
    fn filenames_are_sanitized() {
        let (_dir, fs) = fs();
        let relative = fs.relative_media_path(MediaKind::Movie, "m1", None, None, "a/b:c.mp4");
        assert_eq!(relative, PathBuf::from("movies/m1/a_b_c.mp4"));
    }

    #[tokio::test]
    async fn atomic_write_lands_complete_file_with_checksum() {
        let (_dir, fs) = fs();
        let relative = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "film.mp4")
            .unwrap();

        let data = b"hello media bytes".to_vec();
        let (written, checksum) = fs
            .atomic_write(&relative, Cursor::new(data.clone()))
            .await
            .unwrap();

        assert_eq!(written, data.len() as u64);
        let on_disk = std::fs::read(fs.absolute(&relative)).unwrap();
        assert_eq!(on_disk, data);

        let expected = format!("{:x}", Sha256::digest(&data));
        assert_eq!(checksum, expected);

        // Temp area is clean afterwards.
        assert_eq!(std::fs::read_dir(fs.absolute(Path::new("temp"))).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn atomic_write_refuses_to_replace_existing_file() {
        let (_dir, fs) = fs();
        let relative = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "film.mp4")
            .unwrap();

        fs.atomic_write(&relative, Cursor::new(b"first".to_vec()))
            .await
            .unwrap();
        let err = fs
            .atomic_write(&relative, Cursor::new(b"second".to_vec()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("collision"));
        assert_eq!(std::fs::read(fs.absolute(&relative)).unwrap(), b"first");
    }

    #[tokio::test]
    async fn failed_write_leaves_no_temp_file() {
        let (_dir, fs) = fs();
        let relative = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "film.mp4")
            .unwrap();

        struct FailingReader;
        impl AsyncRead for FailingReader {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("stream broke")))
            }
        }

        let err = fs.atomic_write(&relative, FailingReader).await.unwrap_err();
        assert!(err.to_string().contains("download stream"));

        assert!(!fs.absolute(&relative).exists());
        assert_eq!(std::fs::read_dir(fs.absolute(Path::new("temp"))).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn open_for_range_reports_size() {
        let (_dir, fs) = fs();
        let relative = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "film.mp4")
            .unwrap();
        fs.atomic_write(&relative, Cursor::new(vec![7u8; 321]))
            .await
            .unwrap();

        let (_file, size, _mtime) = fs.open_for_range(&relative).await.unwrap();
        assert_eq!(size, 321);

        assert!(fs.open_for_range(Path::new("movies/ghost/x.mp4")).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_file_sidecar_and_empty_dir() {
        let (_dir, fs) = fs();
        let relative = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "film.mp4")
            .unwrap();
        fs.atomic_write(&relative, Cursor::new(vec![1u8; 10]))
            .await
            .unwrap();

        let leaf = fs.absolute(&relative).parent().unwrap().to_path_buf();
        std::fs::write(leaf.join(METADATA_SIDECAR), b"{}").unwrap();

        fs.delete(&relative).unwrap();

        assert!(!fs.absolute(&relative).exists());
        assert!(!leaf.exists());

        // Deleting a path that is already gone is fine.
        fs.delete(&relative).unwrap();
    }

    #[tokio::test]
    async fn delete_keeps_dir_with_other_files() {
        let (_dir, fs) = fs();
        let first = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "a.mp4")
            .unwrap();
        let second = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "b.mp4")
            .unwrap();
        fs.atomic_write(&first, Cursor::new(vec![1u8; 4])).await.unwrap();
        fs.atomic_write(&second, Cursor::new(vec![2u8; 4])).await.unwrap();

        fs.delete(&first).unwrap();

        assert!(!fs.absolute(&first).exists());
        assert!(fs.absolute(&second).exists());
    }

    #[tokio::test]
    async fn enumerate_size_skips_temp_sidecars_and_top_level_files() {
        let (_dir, fs) = fs();
        let movie = fs
            .reserve_path(MediaKind::Movie, "m1", None, None, None, "a.mp4")
            .unwrap();
        let episode = fs
            .reserve_path(MediaKind::Episode, "e1", Some("show"), Some(1), Some(1), "e.mkv")
            .unwrap();
        fs.atomic_write(&movie, Cursor::new(vec![0u8; 100])).await.unwrap();
        fs.atomic_write(&episode, Cursor::new(vec![0u8; 50])).await.unwrap();

        std::fs::write(
            fs.absolute(&movie).parent().unwrap().join(METADATA_SIDECAR),
            b"{}",
        )
        .unwrap();
        // Database file at the root is not media.
        std::fs::write(fs.root().join("media-cache.db"), vec![0u8; 9999]).unwrap();
        // In-flight temp files do not count either.
        std::fs::write(fs.root().join("temp/in-flight.tmp"), vec![0u8; 500]).unwrap();

        assert_eq!(fs.enumerate_size().unwrap(), 150);
    }

    #[test]
    fn sweep_temp_removes_only_old_files() {
        let (_dir, fs) = fs();
        let temp_file = fs.root().join("temp/stale.tmp");
        std::fs::write(&temp_file, b"junk").unwrap();

        // Generous threshold keeps the fresh file.
        assert_eq!(fs.sweep_temp(Duration::from_secs(3600)).unwrap(), 0);
        assert!(temp_file.exists());

        // Zero threshold removes everything already written.
        assert_eq!(fs.sweep_temp(Duration::ZERO).unwrap(), 1);
        assert!(!temp_file.exists());
    }
}
