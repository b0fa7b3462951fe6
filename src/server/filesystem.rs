use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Filesystem guard for one server's data directory. Every path the daemon
/// touches on behalf of a server must pass through [`Filesystem::safe_path`].
pub struct Filesystem {
    server_id: Uuid,
    root: PathBuf,
    /// Disk quota in MB; zero or negative means unlimited.
    disk_limit: i64,
    disk_used: AtomicI64,
    last_lookup: StdMutex<Option<Instant>>,
    /// Serializes disk usage recomputation so concurrent callers coalesce.
    lookup: Mutex<()>,
    ttl: Duration,
}

impl Filesystem {
    pub fn new(server_id: Uuid, root: impl Into<PathBuf>, disk_limit: i64, ttl: Duration) -> Self {
        Self {
            server_id,
            root: root.into(),
            disk_limit,
            disk_used: AtomicI64::new(0),
            last_lookup: StdMutex::new(None),
            lookup: Mutex::new(()),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn disk_limit(&self) -> i64 {
        self.disk_limit
    }

    /// Resolves a server-relative path and proves that, after following the
    /// existing part of the chain through symlinks, it stays inside the data
    /// root. The terminal components may be absent as long as the resolved
    /// ancestry is contained. Feeding a previously returned path back in
    /// yields the same path.
    pub fn safe_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        resolve_safe(&self.root, path.as_ref())
    }

    /// Byte count of the server's data directory, served from cache while it
    /// is fresh. Stale or missing values trigger a tree walk; concurrent
    /// callers share a single in-flight walk and observe its result.
    pub async fn cached_usage(&self, allow_stale: bool) -> Result<i64> {
        if allow_stale && self.is_fresh() {
            return Ok(self.disk_used.load(Ordering::Acquire));
        }

        let requested_at = Instant::now();
        let _guard = self.lookup.lock().await;

        // Another caller may have finished a walk while we waited for the
        // guard; its result is as good as our own would be.
        if self.refreshed_since(requested_at) {
            return Ok(self.disk_used.load(Ordering::Acquire));
        }

        let root = self.root.clone();
        let size = tokio::task::spawn_blocking(move || directory_size(&root))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        self.disk_used.store(size, Ordering::Release);
        *self.last_lookup.lock().expect("lookup lock poisoned") = Some(Instant::now());

        debug!(server = %self.server_id, bytes = size, "recomputed disk usage");

        Ok(size)
    }

    fn is_fresh(&self) -> bool {
        self.last_lookup
            .lock()
            .expect("lookup lock poisoned")
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    fn refreshed_since(&self, instant: Instant) -> bool {
        self.last_lookup
            .lock()
            .expect("lookup lock poisoned")
            .map(|at| at > instant)
            .unwrap_or(false)
    }
}

/// The containment proof behind [`Filesystem::safe_path`], standalone so
/// blocking archive walks can carry it into another thread.
pub(crate) fn resolve_safe(root: &Path, requested: &Path) -> Result<PathBuf> {
    let canonical_root = std::fs::canonicalize(root)?;

    // Absolute inputs already anchored at the root are treated as
    // root-relative again; anything else keeps only its normal components.
    let relative = requested
        .strip_prefix(root)
        .or_else(|_| requested.strip_prefix(&canonical_root))
        .unwrap_or(requested);

    // Lexical normalization over the joined path. Parent components may
    // climb above the root here, which the prefix check below rejects.
    let mut joined = canonical_root.clone();
    for component in relative.components() {
        match component {
            Component::Normal(c) => joined.push(c),
            Component::ParentDir => {
                joined.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if !joined.starts_with(&canonical_root) {
        return Err(Error::BadPathResolution {
            path: requested.to_path_buf(),
        });
    }

    // Resolve the deepest existing ancestor through symlinks, keeping the
    // not-yet-existing tail as-is.
    let mut base = joined.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !base.exists() {
        match (base.file_name(), base.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                base = parent.to_path_buf();
            }
            _ => break,
        }
    }

    let mut resolved = std::fs::canonicalize(&base)?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&canonical_root) {
        return Err(Error::BadPathResolution {
            path: requested.to_path_buf(),
        });
    }

    Ok(resolved)
}

fn directory_size(path: &Path) -> std::io::Result<i64> {
    let mut total = 0;

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            total += directory_size(&entry.path())?;
        } else {
            total += metadata.len() as i64;
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn guard(root: &Path) -> Filesystem {
        Filesystem::new(Uuid::new_v4(), root, 0, Duration::from_secs(60))
    }

    #[test]
    fn resolves_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("plugins")).unwrap();

        let fs = guard(dir.path());
        let p = fs.safe_path("plugins/world.jar").unwrap();
        assert!(p.starts_with(fs::canonicalize(dir.path()).unwrap()));
        assert!(p.ends_with("plugins/world.jar"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let fs = guard(dir.path());

        let err = fs.safe_path("../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::BadPathResolution { .. }));

        let err = fs.safe_path("uploads/../../../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::BadPathResolution { .. }));
    }

    #[test]
    fn allows_missing_terminal_components() {
        let dir = tempfile::tempdir().unwrap();
        let fs = guard(dir.path());

        let p = fs.safe_path("does/not/exist/yet.txt").unwrap();
        assert!(p.starts_with(fs::canonicalize(dir.path()).unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("sneaky")).unwrap();

        let fs = guard(dir.path());
        let err = fs.safe_path("sneaky/data.txt").unwrap_err();
        assert!(matches!(err, Error::BadPathResolution { .. }));
    }

    #[test]
    fn is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let fs = guard(dir.path());

        let once = fs.safe_path("world/region.mca").unwrap();
        let twice = fs.safe_path(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn usage_is_cached_within_the_freshness_window() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("map.dat"), vec![0u8; 2048]).unwrap();

        let fs = guard(dir.path());
        assert_eq!(fs.cached_usage(true).await.unwrap(), 2048);

        // Growth is invisible until the window lapses.
        std::fs::write(dir.path().join("more.dat"), vec![0u8; 1024]).unwrap();
        assert_eq!(fs.cached_usage(true).await.unwrap(), 2048);
    }

    #[tokio::test]
    async fn stale_requests_walk_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("map.dat"), vec![0u8; 512]).unwrap();

        let fs = Filesystem::new(Uuid::new_v4(), dir.path(), 0, Duration::from_millis(0));
        assert_eq!(fs.cached_usage(true).await.unwrap(), 512);

        fs::write(dir.path().join("more.dat"), vec![0u8; 512]).unwrap();
        assert_eq!(fs.cached_usage(true).await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn sums_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("world/region")).unwrap();
        fs::write(dir.path().join("server.properties"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("world/region/r.0.0.mca"), vec![0u8; 400]).unwrap();

        let fs = guard(dir.path());
        assert_eq!(fs.cached_usage(true).await.unwrap(), 500);
    }
}
