mod backend;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use backend::{DirectoryBackend, OverlayBackend};
use fishler_common::helpers::fs::create_secure_directory;
use fishler_common::{FishlerConfig, FishlerError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounted,
    Unmounting,
}

struct EntryInner {
    state: MountState,
    refs: usize,
    last_access: Instant,
}

struct OverlayEntry {
    username: String,
    mountpoint: PathBuf,
    mirror: PathBuf,
    inner: Mutex<EntryInner>,
}

/// Per-user overlay mounts: shared across concurrent sessions of one user,
/// lazily created, reclaimed by the idle GC once unreferenced, and drained
/// wholesale on shutdown.
pub struct OverlayManager {
    base: PathBuf,
    idle_ttl: Duration,
    backend: Arc<dyn OverlayBackend>,
    entries: std::sync::Mutex<HashMap<String, Arc<OverlayEntry>>>,
}

impl OverlayManager {
    pub fn new(config: &FishlerConfig) -> Self {
        Self::with_backend(config, Arc::new(DirectoryBackend))
    }

    pub fn with_backend(config: &FishlerConfig, backend: Arc<dyn OverlayBackend>) -> Self {
        Self {
            base: config.overlay_base_dir(),
            idle_ttl: config.overlay_idle_ttl,
            backend,
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn entry_for(&self, username: &str) -> Arc<OverlayEntry> {
        #[allow(clippy::unwrap_used)]
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(username.to_owned())
            .or_insert_with(|| {
                let user_base = self.base.join(username);
                Arc::new(OverlayEntry {
                    username: username.to_owned(),
                    mountpoint: user_base.join("mount"),
                    mirror: user_base.join("mirror"),
                    inner: Mutex::new(EntryInner {
                        state: MountState::Unmounted,
                        refs: 0,
                        last_access: Instant::now(),
                    }),
                })
            })
            .clone()
    }

    /// True while `entry` is still the registry's entry for `username`.
    /// The GC deregisters an entry before unmounting it, so a deregistered
    /// entry must never be mounted again.
    fn is_current(&self, username: &str, entry: &Arc<OverlayEntry>) -> bool {
        #[allow(clippy::unwrap_used)]
        let entries = self.entries.lock().unwrap();
        entries
            .get(username)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Returns the session-visible path for `username`, mounting on first
    /// use. Callers for the same user serialize on the entry lock, so exactly
    /// one of them performs the mount; the registry lock is never held across
    /// the backend call.
    pub async fn get_mount_point(&self, username: &str) -> Result<PathBuf, FishlerError> {
        loop {
            let entry = self.entry_for(username);
            let mut inner = entry.inner.lock().await;
            match inner.state {
                MountState::Mounted => {
                    inner.refs += 1;
                    inner.last_access = Instant::now();
                    return Ok(entry.mountpoint.clone());
                }
                MountState::Unmounted => {
                    // An Unmounted state on an entry the GC has already
                    // deregistered is the end of that entry's life, not a
                    // mount opportunity; start over with a fresh one.
                    if !self.is_current(username, &entry) {
                        drop(inner);
                        tokio::task::yield_now().await;
                        continue;
                    }
                    create_secure_directory(&entry.mountpoint)?;
                    create_secure_directory(entry.mirror.join("trash"))?;
                    self.backend.mount(&entry.mountpoint, &entry.mirror)?;
                    inner.state = MountState::Mounted;
                    inner.refs = 1;
                    inner.last_access = Instant::now();
                    info!(user = username, mountpoint = ?entry.mountpoint, "overlay mounted");
                    return Ok(entry.mountpoint.clone());
                }
                MountState::Unmounting => {
                    // A GC pass owns this entry; wait for it to disappear
                    // from the registry and start over with a fresh one.
                    drop(inner);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// The backing directory holding the trash subtree. Only valid while the
    /// user's overlay is mounted.
    pub async fn get_mirror_dir(&self, username: &str) -> Result<PathBuf, FishlerError> {
        let entry = {
            #[allow(clippy::unwrap_used)]
            let entries = self.entries.lock().unwrap();
            entries.get(username).cloned()
        }
        .ok_or_else(|| FishlerError::OverlayNotMounted(username.to_owned()))?;

        let inner = entry.inner.lock().await;
        match inner.state {
            MountState::Mounted => Ok(entry.mirror.clone()),
            MountState::Unmounting => Err(FishlerError::OverlayUnmounting(username.to_owned())),
            MountState::Unmounted => Err(FishlerError::OverlayNotMounted(username.to_owned())),
        }
    }

    /// Drops one reference. The mount stays up; reclaim is the idle GC's job,
    /// which keeps release safe to call while session I/O is still draining.
    pub async fn release(&self, username: &str) {
        let entry = {
            #[allow(clippy::unwrap_used)]
            let entries = self.entries.lock().unwrap();
            entries.get(username).cloned()
        };
        if let Some(entry) = entry {
            let mut inner = entry.inner.lock().await;
            inner.refs = inner.refs.saturating_sub(1);
            inner.last_access = Instant::now();
            debug!(user = username, refs = inner.refs, "overlay released");
        }
    }

    /// One GC pass: unmounts every entry that is unreferenced and idle for at
    /// least the configured TTL.
    pub async fn cleanup_idle_mounts(&self) {
        let entries: Vec<Arc<OverlayEntry>> = {
            #[allow(clippy::unwrap_used)]
            let entries = self.entries.lock().unwrap();
            entries.values().cloned().collect()
        };

        for entry in entries {
            let mut inner = entry.inner.lock().await;
            if inner.state != MountState::Mounted
                || inner.refs > 0
                || inner.last_access.elapsed() < self.idle_ttl
            {
                continue;
            }
            inner.state = MountState::Unmounting;
            {
                // Deregister exactly this entry; the slot may already hold a
                // successor if a shutdown drain ran in between.
                #[allow(clippy::unwrap_used)]
                let mut registry = self.entries.lock().unwrap();
                if registry
                    .get(&entry.username)
                    .is_some_and(|current| Arc::ptr_eq(current, &entry))
                {
                    registry.remove(&entry.username);
                }
            }
            if let Err(error) = self.backend.unmount(&entry.mountpoint) {
                error!(user = entry.username, %error, "overlay unmount failed");
            }
            inner.state = MountState::Unmounted;
            info!(user = entry.username, "idle overlay unmounted");
        }
    }

    /// Periodic GC driver; runs until the task is aborted at shutdown.
    pub async fn run_gc(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.cleanup_idle_mounts().await;
        }
    }

    /// Shutdown path: unmounts everything regardless of reference counts.
    /// Attempts every entry and reports the first error.
    pub async fn unmount_all(&self) -> Result<(), FishlerError> {
        let entries: Vec<Arc<OverlayEntry>> = {
            #[allow(clippy::unwrap_used)]
            let mut registry = self.entries.lock().unwrap();
            registry.drain().map(|(_, entry)| entry).collect()
        };

        let mut first_error = None;
        for entry in entries {
            let mut inner = entry.inner.lock().await;
            if inner.state != MountState::Mounted {
                continue;
            }
            inner.state = MountState::Unmounting;
            if let Err(error) = self.backend.unmount(&entry.mountpoint) {
                error!(user = entry.username, %error, "overlay unmount failed");
                first_error.get_or_insert(FishlerError::Io(error));
            }
            inner.state = MountState::Unmounted;
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn mounted_users(&self) -> Vec<String> {
        #[allow(clippy::unwrap_used)]
        let entries = self.entries.lock().unwrap();
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingBackend {
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                mounts: AtomicUsize::new(0),
                unmounts: AtomicUsize::new(0),
            })
        }
    }

    impl OverlayBackend for CountingBackend {
        fn mount(&self, _: &std::path::Path, _: &std::path::Path) -> std::io::Result<()> {
            self.mounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unmount(&self, _: &std::path::Path) -> std::io::Result<()> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager(
        dir: &std::path::Path,
        idle_ttl: Duration,
        backend: Arc<CountingBackend>,
    ) -> Arc<OverlayManager> {
        let mut config = FishlerConfig::default();
        config.log_basepath = dir.to_path_buf();
        config.overlay_idle_ttl = idle_ttl;
        Arc::new(OverlayManager::with_backend(&config, backend))
    }

    #[tokio::test]
    async fn concurrent_callers_mount_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::new();
        let manager = manager(dir.path(), Duration::from_secs(3600), backend.clone());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(
                async move { manager.get_mount_point("eve").await },
            ));
        }
        let mut paths = Vec::new();
        for task in tasks {
            paths.push(task.await.unwrap().unwrap());
        }

        assert_eq!(backend.mounts.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn mirror_dir_requires_mounted_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::new();
        let manager = manager(dir.path(), Duration::from_secs(3600), backend);

        assert!(manager.get_mirror_dir("nobody").await.is_err());

        manager.get_mount_point("frank").await.unwrap();
        let mirror = manager.get_mirror_dir("frank").await.unwrap();
        assert!(mirror.join("trash").is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_mounts_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::new();
        let manager = manager(dir.path(), Duration::from_secs(1), backend.clone());

        manager.get_mount_point("dave").await.unwrap();
        manager.release("dave").await;

        tokio::time::advance(Duration::from_secs(2)).await;
        manager.cleanup_idle_mounts().await;

        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
        assert!(manager.mounted_users().is_empty());

        // a fresh login mounts again
        manager.get_mount_point("dave").await.unwrap();
        assert_eq!(backend.mounts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn login_racing_gc_never_resurrects_a_dead_entry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::new();
        let manager = manager(dir.path(), Duration::from_millis(0), backend.clone());

        manager.get_mount_point("dave").await.unwrap();
        manager.release("dave").await;

        // Sequence the race: a GC pass and a login both resolve the same
        // registry entry, and the GC reaches its lock first. The entry lock
        // is fair, so holding it while the two tasks queue up fixes the
        // interleaving.
        let stale = manager.entry_for("dave");
        let gate = stale.inner.lock().await;

        let gc = tokio::spawn({
            let manager = manager.clone();
            async move { manager.cleanup_idle_mounts().await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let login = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_mount_point("dave").await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        drop(gate);

        gc.await.unwrap();
        login.await.unwrap().unwrap();

        // The GC reclaimed the original entry exactly once and the login
        // came up on a fresh one; the dead entry stays unmounted and
        // unreferenced.
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.mounts.load(Ordering::SeqCst), 2);
        assert!(!manager.is_current("dave", &stale));
        let inner = stale.inner.lock().await;
        assert_eq!(inner.state, MountState::Unmounted);
        assert_eq!(inner.refs, 0);
        drop(inner);
        assert!(!Arc::ptr_eq(&stale, &manager.entry_for("dave")));
    }

    #[tokio::test]
    async fn referenced_mounts_survive_gc() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::new();
        let manager = manager(dir.path(), Duration::from_millis(0), backend.clone());

        manager.get_mount_point("gina").await.unwrap();
        manager.cleanup_idle_mounts().await;

        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 0);
        assert_eq!(manager.mounted_users(), vec!["gina".to_owned()]);
    }

    #[tokio::test]
    async fn unmount_all_ignores_refcounts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CountingBackend::new();
        let manager = manager(dir.path(), Duration::from_secs(3600), backend.clone());

        manager.get_mount_point("henry").await.unwrap();
        manager.get_mount_point("iris").await.unwrap();

        manager.unmount_all().await.unwrap();
        assert_eq!(backend.unmounts.load(Ordering::SeqCst), 2);
        assert!(manager.mounted_users().is_empty());
    }
}
