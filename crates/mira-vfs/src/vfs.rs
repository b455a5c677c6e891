//! Path-level view over the mirrored tree, the reconciler and the content
//! cache.
//!
//! This is the surface the filesystem-kernel binding calls into. Paths are
//! UNIX-style absolute paths, pre-normalized by the caller (no `.` or `..`);
//! a trailing slash is tolerated. Folders that have fallen behind their
//! remote revision are refreshed lazily while a path is being walked, so a
//! successful resolve always reflects the remote state the mirror knows
//! about.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;

use mira_cache::{CacheLayout, FileCache};
use mira_core::error::{FsError, FsResult};
use mira_core::remote::RemoteClient;
use mira_sync::{housekeep, rebuild, refresh_folder, update};
use mira_tree::{render_tree, snapshot, EntryId, EntryKind, EntryStore};

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const BLOCK_SIZE: u32 = 4096;

/// Default content cache budget: 1 GiB.
pub const DEFAULT_CACHE_BUDGET: u64 = 1_073_741_824;

/// How often `getattr` is allowed to trigger an implicit reconcile.
const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Synthesized attributes. The remote has no POSIX metadata, so modes,
/// link counts and block numbers are made up to look conventional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attrs {
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// Quota-backed filesystem statistics.
#[derive(Debug, Clone, Copy)]
pub struct VfsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub name_max: u32,
}

pub struct Vfs<R: RemoteClient> {
    store: EntryStore,
    cache: FileCache,
    remote: R,
    snapshot_path: PathBuf,
    cache_budget: u64,
    interval_status_check: Duration,
    last_status_check: Option<Instant>,
}

impl<R: RemoteClient> Vfs<R> {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring up the mirror from the on-disk cache directory.
    ///
    /// A loadable snapshot is audited (content cache swept against it) and
    /// then reconciled; a missing or corrupt snapshot falls back to a full
    /// rebuild from the remote.
    pub fn open(layout: &CacheLayout, remote: R) -> FsResult<Vfs<R>> {
        layout
            .prepare()
            .map_err(|err| FsError::Fatal(format!("cannot create cache directory: {}", err)))?;

        let snapshot_path = layout.snapshot_path();
        let cache = FileCache::new(layout.files_dir());

        let mut vfs = Vfs {
            store: EntryStore::new(),
            cache,
            remote,
            snapshot_path,
            cache_budget: DEFAULT_CACHE_BUDGET,
            interval_status_check: DEFAULT_STATUS_INTERVAL,
            last_status_check: None,
        };

        match snapshot::read_snapshot_file(&vfs.snapshot_path) {
            Ok(store) => {
                info!(
                    "loaded directory tree from {} ({} entries at revision {})",
                    vfs.snapshot_path.display(),
                    store.len(),
                    store.revision
                );
                vfs.store = store;
                if let Err(err) = vfs.cache.cleanup(&mut vfs.store, vfs.cache_budget) {
                    warn!("content cache sweep failed: {}", err);
                }
                if let Err(err) = update(&mut vfs.store, &vfs.remote, false) {
                    warn!("initial reconcile failed, serving stale mirror: {}", err);
                }
            }
            Err(err) => {
                if err.is_corrupt() {
                    warn!("cannot load directory tree ({}) - starting a new one", err);
                } else {
                    info!("no usable directory tree, building one");
                }
                rebuild(&mut vfs.store, &vfs.remote)?;
            }
        }

        vfs.last_status_check = Some(Instant::now());
        Ok(vfs)
    }

    /// Write the snapshot out. Called by the binding's destroy hook.
    pub fn shutdown(&mut self) -> FsResult<()> {
        snapshot::write_snapshot_file(&self.store, &self.snapshot_path)
            .map_err(|err| FsError::Fatal(format!("cannot store directory tree: {}", err)))?;
        info!("stored directory tree at {}", self.snapshot_path.display());
        Ok(())
    }

    pub fn set_cache_budget(&mut self, budget_bytes: u64) {
        self.cache_budget = budget_bytes;
    }

    pub fn set_status_interval(&mut self, interval: Duration) {
        self.interval_status_check = interval;
    }

    /// Reconcile with the remote now.
    pub fn reconcile(&mut self, expect_changes: bool) -> FsResult<()> {
        update(&mut self.store, &self.remote, expect_changes)?;
        Ok(())
    }

    /// Structural repair pass; exposed for the binding's periodic
    /// maintenance.
    pub fn repair(&mut self) {
        housekeep(&mut self.store, &self.remote);
    }

    /// Sweep the content cache down to the configured budget.
    pub fn evict_cache(&mut self) -> FsResult<()> {
        self.cache.cleanup(&mut self.store, self.cache_budget)?;
        Ok(())
    }

    // ========================================================================
    // Path Resolution
    // ========================================================================

    /// Walk `path` from the root to an entry.
    ///
    /// Every folder on the way that is behind its remote revision gets
    /// refreshed first; a refresh failure is logged and the walk continues
    /// on the stale view. A file anywhere but in the last position fails
    /// with `NotADirectory`.
    fn resolve(&mut self, path: &str) -> FsResult<EntryId> {
        if !path.is_empty() && !path.starts_with('/') {
            warn!("path must start with a slash: {}", path);
            return Err(FsError::NotFound);
        }

        let components: Vec<String> =
            path.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect();

        let mut current = EntryId::ROOT;
        let last = components.len().saturating_sub(1);

        for (position, component) in components.iter().enumerate() {
            self.maybe_refresh(current);

            let entry = self.store.get(current).ok_or(FsError::NotFound)?;
            let child = entry
                .children()
                .iter()
                .copied()
                .find(|&c| self.store.get(c).map(|e| e.name == *component).unwrap_or(false))
                .ok_or(FsError::NotFound)?;

            let is_file = self.store.get(child).map(|e| e.is_file()).unwrap_or(false);
            if is_file && position < last {
                debug!("a file can only be at the end of a path: {}", path);
                return Err(FsError::NotADirectory);
            }

            current = child;
        }

        self.maybe_refresh(current);
        Ok(current)
    }

    /// Refresh a folder whose contents trail its remote revision. Failures
    /// are swallowed: the caller keeps walking the stale view and a later
    /// reconcile catches up.
    fn maybe_refresh(&mut self, id: EntryId) {
        let stale = self
            .store
            .get(id)
            .map(|e| e.is_folder() && e.local_revision != e.remote_revision)
            .unwrap_or(false);
        if !stale {
            return;
        }
        if let Err(err) = refresh_folder(&mut self.store, &self.remote, id) {
            warn!("lazy folder refresh failed: {}", err);
        }
    }

    /// Reconcile if the status-check interval has elapsed. The clock is
    /// monotonic, and the interval restarts on failure too so a dead remote
    /// is probed once per interval, not once per operation.
    fn maybe_update(&mut self) {
        let due = self
            .last_status_check
            .map(|at| at.elapsed() >= self.interval_status_check)
            .unwrap_or(true);
        if !due {
            return;
        }
        if let Err(err) = update(&mut self.store, &self.remote, false) {
            warn!("interval reconcile failed: {}", err);
        }
        self.last_status_check = Some(Instant::now());
    }

    // ========================================================================
    // Metadata Operations
    // ========================================================================

    /// Attributes of the entry at `path`.
    ///
    /// getattr precedes almost every other call the kernel makes, so this is
    /// also where the throttled implicit reconcile hangs.
    pub fn getattr(&mut self, path: &str) -> FsResult<Attrs> {
        self.maybe_update();

        let id = self.resolve(path)?;
        let entry = self.store.get(id).ok_or(FsError::NotFound)?;

        let attrs = match &entry.kind {
            EntryKind::Folder { children } => Attrs {
                mode: S_IFDIR | 0o755,
                nlink: children.len() as u64 + 2,
                size: 1024,
                blksize: BLOCK_SIZE,
                blocks: 1,
                atime: entry.ctime,
                mtime: entry.ctime,
                ctime: entry.ctime,
            },
            EntryKind::File { size, atime, .. } => Attrs {
                mode: S_IFREG | 0o666,
                nlink: 1,
                size: *size,
                blksize: BLOCK_SIZE,
                blocks: *size / BLOCK_SIZE as u64 + 1,
                atime: *atime,
                mtime: entry.ctime,
                ctime: entry.ctime,
            },
        };
        Ok(attrs)
    }

    /// Names in the folder at `path`: `.`, `..`, then the children in
    /// stored order.
    pub fn readdir(&mut self, path: &str) -> FsResult<Vec<String>> {
        let id = self.resolve(path)?;
        let entry = self.store.get(id).ok_or(FsError::NotFound)?;
        if !entry.is_folder() {
            return Err(FsError::NotFound);
        }

        let mut names = vec![".".to_string(), "..".to_string()];
        for &child in entry.children() {
            if let Some(child_entry) = self.store.get(child) {
                names.push(child_entry.name.clone());
            }
        }
        Ok(names)
    }

    pub fn path_exists(&mut self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    pub fn is_root(&mut self, path: &str) -> bool {
        self.resolve(path).map(|id| id == EntryId::ROOT).unwrap_or(false)
    }

    pub fn is_file(&mut self, path: &str) -> bool {
        self.resolve(path)
            .ok()
            .and_then(|id| self.store.get(id))
            .map(|e| e.is_file())
            .unwrap_or(false)
    }

    pub fn is_directory(&mut self, path: &str) -> bool {
        self.resolve(path)
            .ok()
            .and_then(|id| self.store.get(id))
            .map(|e| e.is_folder())
            .unwrap_or(false)
    }

    pub fn get_key(&mut self, path: &str) -> Option<String> {
        let id = self.resolve(path).ok()?;
        self.store.get(id).map(|e| e.key.clone())
    }

    pub fn get_num_children(&mut self, path: &str) -> Option<u64> {
        let id = self.resolve(path).ok()?;
        self.store.get(id).map(|e| e.num_children())
    }

    // ========================================================================
    // Content Operations
    // ========================================================================

    /// Open the file at `path` through the content cache.
    ///
    /// With `update_content` the cached copy is brought up to the entry's
    /// remote revision first and the entry's local revision is advanced to
    /// match. Either way the access time is stamped.
    pub fn open_file(&mut self, path: &str, write: bool, update_content: bool) -> FsResult<File> {
        let id = self.resolve(path)?;
        let (key, local_revision, remote_revision, size, hash) = self.file_fields(id)?;

        debug!(
            "opening {} with local {} and remote {}",
            key, local_revision, remote_revision
        );

        let file = self.cache.open_file(
            &key,
            local_revision,
            remote_revision,
            size,
            &hash,
            &self.remote,
            write,
            update_content,
        )?;

        if let Some(entry) = self.store.get_mut(id) {
            if update_content {
                entry.local_revision = entry.remote_revision;
            }
            if let EntryKind::File { atime, .. } = &mut entry.kind {
                *atime = now_epoch();
            }
        }

        Ok(file)
    }

    /// Truncate the file at `path` to zero length and mark its content
    /// current, ready to be rewritten and patched back.
    pub fn truncate(&mut self, path: &str) -> FsResult<()> {
        let id = self.resolve(path)?;
        let (key, local_revision, remote_revision, size, hash) = self.file_fields(id)?;

        self.cache
            .truncate_file(&key, local_revision, remote_revision, size, &hash, &self.remote)?;

        if let Some(entry) = self.store.get_mut(id) {
            entry.local_revision = entry.remote_revision;
        }
        Ok(())
    }

    /// Send the locally modified content of `path` back to the remote with
    /// patch semantics. The entry's revisions are left to the next reconcile
    /// to settle; only the local marker is re-armed.
    pub fn upload_patch(&mut self, path: &str) -> FsResult<()> {
        let id = self.resolve(path)?;
        let (key, local_revision, ..) = self.file_fields(id)?;

        let new_revision = self.cache.upload_patch(&key, local_revision, &self.remote)?;
        debug!("{} patched, remote revision now {}", key, new_revision);

        if let Some(entry) = self.store.get_mut(id) {
            entry.local_revision = entry.remote_revision;
        }
        Ok(())
    }

    /// Anonymous scratch file for composing a new upload.
    pub fn tmp_open(&self) -> FsResult<File> {
        self.cache.tmp_open()
    }

    fn file_fields(&self, id: EntryId) -> FsResult<(String, u64, u64, u64, [u8; 32])> {
        let entry = self.store.get(id).ok_or(FsError::NotFound)?;
        match &entry.kind {
            EntryKind::File { hash, size, .. } => Ok((
                entry.key.clone(),
                entry.local_revision,
                entry.remote_revision,
                *size,
                *hash,
            )),
            EntryKind::Folder { .. } => Err(FsError::NotFound),
        }
    }

    // ========================================================================
    // Statistics & Introspection
    // ========================================================================

    /// Quota-backed statvfs synthesis.
    pub fn statvfs(&self) -> FsResult<VfsStats> {
        let quota = self.remote.storage_quota()?;
        let block_size = BLOCK_SIZE as u64;
        let blocks = quota.total_bytes / block_size;
        let free = quota.total_bytes.saturating_sub(quota.used_bytes) / block_size;
        Ok(VfsStats {
            block_size: BLOCK_SIZE,
            blocks,
            blocks_free: free,
            blocks_available: free,
            name_max: 255,
        })
    }

    /// Current device revision of the mirror.
    pub fn revision(&self) -> u64 {
        self.store.revision
    }

    /// ASCII dump of the whole mirrored tree, for logs and debugging.
    pub fn debug_tree(&self) -> String {
        render_tree(&self.store, None)
    }
}

fn now_epoch() -> u64 {
    // files use 0 as the folder discriminator, so clamp pathological clocks
    Utc::now().timestamp().max(1) as u64
}

/// The single coarse lock around the core.
///
/// The kernel binding serializes every inbound operation through this
/// wrapper; the lock is held for the whole call, remote I/O included, so at
/// most one remote request is outstanding per mount. Core-internal recursion
/// (flush calling upload, upload resolving paths, resolution refreshing
/// folders) happens beneath the lock as plain nested calls.
pub struct SharedVfs<R: RemoteClient> {
    inner: Arc<Mutex<Vfs<R>>>,
}

impl<R: RemoteClient> SharedVfs<R> {
    pub fn new(vfs: Vfs<R>) -> SharedVfs<R> {
        SharedVfs { inner: Arc::new(Mutex::new(vfs)) }
    }

    /// Run one operation under the lock.
    pub fn with<T>(&self, op: impl FnOnce(&mut Vfs<R>) -> T) -> T {
        let mut guard = self.inner.lock();
        op(&mut guard)
    }
}

impl<R: RemoteClient> Clone for SharedVfs<R> {
    fn clone(&self) -> Self {
        SharedVfs { inner: Arc::clone(&self.inner) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::{Read, Write};

    use sha2::{Digest, Sha256};

    use mira_core::error::{RemoteError, RemoteResult};
    use mira_core::remote::{
        ChangeBatch, FileDescriptor, FolderDescriptor, StorageQuota, UploadStatus, UploadTicket,
    };

    const DOCS: &str = "doc0000000001";
    const HELLO: &str = "fil00000000001a";

    fn sha_hex(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    struct ScriptedRemote {
        status: u64,
        folders: HashMap<String, FolderDescriptor>,
        contents: HashMap<String, (Vec<FolderDescriptor>, Vec<FileDescriptor>)>,
        blobs: HashMap<String, Vec<u8>>,
        quota: StorageQuota,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedRemote {
        fn log(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }

        fn called(&self, prefix: &str) -> usize {
            self.calls.borrow().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl RemoteClient for ScriptedRemote {
        fn device_status(&self) -> RemoteResult<u64> {
            self.log("status".into());
            Ok(self.status)
        }

        fn device_changes(&self, _since: u64) -> RemoteResult<ChangeBatch> {
            self.log("changes".into());
            Ok(ChangeBatch { changes: Vec::new(), revision: self.status })
        }

        fn folder_info(&self, key: Option<&str>) -> RemoteResult<FolderDescriptor> {
            let key = key.unwrap_or("");
            self.log(format!("folder_info:{}", key));
            self.folders.get(key).cloned().ok_or(RemoteError::NotFound)
        }

        fn file_info(&self, _key: &str) -> RemoteResult<FileDescriptor> {
            Err(RemoteError::NotFound)
        }

        fn folder_content(
            &self,
            key: &str,
        ) -> RemoteResult<(Vec<FolderDescriptor>, Vec<FileDescriptor>)> {
            self.log(format!("content:{}", key));
            Ok(self.contents.get(key).cloned().unwrap_or_default())
        }

        fn file_download(&self, key: &str, dest: &mut dyn Write) -> RemoteResult<u64> {
            self.log(format!("download:{}", key));
            let blob = self.blobs.get(key).ok_or(RemoteError::NotFound)?;
            dest.write_all(blob)
                .map_err(|err| RemoteError::Transient(err.to_string()))?;
            Ok(blob.len() as u64)
        }

        fn file_upload_patch(
            &self,
            _key: &str,
            _base_revision: u64,
            source: &mut dyn Read,
            _size: u64,
        ) -> RemoteResult<UploadTicket> {
            let mut sink = Vec::new();
            source
                .read_to_end(&mut sink)
                .map_err(|err| RemoteError::Transient(err.to_string()))?;
            Ok(UploadTicket { upload_key: "up-1".into() })
        }

        fn upload_poll(&self, _ticket: &UploadTicket) -> RemoteResult<UploadStatus> {
            Ok(UploadStatus::Done { revision: self.status + 1 })
        }

        fn storage_quota(&self) -> RemoteResult<StorageQuota> {
            Ok(self.quota)
        }
    }

    /// Remote with a `docs/` folder holding `hello.txt`.
    fn scripted_remote() -> ScriptedRemote {
        let root = FolderDescriptor {
            key: String::new(),
            name: String::new(),
            parent_key: String::new(),
            revision: 10,
            created: 1_400_000_000,
        };
        let docs = FolderDescriptor {
            key: DOCS.to_string(),
            name: "docs".to_string(),
            parent_key: String::new(),
            revision: 5,
            created: 1_400_000_100,
        };
        let hello = FileDescriptor {
            key: HELLO.to_string(),
            name: "hello.txt".to_string(),
            parent_key: DOCS.to_string(),
            revision: 7,
            created: 1_400_000_200,
            size: 5,
            hash: sha_hex(b"hello"),
        };

        let mut folders = HashMap::new();
        folders.insert(String::new(), root);
        folders.insert(DOCS.to_string(), docs.clone());

        let mut contents = HashMap::new();
        contents.insert(String::new(), (vec![docs], vec![]));
        contents.insert(DOCS.to_string(), (vec![], vec![hello]));

        let mut blobs = HashMap::new();
        blobs.insert(HELLO.to_string(), b"hello".to_vec());

        ScriptedRemote {
            status: 10,
            folders,
            contents,
            blobs,
            quota: StorageQuota { total_bytes: 40_960, used_bytes: 8_192 },
            calls: RefCell::new(Vec::new()),
        }
    }

    fn open_vfs(dir: &std::path::Path) -> Vfs<ScriptedRemote> {
        let layout = CacheLayout::new(dir.to_path_buf(), "test");
        Vfs::open(&layout, scripted_remote()).unwrap()
    }

    #[test]
    fn test_open_rebuilds_when_no_snapshot_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        assert_eq!(vfs.revision(), 10);
        assert!(vfs.is_root("/"));
        assert!(vfs.is_root(""));
        assert!(vfs.is_directory("/docs"));
    }

    #[test]
    fn test_resolve_refreshes_stale_folders_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        // rebuilding listed only the root level; docs is filled on first walk
        assert_eq!(vfs.remote.called("content:doc"), 0);
        assert!(vfs.is_file("/docs/hello.txt"));
        assert_eq!(vfs.remote.called("content:doc"), 1);

        // a second walk finds docs current and does not refetch
        assert!(vfs.is_file("/docs/hello.txt"));
        assert_eq!(vfs.remote.called("content:doc"), 1);
    }

    #[test]
    fn test_resolve_tolerates_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        assert!(vfs.is_directory("/docs/"));
        assert_eq!(vfs.get_key("/docs/"), Some(DOCS.to_string()));
    }

    #[test]
    fn test_resolve_rejects_file_mid_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        assert!(matches!(
            vfs.getattr("/docs/hello.txt/nested"),
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(vfs.getattr("/missing"), Err(FsError::NotFound)));
    }

    #[test]
    fn test_getattr_synthesizes_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        let docs = vfs.getattr("/docs").unwrap();
        assert_eq!(docs.mode, S_IFDIR | 0o755);
        assert_eq!(docs.nlink, 3, "one child plus two");
        assert_eq!(docs.size, 1024);
        assert_eq!(docs.mtime, 1_400_000_100);

        let hello = vfs.getattr("/docs/hello.txt").unwrap();
        assert_eq!(hello.mode, S_IFREG | 0o666);
        assert_eq!(hello.nlink, 1);
        assert_eq!(hello.size, 5);
        assert_eq!(hello.atime, 1, "never opened");
        assert_eq!(hello.blocks, 1);
    }

    #[test]
    fn test_getattr_throttles_implicit_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        let after_open = vfs.remote.called("status");
        vfs.getattr("/docs").unwrap();
        vfs.getattr("/docs").unwrap();
        assert_eq!(
            vfs.remote.called("status"),
            after_open,
            "within the interval getattr must not probe the remote"
        );

        vfs.set_status_interval(Duration::ZERO);
        vfs.getattr("/docs").unwrap();
        assert_eq!(vfs.remote.called("status"), after_open + 1);
    }

    #[test]
    fn test_readdir_lists_dot_entries_then_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        assert_eq!(vfs.readdir("/").unwrap(), vec![".", "..", "docs"]);
        assert_eq!(
            vfs.readdir("/docs").unwrap(),
            vec![".", "..", "hello.txt"]
        );
        assert!(matches!(
            vfs.readdir("/docs/hello.txt"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_open_file_materializes_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        let mut file = vfs.open_file("/docs/hello.txt", false, true).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        let attrs = vfs.getattr("/docs/hello.txt").unwrap();
        assert!(attrs.atime > 1_000_000, "atime stamped with wall clock");
        assert_eq!(vfs.remote.called("download"), 1);

        // second open hits the cache
        vfs.open_file("/docs/hello.txt", false, true).unwrap();
        assert_eq!(vfs.remote.called("download"), 1);
    }

    #[test]
    fn test_upload_patch_rearms_local_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());

        // materialize, then pretend the kernel wrote to the cached copy
        vfs.open_file("/docs/hello.txt", true, true).unwrap();
        vfs.upload_patch("/docs/hello.txt").unwrap();

        let id = vfs.resolve("/docs/hello.txt").unwrap();
        let entry = vfs.store.get(id).unwrap();
        assert_eq!(entry.local_revision, entry.remote_revision);
    }

    #[test]
    fn test_statvfs_uses_quota() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = open_vfs(dir.path());

        let stats = vfs.statvfs().unwrap();
        assert_eq!(stats.block_size, 4096);
        assert_eq!(stats.blocks, 10);
        assert_eq!(stats.blocks_free, 8);
        assert_eq!(stats.name_max, 255);
    }

    #[test]
    fn test_shutdown_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());
        vfs.open_file("/docs/hello.txt", false, true).unwrap();
        vfs.shutdown().unwrap();

        let layout = CacheLayout::new(dir.path().to_path_buf(), "test");
        assert!(layout.snapshot_path().exists());

        let mut reopened = Vfs::open(&layout, scripted_remote()).unwrap();
        assert_eq!(reopened.revision(), 10);
        assert!(reopened.is_file("/docs/hello.txt"));
        // content survived the restart; no new download needed
        reopened.open_file("/docs/hello.txt", false, true).unwrap();
        assert_eq!(reopened.remote.called("download"), 0);
        assert_eq!(reopened.remote.called("folder_info"), 0, "no rebuild happened");
    }

    #[test]
    fn test_shared_vfs_serializes_operations() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedVfs::new(open_vfs(dir.path()));
        let clone = shared.clone();

        let names = shared.with(|vfs| vfs.readdir("/").unwrap());
        assert_eq!(names, vec![".", "..", "docs"]);
        assert!(clone.with(|vfs| vfs.is_directory("/docs")));
    }

    #[test]
    fn test_debug_tree_renders() {
        let dir = tempfile::tempdir().unwrap();
        let mut vfs = open_vfs(dir.path());
        vfs.is_file("/docs/hello.txt");

        let output = vfs.debug_tree();
        assert!(output.contains("docs"));
        assert!(output.contains("hello.txt (5 bytes)"));
    }
}
