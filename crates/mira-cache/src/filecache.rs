//! On-disk content cache.
//!
//! A flat directory of files named `<key>_<revision>` where `<key>` is a
//! 15-character base-36 file key and `<revision>` is the decimal revision the
//! content belongs to. Anything else in the directory is somebody else's and
//! is never touched. Downloads are staged in `tmp_`-prefixed temp files and
//! renamed into place only after size and SHA-256 verify.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use mira_core::error::{FsError, FsResult};
use mira_core::key::FILE_KEY_LEN;
use mira_core::remote::{RemoteClient, UploadStatus};
use mira_tree::{EntryKind, EntryStore};

/// How long to keep polling a pending upload before giving up.
const UPLOAD_POLL_LIMIT: u32 = 60;
const UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: PathBuf) -> FileCache {
        FileCache { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn content_path(&self, key: &str, revision: u64) -> PathBuf {
        self.dir.join(format!("{}_{}", key, revision))
    }

    // ========================================================================
    // Open & Materialize
    // ========================================================================

    /// Open the cached content of a file, materializing it first if needed.
    ///
    /// With `update` set, a cached copy at the entry's remote revision that
    /// passes integrity is opened directly; anything else triggers a fresh
    /// download. Without `update` the cached path is opened as-is (created
    /// empty if missing) - that is the path taken for files that exist only
    /// locally so far.
    #[allow(clippy::too_many_arguments)]
    pub fn open_file(
        &self,
        key: &str,
        local_revision: u64,
        remote_revision: u64,
        size: u64,
        hash: &[u8; 32],
        remote: &dyn RemoteClient,
        write: bool,
        update: bool,
    ) -> FsResult<File> {
        let path = self.content_path(key, remote_revision);

        if update {
            let cached_ok = local_revision == remote_revision
                && path.exists()
                && check_integrity(&path, size, hash);
            if !cached_ok {
                debug!(
                    "materializing {} at revision {} (local {})",
                    key, remote_revision, local_revision
                );
                self.download(key, remote_revision, size, hash, remote)?;
            }
            let file = OpenOptions::new().read(true).write(write).open(&path)?;
            return Ok(file);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .create(write)
            .open(&path)?;
        Ok(file)
    }

    /// Download one revision of a file into the cache.
    ///
    /// Staged in a temp file inside the cache directory so the rename is
    /// atomic; the temp file is removed on any failure, and a size or digest
    /// mismatch surfaces as `AccessDenied`.
    fn download(
        &self,
        key: &str,
        revision: u64,
        size: u64,
        hash: &[u8; 32],
        remote: &dyn RemoteClient,
    ) -> FsResult<()> {
        let mut staged = tempfile::Builder::new()
            .prefix("tmp_")
            .tempfile_in(&self.dir)?;

        let written = remote.file_download(key, staged.as_file_mut())?;
        staged.as_file_mut().flush()?;

        if written != size {
            warn!("download of {} returned {} bytes, expected {}", key, written, size);
            return Err(FsError::AccessDenied);
        }
        if !check_integrity(staged.path(), size, hash) {
            warn!("download of {} failed integrity verification", key);
            return Err(FsError::AccessDenied);
        }

        let path = self.content_path(key, revision);
        staged.persist(&path).map_err(|err| FsError::from(err.error))?;
        info!("cached {} at revision {}", key, revision);
        Ok(())
    }

    /// Truncate a file's cached content to zero length, materializing the
    /// current revision first when the cache is stale.
    #[allow(clippy::too_many_arguments)]
    pub fn truncate_file(
        &self,
        key: &str,
        local_revision: u64,
        remote_revision: u64,
        size: u64,
        hash: &[u8; 32],
        remote: &dyn RemoteClient,
    ) -> FsResult<()> {
        let path = self.content_path(key, remote_revision);
        if local_revision != remote_revision || !path.exists() {
            self.download(key, remote_revision, size, hash, remote)?;
        }

        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(0)?;
        Ok(())
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Send the locally modified cached content back with patch semantics,
    /// then poll until the remote has consumed the upload. Returns the new
    /// remote revision.
    pub fn upload_patch(
        &self,
        key: &str,
        local_revision: u64,
        remote: &dyn RemoteClient,
    ) -> FsResult<u64> {
        let path = self.content_path(key, local_revision);
        let mut source = File::open(&path)?;
        let size = source.metadata()?.len();

        let ticket = remote.file_upload_patch(key, local_revision, &mut source, size)?;

        for _ in 0..UPLOAD_POLL_LIMIT {
            match remote.upload_poll(&ticket)? {
                UploadStatus::InProgress => std::thread::sleep(UPLOAD_POLL_INTERVAL),
                UploadStatus::Done { revision } => {
                    info!("patch upload of {} landed as revision {}", key, revision);
                    return Ok(revision);
                }
                UploadStatus::Failed(msg) => {
                    warn!("patch upload of {} failed: {}", key, msg);
                    return Err(FsError::AccessDenied);
                }
            }
        }

        warn!("patch upload of {} still pending after {} polls", key, UPLOAD_POLL_LIMIT);
        Err(FsError::Transient)
    }

    /// Anonymous scratch file inside the cache directory, for composing
    /// uploads. Unlinked on creation, so it is invisible to the eviction
    /// scan and disappears with its handle.
    pub fn tmp_open(&self) -> FsResult<File> {
        let file = tempfile::tempfile_in(&self.dir)?;
        Ok(file)
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Walk the cache directory and bring it below `budget_bytes`.
    ///
    /// Files that do not match the cache filename grammar are left alone (to
    /// avoid touching anything a user dropped in). Files whose key is gone
    /// from the tree, whose revision is no longer both the remote and local
    /// revision, or whose content fails verification are unlinked outright.
    /// If the survivors still exceed the budget, the least recently accessed
    /// are unlinked until they fit; ties break on key order so the outcome
    /// is deterministic. Every unlink resets the entry's local revision.
    pub fn cleanup(&self, store: &mut EntryStore, budget_bytes: u64) -> io::Result<()> {
        struct CacheFile {
            key: String,
            revision: u64,
            atime: u64,
            size: u64,
        }

        let mut survivors: Vec<CacheFile> = Vec::new();

        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(name) = file_name.to_str() else { continue };

            let Some((key, revision)) = parse_cache_filename(name) else {
                debug!("not a valid cachefile: {} (ignoring)", name);
                continue;
            };
            let path = dir_entry.path();

            let fields = store.lookup(&key).and_then(|id| {
                store.get(id).and_then(|entry| match &entry.kind {
                    EntryKind::File { hash, size, atime } => Some((
                        id,
                        entry.remote_revision,
                        entry.local_revision,
                        *hash,
                        *size,
                        *atime,
                    )),
                    EntryKind::Folder { .. } => None,
                })
            });

            let Some((id, remote_revision, local_revision, hash, size, atime)) = fields else {
                info!("delete cachefile with unknown key: {}", name);
                unlink(&path);
                continue;
            };

            if revision != remote_revision || revision != local_revision {
                info!(
                    "delete cachefile at revision {} (remote {}, local {}): {}",
                    revision, remote_revision, local_revision, name
                );
                unlink(&path);
                if let Some(entry) = store.get_mut(id) {
                    entry.local_revision = 0;
                }
                continue;
            }

            if !check_integrity(&path, size, &hash) {
                info!("delete cachefile with invalid content: {}", name);
                unlink(&path);
                if let Some(entry) = store.get_mut(id) {
                    entry.local_revision = 0;
                }
                continue;
            }

            survivors.push(CacheFile { key, revision, atime, size });
        }

        let mut total: u64 = survivors.iter().map(|f| f.size).sum();
        if total <= budget_bytes {
            return Ok(());
        }

        survivors.sort_by(|a, b| a.atime.cmp(&b.atime).then_with(|| a.key.cmp(&b.key)));

        for cachefile in &survivors {
            if total <= budget_bytes {
                break;
            }
            info!("delete cachefile to free space: {}_{}", cachefile.key, cachefile.revision);
            unlink(&self.content_path(&cachefile.key, cachefile.revision));
            if let Some(entry) = store.lookup(&cachefile.key).and_then(|id| store.get_mut(id)) {
                entry.local_revision = 0;
            }
            total -= cachefile.size;
        }

        Ok(())
    }
}

fn unlink(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!("unlink of {} failed: {}", path.display(), err);
    }
}

/// Parse a cache filename into its key and revision.
///
/// To be valid the first 15 bytes have to be lowercase base-36, the 16th an
/// underscore, the 17th a digit from 1-9 and any remaining characters digits.
pub fn parse_cache_filename(name: &str) -> Option<(String, u64)> {
    let bytes = name.as_bytes();
    if bytes.len() < FILE_KEY_LEN + 2 {
        return None;
    }
    if !bytes[..FILE_KEY_LEN]
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return None;
    }
    if bytes[FILE_KEY_LEN] != b'_' {
        return None;
    }
    if !(b'1'..=b'9').contains(&bytes[FILE_KEY_LEN + 1]) {
        return None;
    }
    if !bytes[FILE_KEY_LEN + 1..].iter().all(u8::is_ascii_digit) {
        return None;
    }

    let revision: u64 = name[FILE_KEY_LEN + 1..].parse().ok()?;
    Some((name[..FILE_KEY_LEN].to_string(), revision))
}

/// Verify a cached file against its expected length and SHA-256 digest.
/// Any I/O error counts as a failed check.
pub fn check_integrity(path: &Path, size: u64, hash: &[u8; 32]) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if metadata.len() != size {
        return false;
    }

    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut reader = io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }

    let digest = hasher.finalize();
    if digest.as_slice() != hash {
        debug!(
            "digest mismatch for {}: got {}, wanted {}",
            path.display(),
            hex::encode(digest),
            hex::encode(hash)
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    use mira_core::error::{RemoteError, RemoteResult};
    use mira_core::remote::{
        ChangeBatch, FileDescriptor, FolderDescriptor, StorageQuota, UploadTicket,
    };
    use mira_tree::EntryId;

    fn sha(data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }

    /// Remote that serves one blob for any download and refuses the rest.
    struct BlobRemote {
        blob: Vec<u8>,
    }

    impl RemoteClient for BlobRemote {
        fn device_status(&self) -> RemoteResult<u64> {
            Err(RemoteError::Fatal("not scripted".into()))
        }

        fn device_changes(&self, _since: u64) -> RemoteResult<ChangeBatch> {
            Err(RemoteError::Fatal("not scripted".into()))
        }

        fn folder_info(&self, _key: Option<&str>) -> RemoteResult<FolderDescriptor> {
            Err(RemoteError::Fatal("not scripted".into()))
        }

        fn file_info(&self, _key: &str) -> RemoteResult<FileDescriptor> {
            Err(RemoteError::Fatal("not scripted".into()))
        }

        fn folder_content(
            &self,
            _key: &str,
        ) -> RemoteResult<(Vec<FolderDescriptor>, Vec<FileDescriptor>)> {
            Err(RemoteError::Fatal("not scripted".into()))
        }

        fn file_download(&self, _key: &str, dest: &mut dyn Write) -> RemoteResult<u64> {
            dest.write_all(&self.blob)
                .map_err(|err| RemoteError::Transient(err.to_string()))?;
            Ok(self.blob.len() as u64)
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
            Ok(UploadTicket { upload_key: "ticket-1".into() })
        }

        fn upload_poll(&self, _ticket: &UploadTicket) -> RemoteResult<UploadStatus> {
            Ok(UploadStatus::Done { revision: 8 })
        }

        fn storage_quota(&self) -> RemoteResult<StorageQuota> {
            Err(RemoteError::Fatal("not scripted".into()))
        }
    }

    fn file_key(seed: u8) -> String {
        format!("a{:014x}", seed)
    }

    /// Store with one file entry per (seed, size, atime), all at the given
    /// revision with content fully cached.
    fn store_with_files(files: &[(u8, u64, u64)], revision: u64) -> EntryStore {
        let mut store = EntryStore::new();
        for &(seed, size, atime) in files {
            let content = vec![b'x' + seed; size as usize];
            let desc = FileDescriptor {
                key: file_key(seed),
                name: format!("file-{}", seed),
                parent_key: String::new(),
                revision,
                created: 1_400_000_000,
                size,
                hash: hex::encode(sha(&content)),
            };
            let id = store.upsert_file(&desc, EntryId::ROOT).unwrap();
            let entry = store.get_mut(id).unwrap();
            entry.local_revision = revision;
            if let EntryKind::File { atime: slot, .. } = &mut entry.kind {
                *slot = atime;
            }
        }
        store
    }

    fn write_cachefile(cache: &FileCache, seed: u8, size: u64, revision: u64) {
        let content = vec![b'x' + seed; size as usize];
        fs::write(cache.content_path(&file_key(seed), revision), content).unwrap();
    }

    #[test]
    fn test_parse_cache_filename() {
        assert_eq!(
            parse_cache_filename("aaa00000000001a_99"),
            Some(("aaa00000000001a".to_string(), 99))
        );
        assert_eq!(parse_cache_filename("aaa00000000001a_1"), Some(("aaa00000000001a".into(), 1)));
        // zero and leading-zero revisions are not cache files
        assert_eq!(parse_cache_filename("aaa00000000001a_0"), None);
        assert_eq!(parse_cache_filename("aaa00000000001a_01"), None);
        // wrong key length, missing separator, foreign names
        assert_eq!(parse_cache_filename("aaa0000000001_99"), None);
        assert_eq!(parse_cache_filename("aaa00000000001a99"), None);
        assert_eq!(parse_cache_filename("AAA00000000001a_99"), None);
        assert_eq!(parse_cache_filename("tmp_abc123"), None);
        assert_eq!(parse_cache_filename("notes.txt"), None);
        assert_eq!(parse_cache_filename(""), None);
    }

    #[test]
    fn test_check_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"hello").unwrap();

        assert!(check_integrity(&path, 5, &sha(b"hello")));
        assert!(!check_integrity(&path, 4, &sha(b"hello")), "size mismatch");
        assert!(!check_integrity(&path, 5, &sha(b"world")), "digest mismatch");
        assert!(!check_integrity(&dir.path().join("absent"), 5, &sha(b"hello")));
    }

    #[test]
    fn test_open_file_downloads_verifies_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        let remote = BlobRemote { blob: b"hello".to_vec() };
        let key = file_key(1);

        let mut file = cache
            .open_file(&key, 0, 7, 5, &sha(b"hello"), &remote, false, true)
            .unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        // the blob was persisted under <key>_<revision> and nothing else
        // was left behind
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}_7", key)]);
    }

    #[test]
    fn test_open_file_reuses_valid_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        let key = file_key(2);
        fs::write(cache.content_path(&key, 7), b"hello").unwrap();

        // remote serves different bytes; a hit must not touch it
        let remote = BlobRemote { blob: b"WRONG".to_vec() };
        let mut file = cache
            .open_file(&key, 7, 7, 5, &sha(b"hello"), &remote, false, true)
            .unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_open_file_rejects_corrupt_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        let remote = BlobRemote { blob: b"tampered".to_vec() };
        let key = file_key(3);

        let result = cache.open_file(&key, 0, 7, 8, &sha(b"original"), &remote, false, true);
        assert!(matches!(result, Err(FsError::AccessDenied)));

        // neither the staged temp file nor a cache entry may remain
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_truncate_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        let remote = BlobRemote { blob: b"hello".to_vec() };
        let key = file_key(4);

        cache
            .truncate_file(&key, 0, 7, 5, &sha(b"hello"), &remote)
            .unwrap();
        let metadata = fs::metadata(cache.content_path(&key, 7)).unwrap();
        assert_eq!(metadata.len(), 0);
    }

    #[test]
    fn test_upload_patch_returns_new_revision() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        let key = file_key(5);
        fs::write(cache.content_path(&key, 3), b"local edit").unwrap();

        let remote = BlobRemote { blob: Vec::new() };
        let revision = cache.upload_patch(&key, 3, &remote).unwrap();
        assert_eq!(revision, 8);
    }

    #[test]
    fn test_upload_patch_without_cached_content_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        let remote = BlobRemote { blob: Vec::new() };

        assert!(matches!(
            cache.upload_patch(&file_key(6), 3, &remote),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_tmp_open_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());

        let mut scratch = cache.tmp_open().unwrap();
        scratch.write_all(b"draft").unwrap();

        // anonymous: nothing named appears in the directory
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    #[test]
    fn test_cleanup_evicts_by_atime_until_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());

        // sizes {100, 200, 300} with atimes {3, 1, 2}, budget 250
        let files = [(1u8, 100u64, 3u64), (2, 200, 1), (3, 300, 2)];
        let mut store = store_with_files(&files, 7);
        for &(seed, size, _) in &files {
            write_cachefile(&cache, seed, size, 7);
        }

        cache.cleanup(&mut store, 250).unwrap();

        // oldest two by atime are gone, the youngest survives
        assert!(!cache.content_path(&file_key(2), 7).exists());
        assert!(!cache.content_path(&file_key(3), 7).exists());
        assert!(cache.content_path(&file_key(1), 7).exists());

        let local = |seed: u8| {
            let id = store.lookup(&file_key(seed)).unwrap();
            store.get(id).unwrap().local_revision
        };
        assert_eq!(local(2), 0);
        assert_eq!(local(3), 0);
        assert_eq!(local(1), 7);
    }

    #[test]
    fn test_cleanup_under_budget_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());

        let files = [(1u8, 100u64, 1u64), (2, 100, 2)];
        let mut store = store_with_files(&files, 7);
        for &(seed, size, _) in &files {
            write_cachefile(&cache, seed, size, 7);
        }

        cache.cleanup(&mut store, 1000).unwrap();

        assert!(cache.content_path(&file_key(1), 7).exists());
        assert!(cache.content_path(&file_key(2), 7).exists());
    }

    #[test]
    fn test_cleanup_atime_ties_break_on_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());

        let files = [(1u8, 100u64, 5u64), (2, 100, 5)];
        let mut store = store_with_files(&files, 7);
        for &(seed, size, _) in &files {
            write_cachefile(&cache, seed, size, 7);
        }

        cache.cleanup(&mut store, 100).unwrap();

        // file_key(1) < file_key(2) lexicographically, so it goes first
        assert!(!cache.content_path(&file_key(1), 7).exists());
        assert!(cache.content_path(&file_key(2), 7).exists());
    }

    #[test]
    fn test_cleanup_removes_stale_and_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());

        // the entry moved on to revision 7 remotely, but only revision 6 was
        // ever cached
        let mut store = store_with_files(&[(1, 100, 1)], 7);
        {
            let id = store.lookup(&file_key(1)).unwrap();
            store.get_mut(id).unwrap().local_revision = 6;
        }
        write_cachefile(&cache, 1, 100, 6);
        // a key the tree does not know
        write_cachefile(&cache, 9, 50, 3);
        // a foreign file that must survive untouched
        fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        cache.cleanup(&mut store, u64::MAX).unwrap();

        assert!(!cache.content_path(&file_key(1), 6).exists());
        assert!(!cache.content_path(&file_key(9), 3).exists());
        assert!(dir.path().join("notes.txt").exists());
        let id = store.lookup(&file_key(1)).unwrap();
        assert_eq!(store.get(id).unwrap().local_revision, 0);
    }

    #[test]
    fn test_cleanup_removes_corrupt_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());

        let mut store = store_with_files(&[(1, 100, 1)], 7);
        fs::write(cache.content_path(&file_key(1), 7), vec![b'!'; 100]).unwrap();

        cache.cleanup(&mut store, u64::MAX).unwrap();

        assert!(!cache.content_path(&file_key(1), 7).exists());
        let id = store.lookup(&file_key(1)).unwrap();
        assert_eq!(store.get(id).unwrap().local_revision, 0);
    }
}
