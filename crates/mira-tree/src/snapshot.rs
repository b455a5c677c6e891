//! Binary snapshot of the entry store.
//!
//! Persistent storage file layout:
//!
//! ```text
//! byte 0: 0x4D -> ASCII M
//! byte 1: 0x46 -> ASCII F
//! byte 2: 0x53 -> ASCII S
//! byte 3: 0x00 -> version information
//! bytes 4-11   -> last seen device revision (u64 LE)
//! bytes 12-19  -> number of entry records including root (u64 LE)
//! bytes 20...  -> fixed-size entry records, the first one being root
//! ```
//!
//! Each record is 360 bytes, little-endian, field order pinned, no padding:
//!
//! ```text
//! key[16]            NUL-padded ASCII
//! name[256]          NUL-padded UTF-8
//! remote_revision    u64
//! local_revision     u64
//! ctime              u64
//! parent_offset      u64  (index of the parent's record; root is 0)
//! num_children       u64  (always written as 0, rebuilt on load)
//! hash[32]
//! atime              u64  (0 iff folder)
//! size               u64
//! ```
//!
//! Child lists and bucket membership are not stored; the loader rebuilds
//! both from the parent offsets in a second pass.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::{debug, warn};
use thiserror::Error;

use mira_core::key::bucket_of;

use crate::store::{Entry, EntryId, EntryKind, EntryStore};

pub const MAGIC: [u8; 3] = *b"MFS";
pub const VERSION: u8 = 0;

const KEY_FIELD: usize = 16;
const NAME_FIELD: usize = 256;

/// Size of one entry record on disk: the two string fields, seven u64
/// scalars and the 32-byte digest.
pub const RECORD_LEN: usize = KEY_FIELD + NAME_FIELD + 7 * 8 + 32;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated snapshot")]
    Truncated,

    #[error("malformed snapshot: {0}")]
    Format(String),
}

impl SnapshotError {
    /// True when the file is unusable and the caller should fall back to a
    /// full rebuild rather than retry the load.
    pub fn is_corrupt(&self) -> bool {
        !matches!(self, SnapshotError::Io(_))
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize the store. Records go out root-first, then in bucket-scan
/// order; in-memory parent ids are converted to record offsets through a
/// side table so nothing in the store is touched.
pub fn store_snapshot(store: &EntryStore, stream: &mut dyn Write) -> Result<(), SnapshotError> {
    let ordered = store.bucket_scan_ids();

    // record offset of every entry: root is 0, the rest follow scan order
    let mut offset_of = vec![u64::MAX; store.slot_upper_bound()];
    offset_of[EntryId::ROOT.index()] = 0;
    for (position, id) in ordered.iter().enumerate() {
        offset_of[id.index()] = position as u64 + 1;
    }

    stream.write_all(&MAGIC)?;
    stream.write_all(&[VERSION])?;
    stream.write_all(&store.revision.to_le_bytes())?;
    stream.write_all(&(ordered.len() as u64 + 1).to_le_bytes())?;

    let root = store
        .get(EntryId::ROOT)
        .ok_or_else(|| SnapshotError::Format("store has no root".into()))?;
    write_record(stream, root, 0)?;

    for id in ordered {
        let entry = store
            .get(id)
            .ok_or_else(|| SnapshotError::Format("bucket references a freed slot".into()))?;
        let parent = entry
            .parent
            .ok_or_else(|| SnapshotError::Format(format!("{} has no parent", entry.key)))?;
        let parent_offset = offset_of[parent.index()];
        if parent_offset == u64::MAX {
            return Err(SnapshotError::Format(format!(
                "parent of {} was not found",
                entry.key
            )));
        }
        write_record(stream, entry, parent_offset)?;
    }

    Ok(())
}

fn write_record(
    stream: &mut dyn Write,
    entry: &Entry,
    parent_offset: u64,
) -> Result<(), SnapshotError> {
    let mut record = [0u8; RECORD_LEN];
    let mut at = 0usize;

    let key = entry.key.as_bytes();
    record[at..at + key.len().min(KEY_FIELD)].copy_from_slice(&key[..key.len().min(KEY_FIELD)]);
    at += KEY_FIELD;

    let name = entry.name.as_bytes();
    record[at..at + name.len().min(NAME_FIELD)]
        .copy_from_slice(&name[..name.len().min(NAME_FIELD)]);
    at += NAME_FIELD;

    for value in [
        entry.remote_revision,
        entry.local_revision,
        entry.ctime,
        parent_offset,
        0u64, // num_children, rebuilt on load
    ] {
        record[at..at + 8].copy_from_slice(&value.to_le_bytes());
        at += 8;
    }

    let (hash, atime, size) = match &entry.kind {
        EntryKind::Folder { .. } => (&[0u8; 32], 0u64, 0u64),
        EntryKind::File { hash, size, atime } => (hash, (*atime).max(1), *size),
    };
    record[at..at + 32].copy_from_slice(hash);
    at += 32;
    record[at..at + 8].copy_from_slice(&atime.to_le_bytes());
    at += 8;
    record[at..at + 8].copy_from_slice(&size.to_le_bytes());

    stream.write_all(&record)?;
    Ok(())
}

// ============================================================================
// Decoding
// ============================================================================

struct RawRecord {
    key: String,
    name: String,
    remote_revision: u64,
    local_revision: u64,
    ctime: u64,
    parent_offset: u64,
    hash: [u8; 32],
    atime: u64,
    size: u64,
}

/// Deserialize a snapshot into a fresh store.
///
/// First pass reads all records into entries with empty child lists; the
/// second pass rebinds each non-root entry to the entry at its stored parent
/// offset, appends it to that parent's children and inserts it into its
/// bucket. A record whose parent offset points at itself or past the record
/// count is a format error, not a repairable condition.
pub fn load_snapshot(stream: &mut dyn Read) -> Result<EntryStore, SnapshotError> {
    let mut header = [0u8; 4];
    read_or_truncated(stream, &mut header)?;
    if header[..3] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if header[3] != VERSION {
        return Err(SnapshotError::UnsupportedVersion(header[3]));
    }

    let revision = read_u64(stream)?;
    let count = read_u64(stream)?;
    if count == 0 {
        return Err(SnapshotError::Format("missing root record".into()));
    }

    let mut store = EntryStore::new();
    store.revision = revision;

    let root_record = read_record(stream)?;
    if !root_record.key.is_empty() {
        return Err(SnapshotError::Format("root record carries a key".into()));
    }
    if let Some(root) = store.get_mut(EntryId::ROOT) {
        root.name = root_record.name;
        root.remote_revision = root_record.remote_revision;
        root.local_revision = root_record.local_revision;
        root.ctime = root_record.ctime;
        // child list and folder tag are rebuilt below regardless of what the
        // record claimed
        root.kind = EntryKind::Folder { children: Vec::new() };
    }

    let mut records = Vec::with_capacity((count - 1).min(1 << 20) as usize);
    for _ in 1..count {
        records.push(read_record(stream)?);
    }

    // first pass: allocate every entry so offsets map onto ids
    let mut ids = Vec::with_capacity(records.len() + 1);
    ids.push(EntryId::ROOT);
    for record in &records {
        let kind = if record.atime == 0 {
            EntryKind::Folder { children: Vec::new() }
        } else {
            EntryKind::File { hash: record.hash, size: record.size, atime: record.atime }
        };
        let id = store.push_decoded(Entry {
            key: record.key.clone(),
            name: record.name.clone(),
            parent: None,
            remote_revision: record.remote_revision,
            local_revision: record.local_revision,
            ctime: record.ctime,
            kind,
        });
        ids.push(id);
    }

    // second pass: rebind parents, rebuild child lists, fill buckets
    for (position, record) in records.iter().enumerate() {
        let offset = position as u64 + 1;
        if record.parent_offset == offset {
            return Err(SnapshotError::Format(format!(
                "{} is its own parent",
                record.key
            )));
        }
        if record.parent_offset >= count {
            return Err(SnapshotError::Format(format!(
                "parent offset {} of {} is out of range",
                record.parent_offset, record.key
            )));
        }

        let id = ids[offset as usize];
        let parent = ids[record.parent_offset as usize];
        store.rebind_decoded(id, parent).map_err(SnapshotError::Format)?;

        let bucket = bucket_of(&record.key)
            .ok_or_else(|| SnapshotError::Format(format!("malformed key {:?}", record.key)))?;
        store.insert_into_bucket(bucket, id);
    }

    debug!("loaded snapshot: {} entries at revision {}", count, revision);
    Ok(store)
}

fn read_record(stream: &mut dyn Read) -> Result<RawRecord, SnapshotError> {
    let mut record = [0u8; RECORD_LEN];
    read_or_truncated(stream, &mut record)?;
    let mut at = 0usize;

    let key = field_str(&record[at..at + KEY_FIELD])?;
    at += KEY_FIELD;
    let name = field_str(&record[at..at + NAME_FIELD])?;
    at += NAME_FIELD;

    let mut words = [0u64; 5];
    for word in &mut words {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&record[at..at + 8]);
        *word = u64::from_le_bytes(buf);
        at += 8;
    }

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&record[at..at + 32]);
    at += 32;

    let mut buf = [0u8; 8];
    buf.copy_from_slice(&record[at..at + 8]);
    let atime = u64::from_le_bytes(buf);
    at += 8;
    buf.copy_from_slice(&record[at..at + 8]);
    let size = u64::from_le_bytes(buf);

    Ok(RawRecord {
        key,
        name,
        remote_revision: words[0],
        local_revision: words[1],
        ctime: words[2],
        parent_offset: words[3],
        // words[4] is num_children, meaningless when stored
        hash,
        atime,
        size,
    })
}

fn field_str(field: &[u8]) -> Result<String, SnapshotError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| SnapshotError::Format("non-UTF-8 bytes in record".into()))
}

fn read_u64(stream: &mut dyn Read) -> Result<u64, SnapshotError> {
    let mut buf = [0u8; 8];
    read_or_truncated(stream, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_or_truncated(stream: &mut dyn Read, buf: &mut [u8]) -> Result<(), SnapshotError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(SnapshotError::Truncated)
        }
        Err(err) => Err(SnapshotError::Io(err)),
    }
}

// ============================================================================
// File helpers
// ============================================================================

/// Write the snapshot to `path` via a temp file and atomic rename.
pub fn write_snapshot_file(store: &EntryStore, path: &Path) -> Result<(), SnapshotError> {
    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    store_snapshot(store, &mut writer)?;
    writer.flush()?;
    drop(writer);
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Load the snapshot from `path`.
pub fn read_snapshot_file(path: &Path) -> Result<EntryStore, SnapshotError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let store = load_snapshot(&mut reader)?;
    let mut violations = store.verify();
    if !violations.is_empty() {
        warn!("snapshot failed its structural audit: {}", violations[0]);
        return Err(SnapshotError::Format(violations.swap_remove(0)));
    }
    Ok(store)
}
