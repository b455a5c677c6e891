use log::warn;
use mira_core::key::{bucket_of, is_file_key, is_folder_key, MAX_NAME_LEN, NUM_BUCKETS};
use mira_core::remote::{FileDescriptor, FolderDescriptor};

/// Stable handle to an entry in the store.
///
/// Slots are reused only after an explicit `remove`, so an id held by a
/// parent or child link stays valid for as long as the entry it names lives.
/// This is the arena-index rendition of the pointer-stable heap nodes the
/// on-wire protocol assumes: moving an entry to a new parent rebinds links
/// without reallocating, so every outstanding id survives the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl EntryId {
    /// The synthetic root. Always present, never removed.
    pub const ROOT: EntryId = EntryId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn from_index(index: usize) -> EntryId {
        EntryId(index as u32)
    }
}

/// Folder/file payload of an entry.
///
/// The discriminator is explicit here; on disk it is carried by the atime
/// field (zero iff folder). A file that has never been opened has an atime
/// of 1, so zero stays unambiguous.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    Folder { children: Vec<EntryId> },
    File { hash: [u8; 32], size: u64, atime: u64 },
}

/// One mirrored file or folder.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Opaque remote key; 13 chars for folders, 15 for files, empty for root.
    pub key: String,
    pub name: String,
    /// Owning folder; `None` only for the root.
    pub parent: Option<EntryId>,
    /// Last revision at which the remote reported this entry.
    pub remote_revision: u64,
    /// Last revision whose contents have been pulled (folders) or whose
    /// payload has been materialized in the file cache (files; 0 = none).
    pub local_revision: u64,
    pub ctime: u64,
    pub kind: EntryKind,
}

impl Entry {
    fn new_folder(key: &str) -> Entry {
        Entry {
            key: key.to_string(),
            name: String::new(),
            parent: None,
            remote_revision: 0,
            local_revision: 0,
            ctime: 0,
            kind: EntryKind::Folder { children: Vec::new() },
        }
    }

    fn new_file(key: &str) -> Entry {
        Entry {
            key: key.to_string(),
            name: String::new(),
            parent: None,
            remote_revision: 0,
            local_revision: 0,
            ctime: 0,
            kind: EntryKind::File { hash: [0; 32], size: 0, atime: 1 },
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntryKind::Folder { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    /// Children of a folder; empty for files.
    pub fn children(&self) -> &[EntryId] {
        match &self.kind {
            EntryKind::Folder { children } => children,
            EntryKind::File { .. } => &[],
        }
    }

    pub fn num_children(&self) -> u64 {
        self.children().len() as u64
    }

    /// Last access time of a file; `None` for folders.
    pub fn file_atime(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File { atime, .. } => Some(atime),
            EntryKind::Folder { .. } => None,
        }
    }

    pub fn file_size(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File { size, .. } => Some(size),
            EntryKind::Folder { .. } => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<EntryId>> {
        match &mut self.kind {
            EntryKind::Folder { children } => Some(children),
            EntryKind::File { .. } => None,
        }
    }
}

/// Hashed table of entries plus the root.
///
/// The store owns every entry; parent and child links are plain `EntryId`s
/// whose lifetime is bounded by the store. Keys are globally unique and each
/// bucketed entry sits in the bucket its first three characters decode to.
/// Buckets are expected to stay small (46656 of them), so lookup is a linear
/// scan of one bucket.
pub struct EntryStore {
    /// Device revision of the last fully applied change stream.
    pub revision: u64,
    pub(crate) slots: Vec<Option<Entry>>,
    free: Vec<u32>,
    pub(crate) buckets: Vec<Vec<EntryId>>,
}

impl EntryStore {
    pub fn new() -> EntryStore {
        EntryStore {
            revision: 0,
            slots: vec![Some(Entry::new_folder(""))],
            free: Vec::new(),
            buckets: vec![Vec::new(); NUM_BUCKETS],
        }
    }

    pub fn root(&self) -> EntryId {
        EntryId::ROOT
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Number of live entries including the root.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the entry for `key`; the empty key names the root.
    pub fn lookup(&self, key: &str) -> Option<EntryId> {
        if key.is_empty() {
            return Some(EntryId::ROOT);
        }
        let bucket = bucket_of(key)?;
        self.buckets[bucket]
            .iter()
            .copied()
            .find(|&id| self.get(id).map(|e| e.key.as_str()) == Some(key))
    }

    /// True if `child` appears in `parent`'s child list.
    ///
    /// Compares ids, not keys; this relies on keys being globally unique. It
    /// deliberately ignores the child's own parent link so that housekeeping
    /// can cross-check the two directions independently.
    pub fn is_parent_of(&self, parent: EntryId, child: EntryId) -> bool {
        self.get(parent).map(|p| p.children().contains(&child)).unwrap_or(false)
    }

    // ========================================================================
    // Allocation & Rebinding
    // ========================================================================

    /// Get or create the entry for `key` and hang it under `new_parent`.
    ///
    /// An existing entry keeps its slot: it is detached from its old parent's
    /// child list and appended to the new one (a no-op if already there), so
    /// ids held elsewhere stay valid across the move. A fresh entry is
    /// allocated with the kind its key shape implies, inserted into its
    /// bucket and appended to `new_parent`'s children. The caller fills the
    /// remaining fields.
    pub fn allocate_or_rebind(&mut self, key: &str, new_parent: EntryId) -> Option<EntryId> {
        if let Some(id) = self.lookup(key) {
            if id == EntryId::ROOT {
                warn!("refusing to rebind the root under {:?}", new_parent);
                return None;
            }
            self.detach_from_parent(id);
            self.attach_to_parent(id, new_parent)?;
            return Some(id);
        }

        let bucket = match bucket_of(key) {
            Some(b) => b,
            None => {
                warn!("cannot allocate entry for malformed key {:?}", key);
                return None;
            }
        };

        let entry = if is_file_key(key) {
            Entry::new_file(key)
        } else {
            Entry::new_folder(key)
        };

        let id = match self.free.pop() {
            Some(slot) => {
                let id = EntryId(slot);
                self.slots[id.index()] = Some(entry);
                id
            }
            None => {
                let id = EntryId::from_index(self.slots.len());
                self.slots.push(Some(entry));
                id
            }
        };

        self.buckets[bucket].push(id);
        self.attach_to_parent(id, new_parent)?;
        Some(id)
    }

    /// Remove `id` from its current parent's child list, if it has one.
    fn detach_from_parent(&mut self, id: EntryId) {
        let Some(parent) = self.get(id).and_then(|e| e.parent) else {
            return;
        };
        if let Some(children) = self.get_mut(parent).and_then(|p| p.children_mut()) {
            children.retain(|&c| c != id);
        }
    }

    /// Append `id` to `new_parent`'s children (idempotent) and point its
    /// parent link there.
    fn attach_to_parent(&mut self, id: EntryId, new_parent: EntryId) -> Option<()> {
        match self.get_mut(new_parent).and_then(|p| p.children_mut()) {
            Some(children) => {
                if !children.contains(&id) {
                    children.push(id);
                }
            }
            None => {
                warn!("new parent {:?} is not a folder", new_parent);
                return None;
            }
        }
        self.get_mut(id)?.parent = Some(new_parent);
        Some(())
    }

    // ========================================================================
    // Upserts from remote descriptors
    // ========================================================================

    /// Insert or update a file entry from a remote descriptor.
    ///
    /// A pre-existing entry keeps its `local_revision` (the cached payload
    /// does not regress just because the entry moved) and its access time.
    pub fn upsert_file(&mut self, desc: &FileDescriptor, parent: EntryId) -> Option<EntryId> {
        let old = self
            .lookup(&desc.key)
            .and_then(|id| self.get(id))
            .map(|e| (e.local_revision, e.file_atime().unwrap_or(1)));

        let id = self.allocate_or_rebind(&desc.key, parent)?;
        let mut hash = [0u8; 32];
        match hex::decode(&desc.hash) {
            Ok(bytes) if bytes.len() == 32 => hash.copy_from_slice(&bytes),
            _ => warn!("file {} carries a malformed content hash", desc.key),
        }

        let (local_revision, atime) = old.unwrap_or((0, 1));
        let entry = self.get_mut(id)?;
        entry.name = clamp_name(&desc.name);
        entry.remote_revision = desc.revision;
        entry.local_revision = local_revision;
        entry.ctime = desc.created;
        entry.kind = EntryKind::File { hash, size: desc.size, atime: atime.max(1) };
        Some(id)
    }

    /// Insert or update a folder entry from a remote descriptor.
    ///
    /// A pre-existing folder keeps its children and its `local_revision`;
    /// only the scalar fields are refreshed. Content is pulled separately
    /// once the revision gap is observed.
    pub fn upsert_folder(&mut self, desc: &FolderDescriptor, parent: EntryId) -> Option<EntryId> {
        let id = self.allocate_or_rebind(&desc.key, parent)?;
        let entry = self.get_mut(id)?;
        entry.name = clamp_name(&desc.name);
        entry.remote_revision = desc.revision;
        entry.ctime = desc.created;
        if entry.is_file() {
            warn!("key {} changed shape from file to folder", desc.key);
            entry.kind = EntryKind::Folder { children: Vec::new() };
            entry.local_revision = 0;
        }
        Some(id)
    }

    /// Refresh the root's own fields from its remote descriptor.
    pub fn set_root_info(&mut self, desc: &FolderDescriptor) {
        if let Some(root) = self.get_mut(EntryId::ROOT) {
            root.name = clamp_name(&desc.name);
            root.remote_revision = desc.revision;
            root.ctime = desc.created;
        }
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove the entry for `key` and, recursively, every child that still
    /// references it as parent.
    ///
    /// Children that have already been rebound elsewhere are left alone; the
    /// guard matters because a folder's child list can briefly contain
    /// entries whose parent link moved on during reconciliation. Removing a
    /// non-existent key is a no-op with a warning.
    pub fn remove(&mut self, key: &str) {
        if key.is_empty() {
            warn!("cannot remove the root");
            return;
        }
        let Some(id) = self.lookup(key) else {
            warn!("key {} was not found, removing nothing", key);
            return;
        };

        // take it out of its bucket first so recursive removals of children
        // can no longer resolve this key
        if let Some(bucket) = bucket_of(key) {
            self.buckets[bucket].retain(|&b| b != id);
        }

        let child_keys: Vec<String> = self
            .get(id)
            .map(|e| {
                e.children()
                    .iter()
                    .filter_map(|&c| self.get(c))
                    .filter(|c| c.parent == Some(id))
                    .map(|c| c.key.clone())
                    .collect()
            })
            .unwrap_or_default();

        for child_key in child_keys {
            self.remove(&child_key);
        }

        self.detach_from_parent(id);

        self.slots[id.index()] = None;
        self.free.push(id.index() as u32);
    }

    /// Drop a folder's child list without freeing the entries it names.
    ///
    /// The children keep their parent links; whoever calls this is expected
    /// to repopulate the list (folder refresh) and to leave strays for
    /// housekeeping.
    pub fn clear_children(&mut self, id: EntryId) {
        if let Some(children) = self.get_mut(id).and_then(|e| e.children_mut()) {
            children.clear();
        }
    }

    /// Drop every entry except the root (whose children are cleared) in
    /// preparation for a full rebuild. The device revision is left for the
    /// caller to reseed.
    pub fn clear(&mut self) {
        self.slots.truncate(1);
        if let Some(root) = self.get_mut(EntryId::ROOT) {
            root.kind = EntryKind::Folder { children: Vec::new() };
        }
        self.free.clear();
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Append a decoded entry without touching buckets or parent links; the
    /// snapshot loader wires those up in its second pass.
    pub(crate) fn push_decoded(&mut self, entry: Entry) -> EntryId {
        let id = EntryId::from_index(self.slots.len());
        self.slots.push(Some(entry));
        id
    }

    pub(crate) fn insert_into_bucket(&mut self, bucket: usize, id: EntryId) {
        self.buckets[bucket].push(id);
    }

    /// Point a decoded entry at its parent and register it as a child. The
    /// loader guarantees both ids are live; a non-folder parent means the
    /// snapshot is lying about its structure.
    pub(crate) fn rebind_decoded(&mut self, id: EntryId, parent: EntryId) -> Result<(), String> {
        let key = self.get(id).map(|e| e.key.clone()).unwrap_or_default();
        match self.get_mut(parent).and_then(|p| p.children_mut()) {
            Some(children) => children.push(id),
            None => return Err(format!("parent of {} is not a folder", key)),
        }
        if let Some(entry) = self.get_mut(id) {
            entry.parent = Some(parent);
        }
        Ok(())
    }

    pub(crate) fn slot_upper_bound(&self) -> usize {
        self.slots.len()
    }

    // ========================================================================
    // Iteration & Auditing
    // ========================================================================

    /// Ids of all bucketed entries in bucket-scan order (bucket 0..46655,
    /// each in stored order). The root is not included.
    pub fn bucket_scan_ids(&self) -> Vec<EntryId> {
        self.buckets.iter().flatten().copied().collect()
    }

    /// Audit the structural invariants; returns a description of every
    /// violation found. Used by tests and the offline inspector.
    pub fn verify(&self) -> Vec<String> {
        let mut violations = Vec::new();
        let mut live = 0usize;

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(entry) = slot else { continue };
            live += 1;
            let id = EntryId::from_index(index);

            if id != EntryId::ROOT {
                match entry.parent {
                    None => violations.push(format!("{} has no parent", entry.key)),
                    Some(parent) => match self.get(parent) {
                        None => violations.push(format!("{} has a dangling parent", entry.key)),
                        Some(_) => {
                            let occurrences = self
                                .get(parent)
                                .map(|p| p.children().iter().filter(|&&c| c == id).count())
                                .unwrap_or(0);
                            if occurrences != 1 {
                                violations.push(format!(
                                    "{} appears {} times in its parent's children",
                                    entry.key, occurrences
                                ));
                            }
                        }
                    },
                }

                match bucket_of(&entry.key) {
                    Some(bucket) if self.buckets[bucket].contains(&id) => {}
                    Some(_) => violations.push(format!("{} is not in its bucket", entry.key)),
                    None => violations.push(format!("{} has a malformed key", entry.key)),
                }

                if self.lookup(&entry.key) != Some(id) {
                    violations.push(format!("lookup({}) does not resolve to it", entry.key));
                }

                let shape_ok = match entry.kind {
                    EntryKind::Folder { .. } => is_folder_key(&entry.key),
                    EntryKind::File { .. } => is_file_key(&entry.key),
                };
                if !shape_ok {
                    violations.push(format!("{} has a key of the wrong shape", entry.key));
                }
            }

            for &child in entry.children() {
                if self.get(child).map(|c| c.parent) != Some(Some(id)) {
                    violations.push(format!(
                        "{} lists a child that does not point back",
                        entry.key
                    ));
                }
            }

            if let Some(0) = entry.file_atime() {
                violations.push(format!("file {} has a zero atime", entry.key));
            }
        }

        let bucketed: usize = self.buckets.iter().map(Vec::len).sum();
        if bucketed + 1 != live {
            violations.push(format!(
                "{} live entries but {} bucketed plus root",
                live, bucketed
            ));
        }

        violations
    }
}

impl Default for EntryStore {
    fn default() -> Self {
        EntryStore::new()
    }
}

/// Clamp a display name to the 255-byte limit on a char boundary.
fn clamp_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    warn!("truncating overlong name ({} bytes)", name.len());
    name[..end].to_string()
}
