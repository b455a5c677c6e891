//! Reconciliation between the local mirror and the remote.
//!
//! The remote numbers every mutation with a device-wide revision counter and
//! can replay the ordered change stream between any past revision and now.
//! `update` applies that stream; `refresh_folder` pulls one folder's true
//! content on demand; `housekeep` repairs the two link directions against
//! each other; `rebuild` starts over from nothing.

use log::{debug, info, warn};

use mira_core::error::RemoteResult;
use mira_core::remote::{ChangeKind, RemoteClient};
use mira_tree::{EntryId, EntryStore};

/// Remote key of the trash folder. Trashed entries are invisible to the
/// mirror; changes about them are dropped on the floor.
const TRASH_KEY: &str = "trash";

/// Ask the remote for changes after the locally stored revision and
/// integrate them.
///
/// `expect_changes` skips the `device_status` probe for callers that already
/// know the remote moved (e.g. right after an upload).
///
/// Changes are applied strictly in revision order. If fetching the stream
/// itself fails the update aborts and the store's revision stays put, so the
/// next attempt retries the same suffix. A failed metadata fetch for a
/// single key removes that key locally and the stream continues: the benign
/// reading of such a failure is that the entry vanished remotely, and if
/// that was wrong the next root refresh or housekeeping pass restores it.
///
/// The root never appears in the change stream, so after the stream is
/// applied its direct children are refreshed from a listing. That listing is
/// merged additively; entries that have silently disappeared remotely (e.g.
/// purged from the trash, which the change stream does not report) are left
/// to housekeeping.
pub fn update(
    store: &mut EntryStore,
    remote: &dyn RemoteClient,
    expect_changes: bool,
) -> RemoteResult<()> {
    if !expect_changes {
        let revision_remote = remote.device_status()?;
        if store.revision == revision_remote {
            debug!("request to update but nothing to do");
            return Ok(());
        }
    }

    let batch = remote.device_changes(store.revision)?;
    info!(
        "applying {} changes from revision {} to {}",
        batch.changes.len(),
        store.revision,
        batch.revision
    );

    for change in &batch.changes {
        // trash is not part of the visible tree; judge each change only by
        // its own key and parent, not by any earlier change for the same key
        if change.key == TRASH_KEY || change.parent == TRASH_KEY {
            continue;
        }

        match change.kind {
            ChangeKind::FolderDeleted | ChangeKind::FileDeleted => {
                store.remove(&change.key);
            }
            ChangeKind::FolderUpdated => {
                if already_current(store, &change.key, change.revision) {
                    continue;
                }
                update_folder_info(store, remote, &change.key);
            }
            ChangeKind::FileUpdated => {
                if already_current(store, &change.key, change.revision) {
                    continue;
                }
                update_file_info(store, remote, &change.key);
            }
        }
    }

    match remote.folder_content("") {
        Ok((folders, files)) => {
            for desc in &folders {
                store.upsert_folder(desc, EntryId::ROOT);
            }
            for desc in &files {
                store.upsert_file(desc, EntryId::ROOT);
            }
        }
        Err(err) => warn!("refreshing root children failed: {}", err),
    }

    store.revision = batch.revision;

    housekeep(store, remote);

    Ok(())
}

/// True if the local entry already reflects this change's revision.
fn already_current(store: &EntryStore, key: &str, revision: u64) -> bool {
    store
        .lookup(key)
        .and_then(|id| store.get(id))
        .map(|entry| entry.remote_revision >= revision)
        .unwrap_or(false)
}

/// Replace a folder's children with the remote's listing.
///
/// The listing is fetched before anything is discarded, so a failed call
/// leaves the existing children in place and reports the error. On success
/// the old child list is dropped (the entries themselves are not freed:
/// whatever does not reappear in the listing is either still referenced from
/// elsewhere or gets swept by housekeeping) and every listed descriptor is
/// upserted under this folder.
pub fn refresh_folder(
    store: &mut EntryStore,
    remote: &dyn RemoteClient,
    id: EntryId,
) -> RemoteResult<()> {
    let key = match store.get(id) {
        Some(entry) if entry.is_folder() => entry.key.clone(),
        Some(entry) => {
            warn!("refusing to refresh file {} as a folder", entry.key);
            return Ok(());
        }
        None => return Ok(()),
    };

    let (folders, files) = remote.folder_content(&key)?;

    store.clear_children(id);
    for desc in &folders {
        store.upsert_folder(desc, id);
    }
    for desc in &files {
        store.upsert_file(desc, id);
    }

    if let Some(entry) = store.get_mut(id) {
        entry.local_revision = entry.remote_revision;
    }

    Ok(())
}

/// Pull a file's metadata and upsert it, materializing missing ancestors
/// first.
///
/// A failed fetch is read as "the file vanished remotely" and removes the
/// key locally; the change stream does not distinguish a transient error
/// from a purge here, and a wrongly removed entry comes back with the next
/// listing that mentions it.
fn update_file_info(store: &mut EntryStore, remote: &dyn RemoteClient, key: &str) {
    let desc = match remote.file_info(key) {
        Ok(desc) => desc,
        Err(err) => {
            warn!("file/get_info for {} failed ({}); removing locally", key, err);
            store.remove(key);
            return;
        }
    };

    let Some(parent) = materialize_parent(store, remote, &desc.parent_key, key) else {
        warn!("parent {} of file {} could not be materialized", desc.parent_key, key);
        return;
    };

    store.upsert_file(&desc, parent);
}

/// Folder counterpart of `update_file_info`. Recurses towards the root so a
/// change deep in an unseen subtree never leaves a dangling parent link; the
/// recursion terminates because the root always exists.
fn update_folder_info(store: &mut EntryStore, remote: &dyn RemoteClient, key: &str) {
    if key == TRASH_KEY {
        warn!("cannot get folder info of trash");
        return;
    }

    let desc = match remote.folder_info(Some(key)) {
        Ok(desc) => desc,
        Err(err) => {
            warn!("folder/get_info for {} failed ({}); removing locally", key, err);
            store.remove(key);
            return;
        }
    };

    let Some(parent) = materialize_parent(store, remote, &desc.parent_key, key) else {
        warn!("parent {} of folder {} could not be materialized", desc.parent_key, key);
        return;
    };

    store.upsert_folder(&desc, parent);
}

/// Resolve a parent key, fetching the parent chain if it is not local yet.
fn materialize_parent(
    store: &mut EntryStore,
    remote: &dyn RemoteClient,
    parent_key: &str,
    child_key: &str,
) -> Option<EntryId> {
    if let Some(id) = store.lookup(parent_key) {
        return Some(id);
    }
    debug!("the parent of {} does not exist yet - retrieve it", child_key);
    update_folder_info(store, remote, parent_key);
    store.lookup(parent_key)
}

/// Structural audit and repair.
///
/// Two passes over the whole store:
///
/// 1. For every folder, verify each listed child points back at it. A
///    mismatch means the child moved without this folder hearing about it,
///    so the folder's true content is refetched.
/// 2. For every entry, verify its parent lists it. A mismatch usually means
///    the entry was purged remotely without ever appearing in a change
///    stream; refetching its metadata either re-attaches it to its real
///    parent or removes it.
///
/// Both passes are bounded by the store size at entry; a folder refresh can
/// introduce new entries, but only with consistent back-references.
pub fn housekeep(store: &mut EntryStore, remote: &dyn RemoteClient) {
    let mut folders = vec![EntryId::ROOT];
    folders.extend(
        store
            .bucket_scan_ids()
            .into_iter()
            .filter(|&id| store.get(id).map(|e| e.is_folder()).unwrap_or(false)),
    );

    for id in folders {
        let Some(entry) = store.get(id) else { continue };
        let disowned = entry
            .children()
            .iter()
            .any(|&child| store.get(child).map(|c| c.parent) != Some(Some(id)));
        if disowned {
            warn!(
                "folder {} lists a child that does not point back; refetching its content",
                entry.key
            );
            if let Err(err) = refresh_folder(store, remote, id) {
                warn!("housekeeping refresh failed: {}", err);
            }
        }
    }

    for id in store.bucket_scan_ids() {
        let Some(entry) = store.get(id) else { continue };
        let Some(parent) = entry.parent else { continue };
        if store.is_parent_of(parent, id) {
            continue;
        }
        warn!("{} claims a parent that does not list it", entry.key);
        let key = entry.key.clone();
        if entry.is_folder() {
            update_folder_info(store, remote, &key);
        } else {
            update_file_info(store, remote, &key);
        }
    }
}

/// Rebuild the mirror by walking the remote.
///
/// Used on first start and whenever the snapshot is unusable. Only the root
/// level is listed eagerly; deeper folders keep `local_revision = 0` and are
/// filled in lazily by path resolution. A final `update` catches anything
/// that changed remotely while the walk ran.
pub fn rebuild(store: &mut EntryStore, remote: &dyn RemoteClient) -> RemoteResult<()> {
    store.clear();

    let revision_before = remote.device_status()?;
    store.revision = revision_before;

    let root_desc = remote.folder_info(None)?;
    store.set_root_info(&root_desc);

    refresh_folder(store, remote, EntryId::ROOT)?;

    update(store, remote, false)
}
