//! The remote capability consumed by the core.
//!
//! The HTTP/JSON transport, request signing and token refresh live in a
//! collaborator crate; the core only sees this trait and its descriptor
//! types. All operations may block on network I/O for up to the transport's
//! configured connect timeout.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::RemoteResult;

/// Remote view of a folder.
///
/// An empty `parent_key` means the folder sits directly under the root; the
/// root itself is described with empty `key` and `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderDescriptor {
    pub key: String,
    pub name: String,
    pub parent_key: String,
    pub revision: u64,
    pub created: u64,
}

/// Remote view of a file. `hash` is the hex-encoded SHA-256 of the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub key: String,
    pub name: String,
    pub parent_key: String,
    pub revision: u64,
    pub created: u64,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    FolderUpdated,
    FileUpdated,
    FolderDeleted,
    FileDeleted,
}

/// One element of the device change stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub key: String,
    pub parent: String,
    pub revision: u64,
}

/// The ordered change stream between two device revisions.
///
/// `revision` is the terminator: the device revision after the last change in
/// the batch has been applied. A batch with no changes still carries the
/// current device revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageQuota {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Handle for a pending upload, polled until the remote has consumed it.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub upload_key: String,
}

#[derive(Debug, Clone)]
pub enum UploadStatus {
    InProgress,
    Done { revision: u64 },
    Failed(String),
}

/// The nine remote operations the core consumes.
pub trait RemoteClient {
    /// Current device revision.
    fn device_status(&self) -> RemoteResult<u64>;

    /// Changes after `since`, ordered by ascending revision.
    fn device_changes(&self, since: u64) -> RemoteResult<ChangeBatch>;

    /// Folder metadata; `None` asks for the root.
    fn folder_info(&self, key: Option<&str>) -> RemoteResult<FolderDescriptor>;

    /// File metadata.
    fn file_info(&self, key: &str) -> RemoteResult<FileDescriptor>;

    /// Direct children of a folder. The empty key lists the root.
    fn folder_content(
        &self,
        key: &str,
    ) -> RemoteResult<(Vec<FolderDescriptor>, Vec<FileDescriptor>)>;

    /// Stream the content of a file into `dest`; returns bytes written.
    fn file_download(&self, key: &str, dest: &mut dyn Write) -> RemoteResult<u64>;

    /// Upload a locally modified file with delta semantics against the
    /// revision the local copy was based on.
    fn file_upload_patch(
        &self,
        key: &str,
        base_revision: u64,
        source: &mut dyn Read,
        size: u64,
    ) -> RemoteResult<UploadTicket>;

    /// Poll a pending upload.
    fn upload_poll(&self, ticket: &UploadTicket) -> RemoteResult<UploadStatus>;

    /// Account storage totals, used to synthesize statvfs output.
    fn storage_quota(&self) -> RemoteResult<StorageQuota>;
}
