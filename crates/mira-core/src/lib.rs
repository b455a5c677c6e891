pub mod cli;
pub mod error;
pub mod key;
pub mod remote;

pub use cli::{parse_args, Args, OutputFormat};
pub use error::{FsError, FsResult, RemoteError, RemoteResult};
pub use key::{bucket_of, NUM_BUCKETS};
pub use remote::{
    Change, ChangeBatch, ChangeKind, FileDescriptor, FolderDescriptor, RemoteClient, StorageQuota,
    UploadStatus, UploadTicket,
};
