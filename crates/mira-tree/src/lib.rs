pub mod render;
pub mod snapshot;
pub mod store;

pub use render::{render_json, render_tree};
pub use snapshot::{
    load_snapshot, read_snapshot_file, store_snapshot, write_snapshot_file, SnapshotError,
};
pub use store::{Entry, EntryId, EntryKind, EntryStore};
