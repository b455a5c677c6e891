pub mod vfs;

pub use vfs::{Attrs, SharedVfs, Vfs, VfsStats, DEFAULT_CACHE_BUDGET};
