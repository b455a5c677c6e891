pub mod filecache;
pub mod layout;

pub use filecache::{check_integrity, parse_cache_filename, FileCache};
pub use layout::{cache_base_dir, cache_base_dir_custom, CacheLayout};
