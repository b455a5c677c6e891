pub mod reconcile;

pub use reconcile::{housekeep, rebuild, refresh_folder, update};
