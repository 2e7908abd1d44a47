pub mod cache;
pub mod catalogue;
pub mod config;
pub mod navigation;
pub mod record;
pub mod rescan;
pub mod search;
pub mod session;
pub mod state;
pub mod store;

/// Default zero-pad width of segmentation ids in extraction filenames.
pub const DEFAULT_SEG_ID_PAD: usize = 5;

/// File name of the classification table inside `out_dir`.
pub const OUTPUT_FILE_NAME: &str = "pyGCG_output.db";

/// Application name for XDG paths
pub const APP_NAME: &str = "gcg";
