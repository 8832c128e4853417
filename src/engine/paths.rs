// Default on-disk locations. Hosts can override every one of these through
// ConnectionConfig or by passing explicit paths to SessionStore::open.

use crate::atoms::constants::{APP_DIR_NAME, DB_FILE_NAME, SESSIONS_DIR_NAME};
use std::path::PathBuf;

/// Per-user data directory, falling back to the working directory when the
/// platform has no notion of one (containers without $HOME).
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Root under which every Working Area is created.
pub fn sessions_root() -> PathBuf {
    data_dir().join(SESSIONS_DIR_NAME)
}

pub fn engine_db_path() -> PathBuf {
    data_dir().join(DB_FILE_NAME)
}
