//! Central path resolution for agentscope data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `AGENTSCOPE_DATA_DIR` env > `~/.agentscope`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

const DIR_NAME: &str = ".agentscope";

/// Initialize the global data directory. Returns the resolved path.
///
/// Falls back to the system temp dir when no home directory exists.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("AGENTSCOPE_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(DIR_NAME)
    };

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

/// Current data directory, or the temp-dir default if `init_data_dir`
/// has not run.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(DIR_NAME))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    std::fs::create_dir_all(log_dir())
}
