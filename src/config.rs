use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const APP_ID: &str = "maritime.endorser";
const DATABASE_FILE: &str = "endorser.db";

#[cfg(test)]
pub fn test_env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Where the store lives and where exported documents are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorserConfig {
    pub database_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Partial config as sent by the shell; unset fields keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverrides {
    pub database_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl EndorserConfig {
    /// Defaults probed from the environment. `ENDORSER_DB_PATH` and
    /// `ENDORSER_OUTPUT_DIR` win over the probed directories.
    pub fn from_env() -> Self {
        let database_path = std::env::var("ENDORSER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| preferred_data_dir().join(DATABASE_FILE));
        let output_dir = std::env::var("ENDORSER_OUTPUT_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(downloads_dir)
            .unwrap_or_else(preferred_temp_dir);
        Self {
            database_path,
            output_dir,
        }
    }

    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(path) = overrides.database_path {
            self.database_path = path;
        }
        if let Some(dir) = overrides.output_dir {
            self.output_dir = dir;
        }
        self
    }
}

fn first_existing_dir(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|dir| {
        std::fs::metadata(dir)
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    })
}

pub fn preferred_data_dir() -> PathBuf {
    let candidates = vec![
        PathBuf::from(format!("/data/user/0/{APP_ID}/files")),
        PathBuf::from(format!("/data/data/{APP_ID}/files")),
    ];
    first_existing_dir(candidates).unwrap_or_else(preferred_temp_dir)
}

pub fn preferred_temp_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(custom) = std::env::var("ENDORSER_TEMP_DIR") {
        candidates.push(PathBuf::from(custom));
    }
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(tmpdir));
    }
    candidates.push(PathBuf::from(format!("/data/user/0/{APP_ID}/cache")));
    candidates.push(PathBuf::from(format!("/data/data/{APP_ID}/cache")));
    first_existing_dir(candidates).unwrap_or_else(std::env::temp_dir)
}

pub fn downloads_dir() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(root) = std::env::var("EXTERNAL_STORAGE") {
        candidates.push(PathBuf::from(root).join("Download"));
    }
    candidates.push(PathBuf::from("/storage/emulated/0/Download"));
    candidates.push(PathBuf::from("/sdcard/Download"));
    first_existing_dir(candidates)
}
