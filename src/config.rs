//! Process-wide configuration: where persistent state lives and the few
//! knobs tests need to override (mirrors the teacher's `config.rs` +
//! `config/datastore.rs` file/env resolution, without the schema-macro
//! plumbing the teacher leans on for its own CLI).

use std::path::{Path, PathBuf};

/// Default on-disk part size for [`crate::partstore::DataPart`] (64 KiB).
pub const DEFAULT_PART_DATA_SIZE: usize = 64 * 1024;

pub const ENV_DATA_DIR: &str = "BLOCKCORE_DATA_DIR";

/// Resolved runtime configuration for a [`crate::filestore::Filestore`].
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub part_data_size: usize,
}

impl Config {
    /// Resolve the data directory from (in order) an explicit override, the
    /// `BLOCKCORE_DATA_DIR` environment variable, or an XDG-style default.
    pub fn resolve(data_dir_override: Option<&Path>) -> Self {
        let data_dir = data_dir_override
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var_os(ENV_DATA_DIR).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        Config { data_dir, part_data_size: DEFAULT_PART_DATA_SIZE }
    }

    pub fn with_part_data_size(mut self, size: usize) -> Self {
        self.part_data_size = size;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("filestore.db")
    }
}

fn default_data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/share/blockcore")
    } else {
        PathBuf::from("/var/lib/blockcore")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_explicit_override() {
        let cfg = Config::resolve(Some(Path::new("/tmp/explicit")));
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/explicit"));
        assert_eq!(cfg.part_data_size, DEFAULT_PART_DATA_SIZE);
    }

    #[test]
    fn db_path_is_under_data_dir() {
        let cfg = Config::resolve(Some(Path::new("/tmp/explicit")));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/explicit/db/filestore.db"));
    }
}
