//! Engine configuration: built-in defaults, overridable by a TOML file and
//! then environment variables, the same precedence order the CLI uses.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::Strategy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub strategy: Strategy,
    pub wal_cap: usize,
    pub wal_batch_size: usize,
    pub chunk_bytes: usize,
    pub memory_limit: usize,
    pub read_pool_capacity: usize,
    pub drop_pool_capacity: usize,
    pub common_pool_capacity: usize,
    pub readonly: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("chronodb-data"),
            strategy: Strategy::default(),
            wal_cap: 100_000,
            wal_batch_size: 256,
            chunk_bytes: 4096,
            memory_limit: 64 * 1024 * 1024,
            read_pool_capacity: 4,
            drop_pool_capacity: 1,
            common_pool_capacity: 2,
            readonly: false,
        }
    }
}

/// Optional on-disk overrides; any field left `None` falls through to the
/// built-in default (or an already-set value from a higher-precedence
/// source).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigFile {
    pub root: Option<PathBuf>,
    pub wal_cap: Option<usize>,
    pub wal_batch_size: Option<usize>,
    pub chunk_bytes: Option<usize>,
    pub memory_limit: Option<usize>,
    pub read_pool_capacity: Option<usize>,
    pub drop_pool_capacity: Option<usize>,
    pub common_pool_capacity: Option<usize>,
    pub readonly: Option<bool>,
}

impl EngineConfigFile {
    fn apply_to(self, cfg: &mut EngineConfig) {
        if let Some(v) = self.root {
            cfg.root = v;
        }
        if let Some(v) = self.wal_cap {
            cfg.wal_cap = v;
        }
        if let Some(v) = self.wal_batch_size {
            cfg.wal_batch_size = v;
        }
        if let Some(v) = self.chunk_bytes {
            cfg.chunk_bytes = v;
        }
        if let Some(v) = self.memory_limit {
            cfg.memory_limit = v;
        }
        if let Some(v) = self.read_pool_capacity {
            cfg.read_pool_capacity = v;
        }
        if let Some(v) = self.drop_pool_capacity {
            cfg.drop_pool_capacity = v;
        }
        if let Some(v) = self.common_pool_capacity {
            cfg.common_pool_capacity = v;
        }
        if let Some(v) = self.readonly {
            cfg.readonly = v;
        }
    }
}

/// Load config: defaults, then `config_path` (if given) or
/// `./chronodb.toml`, then `CHRONODB_ROOT`/`CHRONODB_READONLY` env vars.
#[must_use]
pub fn load(config_path: Option<&Path>) -> EngineConfig {
    let mut cfg = EngineConfig::default();

    let candidate = config_path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("chronodb.toml"));
    if candidate.exists()
        && let Ok(text) = std::fs::read_to_string(&candidate)
        && let Ok(file_cfg) = toml::from_str::<EngineConfigFile>(&text)
    {
        file_cfg.apply_to(&mut cfg);
    }

    if let Ok(root) = std::env::var("CHRONODB_ROOT") {
        cfg.root = PathBuf::from(root);
    }
    if let Ok(ro) = std::env::var("CHRONODB_READONLY") {
        cfg.readonly = ro == "1" || ro.eq_ignore_ascii_case("true");
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_wal_to_page() {
        assert_eq!(EngineConfig::default().strategy, Strategy::WalToPage);
    }

    #[test]
    fn file_overrides_apply_over_defaults() {
        let mut cfg = EngineConfig::default();
        let file = EngineConfigFile { wal_cap: Some(42), ..Default::default() };
        file.apply_to(&mut cfg);
        assert_eq!(cfg.wal_cap, 42);
        assert_eq!(cfg.chunk_bytes, EngineConfig::default().chunk_bytes);
    }
}
