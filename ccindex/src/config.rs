//! Configuration for the CCIndex pipeline.
//!
//! State dir resolution order:
//! 1. Explicit path passed to Config::with_root()
//! 2. CCINDEX_STATE_DIR environment variable
//! 3. Default: platform data dir (~/.local/share/ccindex)
//!
//! Individual roots (parquet, DuckDB indexes, caches) can be moved off the
//! state dir via the CCINDEX_* environment variables. An env var set to the
//! empty string explicitly disables the corresponding cache directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::schema::collection_year;
use crate::{atomic, Error, Result};

/// How the per-collection DuckDB index stores pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Copy every pointer row into `cc_pointers`.
    Url,
    /// One row per distinct (host_rev, shard) in `cc_domain_shards`, plus
    /// optional row-group statistics. Default for large deployments.
    Domain,
}

impl std::str::FromStr for IndexMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "url" => Ok(IndexMode::Url),
            "domain" => Ok(IndexMode::Domain),
            other => Err(Error::Config(format!("unknown index mode: {}", other))),
        }
    }
}

/// CCIndex pipeline configuration.
///
/// Immutable once constructed; components hold shared references. Persisted
/// to `<state_dir>/orchestrator_settings.json` so background jobs launched
/// later inherit the same defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root for downloaded source shards: `<ccindex_root>/<collection>/cdx-NNNNN.gz`.
    pub ccindex_root: PathBuf,

    /// Root for Parquet pointer stores.
    pub parquet_root: PathBuf,

    /// Directory holding one DuckDB index per collection.
    pub duckdb_collection_root: PathBuf,

    /// Directory holding per-year meta-index databases.
    pub duckdb_year_root: PathBuf,

    /// Directory holding the master meta-index database.
    pub duckdb_master_root: PathBuf,

    /// Directory holding per-collection row-group slice databases.
    /// None disables slice indexing and slice-assisted lookup.
    #[serde(default)]
    pub rowgroup_index_dir: Option<PathBuf>,

    /// State directory (settings, job registry, caches, collinfo cache).
    pub state_dir: PathBuf,

    /// Log directory for orchestrator jobs and pid files.
    pub log_dir: PathBuf,

    /// Worker count for download/convert stages.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Explicit sort worker count. None = derive from available memory.
    #[serde(default)]
    pub sort_workers: Option<usize>,

    /// Memory budget per concurrent Parquet sort, in GB.
    #[serde(default = "default_sort_memory_gb")]
    pub sort_memory_per_worker_gb: f64,

    /// Spill directory for DuckDB sorts. None = DuckDB default.
    #[serde(default)]
    pub sort_temp_dir: Option<PathBuf>,

    /// Seconds of stage-subprocess silence before a heartbeat line is logged.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,

    /// Rows per append batch (and Parquet row group) during conversion.
    #[serde(default = "default_parquet_batch_rows")]
    pub parquet_batch_rows: usize,

    /// Parquet compression codec: zstd (default), snappy or gzip.
    #[serde(default = "default_parquet_compression")]
    pub parquet_compression: String,

    /// Index shape for per-collection DuckDB databases.
    #[serde(default = "default_index_mode")]
    pub index_mode: IndexMode,

    /// Record per-row-group host_rev statistics while indexing.
    #[serde(default = "default_true")]
    pub extract_rowgroups: bool,

    /// Build secondary indexes on the collection database.
    #[serde(default)]
    pub create_indexes: bool,

    /// Run the cleanup pass after a collection validates as complete.
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,

    /// Allow cleanup to delete source `cdx-*.gz` / `*.tar.gz` archives once a
    /// collection is fully complete.
    #[serde(default)]
    pub cleanup_source_archives: bool,

    /// DuckDB thread count per connection.
    #[serde(default = "default_duckdb_threads")]
    pub duckdb_threads: usize,

    /// Base URL for Common Crawl data downloads.
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    /// On-disk cache for WARC range slices. None disables caching.
    #[serde(default)]
    pub warc_cache_dir: Option<PathBuf>,

    /// On-disk cache for whole `*.warc.gz` files. None disables caching.
    #[serde(default)]
    pub full_warc_cache_dir: Option<PathBuf>,

    /// Fail fast when available memory drops below this many GB.
    #[serde(default = "default_min_free_memory_gb")]
    pub min_free_memory_gb: f64,

    /// Fail fast when free disk at the parquet root drops below this many GB.
    #[serde(default = "default_min_free_disk_gb")]
    pub min_free_disk_gb: f64,

    /// Shards expected per collection.
    #[serde(default = "default_expected_shards")]
    pub expected_shards: usize,

    /// JSONL trace log for lookup operations. None disables tracing.
    #[serde(default)]
    pub trace_log: Option<PathBuf>,
}

fn default_workers() -> usize {
    4
}

fn default_sort_memory_gb() -> f64 {
    4.0
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_parquet_batch_rows() -> usize {
    200_000
}

fn default_parquet_compression() -> String {
    "zstd".to_string()
}

fn default_index_mode() -> IndexMode {
    IndexMode::Domain
}

fn default_true() -> bool {
    true
}

fn default_duckdb_threads() -> usize {
    4
}

fn default_download_base_url() -> String {
    "https://data.commoncrawl.org".to_string()
}

fn default_min_free_memory_gb() -> f64 {
    2.0
}

fn default_min_free_disk_gb() -> f64 {
    10.0
}

fn default_expected_shards() -> usize {
    300
}

impl Config {
    /// Create a config with every root under the given directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            ccindex_root: root.join("ccindex"),
            parquet_root: root.join("parquet"),
            duckdb_collection_root: root.join("duckdb/collections"),
            duckdb_year_root: root.join("duckdb/years"),
            duckdb_master_root: root.join("duckdb"),
            rowgroup_index_dir: Some(root.join("duckdb/rowgroups")),
            state_dir: root.clone(),
            log_dir: root.join("logs"),
            workers: default_workers(),
            sort_workers: None,
            sort_memory_per_worker_gb: default_sort_memory_gb(),
            sort_temp_dir: None,
            heartbeat_seconds: default_heartbeat_seconds(),
            parquet_batch_rows: default_parquet_batch_rows(),
            parquet_compression: default_parquet_compression(),
            index_mode: default_index_mode(),
            extract_rowgroups: true,
            create_indexes: false,
            cleanup_enabled: true,
            cleanup_source_archives: false,
            duckdb_threads: default_duckdb_threads(),
            download_base_url: default_download_base_url(),
            warc_cache_dir: Some(root.join("warc_cache")),
            full_warc_cache_dir: Some(root.join("warc_files")),
            min_free_memory_gb: default_min_free_memory_gb(),
            min_free_disk_gb: default_min_free_disk_gb(),
            expected_shards: default_expected_shards(),
            trace_log: None,
        }
    }

    /// Load persisted settings (if any) from the resolved state dir and
    /// apply environment overrides.
    pub fn load() -> Result<Self> {
        let state_dir = resolve_state_dir()?;
        Self::load_from(&state_dir)
    }

    /// Load from a specific state dir, then apply environment overrides.
    pub fn load_from(state_dir: &Path) -> Result<Self> {
        let settings_path = state_dir.join("orchestrator_settings.json");

        let mut config = if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path)?;
            let mut config: Config = serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse settings: {}", e)))?;
            // The file may have been copied from another machine; the state
            // dir on disk wins.
            config.state_dir = state_dir.to_path_buf();
            config
        } else {
            Config::with_root(state_dir)
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Persist settings to `<state_dir>/orchestrator_settings.json`.
    pub fn save(&self) -> Result<()> {
        atomic::write_json(&self.settings_path(), self)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_path("CCINDEX_LOG_DIR").flatten() {
            self.log_dir = dir;
        }
        if let Some(dir) = env_path("CCINDEX_DOMAIN_POINTER_INDEX_DIR").flatten() {
            self.duckdb_collection_root = dir;
        }
        if let Some(dir) = env_path("CCINDEX_DOMAIN_POINTER_PARQUET_ROOT").flatten() {
            self.parquet_root = dir;
        }
        match env_path("CCINDEX_DOMAIN_ROWGROUP_INDEX_DIR") {
            Some(Some(dir)) => self.rowgroup_index_dir = Some(dir),
            Some(None) => self.rowgroup_index_dir = None,
            None => {}
        }
        match env_path("CCINDEX_WARC_CACHE_DIR") {
            Some(Some(dir)) => self.warc_cache_dir = Some(dir),
            Some(None) => self.warc_cache_dir = None,
            None => {}
        }
        match env_path("CCINDEX_FULL_WARC_CACHE_DIR") {
            Some(Some(dir)) => self.full_warc_cache_dir = Some(dir),
            Some(None) => self.full_warc_cache_dir = None,
            None => {}
        }
        if let Ok(threads) = std::env::var("CCINDEX_DUCKDB_THREADS") {
            if let Ok(n) = threads.trim().parse::<usize>() {
                if n > 0 {
                    self.duckdb_threads = n;
                }
            }
        }
    }

    // Path helpers

    /// Directory holding a collection's source `cdx-*.gz` shards.
    pub fn collection_source_dir(&self, collection: &str) -> PathBuf {
        self.ccindex_root.join(collection)
    }

    /// Directory holding a collection's Parquet files.
    ///
    /// Prefers `<parquet_root>/cc_pointers_by_collection/<year>/<collection>`;
    /// falls back to legacy layouts when they already exist on disk.
    pub fn collection_parquet_dir(&self, collection: &str) -> PathBuf {
        if let Some(year) = collection_year(collection) {
            let primary = self
                .parquet_root
                .join("cc_pointers_by_collection")
                .join(year.to_string())
                .join(collection);
            if primary.exists() {
                return primary;
            }
            let legacy = self.parquet_root.join(year.to_string()).join(collection);
            if legacy.exists() {
                return legacy;
            }
            let flat = self.parquet_root.join(collection);
            if flat.exists() {
                return flat;
            }
            return primary;
        }
        self.parquet_root.join(collection)
    }

    /// Relative path of a collection's Parquet dir under the parquet root.
    pub fn collection_parquet_relpath(&self, collection: &str) -> Option<PathBuf> {
        self.collection_parquet_dir(collection)
            .strip_prefix(&self.parquet_root)
            .ok()
            .map(|p| p.to_path_buf())
    }

    /// Path of the per-collection DuckDB index.
    pub fn collection_db_path(&self, collection: &str) -> PathBuf {
        self.duckdb_collection_root
            .join(format!("{}.duckdb", collection))
    }

    /// Sidecar marker recording that the collection index was built from
    /// sorted Parquets.
    pub fn index_sorted_marker(&self, collection: &str) -> PathBuf {
        self.duckdb_collection_root
            .join(format!("{}.duckdb.sorted", collection))
    }

    /// Path of a per-year meta-index database.
    pub fn year_db_path(&self, year: i32) -> PathBuf {
        self.duckdb_year_root
            .join(format!("cc_pointers_{}.duckdb", year))
    }

    /// Path of the master meta-index database. `CCINDEX_MASTER_DB` overrides.
    pub fn master_db_path(&self) -> PathBuf {
        if let Some(path) = env_path("CCINDEX_MASTER_DB").flatten() {
            return path;
        }
        self.duckdb_master_root.join("cc_master_index.duckdb")
    }

    /// Path of a collection's row-group slice database, if slice indexing is
    /// enabled.
    pub fn rowgroup_db_path(&self, collection: &str) -> Option<PathBuf> {
        self.rowgroup_index_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_rowgroups.duckdb", collection)))
    }

    /// Path of the persisted settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.state_dir.join("orchestrator_settings.json")
    }

    /// Path of the append-only job registry.
    pub fn jobs_registry_path(&self) -> PathBuf {
        self.state_dir.join("orchestrator_jobs.jsonl")
    }

    /// Path of the cached collection manifest.
    pub fn collinfo_cache_path(&self) -> PathBuf {
        self.state_dir.join("collinfo.json")
    }

    /// Path of the index-progress snapshot for a collection.
    pub fn index_progress_path(&self, collection: &str) -> PathBuf {
        self.state_dir
            .join("index_progress")
            .join(format!("{}.json", collection))
    }
}

/// Read an env var as a path. Returns:
/// - None if unset
/// - Some(None) if set to the empty string (explicit disable)
/// - Some(Some(path)) otherwise
fn env_path(var: &str) -> Option<Option<PathBuf>> {
    match std::env::var(var) {
        Ok(s) if s.trim().is_empty() => Some(None),
        Ok(s) => Some(Some(PathBuf::from(s))),
        Err(_) => None,
    }
}

/// Resolve the state dir using the standard resolution order.
fn resolve_state_dir() -> Result<PathBuf> {
    if let Some(Some(path)) = env_path("CCINDEX_STATE_DIR") {
        return Ok(path);
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "ccindex") {
        return Ok(proj_dirs.data_dir().to_path_buf());
    }

    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("could not determine home directory".to_string()))?;
    Ok(PathBuf::from(home).join(".local/share/ccindex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_with_root() {
        let config = Config::with_root("/tmp/test-ccindex");
        assert_eq!(config.ccindex_root, PathBuf::from("/tmp/test-ccindex/ccindex"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.expected_shards, 300);
        assert_eq!(config.parquet_batch_rows, 200_000);
        assert_eq!(config.index_mode, IndexMode::Domain);
    }

    #[test]
    fn test_collection_paths() {
        let config = Config::with_root("/tmp/test-ccindex");
        assert_eq!(
            config.collection_db_path("CC-MAIN-2024-10"),
            PathBuf::from("/tmp/test-ccindex/duckdb/collections/CC-MAIN-2024-10.duckdb")
        );
        assert_eq!(
            config.index_sorted_marker("CC-MAIN-2024-10"),
            PathBuf::from("/tmp/test-ccindex/duckdb/collections/CC-MAIN-2024-10.duckdb.sorted")
        );
        assert_eq!(
            config.year_db_path(2024),
            PathBuf::from("/tmp/test-ccindex/duckdb/years/cc_pointers_2024.duckdb")
        );
    }

    #[test]
    fn test_collection_parquet_dir_prefers_primary_layout() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());

        // Nothing on disk yet: primary layout is chosen for creation.
        let dir = config.collection_parquet_dir("CC-MAIN-2024-10");
        assert!(dir.ends_with("cc_pointers_by_collection/2024/CC-MAIN-2024-10"));

        // A legacy layout on disk wins over a missing primary.
        let legacy = config.parquet_root.join("2024/CC-MAIN-2024-10");
        std::fs::create_dir_all(&legacy).unwrap();
        assert_eq!(config.collection_parquet_dir("CC-MAIN-2024-10"), legacy);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();

        let mut config = Config::with_root(tmp.path());
        config.workers = 12;
        config.index_mode = IndexMode::Url;
        config.save().unwrap();

        let loaded = Config::load_from(tmp.path()).unwrap();
        assert_eq!(loaded.workers, 12);
        assert_eq!(loaded.index_mode, IndexMode::Url);
        assert_eq!(loaded.state_dir, tmp.path());
    }

    #[test]
    fn test_index_mode_parse() {
        assert_eq!("domain".parse::<IndexMode>().unwrap(), IndexMode::Domain);
        assert_eq!("URL".parse::<IndexMode>().unwrap(), IndexMode::Url);
        assert!("pointer".parse::<IndexMode>().is_err());
    }
}
