//! Collection completeness validation.
//!
//! A collection is complete when every expected shard has a sorted Parquet
//! (or an empty-shard marker) and the collection index exists and was built
//! from sorted inputs. Source archive counts are reported but not required,
//! so cleanup can safely delete sources.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;

use crate::config::Config;
use crate::schema::shard_stem;

/// Validator output for one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub collection: String,
    pub tar_gz_count: usize,
    pub tar_gz_expected: usize,
    pub parquet_count: usize,
    pub parquet_expected: usize,
    /// Sorted Parquets plus empty-shard markers.
    pub sorted_count: usize,
    pub duckdb_index_exists: bool,
    pub duckdb_index_sorted: bool,
    pub complete: bool,
}

/// Best-effort on-disk footprint of a collection.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskUsage {
    pub source_bytes: u64,
    pub parquet_bytes: u64,
    pub duckdb_bytes: u64,
}

impl DiskUsage {
    pub fn total(&self) -> u64 {
        self.source_bytes + self.parquet_bytes + self.duckdb_bytes
    }
}

/// Validate one collection's pipeline state.
pub fn validate_collection(config: &Config, collection: &str) -> CollectionStatus {
    let expected = config.expected_shards;

    let source_dir = config.collection_source_dir(collection);
    let tar_gz_count = count_matching(&source_dir, |name| {
        name.ends_with(".gz") && !name.ends_with(".tar.gz") && shard_stem(name).is_some()
    });

    let parquet_dir = config.collection_parquet_dir(collection);
    let mut converted: HashSet<String> = HashSet::new();
    let mut sorted: HashSet<String> = HashSet::new();
    if parquet_dir.exists() {
        if let Ok(entries) = std::fs::read_dir(&parquet_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(stem) = shard_stem(&name) else {
                    continue;
                };
                if name.ends_with(".gz.sorted.parquet") || name.ends_with(".gz.parquet.empty") {
                    sorted.insert(stem.to_string());
                    converted.insert(stem.to_string());
                } else if name.ends_with(".gz.parquet") {
                    converted.insert(stem.to_string());
                }
            }
        }
    }

    let duckdb_index_exists = config.collection_db_path(collection).exists();
    let duckdb_index_sorted = config.index_sorted_marker(collection).exists();

    let complete = sorted.len() == expected && duckdb_index_exists && duckdb_index_sorted;

    CollectionStatus {
        collection: collection.to_string(),
        tar_gz_count,
        tar_gz_expected: expected,
        parquet_count: converted.len(),
        parquet_expected: expected,
        sorted_count: sorted.len(),
        duckdb_index_exists,
        duckdb_index_sorted,
        complete,
    }
}

/// Shard stems that are missing a sorted Parquet (and have no empty marker).
pub fn missing_sorted_stems(config: &Config, collection: &str) -> Vec<String> {
    let parquet_dir = config.collection_parquet_dir(collection);
    let mut present: HashSet<String> = HashSet::new();
    if let Ok(entries) = std::fs::read_dir(&parquet_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".gz.sorted.parquet") || name.ends_with(".gz.parquet.empty") {
                if let Some(stem) = shard_stem(&name) {
                    present.insert(stem.to_string());
                }
            }
        }
    }

    (0..config.expected_shards)
        .map(|i| format!("cdx-{:05}", i))
        .filter(|stem| !present.contains(stem))
        .collect()
}

/// Measure the collection's on-disk footprint.
pub fn disk_usage(config: &Config, collection: &str) -> DiskUsage {
    let mut usage = DiskUsage::default();
    usage.source_bytes = dir_size(&config.collection_source_dir(collection));
    usage.parquet_bytes = dir_size(&config.collection_parquet_dir(collection));
    for path in [
        config.collection_db_path(collection),
        config.index_sorted_marker(collection),
    ] {
        if let Ok(meta) = std::fs::metadata(&path) {
            usage.duckdb_bytes += meta.len();
        }
    }
    if let Some(path) = config.rowgroup_db_path(collection) {
        if let Ok(meta) = std::fs::metadata(&path) {
            usage.duckdb_bytes += meta.len();
        }
    }
    usage
}

fn count_matching(dir: &Path, pred: impl Fn(&str) -> bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| pred(&e.file_name().to_string_lossy()))
        .count()
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
