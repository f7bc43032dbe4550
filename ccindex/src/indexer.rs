//! Per-collection DuckDB index construction (stage 4).
//!
//! URL mode copies every pointer row into `cc_pointers`. Domain mode (the
//! default) stores one row per distinct `(host_rev, shard)` in
//! `cc_domain_shards` plus per-row-group host_rev statistics in
//! `cc_parquet_rowgroups`, so a domain query only ever opens the Parquet
//! files (and row groups) that can contain it.
//!
//! The `cc_ingested_files` ledger keyed on `(path, size, mtime_ns)` makes
//! re-runs skip shards that are already ingested.

use std::path::{Path, PathBuf};

use chrono::Utc;
use duckdb::{params, Connection};
use tracing::{info, warn};

use crate::config::{Config, IndexMode};
use crate::db;
use crate::schema::{
    collection_year, DDL_CC_DOMAIN_SHARDS, DDL_CC_INGESTED_FILES, DDL_CC_PARQUET_ROWGROUPS,
    DDL_CC_POINTERS,
};
use crate::{atomic, Error, Result};

/// Options for an index build.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    /// Re-ingest shards even when the ledger says they are current.
    pub force_reindex: bool,
}

/// Aggregate results of an index build.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub ingested: usize,
    pub skipped: usize,
}

/// Build (or update) the DuckDB index for one collection from its sorted
/// Parquet files, then mark the index as built-from-sorted.
pub fn build_collection_index(
    config: &Config,
    collection: &str,
    opts: IndexOptions,
) -> Result<IndexStats> {
    let parquet_dir = config.collection_parquet_dir(collection);
    let db_path = config.collection_db_path(collection);
    let year = collection_year(collection);

    let mut sorted: Vec<PathBuf> = Vec::new();
    if parquet_dir.exists() {
        for entry in std::fs::read_dir(&parquet_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".gz.sorted.parquet") {
                sorted.push(entry.path());
            }
        }
    }
    sorted.sort();

    info!(
        collection,
        files = sorted.len(),
        mode = ?config.index_mode,
        db = %db_path.display(),
        "building collection index"
    );

    let conn = db::open_rw(&db_path, config.duckdb_threads, None)?;
    init_schema(&conn, config.index_mode)?;

    let mut stats = IndexStats::default();
    for parquet in &sorted {
        let shard_file = shard_file_of(parquet)?;
        let meta = std::fs::metadata(parquet)?;
        let size_bytes = meta.len() as i64;
        let mtime_ns = mtime_ns(&meta);
        let source_path = parquet.to_string_lossy().to_string();

        if !opts.force_reindex && already_ingested(&conn, &source_path, size_bytes, mtime_ns)? {
            stats.skipped += 1;
            continue;
        }

        // The stem in this line is how the orchestrator attributes a corrupt
        // Parquet failure to a specific shard from the log tail.
        info!(collection, shard = %shard_file, "indexing shard");

        let rows = ingest_shard(
            &conn,
            config,
            collection,
            year,
            &shard_file,
            &source_path,
            parquet,
        )
        .map_err(|e| corrupt_or(e, parquet))?;

        record_ingested(&conn, &source_path, size_bytes, mtime_ns, rows)?;
        stats.ingested += 1;
        write_progress_snapshot(config, collection, sorted.len(), &stats, &shard_file);
    }

    if config.create_indexes {
        create_secondary_indexes(&conn, config.index_mode)?;
    }

    drop(conn);
    atomic::write_file(
        &config.index_sorted_marker(collection),
        Utc::now().to_rfc3339().as_bytes(),
    )?;

    info!(
        collection,
        ingested = stats.ingested,
        skipped = stats.skipped,
        "collection index built"
    );
    Ok(stats)
}

/// Snapshot of a long index build, written after each shard so operators
/// can watch progress without tailing the database.
fn write_progress_snapshot(
    config: &Config,
    collection: &str,
    shards_total: usize,
    stats: &IndexStats,
    current_shard: &str,
) {
    let snapshot = serde_json::json!({
        "collection": collection,
        "shards_total": shards_total,
        "ingested": stats.ingested,
        "skipped": stats.skipped,
        "current_shard": current_shard,
        "updated_at": Utc::now().to_rfc3339(),
    });
    if let Err(e) = atomic::write_json(&config.index_progress_path(collection), &snapshot) {
        warn!(collection, error = %e, "could not write progress snapshot");
    }
}

fn init_schema(conn: &Connection, mode: IndexMode) -> Result<()> {
    match mode {
        IndexMode::Url => conn.execute_batch(DDL_CC_POINTERS)?,
        IndexMode::Domain => {
            conn.execute_batch(DDL_CC_DOMAIN_SHARDS)?;
            conn.execute_batch(DDL_CC_PARQUET_ROWGROUPS)?;
        }
    }
    conn.execute_batch(DDL_CC_INGESTED_FILES)?;
    Ok(())
}

fn ingest_shard(
    conn: &Connection,
    config: &Config,
    collection: &str,
    year: Option<i32>,
    shard_file: &str,
    source_path: &str,
    parquet: &Path,
) -> Result<i64> {
    let parquet_str = parquet.to_string_lossy().to_string();
    let relpath = parquet
        .strip_prefix(&config.parquet_root)
        .map(|p| p.to_string_lossy().to_string())
        .ok();

    match config.index_mode {
        IndexMode::Url => {
            conn.execute(
                "DELETE FROM cc_pointers WHERE collection = ? AND shard_file = ?",
                params![collection, shard_file],
            )?;
            let rows = conn.execute(
                "INSERT INTO cc_pointers \
                 SELECT collection, shard_file, surt, ts, url, host, host_rev, status, mime, \
                        digest, warc_filename, warc_offset, warc_length \
                 FROM read_parquet(?)",
                params![parquet_str],
            )?;
            Ok(rows as i64)
        }
        IndexMode::Domain => {
            conn.execute(
                "DELETE FROM cc_domain_shards WHERE source_path = ?",
                params![source_path],
            )?;
            let rows = conn.execute(
                "INSERT INTO cc_domain_shards \
                 SELECT ?, ?, ?, ?, ?, host, host_rev \
                 FROM (SELECT DISTINCT host, host_rev FROM read_parquet(?))",
                params![source_path, collection, year, shard_file, relpath, parquet_str],
            )?;

            if config.extract_rowgroups {
                conn.execute(
                    "DELETE FROM cc_parquet_rowgroups WHERE source_path = ?",
                    params![source_path],
                )?;
                conn.execute(
                    "INSERT INTO cc_parquet_rowgroups \
                     SELECT ?, ?, ?, ?, ?, \
                            row_group_id, \
                            sum(row_group_num_rows) OVER (ORDER BY row_group_id) - row_group_num_rows, \
                            sum(row_group_num_rows) OVER (ORDER BY row_group_id), \
                            stats_min_value, stats_max_value \
                     FROM parquet_metadata(?) \
                     WHERE path_in_schema = 'host_rev'",
                    params![source_path, collection, year, shard_file, relpath, parquet_str],
                )?;
            }
            Ok(rows as i64)
        }
    }
}

fn create_secondary_indexes(conn: &Connection, mode: IndexMode) -> Result<()> {
    // Index support varies by DuckDB version; failures downgrade to warnings.
    let statements: &[&str] = match mode {
        IndexMode::Url => &[
            "CREATE INDEX IF NOT EXISTS idx_pointers_host_rev ON cc_pointers(host_rev)",
            "CREATE INDEX IF NOT EXISTS idx_pointers_host ON cc_pointers(host)",
            "CREATE INDEX IF NOT EXISTS idx_pointers_url ON cc_pointers(url)",
            "CREATE INDEX IF NOT EXISTS idx_pointers_collection ON cc_pointers(collection)",
        ],
        IndexMode::Domain => &[
            "CREATE INDEX IF NOT EXISTS idx_domain_shards_host_rev ON cc_domain_shards(host_rev)",
            "CREATE INDEX IF NOT EXISTS idx_domain_shards_host ON cc_domain_shards(host)",
            "CREATE INDEX IF NOT EXISTS idx_rowgroups_minmax ON cc_parquet_rowgroups(host_rev_min, host_rev_max)",
        ],
    };
    for sql in statements {
        if let Err(e) = conn.execute_batch(sql) {
            warn!(error = %e, "secondary index creation failed");
        }
    }
    Ok(())
}

fn already_ingested(
    conn: &Connection,
    path: &str,
    size_bytes: i64,
    mtime_ns: i64,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM cc_ingested_files \
             WHERE path = ? AND size_bytes = ? AND mtime_ns = ? LIMIT 1",
            params![path, size_bytes, mtime_ns],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            duckdb::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(found.is_some())
}

fn record_ingested(
    conn: &Connection,
    path: &str,
    size_bytes: i64,
    mtime_ns: i64,
    rows: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO cc_ingested_files(path, size_bytes, mtime_ns, ingested_at, rows) \
         VALUES (?, ?, ?, ?, ?)",
        params![path, size_bytes, mtime_ns, Utc::now().to_rfc3339(), rows],
    )?;
    Ok(())
}

fn shard_file_of(parquet: &Path) -> Result<String> {
    let name = parquet
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config(format!("bad parquet path: {}", parquet.display())))?;
    let stem = crate::schema::shard_stem(name)
        .ok_or_else(|| Error::Config(format!("not a shard parquet: {}", name)))?;
    Ok(format!("{}.gz", stem))
}

fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Wrap DuckDB failures that indicate a damaged Parquet as CorruptInput so
/// the orchestrator can route the shard through the heal chain.
fn corrupt_or(e: Error, parquet: &Path) -> Error {
    let msg = e.to_string();
    let lowered = msg.to_ascii_lowercase();
    if lowered.contains("invalid utf-8")
        || lowered.contains("invalid unicode")
        || lowered.contains("corrupt")
        || lowered.contains("invalid input")
    {
        Error::CorruptInput(format!("{}: {}", parquet.display(), msg))
    } else {
        e
    }
}
