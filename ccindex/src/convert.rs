//! Shard conversion: one `cdx-*.gz` shard into one Parquet pointer file.
//!
//! Rows are appended into a DuckDB staging table in bounded batches and then
//! copied out as Parquet with ZSTD (default) compression. The final file is
//! written as `<name>.tmp` and renamed, so a complete Parquet never coexists
//! with a partial one. A shard with zero parseable rows produces a zero-byte
//! `*.parquet.empty` sidecar instead of a Parquet file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use duckdb::{params, Connection};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cdxj::{CdxjLine, CdxjReader};
use crate::config::Config;
use crate::db;
use crate::schema::{POINTER_COLUMNS, DDL_CC_POINTERS};
use crate::{atomic, Error, Result};

/// Outcome of converting one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    /// A Parquet file was written with this many rows.
    Written { rows: u64 },
    /// The shard had zero parseable rows; an empty marker was written.
    Empty,
    /// A complete output already existed and was left alone.
    Skipped,
}

/// Aggregate results for a collection conversion run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvertStats {
    pub written: usize,
    pub empty: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows: u64,
}

/// Unsorted Parquet path for a shard file name.
pub fn unsorted_parquet_path(out_dir: &Path, shard_file: &str) -> PathBuf {
    out_dir.join(format!("{}.parquet", shard_file))
}

/// Sorted Parquet path for a shard file name.
pub fn sorted_parquet_path(out_dir: &Path, shard_file: &str) -> PathBuf {
    out_dir.join(format!("{}.sorted.parquet", shard_file))
}

/// Empty-shard marker path for a shard file name.
pub fn empty_marker_path(out_dir: &Path, shard_file: &str) -> PathBuf {
    out_dir.join(format!("{}.parquet.empty", shard_file))
}

/// Convert one shard into a Parquet file under `out_dir`.
///
/// With `overwrite = false` the shard is skipped when a complete unsorted or
/// sorted Parquet (or an empty marker) already exists.
pub fn convert_shard(
    config: &Config,
    collection: &str,
    shard_path: &Path,
    out_dir: &Path,
    overwrite: bool,
) -> Result<ShardOutcome> {
    let shard_file = shard_path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config(format!("bad shard path: {}", shard_path.display())))?
        .to_string();

    let final_path = unsorted_parquet_path(out_dir, &shard_file);
    let sorted_path = sorted_parquet_path(out_dir, &shard_file);
    let marker_path = empty_marker_path(out_dir, &shard_file);

    if !overwrite
        && (marker_path.exists()
            || parquet_is_complete(&final_path, &POINTER_COLUMNS)
            || parquet_is_complete(&sorted_path, &POINTER_COLUMNS))
    {
        return Ok(ShardOutcome::Skipped);
    }

    std::fs::create_dir_all(out_dir)?;

    let conn = db::memory_session(
        config.duckdb_threads,
        Some(config.sort_memory_per_worker_gb),
        config.sort_temp_dir.as_deref(),
    )?;
    conn.execute_batch(DDL_CC_POINTERS)?;

    let file = File::open(shard_path)?;
    let reader = CdxjReader::new(file, collection, &shard_file);

    let mut rows: u64 = 0;
    let mut malformed: u64 = 0;
    {
        let mut appender = conn.appender("cc_pointers")?;
        for line in reader {
            match line? {
                CdxjLine::Record(rec) => {
                    appender.append_row(params![
                        rec.collection,
                        rec.shard_file,
                        rec.surt,
                        rec.timestamp,
                        rec.url,
                        rec.host,
                        rec.host_rev,
                        rec.status,
                        rec.mime,
                        rec.digest,
                        rec.warc_filename,
                        rec.warc_offset,
                        rec.warc_length,
                    ])?;
                    rows += 1;
                    if rows % config.parquet_batch_rows.max(1) as u64 == 0 {
                        appender.flush()?;
                    }
                }
                CdxjLine::Malformed(_) => malformed += 1,
                CdxjLine::Comment | CdxjLine::Empty => {}
            }
        }
        appender.flush()?;
    }

    if malformed > 0 {
        warn!(shard = %shard_file, malformed, "skipped malformed CDXJ lines");
    }

    if rows == 0 {
        atomic::write_file(&marker_path, b"")?;
        if final_path.exists() {
            let _ = std::fs::remove_file(&final_path);
        }
        debug!(shard = %shard_file, "empty shard, wrote marker");
        return Ok(ShardOutcome::Empty);
    }

    let tmp_path = out_dir.join(format!("{}.parquet.tmp", shard_file));
    let copy_sql = format!(
        "COPY cc_pointers TO '{}' (FORMAT PARQUET, COMPRESSION '{}', ROW_GROUP_SIZE {});",
        db::sql_quote_str(&tmp_path),
        db::sql_quote(&config.parquet_compression),
        config.parquet_batch_rows.max(1)
    );
    if let Err(e) = conn.execute_batch(&copy_sql) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    // A previous run may have left a stale empty marker behind.
    if marker_path.exists() {
        let _ = std::fs::remove_file(&marker_path);
    }

    debug!(shard = %shard_file, rows, "converted shard");
    Ok(ShardOutcome::Written { rows })
}

/// Convert every (or only selected) shard of a collection in parallel.
pub fn convert_collection(
    config: &Config,
    collection: &str,
    input_dir: &Path,
    output_dir: &Path,
    workers: usize,
    overwrite: bool,
    only: &[String],
) -> Result<ConvertStats> {
    let mut shards: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if crate::schema::shard_stem(&name).is_some() && name.ends_with(".gz") {
            if only.is_empty() || only.iter().any(|o| o == &name) {
                shards.push(entry.path());
            }
        }
    }
    shards.sort();

    info!(collection, shards = shards.len(), workers, "converting shards");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| Error::Stage(format!("thread pool: {}", e)))?;

    let outcomes: Vec<(PathBuf, Result<ShardOutcome>)> = pool.install(|| {
        shards
            .par_iter()
            .map(|shard| {
                let outcome = convert_shard(config, collection, shard, output_dir, overwrite);
                (shard.clone(), outcome)
            })
            .collect()
    });

    let mut stats = ConvertStats::default();
    for (shard, outcome) in outcomes {
        match outcome {
            Ok(ShardOutcome::Written { rows }) => {
                stats.written += 1;
                stats.rows += rows;
            }
            Ok(ShardOutcome::Empty) => stats.empty += 1,
            Ok(ShardOutcome::Skipped) => stats.skipped += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(shard = %shard.display(), error = %e, "shard conversion failed");
            }
        }
    }

    info!(
        collection,
        written = stats.written,
        empty = stats.empty,
        skipped = stats.skipped,
        failed = stats.failed,
        rows = stats.rows,
        "conversion finished"
    );
    Ok(stats)
}

/// Best-effort Parquet integrity check.
///
/// A Parquet is complete only if it ends with the `PAR1` magic, its footer
/// parses, it has at least one row group and one row, and it contains every
/// expected column.
pub fn parquet_is_complete(path: &Path, expected_cols: &[&str]) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(meta) = file.metadata() else {
        return false;
    };
    if meta.len() < 12 {
        return false;
    }
    let mut magic = [0u8; 4];
    if file.seek(SeekFrom::End(-4)).is_err() || file.read_exact(&mut magic).is_err() {
        return false;
    }
    if &magic != b"PAR1" {
        return false;
    }

    let Ok(conn) = Connection::open_in_memory() else {
        return false;
    };
    let path_str = path.to_string_lossy().to_string();

    let footer: std::result::Result<(i64, i64), duckdb::Error> = conn.query_row(
        "SELECT num_rows, num_row_groups FROM parquet_file_metadata(?)",
        [&path_str],
        |row| Ok((row.get(0)?, row.get(1)?)),
    );
    let Ok((num_rows, num_row_groups)) = footer else {
        return false;
    };
    if num_rows <= 0 || num_row_groups <= 0 {
        return false;
    }

    if !expected_cols.is_empty() {
        let Ok(mut stmt) = conn.prepare("SELECT name FROM parquet_schema(?)") else {
            return false;
        };
        let Ok(names) = stmt.query_map([&path_str], |row| row.get::<_, String>(0)) else {
            return false;
        };
        let names: std::collections::HashSet<String> = names.filter_map(|r| r.ok()).collect();
        for col in expected_cols {
            if !names.contains(*col) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_gz_shard(path: &Path, lines: &[&str]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        for line in lines {
            writeln!(enc, "{}", line).unwrap();
        }
        enc.finish().unwrap();
    }

    fn cdxj_line(host_rev: &str, url: &str, ts: &str, offset: i64) -> String {
        format!(
            r#"{hr})/ {ts} {{"url": "{url}", "mime": "text/html", "status": "200", "digest": "D{offset}", "length": "512", "offset": "{offset}", "filename": "crawl-data/CC-MAIN-2024-10/segments/1.0/warc/X.warc.gz"}}"#,
            hr = host_rev,
            ts = ts,
            url = url,
            offset = offset,
        )
    }

    #[test]
    fn test_convert_shard_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let shard = tmp.path().join("src/cdx-00000.gz");
        let out_dir = tmp.path().join("out");

        write_gz_shard(
            &shard,
            &[
                "# header",
                &cdxj_line("gov,18f", "https://18f.gov/", "20240315120000", 1024),
                &cdxj_line("gov,18f", "https://18f.gov/about", "20240315120001", 4096),
            ],
        );

        let outcome =
            convert_shard(&config, "CC-MAIN-2024-10", &shard, &out_dir, false).unwrap();
        assert_eq!(outcome, ShardOutcome::Written { rows: 2 });

        let parquet = unsorted_parquet_path(&out_dir, "cdx-00000.gz");
        assert!(parquet_is_complete(&parquet, &POINTER_COLUMNS));

        let conn = Connection::open_in_memory().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM read_parquet(?)",
                [parquet.to_string_lossy().to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        // Second run skips.
        let outcome =
            convert_shard(&config, "CC-MAIN-2024-10", &shard, &out_dir, false).unwrap();
        assert_eq!(outcome, ShardOutcome::Skipped);
    }

    #[test]
    fn test_convert_empty_shard_writes_marker() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let shard = tmp.path().join("src/cdx-00099.gz");
        let out_dir = tmp.path().join("out");

        write_gz_shard(&shard, &["# only comments", "", "# nothing else"]);

        let outcome =
            convert_shard(&config, "CC-MAIN-2024-10", &shard, &out_dir, false).unwrap();
        assert_eq!(outcome, ShardOutcome::Empty);

        let marker = empty_marker_path(&out_dir, "cdx-00099.gz");
        assert!(marker.exists());
        assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);
        assert!(!unsorted_parquet_path(&out_dir, "cdx-00099.gz").exists());
    }

    #[test]
    fn test_parquet_is_complete_rejects_truncated() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.parquet");
        std::fs::write(&path, b"PAR1 not really a parquet file").unwrap();
        assert!(!parquet_is_complete(&path, &POINTER_COLUMNS));

        let missing = tmp.path().join("missing.parquet");
        assert!(!parquet_is_complete(&missing, &POINTER_COLUMNS));
    }

    #[test]
    fn test_convert_collection_filters_only() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let input = tmp.path().join("src");
        let out_dir = tmp.path().join("out");

        write_gz_shard(
            &input.join("cdx-00000.gz"),
            &[&cdxj_line("gov,18f", "https://18f.gov/", "20240315120000", 1)],
        );
        write_gz_shard(
            &input.join("cdx-00001.gz"),
            &[&cdxj_line("gov,gsa", "https://gsa.gov/", "20240315120000", 2)],
        );

        let stats = convert_collection(
            &config,
            "CC-MAIN-2024-10",
            &input,
            &out_dir,
            2,
            false,
            &["cdx-00001.gz".to_string()],
        )
        .unwrap();
        assert_eq!(stats.written, 1);
        assert!(!unsorted_parquet_path(&out_dir, "cdx-00000.gz").exists());
        assert!(unsorted_parquet_path(&out_dir, "cdx-00001.gz").exists());
    }
}
