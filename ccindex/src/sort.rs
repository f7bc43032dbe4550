//! Parquet sorting: `*.gz.parquet` into `*.gz.sorted.parquet`.
//!
//! Sorting is the memory-hungry stage, so every rewrite runs in its own
//! DuckDB session with an explicit memory limit and spill directory, and the
//! effective parallelism is capped by available RAM. Files that are already
//! ordered are renamed instead of rewritten.

use std::path::{Path, PathBuf};

use duckdb::Connection;
use rayon::prelude::*;
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::convert::{parquet_is_complete, sorted_parquet_path};
use crate::db;
use crate::schema::POINTER_COLUMNS;
use crate::{Error, Result};

/// Options for a sort run over one collection's Parquet directory.
#[derive(Debug, Clone, Default)]
pub struct SortOptions {
    /// Upper bound on concurrent sorts. None = derive from config + RAM.
    pub sort_workers: Option<usize>,
    /// Memory budget per sort in GB. None = config default.
    pub memory_per_sort_gb: Option<f64>,
    /// Spill directory override.
    pub temp_dir: Option<PathBuf>,
    /// Restrict to these unsorted file names (`cdx-NNNNN.gz.parquet`).
    pub only: Vec<String>,
}

/// Aggregate results of a sort run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortStats {
    /// Files rewritten in sorted order.
    pub sorted: usize,
    /// Files that were already ordered and only renamed.
    pub marked: usize,
    /// Unsorted duplicates removed because a sorted twin already existed.
    pub removed_duplicates: usize,
    pub failed: usize,
}

/// Available system memory in GB, if it can be determined.
pub fn available_memory_gb() -> Option<f64> {
    let mut sys = System::new();
    sys.refresh_memory();
    let bytes = sys.available_memory();
    if bytes == 0 {
        None
    } else {
        Some(bytes as f64 / 1e9)
    }
}

/// Free disk space in GB for the filesystem holding `path`.
pub fn free_disk_gb(path: &Path) -> Option<f64> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.components().count();
            if best.map_or(true, |(d, _)| depth >= d) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, bytes)| bytes as f64 / 1e9)
}

/// Effective sort worker count.
///
/// An explicit `--sort-workers` wins; otherwise the configured worker count
/// is reduced so that `workers * memory_per_sort` stays under 80% of
/// available RAM.
pub fn effective_sort_workers(
    explicit: Option<usize>,
    workers: usize,
    memory_per_sort_gb: f64,
) -> usize {
    if let Some(n) = explicit {
        return n.max(1);
    }
    let workers = workers.max(1);
    let Some(avail) = available_memory_gb() else {
        return workers;
    };
    let budget = (avail * 0.8 / memory_per_sort_gb.max(0.1)).floor() as usize;
    workers.min(budget.max(1))
}

/// Check whether a pointer Parquet is already ordered by (host_rev, url, ts).
pub fn is_parquet_sorted(path: &Path) -> Result<bool> {
    let conn = Connection::open_in_memory()?;
    let out_of_order: i64 = conn.query_row(
        r#"
        SELECT count(*) FROM (
            SELECT host_rev, url, ts,
                   lag(host_rev) OVER w AS p_hr,
                   lag(url) OVER w AS p_url,
                   lag(ts) OVER w AS p_ts
            FROM read_parquet(?, file_row_number=true)
            WINDOW w AS (ORDER BY file_row_number)
        )
        WHERE p_hr IS NOT NULL
          AND (host_rev < p_hr
               OR (host_rev = p_hr AND url < p_url)
               OR (host_rev = p_hr AND url = p_url AND ts < p_ts))
        "#,
        [path.to_string_lossy().to_string()],
        |row| row.get(0),
    )?;
    Ok(out_of_order == 0)
}

/// Rewrite one Parquet in `(host_rev, url, ts)` order.
///
/// Runs in a fresh session bounded by `memory_gb`, spilling to a per-file
/// subdirectory of `temp_dir`. Writes `<dst>.tmp` then renames.
pub fn sort_shard(
    config: &Config,
    src: &Path,
    dst: &Path,
    memory_gb: f64,
    temp_dir: Option<&Path>,
) -> Result<()> {
    let src_name = src
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config(format!("bad parquet path: {}", src.display())))?;

    let spill_dir = temp_dir.map(|dir| dir.join(format!("duckdb_sort_{}", src_name)));
    let conn = db::memory_session(config.duckdb_threads, Some(memory_gb), spill_dir.as_deref())?;

    let tmp = dst.with_extension("parquet.tmp");
    let sql = format!(
        "COPY (SELECT * FROM read_parquet('{}') ORDER BY host_rev, url, ts) \
         TO '{}' (FORMAT PARQUET, COMPRESSION '{}', ROW_GROUP_SIZE {});",
        db::sql_quote_str(src),
        db::sql_quote_str(&tmp),
        db::sql_quote(&config.parquet_compression),
        config.parquet_batch_rows.max(1)
    );

    let copied = conn.execute_batch(&sql);
    if let Some(dir) = &spill_dir {
        let _ = std::fs::remove_dir_all(dir);
    }
    if let Err(e) = copied {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    if !parquet_is_complete(&tmp, &POINTER_COLUMNS) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::CorruptInput(format!(
            "sorted output for {} failed integrity check",
            src.display()
        )));
    }

    if let Err(e) = std::fs::rename(&tmp, dst) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Sort every unsorted Parquet in a collection directory.
///
/// After this pass each shard has exactly one of `*.gz.sorted.parquet` or
/// `*.gz.parquet.empty`; successfully sorted inputs are removed.
pub fn sort_collection(config: &Config, parquet_dir: &Path, opts: &SortOptions) -> Result<SortStats> {
    let mut unsorted: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(parquet_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".gz.parquet") && !name.ends_with(".sorted.parquet") {
            if opts.only.is_empty() || opts.only.iter().any(|o| o == &name) {
                unsorted.push(entry.path());
            }
        }
    }
    unsorted.sort();

    let memory_gb = opts
        .memory_per_sort_gb
        .unwrap_or(config.sort_memory_per_worker_gb);
    let workers = effective_sort_workers(
        opts.sort_workers.or(config.sort_workers),
        config.workers,
        memory_gb,
    );
    let temp_dir = opts.temp_dir.clone().or_else(|| config.sort_temp_dir.clone());

    info!(
        dir = %parquet_dir.display(),
        files = unsorted.len(),
        workers,
        memory_gb,
        "sorting parquet files"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| Error::Stage(format!("thread pool: {}", e)))?;

    let outcomes: Vec<Result<SortStats>> = pool.install(|| {
        unsorted
            .par_iter()
            .map(|src| sort_one(config, src, memory_gb, temp_dir.as_deref()))
            .collect()
    });

    let mut stats = SortStats::default();
    for outcome in outcomes {
        match outcome {
            Ok(one) => {
                stats.sorted += one.sorted;
                stats.marked += one.marked;
                stats.removed_duplicates += one.removed_duplicates;
            }
            Err(e) => {
                stats.failed += 1;
                warn!(error = %e, "sort failed");
            }
        }
    }

    info!(
        sorted = stats.sorted,
        marked = stats.marked,
        duplicates = stats.removed_duplicates,
        failed = stats.failed,
        "sort pass finished"
    );
    Ok(stats)
}

fn sort_one(
    config: &Config,
    src: &Path,
    memory_gb: f64,
    temp_dir: Option<&Path>,
) -> Result<SortStats> {
    let mut stats = SortStats::default();
    let dir = src.parent().unwrap_or(Path::new("."));
    let shard_file = src
        .file_name()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_suffix(".parquet"))
        .ok_or_else(|| Error::Config(format!("bad parquet path: {}", src.display())))?;
    let sorted = sorted_parquet_path(dir, shard_file);

    if parquet_is_complete(&sorted, &POINTER_COLUMNS) {
        std::fs::remove_file(src)?;
        stats.removed_duplicates += 1;
        debug!(file = %src.display(), "removed duplicate unsorted parquet");
        return Ok(stats);
    }

    if !parquet_is_complete(src, &POINTER_COLUMNS) {
        return Err(Error::CorruptInput(format!(
            "unsorted parquet {} is incomplete",
            src.display()
        )));
    }

    if is_parquet_sorted(src)? {
        std::fs::rename(src, &sorted)?;
        stats.marked += 1;
        debug!(file = %sorted.display(), "already ordered, renamed");
    } else {
        sort_shard(config, src, &sorted, memory_gb, temp_dir)?;
        std::fs::remove_file(src)?;
        stats.sorted += 1;
        debug!(file = %sorted.display(), "sorted");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_pointer_parquet(path: &Path, rows: &[(&str, &str, &str)]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::schema::DDL_CC_POINTERS).unwrap();
        {
            let mut app = conn.appender("cc_pointers").unwrap();
            for (host_rev, url, ts) in rows {
                app.append_row(duckdb::params![
                    "CC-MAIN-2024-10",
                    "cdx-00000.gz",
                    format!("{})/", host_rev),
                    ts,
                    url,
                    "18f.gov",
                    host_rev,
                    200,
                    "text/html",
                    "DIGEST",
                    "crawl-data/CC-MAIN-2024-10/segments/1.0/warc/X.warc.gz",
                    1024_i64,
                    512_i64,
                ])
                .unwrap();
            }
            app.flush().unwrap();
        }
        conn.execute_batch(&format!(
            "COPY cc_pointers TO '{}' (FORMAT PARQUET);",
            db::sql_quote_str(path)
        ))
        .unwrap();
    }

    #[test]
    fn test_is_parquet_sorted() {
        let tmp = TempDir::new().unwrap();
        let sorted = tmp.path().join("sorted.parquet");
        let unsorted = tmp.path().join("unsorted.parquet");

        write_pointer_parquet(
            &sorted,
            &[
                ("gov,18f", "https://18f.gov/", "20240101000000"),
                ("gov,18f", "https://18f.gov/about", "20240101000000"),
                ("gov,gsa", "https://gsa.gov/", "20240101000000"),
            ],
        );
        write_pointer_parquet(
            &unsorted,
            &[
                ("gov,gsa", "https://gsa.gov/", "20240101000000"),
                ("gov,18f", "https://18f.gov/", "20240101000000"),
            ],
        );

        assert!(is_parquet_sorted(&sorted).unwrap());
        assert!(!is_parquet_sorted(&unsorted).unwrap());
    }

    #[test]
    fn test_sort_collection_rewrites_and_removes_input() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let dir = tmp.path().join("pq");
        let src = dir.join("cdx-00000.gz.parquet");

        write_pointer_parquet(
            &src,
            &[
                ("gov,gsa", "https://gsa.gov/", "20240101000000"),
                ("gov,18f", "https://18f.gov/b", "20240101000001"),
                ("gov,18f", "https://18f.gov/a", "20240101000000"),
            ],
        );

        let stats = sort_collection(&config, &dir, &SortOptions::default()).unwrap();
        assert_eq!(stats.sorted, 1);
        assert_eq!(stats.failed, 0);

        let sorted = dir.join("cdx-00000.gz.sorted.parquet");
        assert!(sorted.exists());
        assert!(!src.exists());
        assert!(is_parquet_sorted(&sorted).unwrap());
    }

    #[test]
    fn test_sort_collection_marks_already_sorted() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let dir = tmp.path().join("pq");
        let src = dir.join("cdx-00001.gz.parquet");

        write_pointer_parquet(
            &src,
            &[
                ("gov,18f", "https://18f.gov/a", "20240101000000"),
                ("gov,18f", "https://18f.gov/b", "20240101000001"),
            ],
        );

        let stats = sort_collection(&config, &dir, &SortOptions::default()).unwrap();
        assert_eq!(stats.marked, 1);
        assert_eq!(stats.sorted, 0);
        assert!(dir.join("cdx-00001.gz.sorted.parquet").exists());
    }

    #[test]
    fn test_effective_sort_workers_explicit_wins() {
        assert_eq!(effective_sort_workers(Some(7), 2, 1000.0), 7);
        assert!(effective_sort_workers(None, 4, 0.5) >= 1);
    }
}
