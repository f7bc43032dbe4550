//! Row-group slice index.
//!
//! For each sorted Parquet this records, per host_rev, the contiguous row
//! span it occupies inside each row group. Lookups can then read only the
//! `(row_group, [row_start, row_end))` windows that contain a domain instead
//! of scanning whole files. Slices live in a per-collection DuckDB under the
//! rowgroup index dir.

use std::path::{Path, PathBuf};

use duckdb::{params, Connection};
use tracing::{debug, info};

use crate::config::Config;
use crate::db;
use crate::schema::DDL_CC_DOMAIN_ROWGROUPS;
use crate::{Error, Result};

/// One contiguous run of a host_rev inside one row group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSlice {
    pub source_path: String,
    pub host_rev: String,
    pub row_group: i32,
    pub row_start: i64,
    pub row_end: i64,
}

/// Aggregate results of a slice build.
#[derive(Debug, Default, Clone, Copy)]
pub struct SliceStats {
    pub files: usize,
    pub slices: usize,
}

/// Build (or refresh) the slice index for every sorted Parquet of a
/// collection. No-op when the rowgroup index dir is disabled.
pub fn build_rowgroup_slices(config: &Config, collection: &str) -> Result<SliceStats> {
    let Some(db_path) = config.rowgroup_db_path(collection) else {
        return Ok(SliceStats::default());
    };
    let parquet_dir = config.collection_parquet_dir(collection);

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

    let conn = db::open_rw(&db_path, config.duckdb_threads, None)?;
    conn.execute_batch(DDL_CC_DOMAIN_ROWGROUPS)?;

    let mut stats = SliceStats::default();
    for parquet in &sorted {
        let slices = compute_slices(&conn, parquet)?;
        let source_path = parquet.to_string_lossy().to_string();

        conn.execute(
            "DELETE FROM cc_domain_rowgroups WHERE source_path = ?",
            params![source_path],
        )?;
        {
            let mut app = conn.appender("cc_domain_rowgroups")?;
            for slice in &slices {
                app.append_row(params![
                    source_path,
                    collection,
                    slice.host_rev,
                    slice.row_group,
                    slice.row_start,
                    slice.row_end,
                ])?;
            }
            app.flush()?;
        }

        debug!(file = %parquet.display(), slices = slices.len(), "sliced parquet");
        stats.files += 1;
        stats.slices += slices.len();
    }

    info!(
        collection,
        files = stats.files,
        slices = stats.slices,
        db = %db_path.display(),
        "row-group slice index built"
    );
    Ok(stats)
}

/// Compute per-host_rev, per-row-group row spans for one sorted Parquet.
///
/// In a file ordered by host_rev each host occupies one contiguous run, so
/// min/max row numbers describe it exactly; the run is then split at
/// row-group boundaries.
fn compute_slices(conn: &Connection, parquet: &Path) -> Result<Vec<DomainSlice>> {
    let path_str = parquet.to_string_lossy().to_string();

    // Row-group boundaries as cumulative row offsets.
    let mut stmt = conn.prepare(
        "SELECT row_group_id, row_group_num_rows FROM parquet_metadata(?) \
         WHERE path_in_schema = 'host_rev' ORDER BY row_group_id",
    )?;
    let groups: Vec<(i64, i64)> = stmt
        .query_map([&path_str], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;
    if groups.is_empty() {
        return Err(Error::CorruptInput(format!(
            "{} has no host_rev row groups",
            parquet.display()
        )));
    }
    let mut boundaries: Vec<(i32, i64, i64)> = Vec::with_capacity(groups.len());
    let mut offset: i64 = 0;
    for (rg, rows) in groups {
        boundaries.push((rg as i32, offset, offset + rows));
        offset += rows;
    }

    // One run per host_rev.
    let mut stmt = conn.prepare(
        "SELECT host_rev, min(file_row_number), max(file_row_number) + 1 \
         FROM read_parquet(?, file_row_number=true) \
         WHERE host_rev IS NOT NULL \
         GROUP BY host_rev ORDER BY 2",
    )?;
    let runs: Vec<(String, i64, i64)> = stmt
        .query_map([&path_str], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let source_path = path_str;
    let mut slices = Vec::new();
    for (host_rev, run_start, run_end) in runs {
        for &(rg, rg_start, rg_end) in &boundaries {
            let start = run_start.max(rg_start);
            let end = run_end.min(rg_end);
            if start < end {
                slices.push(DomainSlice {
                    source_path: source_path.clone(),
                    host_rev: host_rev.clone(),
                    row_group: rg,
                    row_start: start,
                    row_end: end,
                });
            }
        }
    }
    Ok(slices)
}

/// Fetch the slices for an exact set of host_revs from a slice database.
pub fn slices_for(conn: &Connection, host_revs: &[String]) -> Result<Vec<DomainSlice>> {
    if host_revs.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; host_revs.len()].join(", ");
    let sql = format!(
        "SELECT source_path, host_rev, row_group, row_start, row_end \
         FROM cc_domain_rowgroups WHERE host_rev IN ({}) \
         ORDER BY source_path, row_group, row_start",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_vec: Vec<&dyn duckdb::ToSql> =
        host_revs.iter().map(|h| h as &dyn duckdb::ToSql).collect();
    let rows = stmt.query_map(params_vec.as_slice(), |row| {
        Ok(DomainSlice {
            source_path: row.get(0)?,
            host_rev: row.get(1)?,
            row_group: row.get(2)?,
            row_start: row.get(3)?,
            row_end: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_sorted_parquet(path: &Path, hosts: &[&str], row_group_size: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::schema::DDL_CC_POINTERS).unwrap();
        {
            let mut app = conn.appender("cc_pointers").unwrap();
            for (i, host_rev) in hosts.iter().enumerate() {
                app.append_row(params![
                    "CC-MAIN-2024-10",
                    "cdx-00000.gz",
                    format!("{})/", host_rev),
                    format!("2024010100{:04}", i),
                    format!("https://example/{}", i),
                    "example",
                    host_rev,
                    200,
                    "text/html",
                    "D",
                    "crawl-data/x/warc/X.warc.gz",
                    i as i64,
                    10_i64,
                ])
                .unwrap();
            }
            app.flush().unwrap();
        }
        conn.execute_batch(&format!(
            "COPY cc_pointers TO '{}' (FORMAT PARQUET, ROW_GROUP_SIZE {});",
            db::sql_quote_str(path),
            row_group_size
        ))
        .unwrap();
    }

    #[test]
    fn test_slices_split_at_row_group_boundaries() {
        let tmp = TempDir::new().unwrap();
        let parquet = tmp.path().join("cdx-00000.gz.sorted.parquet");
        // Rows 0-2 are gov,18f; rows 3-4 gov,gsa. Row groups of 2 rows.
        write_sorted_parquet(
            &parquet,
            &["gov,18f", "gov,18f", "gov,18f", "gov,gsa", "gov,gsa"],
            2,
        );

        let conn = Connection::open_in_memory().unwrap();
        let slices = compute_slices(&conn, &parquet).unwrap();

        let f18: Vec<_> = slices.iter().filter(|s| s.host_rev == "gov,18f").collect();
        assert_eq!(f18.len(), 2);
        assert_eq!((f18[0].row_group, f18[0].row_start, f18[0].row_end), (0, 0, 2));
        assert_eq!((f18[1].row_group, f18[1].row_start, f18[1].row_end), (1, 2, 3));

        let gsa: Vec<_> = slices.iter().filter(|s| s.host_rev == "gov,gsa").collect();
        assert_eq!(gsa.len(), 2);
        assert_eq!((gsa[0].row_group, gsa[0].row_start, gsa[0].row_end), (1, 3, 4));
        assert_eq!((gsa[1].row_group, gsa[1].row_start, gsa[1].row_end), (2, 4, 5));
    }

    #[test]
    fn test_slice_windows_contain_exactly_their_host() {
        let tmp = TempDir::new().unwrap();
        let parquet = tmp.path().join("cdx-00000.gz.sorted.parquet");
        write_sorted_parquet(
            &parquet,
            &["gov,18f", "gov,18f", "gov,18f,blog", "gov,gsa", "gov,gsa", "gov,nasa"],
            2,
        );

        let conn = Connection::open_in_memory().unwrap();
        let slices = compute_slices(&conn, &parquet).unwrap();

        // Reading any slice window yields rows whose host_rev equals the
        // slice's host_rev, and the union covers every row once.
        let mut covered = 0i64;
        for slice in &slices {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT host_rev FROM read_parquet('{}', file_row_number=true) \
                     WHERE file_row_number >= {} AND file_row_number < {}",
                    db::sql_quote_str(&parquet),
                    slice.row_start,
                    slice.row_end
                ))
                .unwrap();
            let hosts: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            assert_eq!(hosts.len() as i64, slice.row_end - slice.row_start);
            assert!(hosts.iter().all(|h| h == &slice.host_rev));
            covered += slice.row_end - slice.row_start;
        }
        assert_eq!(covered, 6);
    }

    #[test]
    fn test_build_and_query_slice_db() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path());
        let dir = config.collection_parquet_dir("CC-MAIN-2024-10");
        write_sorted_parquet(
            &dir.join("cdx-00000.gz.sorted.parquet"),
            &["gov,18f", "gov,gsa"],
            2,
        );

        let stats = build_rowgroup_slices(&config, "CC-MAIN-2024-10").unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.slices, 2);

        let db_path = config.rowgroup_db_path("CC-MAIN-2024-10").unwrap();
        let conn = db::open_readonly(&db_path).unwrap();
        let slices = slices_for(&conn, &["gov,18f".to_string()]).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].row_start, 0);
        assert_eq!(slices[0].row_end, 1);

        // Rebuild is idempotent.
        let stats = build_rowgroup_slices(&config, "CC-MAIN-2024-10").unwrap();
        assert_eq!(stats.slices, 2);
    }
}
