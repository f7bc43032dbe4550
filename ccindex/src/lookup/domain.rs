//! Domain resolution through the meta-index hierarchy.

use std::path::PathBuf;
use std::time::Instant;

use duckdb::Connection;
use tracing::debug;

use crate::cdxj::host_to_rev;
use crate::config::Config;
use crate::schema::CollectionRef;
use crate::slices::{slices_for, DomainSlice};
use crate::{db, meta, Result};

use super::{
    hit_from_row, normalize_domain, trace_event, wayback_score, DomainSearchResult, LookupTimings,
    PointerHit, SearchOptions, HIT_COLUMNS,
};

/// Resolve the collection list, walking master -> year -> directory scan.
pub(crate) fn candidate_collections(
    config: &Config,
    year: Option<i32>,
) -> Result<(Vec<CollectionRef>, &'static str)> {
    let refs = meta::load_collections_from_master(config, year)?;
    if !refs.is_empty() {
        return Ok((refs, "master"));
    }

    let refs = collections_from_year_dbs(config, year)?;
    if !refs.is_empty() {
        return Ok((refs, "year"));
    }

    let mut refs = meta::scan_collection_dbs(config)?;
    if let Some(y) = year {
        refs.retain(|r| r.year == Some(y));
    }
    refs.sort_by(|a, b| b.collection.cmp(&a.collection));
    Ok((refs, "scan"))
}

fn collections_from_year_dbs(config: &Config, year: Option<i32>) -> Result<Vec<CollectionRef>> {
    let mut refs = Vec::new();
    let root = &config.duckdb_year_root;
    if !root.exists() {
        return Ok(refs);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(y) = name
            .strip_prefix("cc_pointers_")
            .and_then(|rest| rest.strip_suffix(".duckdb"))
            .and_then(|digits| digits.parse::<i32>().ok())
        else {
            continue;
        };
        if year.is_some() && year != Some(y) {
            continue;
        }
        let Ok(conn) = db::open_readonly(&entry.path()) else {
            continue;
        };
        if !db::table_exists(&conn, "collection_registry") {
            continue;
        }
        let Ok(mut stmt) = conn.prepare("SELECT collection, db_path FROM collection_registry")
        else {
            continue;
        };
        let rows = stmt.query_map([], |row| {
            Ok(CollectionRef {
                year: Some(y),
                collection: row.get(0)?,
                db_path: PathBuf::from(row.get::<_, String>(1)?),
            })
        });
        if let Ok(rows) = rows {
            refs.extend(rows.filter_map(|r| r.ok()));
        }
    }
    refs.sort_by(|a, b| b.collection.cmp(&a.collection));
    Ok(refs)
}

/// Parquet files of one collection that can contain the host_rev prefix,
/// resolved to paths that exist on disk.
pub(crate) fn domain_parquets(
    config: &Config,
    conn: &Connection,
    prefix: &str,
) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT source_path, parquet_relpath FROM cc_domain_shards \
         WHERE host_rev = ? OR host_rev LIKE ? || ',%' \
         ORDER BY source_path",
    )?;
    let rows: Vec<(Option<String>, Option<String>)> = stmt
        .query_map([prefix, prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut out = Vec::new();
    for (source_path, relpath) in rows {
        let direct = source_path.map(PathBuf::from);
        if let Some(path) = direct.filter(|p| p.exists()) {
            out.push(path);
            continue;
        }
        if let Some(rel) = relpath {
            let joined = config.parquet_root.join(rel);
            if joined.exists() {
                out.push(joined);
            }
        }
    }
    Ok(out)
}

/// Distinct host_revs under a prefix; slice matching is by equality, so a
/// prefix query has to enumerate the concrete hosts first.
pub(crate) fn domain_host_revs(conn: &Connection, prefix: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT host_rev FROM cc_domain_shards \
         WHERE host_rev = ? OR host_rev LIKE ? || ',%'",
    )?;
    let rows = stmt.query_map([prefix, prefix], |row| row.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn query_parquet_prefix_scan(
    conn: &Connection,
    parquet: &std::path::Path,
    prefix: &str,
    limit: usize,
) -> Result<Vec<PointerHit>> {
    let path_str = parquet.to_string_lossy().to_string();
    let sql = format!(
        "SELECT {} FROM read_parquet('{}') \
         WHERE host_rev = ? OR host_rev LIKE ? || ',%' LIMIT {}",
        HIT_COLUMNS,
        db::sql_quote(&path_str),
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([prefix, prefix], |row| hit_from_row(row, Some(&path_str)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn query_parquet_slices(
    conn: &Connection,
    parquet: &std::path::Path,
    slices: &[&DomainSlice],
    limit: usize,
) -> Result<Vec<PointerHit>> {
    if slices.is_empty() {
        return Ok(Vec::new());
    }
    let path_str = parquet.to_string_lossy().to_string();
    let windows: Vec<String> = slices
        .iter()
        .map(|s| {
            format!(
                "(file_row_number >= {} AND file_row_number < {})",
                s.row_start, s.row_end
            )
        })
        .collect();
    let sql = format!(
        "SELECT {} FROM read_parquet('{}', file_row_number=true) \
         WHERE {} LIMIT {}",
        HIT_COLUMNS,
        db::sql_quote(&path_str),
        windows.join(" OR "),
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| hit_from_row(row, Some(&path_str)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

fn query_url_mode_db(
    conn: &Connection,
    db_path: &std::path::Path,
    prefix: &str,
    limit: usize,
) -> Result<Vec<PointerHit>> {
    let path_str = db_path.to_string_lossy().to_string();
    let sql = format!(
        "SELECT {} FROM cc_pointers \
         WHERE host_rev = ? OR host_rev LIKE ? || ',%' LIMIT {}",
        HIT_COLUMNS, limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([prefix, prefix], |row| hit_from_row(row, Some(&path_str)))?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

pub(crate) fn search_domain(
    config: &Config,
    domain: &str,
    opts: &SearchOptions,
) -> Result<DomainSearchResult> {
    let started = Instant::now();
    let mut timings = LookupTimings::default();

    let host = normalize_domain(domain);
    let prefix = host_to_rev(&host).unwrap_or_default();

    let phase = Instant::now();
    let (collections, meta_source) = candidate_collections(config, opts.year)?;
    timings.setup_s = phase.elapsed().as_secs_f64();

    let mut records: Vec<PointerHit> = Vec::new();
    let scan_conn = Connection::open_in_memory()?;

    'collections: for cref in &collections {
        if records.len() >= opts.max_matches {
            break;
        }
        if !cref.db_path.exists() {
            continue;
        }

        let phase = Instant::now();
        let conn = match db::open_readonly(&cref.db_path) {
            Ok(conn) => conn,
            Err(e) => {
                debug!(collection = %cref.collection, error = %e, "skipping unreadable collection db");
                continue;
            }
        };
        let has_domain_shards = db::table_exists(&conn, "cc_domain_shards");
        let has_pointers = db::table_exists(&conn, "cc_pointers");
        timings.schema_s += phase.elapsed().as_secs_f64();

        if has_pointers && !has_domain_shards {
            let phase = Instant::now();
            let room = opts.max_matches - records.len();
            records.extend(query_url_mode_db(&conn, &cref.db_path, &prefix, room)?);
            timings.query_s += phase.elapsed().as_secs_f64();
            continue;
        }
        if !has_domain_shards {
            continue;
        }

        let parquets = domain_parquets(config, &conn, &prefix)?;
        if parquets.is_empty() {
            continue;
        }

        // Load the slice windows for every concrete host under the prefix.
        let phase = Instant::now();
        let slices: Vec<DomainSlice> = match config
            .rowgroup_db_path(&cref.collection)
            .filter(|p| p.exists())
            .and_then(|p| db::open_readonly(&p).ok())
        {
            Some(slice_conn) if db::table_exists(&slice_conn, "cc_domain_rowgroups") => {
                let host_revs = domain_host_revs(&conn, &prefix)?;
                slices_for(&slice_conn, &host_revs)?
            }
            _ => Vec::new(),
        };
        timings.rowgroup_s += phase.elapsed().as_secs_f64();

        for parquet in &parquets {
            if records.len() >= opts.max_matches {
                break 'collections;
            }
            let room = (opts.max_matches - records.len()).min(opts.per_parquet_limit);
            let path_str = parquet.to_string_lossy();
            let file_slices: Vec<&DomainSlice> = slices
                .iter()
                .filter(|s| s.source_path == path_str)
                .collect();

            let phase = Instant::now();
            let hits = if file_slices.is_empty() {
                query_parquet_prefix_scan(&scan_conn, parquet, &prefix, room)?
            } else {
                query_parquet_slices(&scan_conn, parquet, &file_slices, room)?
            };
            timings.query_s += phase.elapsed().as_secs_f64();
            records.extend(hits);
        }
    }

    let phase = Instant::now();
    records.sort_by(|a, b| wayback_score(b).cmp(&wayback_score(a)));
    records.truncate(opts.max_matches);
    timings.filter_s = phase.elapsed().as_secs_f64();

    let elapsed_s = started.elapsed().as_secs_f64();
    trace_event(
        config,
        serde_json::json!({
            "event": "search_domain",
            "domain": host,
            "host_rev": prefix,
            "meta_source": meta_source,
            "collections_considered": collections.len(),
            "records": records.len(),
            "elapsed_s": elapsed_s,
        }),
    );

    Ok(DomainSearchResult {
        records,
        collections_considered: collections.len(),
        meta_source: meta_source.to_string(),
        elapsed_s,
        timings,
    })
}
